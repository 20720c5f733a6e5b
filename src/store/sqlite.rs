//! SQLite-backed state store.
//!
//! Durable rows so a restarted server can resume every running pipeline.
//! Conditional writes use `WHERE id = ? AND version = ?`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use super::{job_change, run_change, ChangeFeed, ChangeKind, StateStore};
use crate::orchestrator::{JobStatus, Phase, PhaseJob, PipelineRun, PipelineStatus, RunConfig};
use crate::types::{Error, PhaseJobId, PipelineId, ProjectId, Result, UserId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id             TEXT PRIMARY KEY,
    project_id     TEXT NOT NULL,
    user_id        TEXT NOT NULL,
    status         TEXT NOT NULL,
    current_phase  TEXT,
    config         TEXT NOT NULL,
    search_job     TEXT,
    analysis_job   TEXT,
    generation_job TEXT,
    refinement_job TEXT,
    error_message  TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    completed_at   TEXT,
    version        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pipeline_runs_project ON pipeline_runs(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_pipeline_runs_status ON pipeline_runs(status);

CREATE TABLE IF NOT EXISTS phase_jobs (
    id             TEXT PRIMARY KEY,
    pipeline_id    TEXT NOT NULL REFERENCES pipeline_runs(id),
    project_id     TEXT NOT NULL,
    phase          TEXT NOT NULL,
    status         TEXT NOT NULL,
    iteration      INTEGER NOT NULL,
    started_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    completed_at   TEXT,
    result_summary TEXT,
    error_message  TEXT,
    version        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_phase_jobs_pipeline ON phase_jobs(pipeline_id, started_at);
";

const RUN_COLUMNS: &str = "id, project_id, user_id, status, current_phase, config, search_job, \
     analysis_job, generation_job, refinement_job, error_message, created_at, updated_at, \
     completed_at, version";

const JOB_COLUMNS: &str = "id, pipeline_id, project_id, phase, status, iteration, started_at, \
     updated_at, completed_at, result_summary, error_message, version";

/// Thin repository over SQLite. Thread-safe via an internal mutex.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    feed: ChangeFeed,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("sqlite_store_ready");
        Ok(Self {
            conn: Mutex::new(conn),
            feed: ChangeFeed::new(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn query_runs(&self, sql: &str, arg: &str) -> Result<Vec<PipelineRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params![arg], RawRun::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawRun::into_run).collect()
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn insert_run(&self, mut run: PipelineRun) -> Result<PipelineRun> {
        run.version = 1;
        let config = serde_json::to_string(&run.config)?;
        self.conn().execute(
            &format!(
                "INSERT INTO pipeline_runs ({RUN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                run.id.as_str(),
                run.project_id.as_str(),
                run.user_id.as_str(),
                run.status.as_str(),
                run.current_phase.map(Phase::as_str),
                config,
                run.search_job.as_ref().map(PhaseJobId::as_str),
                run.analysis_job.as_ref().map(PhaseJobId::as_str),
                run.generation_job.as_ref().map(PhaseJobId::as_str),
                run.refinement_job.as_ref().map(PhaseJobId::as_str),
                run.error_message,
                fmt_dt(run.created_at),
                fmt_dt(run.updated_at),
                run.completed_at.map(fmt_dt),
                run.version as i64,
            ],
        )?;
        self.feed.publish(run_change(&run, ChangeKind::Insert));
        Ok(run)
    }

    async fn get_run(&self, id: &PipelineId) -> Result<PipelineRun> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = ?1"),
                params![id.as_str()],
                RawRun::from_row,
            )
            .optional()?;
        raw.ok_or_else(|| Error::not_found(format!("pipeline {}", id)))?
            .into_run()
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<PipelineRun> {
        let config = serde_json::to_string(&run.config)?;
        let changed = self.conn().execute(
            "UPDATE pipeline_runs SET
                status = ?3, current_phase = ?4, config = ?5, search_job = ?6,
                analysis_job = ?7, generation_job = ?8, refinement_job = ?9,
                error_message = ?10, updated_at = ?11, completed_at = ?12,
                version = version + 1
             WHERE id = ?1 AND version = ?2",
            params![
                run.id.as_str(),
                run.version as i64,
                run.status.as_str(),
                run.current_phase.map(Phase::as_str),
                config,
                run.search_job.as_ref().map(PhaseJobId::as_str),
                run.analysis_job.as_ref().map(PhaseJobId::as_str),
                run.generation_job.as_ref().map(PhaseJobId::as_str),
                run.refinement_job.as_ref().map(PhaseJobId::as_str),
                run.error_message,
                fmt_dt(run.updated_at),
                run.completed_at.map(fmt_dt),
            ],
        )?;
        if changed == 0 {
            // Distinguish a missing row from a lost race.
            let current = self.get_run(&run.id).await?;
            return Err(Error::conflict(format!(
                "pipeline {} is at version {}, write expected {}",
                run.id, current.version, run.version
            )));
        }

        let mut stored = run.clone();
        stored.version = run.version + 1;
        self.feed.publish(run_change(&stored, ChangeKind::Update));
        Ok(stored)
    }

    async fn runs_for_project(&self, project_id: &ProjectId) -> Result<Vec<PipelineRun>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE project_id = ?1
                 ORDER BY created_at DESC"
            ),
            project_id.as_str(),
        )
    }

    async fn runs_with_status(&self, status: PipelineStatus) -> Result<Vec<PipelineRun>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE status = ?1
                 ORDER BY created_at ASC"
            ),
            status.as_str(),
        )
    }

    async fn insert_job(&self, mut job: PhaseJob) -> Result<PhaseJob> {
        job.version = 1;
        self.conn().execute(
            &format!(
                "INSERT INTO phase_jobs ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                job.id.as_str(),
                job.pipeline_id.as_str(),
                job.project_id.as_str(),
                job.phase.as_str(),
                job.status.as_str(),
                job.iteration,
                fmt_dt(job.started_at),
                fmt_dt(job.updated_at),
                job.completed_at.map(fmt_dt),
                job.result_summary,
                job.error_message,
                job.version as i64,
            ],
        )?;
        self.feed.publish(job_change(&job, ChangeKind::Insert));
        Ok(job)
    }

    async fn get_job(&self, id: &PhaseJobId) -> Result<PhaseJob> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM phase_jobs WHERE id = ?1"),
                params![id.as_str()],
                RawJob::from_row,
            )
            .optional()?;
        raw.ok_or_else(|| Error::not_found(format!("phase job {}", id)))?
            .into_job()
    }

    async fn update_job(&self, job: &PhaseJob) -> Result<PhaseJob> {
        let changed = self.conn().execute(
            "UPDATE phase_jobs SET
                status = ?3, iteration = ?4, updated_at = ?5, completed_at = ?6,
                result_summary = ?7, error_message = ?8, version = version + 1
             WHERE id = ?1 AND version = ?2",
            params![
                job.id.as_str(),
                job.version as i64,
                job.status.as_str(),
                job.iteration,
                fmt_dt(job.updated_at),
                job.completed_at.map(fmt_dt),
                job.result_summary,
                job.error_message,
            ],
        )?;
        if changed == 0 {
            let current = self.get_job(&job.id).await?;
            return Err(Error::conflict(format!(
                "phase job {} is at version {}, write expected {}",
                job.id, current.version, job.version
            )));
        }

        let mut stored = job.clone();
        stored.version = job.version + 1;
        self.feed.publish(job_change(&stored, ChangeKind::Update));
        Ok(stored)
    }

    async fn jobs_for_pipeline(&self, pipeline_id: &PipelineId) -> Result<Vec<PhaseJob>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM phase_jobs WHERE pipeline_id = ?1 ORDER BY started_at ASC"
        ))?;
        let raws = stmt
            .query_map(params![pipeline_id.as_str()], RawJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawJob::into_job).collect()
    }

    fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

// =============================================================================
// Row mapping
// =============================================================================

/// Column values as stored; parsed into domain types outside the rusqlite
/// row callback so parse failures surface as crate errors.
struct RawRun {
    id: String,
    project_id: String,
    user_id: String,
    status: String,
    current_phase: Option<String>,
    config: String,
    handles: [Option<String>; 4],
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    version: i64,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            user_id: row.get(2)?,
            status: row.get(3)?,
            current_phase: row.get(4)?,
            config: row.get(5)?,
            handles: [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?],
            error_message: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            completed_at: row.get(13)?,
            version: row.get(14)?,
        })
    }

    fn into_run(self) -> Result<PipelineRun> {
        let config: RunConfig = serde_json::from_str(&self.config)?;
        let [search_job, analysis_job, generation_job, refinement_job] =
            self.handles.map(|h| h.map(parse_job_id).transpose());
        Ok(PipelineRun {
            id: PipelineId::from_string(self.id).map_err(Error::internal)?,
            project_id: ProjectId::from_string(self.project_id).map_err(Error::internal)?,
            user_id: UserId::from_string(self.user_id).map_err(Error::internal)?,
            status: self.status.parse()?,
            current_phase: self.current_phase.map(|p| p.parse()).transpose()?,
            config,
            search_job: search_job?,
            analysis_job: analysis_job?,
            generation_job: generation_job?,
            refinement_job: refinement_job?,
            error_message: self.error_message,
            created_at: parse_dt(&self.created_at)?,
            updated_at: parse_dt(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_dt).transpose()?,
            version: self.version as u64,
        })
    }
}

struct RawJob {
    id: String,
    pipeline_id: String,
    project_id: String,
    phase: String,
    status: String,
    iteration: u32,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
    result_summary: Option<String>,
    error_message: Option<String>,
    version: i64,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pipeline_id: row.get(1)?,
            project_id: row.get(2)?,
            phase: row.get(3)?,
            status: row.get(4)?,
            iteration: row.get(5)?,
            started_at: row.get(6)?,
            updated_at: row.get(7)?,
            completed_at: row.get(8)?,
            result_summary: row.get(9)?,
            error_message: row.get(10)?,
            version: row.get(11)?,
        })
    }

    fn into_job(self) -> Result<PhaseJob> {
        Ok(PhaseJob {
            id: parse_job_id(self.id)?,
            pipeline_id: PipelineId::from_string(self.pipeline_id).map_err(Error::internal)?,
            project_id: ProjectId::from_string(self.project_id).map_err(Error::internal)?,
            phase: self.phase.parse()?,
            status: self.status.parse::<JobStatus>()?,
            iteration: self.iteration,
            started_at: parse_dt(&self.started_at)?,
            updated_at: parse_dt(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_dt).transpose()?,
            result_summary: self.result_summary,
            error_message: self.error_message,
            version: self.version as u64,
        })
    }
}

fn parse_job_id(raw: String) -> Result<PhaseJobId> {
    PhaseJobId::from_string(raw).map_err(Error::internal)
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::internal(format!("bad timestamp {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SearchCriteria;

    fn sample_run() -> PipelineRun {
        PipelineRun::new(
            ProjectId::from_string("proj-1").unwrap(),
            UserId::from_string("user-1").unwrap(),
            RunConfig {
                goal: "find dental clinics".to_string(),
                search_criteria: SearchCriteria {
                    keywords: vec!["dentist".to_string()],
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inserted = store.insert_run(sample_run()).await.unwrap();
        let fetched = store.get_run(&inserted.id).await.unwrap();

        assert_eq!(fetched.id, inserted.id);
        assert_eq!(fetched.config, inserted.config);
        assert_eq!(fetched.status, PipelineStatus::Running);
        assert_eq!(fetched.current_phase, Some(Phase::Search));
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.insert_run(sample_run()).await.unwrap();
        let job = store.insert_job(PhaseJob::new(&run, Phase::Search)).await.unwrap();

        let mut linked = run.clone();
        linked.set_handle(Phase::Search, job.id.clone());
        let stored = store.update_run(&linked).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(
            store.get_run(&run.id).await.unwrap().search_job,
            Some(job.id.clone())
        );

        let mut stale = run.clone();
        stale.error_message = Some("stale".to_string());
        assert!(matches!(store.update_run(&stale).await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_missing_rows_are_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get_job(&PhaseJobId::new()).await,
            Err(Error::NotFound(_))
        ));

        let orphan = PipelineRun::new(
            ProjectId::from_string("p").unwrap(),
            UserId::from_string("u").unwrap(),
            RunConfig::default(),
        );
        assert!(matches!(store.update_run(&orphan).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_job_update_and_listing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.insert_run(sample_run()).await.unwrap();
        let mut job = store.insert_job(PhaseJob::new(&run, Phase::Search)).await.unwrap();

        job.status = JobStatus::Completed;
        job.iteration = 3;
        job.completed_at = Some(job.updated_at);
        job.result_summary = Some("42 leads".to_string());
        store.update_job(&job).await.unwrap();

        let jobs = store.jobs_for_pipeline(&run.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(jobs[0].iteration, 3);
        assert_eq!(jobs[0].result_summary.as_deref(), Some("42 leads"));
        assert_eq!(jobs[0].version, 2);
    }
}
