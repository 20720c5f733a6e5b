//! In-memory state store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{job_change, run_change, ChangeFeed, ChangeKind, StateStore};
use crate::orchestrator::{PhaseJob, PipelineRun, PipelineStatus};
use crate::types::{Error, PhaseJobId, PipelineId, ProjectId, Result};

/// Process-local store. State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<PipelineId, PipelineRun>>,
    jobs: RwLock<HashMap<PhaseJobId, PhaseJob>>,
    feed: ChangeFeed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn insert_run(&self, mut run: PipelineRun) -> Result<PipelineRun> {
        {
            let mut runs = self.runs.write().await;
            if runs.contains_key(&run.id) {
                return Err(Error::validation(format!("pipeline {} already exists", run.id)));
            }
            run.version = 1;
            runs.insert(run.id.clone(), run.clone());
        }
        self.feed.publish(run_change(&run, ChangeKind::Insert));
        Ok(run)
    }

    async fn get_run(&self, id: &PipelineId) -> Result<PipelineRun> {
        self.runs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pipeline {}", id)))
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<PipelineRun> {
        let stored = {
            let mut runs = self.runs.write().await;
            let current = runs
                .get_mut(&run.id)
                .ok_or_else(|| Error::not_found(format!("pipeline {}", run.id)))?;
            if current.version != run.version {
                return Err(Error::conflict(format!(
                    "pipeline {} is at version {}, write expected {}",
                    run.id, current.version, run.version
                )));
            }
            let mut next = run.clone();
            next.version = run.version + 1;
            *current = next.clone();
            next
        };
        self.feed.publish(run_change(&stored, ChangeKind::Update));
        Ok(stored)
    }

    async fn runs_for_project(&self, project_id: &ProjectId) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| &run.project_id == project_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn runs_with_status(&self, status: PipelineStatus) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| run.status == status)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn insert_job(&self, mut job: PhaseJob) -> Result<PhaseJob> {
        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job.id) {
                return Err(Error::validation(format!("phase job {} already exists", job.id)));
            }
            job.version = 1;
            jobs.insert(job.id.clone(), job.clone());
        }
        self.feed.publish(job_change(&job, ChangeKind::Insert));
        Ok(job)
    }

    async fn get_job(&self, id: &PhaseJobId) -> Result<PhaseJob> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("phase job {}", id)))
    }

    async fn update_job(&self, job: &PhaseJob) -> Result<PhaseJob> {
        let stored = {
            let mut jobs = self.jobs.write().await;
            let current = jobs
                .get_mut(&job.id)
                .ok_or_else(|| Error::not_found(format!("phase job {}", job.id)))?;
            if current.version != job.version {
                return Err(Error::conflict(format!(
                    "phase job {} is at version {}, write expected {}",
                    job.id, current.version, job.version
                )));
            }
            let mut next = job.clone();
            next.version = job.version + 1;
            *current = next.clone();
            next
        };
        self.feed.publish(job_change(&stored, ChangeKind::Update));
        Ok(stored)
    }

    async fn jobs_for_pipeline(&self, pipeline_id: &PipelineId) -> Result<Vec<PhaseJob>> {
        let mut jobs: Vec<PhaseJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| &job.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(jobs)
    }

    fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{JobStatus, Phase, RunConfig};
    use crate::store::ChangeFilter;
    use crate::types::UserId;

    fn sample_run(project: &str) -> PipelineRun {
        PipelineRun::new(
            ProjectId::from_string(project).unwrap(),
            UserId::from_string("user-1").unwrap(),
            RunConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_run() {
        let store = MemoryStore::new();
        let run = store.insert_run(sample_run("proj-1")).await.unwrap();
        assert_eq!(run.version, 1);

        let fetched = store.get_run(&run.id).await.unwrap();
        assert_eq!(fetched, run);
        assert!(matches!(
            store.get_run(&PipelineId::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let run = store.insert_run(sample_run("proj-1")).await.unwrap();

        let mut first = run.clone();
        first.current_phase = Some(Phase::Analysis);
        let stored = store.update_run(&first).await.unwrap();
        assert_eq!(stored.version, 2);

        let mut second = run.clone();
        second.error_message = Some("late writer".to_string());
        assert!(matches!(
            store.update_run(&second).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(
            store.get_run(&run.id).await.unwrap().current_phase,
            Some(Phase::Analysis)
        );
    }

    #[tokio::test]
    async fn test_job_queries_and_feed() {
        let store = MemoryStore::new();
        let run = store.insert_run(sample_run("proj-1")).await.unwrap();
        let job = PhaseJob::new(&run, Phase::Search);
        let mut sub = store.subscribe(ChangeFilter::Job(job.id.clone()));

        let mut job = store.insert_job(job).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Insert);

        job.status = JobStatus::Running;
        let job = store.update_job(&job).await.unwrap();
        let change = sub.recv().await.unwrap();
        assert_eq!(change.status, "running");
        assert_eq!(change.version, job.version);

        let jobs = store.jobs_for_pipeline(&run.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_runs_for_project_newest_first() {
        let store = MemoryStore::new();
        let mut older = sample_run("proj-1");
        older.created_at -= chrono::Duration::minutes(5);
        let older = store.insert_run(older).await.unwrap();
        let newer = store.insert_run(sample_run("proj-1")).await.unwrap();
        store.insert_run(sample_run("proj-2")).await.unwrap();

        let runs = store
            .runs_for_project(&ProjectId::from_string("proj-1").unwrap())
            .await
            .unwrap();
        assert_eq!(
            runs.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            vec![newer.id, older.id]
        );
        assert_eq!(
            store
                .runs_with_status(PipelineStatus::Running)
                .await
                .unwrap()
                .len(),
            3
        );
    }
}
