//! State store - persistence for PipelineRun and PhaseJob rows.
//!
//! Two row kinds only. Every write is conditional on the caller's copy of
//! the row `version`; a stale copy fails with [`Error::Conflict`] and the
//! caller must re-read. Successful writes bump the version and publish one
//! change on the store's [`ChangeFeed`].
//!
//! Implementations:
//! - [`MemoryStore`]: maps behind an async lock, for tests and ephemeral runs
//! - [`SqliteStore`]: durable state that survives process restarts

use async_trait::async_trait;

use crate::orchestrator::{PhaseJob, PipelineRun, PipelineStatus};
use crate::types::{PhaseJobId, PipelineId, ProjectId, Result};

pub mod feed;
mod memory;
mod sqlite;

pub use feed::{ChangeFeed, ChangeFilter, ChangeKind, RowChange, RowKind, Subscription};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persistence contract shared by every actor that touches pipeline state.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Insert a new run. The stored row starts at version 1.
    async fn insert_run(&self, run: PipelineRun) -> Result<PipelineRun>;

    async fn get_run(&self, id: &PipelineId) -> Result<PipelineRun>;

    /// Conditional update against `run.version`. Returns the stored row.
    async fn update_run(&self, run: &PipelineRun) -> Result<PipelineRun>;

    /// Runs of a project, newest first.
    async fn runs_for_project(&self, project_id: &ProjectId) -> Result<Vec<PipelineRun>>;

    /// Runs in a status, oldest first.
    async fn runs_with_status(&self, status: PipelineStatus) -> Result<Vec<PipelineRun>>;

    /// Insert a new job. The stored row starts at version 1.
    async fn insert_job(&self, job: PhaseJob) -> Result<PhaseJob>;

    async fn get_job(&self, id: &PhaseJobId) -> Result<PhaseJob>;

    /// Conditional update against `job.version`. Returns the stored row.
    async fn update_job(&self, job: &PhaseJob) -> Result<PhaseJob>;

    /// Jobs of a pipeline ordered by `started_at`.
    async fn jobs_for_pipeline(&self, pipeline_id: &PipelineId) -> Result<Vec<PhaseJob>>;

    /// Change feed fed by this store's writes.
    fn feed(&self) -> &ChangeFeed;

    fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        self.feed().subscribe(filter)
    }
}

pub(crate) fn run_change(run: &PipelineRun, kind: ChangeKind) -> RowChange {
    RowChange {
        row: RowKind::PipelineRun,
        kind,
        id: run.id.to_string(),
        pipeline_id: run.id.clone(),
        status: run.status.as_str().to_string(),
        version: run.version,
    }
}

pub(crate) fn job_change(job: &PhaseJob, kind: ChangeKind) -> RowChange {
    RowChange {
        row: RowKind::PhaseJob,
        kind,
        id: job.id.to_string(),
        pipeline_id: job.pipeline_id.clone(),
        status: job.status.as_str().to_string(),
        version: job.version,
    }
}
