//! Phase executor client.
//!
//! Creates the PhaseJob row for a dispatch and hands the phase to the
//! external execution system. Dispatch is acknowledged, never awaited to
//! completion: the job row is the durable handle from then on.
//!
//! A dispatch that is not acknowledged always leaves its job `failed`,
//! never `pending`.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use super::lifecycle;
use super::types::{Phase, PhaseJob, PipelineRun};
use crate::store::StateStore;
use crate::types::{Error, ExecutorConfig, PhaseJobId, ProjectId, Result, UserId};

// =============================================================================
// Transport
// =============================================================================

/// Body sent to the external execution system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub phase: Phase,
    pub job_id: PhaseJobId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub payload: Value,
}

/// Carries a dispatch to the external execution system.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhaseTransport: Send + Sync {
    /// Returns once the executor has accepted the job.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<()>;
}

/// HTTP transport: `POST {base_url}/phases/{phase}` with a JSON body.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::internal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl PhaseTransport for HttpTransport {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<()> {
        let url = format!("{}/phases/{}", self.base_url, request.phase);
        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::dispatch(format!("{} dispatch to {}: {}", request.phase, url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::dispatch(format!(
                "executor answered {} for {}: {}",
                status, request.phase, body
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Executor client
// =============================================================================

/// Job-row bookkeeping around a [`PhaseTransport`].
#[derive(Clone)]
pub struct PhaseExecutor {
    store: Arc<dyn StateStore>,
    transport: Arc<dyn PhaseTransport>,
}

impl fmt::Debug for PhaseExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseExecutor")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl PhaseExecutor {
    pub fn new(store: Arc<dyn StateStore>, transport: Arc<dyn PhaseTransport>) -> Self {
        Self { store, transport }
    }

    /// Create and dispatch in one step.
    pub async fn start(&self, run: &PipelineRun, phase: Phase) -> Result<PhaseJob> {
        let job = self.create_job(run, phase).await?;
        self.dispatch(run, &job).await?;
        Ok(job)
    }

    /// Insert a fresh pending job for `phase`. Never reuses an old row.
    pub async fn create_job(&self, run: &PipelineRun, phase: Phase) -> Result<PhaseJob> {
        let job = self.store.insert_job(PhaseJob::new(run, phase)).await?;
        tracing::debug!(
            "phase_job_created: pipeline_id={}, phase={}, job_id={}",
            run.id,
            phase,
            job.id
        );
        Ok(job)
    }

    /// Hand a created job to the executor. On failure the job is marked
    /// failed before the error is returned.
    pub async fn dispatch(&self, run: &PipelineRun, job: &PhaseJob) -> Result<()> {
        let request = DispatchRequest {
            phase: job.phase,
            job_id: job.id.clone(),
            project_id: run.project_id.clone(),
            user_id: run.user_id.clone(),
            payload: phase_payload(run, job.phase),
        };

        match self.transport.dispatch(&request).await {
            Ok(()) => {
                tracing::info!(
                    "phase_dispatched: pipeline_id={}, phase={}, job_id={}",
                    run.id,
                    job.phase,
                    job.id
                );
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::error!(
                    "phase_dispatch_failed: pipeline_id={}, phase={}, job_id={}, error={}",
                    run.id,
                    job.phase,
                    job.id,
                    reason
                );
                self.mark_failed(&job.id, &reason).await?;
                Err(match err {
                    Error::Dispatch(_) => err,
                    other => Error::dispatch(other.to_string()),
                })
            }
        }
    }

    /// Force a job to failed, re-reading on every attempt so a concurrent
    /// terminal write wins. Returns the stored job when this call failed it,
    /// `None` when it was already terminal.
    pub async fn mark_failed(&self, job_id: &PhaseJobId, reason: &str) -> Result<Option<PhaseJob>> {
        loop {
            let mut job = self.store.get_job(job_id).await?;
            if !lifecycle::fail_job(&mut job, reason, Utc::now()) {
                return Ok(None);
            }
            match self.store.update_job(&job).await {
                Ok(stored) => return Ok(Some(stored)),
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Phase-specific slice of the run's config snapshot.
pub fn phase_payload(run: &PipelineRun, phase: Phase) -> Value {
    let config = &run.config;
    match phase {
        Phase::Search => json!({
            "search_criteria": config.search_criteria,
            "goal": config.goal,
        }),
        Phase::Analysis => json!({
            "goal": config.goal,
        }),
        Phase::ContentGeneration => json!({
            "goal": config.goal,
            "template": config.template,
            "contact": config.contact,
        }),
        Phase::ContentRefinement => json!({
            "template": config.template,
            "contact": config.contact,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::{JobStatus, RunConfig};
    use crate::store::MemoryStore;

    async fn setup(transport: MockPhaseTransport) -> (Arc<MemoryStore>, PhaseExecutor, PipelineRun) {
        let store = Arc::new(MemoryStore::new());
        let run = store
            .insert_run(PipelineRun::new(
                ProjectId::from_string("proj").unwrap(),
                UserId::from_string("user").unwrap(),
                RunConfig {
                    goal: "book demos".to_string(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let executor = PhaseExecutor::new(store.clone(), Arc::new(transport));
        (store, executor, run)
    }

    #[tokio::test]
    async fn test_start_creates_pending_job_and_dispatches() {
        let mut transport = MockPhaseTransport::new();
        transport
            .expect_dispatch()
            .withf(|req| req.phase == Phase::Search && req.payload["goal"] == "book demos")
            .times(1)
            .returning(|_| Ok(()));
        let (store, executor, run) = setup(transport).await;

        let job = executor.start(&run, Phase::Search).await.unwrap();
        let stored = store.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.pipeline_id, run.id);
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_job_failed() {
        let mut transport = MockPhaseTransport::new();
        transport
            .expect_dispatch()
            .returning(|_| Err(Error::dispatch("connection refused")));
        let (store, executor, run) = setup(transport).await;

        let err = executor.start(&run, Phase::Analysis).await.unwrap_err();
        assert!(matches!(err, Error::Dispatch(_)));

        let jobs = store.jobs_for_pipeline(&run.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn test_mark_failed_leaves_terminal_jobs_alone() {
        let (store, executor, run) = setup(MockPhaseTransport::new()).await;
        let mut job = executor.create_job(&run, Phase::Search).await.unwrap();
        job.status = JobStatus::Completed;
        store.update_job(&job).await.unwrap();

        assert!(executor.mark_failed(&job.id, "stalled").await.unwrap().is_none());
        assert_eq!(store.get_job(&job.id).await.unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_payload_per_phase() {
        let run = PipelineRun::new(
            ProjectId::from_string("proj").unwrap(),
            UserId::from_string("user").unwrap(),
            RunConfig {
                goal: "grow".to_string(),
                ..Default::default()
            },
        );
        assert!(phase_payload(&run, Phase::Search).get("search_criteria").is_some());
        assert!(phase_payload(&run, Phase::Analysis).get("contact").is_none());
        assert!(phase_payload(&run, Phase::ContentRefinement).get("goal").is_none());
    }
}
