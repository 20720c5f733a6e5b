//! Pipeline orchestrator.
//!
//! Sequences the four phases of a lead-acquisition run over durable rows:
//!
//! ```text
//!   start ──► PhaseExecutor ──► external system ──► Report (heartbeats)
//!                 ▲                                      │
//!                 │                                      ▼
//!   RecoveryController ◄── PipelineDriver ◄── CompletionWaiter ◄── ChangeFeed
//!                 ▲
//!                 └── Watchdog (stalls)   recover / cancel (clients)
//! ```
//!
//! [`Orchestrator`] owns the pieces and is what the IPC layer and the binary
//! talk to. It is shared as `Arc<Orchestrator>`; every method takes `&self`.

pub mod driver;
pub mod executor;
pub mod lifecycle;
pub mod progress;
pub mod recovery;
pub mod types;
pub mod waiter;
pub mod watchdog;

pub use driver::{DriverRegistry, PipelineDriver};
pub use executor::{DispatchRequest, HttpTransport, PhaseExecutor, PhaseTransport};
pub use lifecycle::JobReport;
pub use progress::{PhaseDisplayState, PhaseProgress, ProgressCalculator};
pub use recovery::{AdvanceOutcome, RecoveryController, CANCEL_REASON};
pub use types::{
    ContactBlock, IterationMaxima, JobStatus, Phase, PhaseJob, PipelineRun, PipelineStatus,
    RunConfig, SearchCriteria, TemplateSelection,
};
pub use waiter::CompletionWaiter;
pub use watchdog::{Notification, ScanStats, StallDetector, Watchdog};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::store::StateStore;
use crate::types::{Config, Error, PhaseJobId, PipelineId, ProjectId, Result, UserId};

const NOTIFICATION_CAPACITY: usize = 256;

/// Client request to start a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub project_id: String,
    pub user_id: String,
    pub config: RunConfig,
}

/// Answer to a status query.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatusView {
    pub run: PipelineRun,
    /// Always four entries, in phase order.
    pub phases: Vec<PhaseProgress>,
    pub composite_progress: f64,
}

#[derive(Debug)]
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    controller: Arc<RecoveryController>,
    drivers: Arc<DriverRegistry>,
    detector: StallDetector,
    progress: ProgressCalculator,
    notifier: broadcast::Sender<Notification>,
    watchdog_interval: std::time::Duration,
    watchdog: Mutex<Option<(Watchdog, JoinHandle<()>)>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        transport: Arc<dyn PhaseTransport>,
        config: &Config,
    ) -> Self {
        let executor = PhaseExecutor::new(store.clone(), transport);
        let controller = Arc::new(RecoveryController::new(
            store.clone(),
            executor,
            config.orchestration.clone(),
        ));
        let drivers = Arc::new(DriverRegistry::new(PipelineDriver::new(controller.clone())));
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let detector = StallDetector::new(controller.clone(), drivers.clone(), notifier.clone());

        Self {
            store,
            controller,
            drivers,
            detector,
            progress: ProgressCalculator::new(&config.progress),
            notifier,
            watchdog_interval: config.orchestration.watchdog_interval,
            watchdog: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Create a run, dispatch the search phase and hand the run to a driver.
    pub async fn start(&self, request: StartRequest) -> Result<PipelineId> {
        let project_id = ProjectId::from_string(request.project_id)
            .map_err(|e| Error::validation(format!("project_id: {}", e)))?;
        let user_id = UserId::from_string(request.user_id)
            .map_err(|e| Error::validation(format!("user_id: {}", e)))?;
        if request.config.goal.trim().is_empty() {
            return Err(Error::validation("goal must not be empty"));
        }

        let run = PipelineRun::new(project_id, user_id, request.config);
        let (run, _) = self.controller.start_run(run).await?;
        self.drivers.ensure(&run.id);
        Ok(run.id)
    }

    /// Status of the most recent run of a project.
    pub async fn get_status(&self, project_id: &ProjectId) -> Result<PipelineStatusView> {
        let run = self
            .store
            .runs_for_project(project_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("no pipeline for project {}", project_id)))?;
        self.status_view(run, Utc::now()).await
    }

    /// Status of one run.
    pub async fn get_pipeline(&self, pipeline_id: &PipelineId) -> Result<PipelineStatusView> {
        let run = self.store.get_run(pipeline_id).await?;
        self.status_view(run, Utc::now()).await
    }

    async fn status_view(&self, run: PipelineRun, now: DateTime<Utc>) -> Result<PipelineStatusView> {
        let mut jobs = Vec::with_capacity(4);
        for (_, job_id) in run.handles() {
            jobs.push(self.store.get_job(job_id).await?);
        }
        let (phases, composite_progress) = self.progress.summarize(&run, &jobs, now);
        Ok(PipelineStatusView {
            run,
            phases,
            composite_progress,
        })
    }

    /// Fail the run and its open jobs, and stop waiting on it.
    pub async fn cancel(&self, pipeline_id: &PipelineId) -> Result<PipelineRun> {
        let run = self.controller.cancel(pipeline_id).await?;
        self.drivers.cancel(pipeline_id);
        Ok(run)
    }

    /// Resume a run past its stuck phase and make sure it is being driven.
    pub async fn recover(&self, pipeline_id: &PipelineId) -> Result<AdvanceOutcome> {
        let outcome = self.controller.recover(pipeline_id).await?;
        if self.store.get_run(pipeline_id).await?.is_running() {
            self.drivers.ensure(pipeline_id);
        }
        Ok(outcome)
    }

    /// Apply a heartbeat or terminal report from the external system.
    pub async fn report_progress(&self, job_id: &PhaseJobId, report: &JobReport) -> Result<PhaseJob> {
        let retries = self.controller.config().max_conflict_retries;
        let mut attempts = 0;
        loop {
            let mut job = self.store.get_job(job_id).await?;
            lifecycle::apply_report(&mut job, report, Utc::now())?;
            match self.store.update_job(&job).await {
                Ok(stored) => {
                    if stored.status.is_terminal() {
                        tracing::info!(
                            "phase_job_finished: pipeline_id={}, phase={}, job_id={}, status={}",
                            stored.pipeline_id,
                            stored.phase,
                            stored.id,
                            stored.status.as_str()
                        );
                    }
                    return Ok(stored);
                }
                Err(Error::Conflict(_)) if attempts < retries => attempts += 1,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_job(&self, job_id: &PhaseJobId) -> Result<PhaseJob> {
        self.store.get_job(job_id).await
    }

    /// Spawn a driver for every running run. Called once on boot.
    pub async fn resume_all(&self) -> Result<usize> {
        let runs = self.store.runs_with_status(PipelineStatus::Running).await?;
        let spawned = runs.iter().filter(|run| self.drivers.ensure(&run.id)).count();
        tracing::info!("pipelines_resumed: count={}", spawned);
        Ok(spawned)
    }

    /// Start the background watchdog. No-op if already running.
    pub fn spawn_watchdog(&self) {
        let mut slot = self.watchdog.lock();
        if slot.is_some() {
            return;
        }
        let mut watchdog = Watchdog::new(self.detector.clone(), self.watchdog_interval);
        let handle = watchdog.start();
        tracing::info!(
            "watchdog_started: interval_secs={}",
            self.watchdog_interval.as_secs()
        );
        *slot = Some((watchdog, handle));
    }

    /// One watchdog pass as of `now`.
    pub async fn check_stalls(&self, now: DateTime<Utc>) -> Result<ScanStats> {
        self.detector.scan(now).await
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Receivers currently subscribed to notifications.
    pub fn notification_listeners(&self) -> usize {
        self.notifier.receiver_count()
    }

    /// Stop the watchdog and every driver.
    pub async fn shutdown(&self) {
        let watchdog = self.watchdog.lock().take();
        if let Some((mut watchdog, handle)) = watchdog {
            watchdog.stop();
            if let Err(e) = handle.await {
                tracing::warn!("watchdog_join_failed: error={}", e);
            }
        }
        self.drivers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AcceptAll;

    #[async_trait]
    impl PhaseTransport for AcceptAll {
        async fn dispatch(&self, _request: &DispatchRequest) -> Result<()> {
            Ok(())
        }
    }

    fn orchestrator() -> Orchestrator {
        let mut config = Config::default();
        config.orchestration.inter_phase_delay = Duration::ZERO;
        Orchestrator::new(Arc::new(MemoryStore::new()), Arc::new(AcceptAll), &config)
    }

    fn request(project: &str, goal: &str) -> StartRequest {
        StartRequest {
            project_id: project.to_string(),
            user_id: "user-1".to_string(),
            config: RunConfig {
                goal: goal.to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_start_rejects_missing_fields() {
        let orch = orchestrator();
        assert!(matches!(
            orch.start(request("", "goal")).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            orch.start(request("proj", "  ")).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_status_reports_four_phases() {
        let orch = orchestrator();
        let id = orch.start(request("proj", "find buyers")).await.unwrap();
        assert!(orch.drivers().is_driving(&id));

        let view = orch
            .get_status(&ProjectId::from_string("proj").unwrap())
            .await
            .unwrap();
        assert_eq!(view.run.id, id);
        assert_eq!(view.phases.len(), 4);
        assert_eq!(view.phases[0].state, PhaseDisplayState::Pending);
        assert_eq!(view.composite_progress, 0.0);

        assert!(matches!(
            orch.get_status(&ProjectId::from_string("other").unwrap()).await,
            Err(Error::NotFound(_))
        ));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_report_then_cancel() {
        let orch = orchestrator();
        let id = orch.start(request("proj", "find buyers")).await.unwrap();
        let run = orch.store().get_run(&id).await.unwrap();
        let job_id = run.search_job.unwrap();

        let job = orch
            .report_progress(
                &job_id,
                &JobReport {
                    status: Some(JobStatus::Running),
                    iteration: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.iteration, 3);

        let cancelled = orch.cancel(&id).await.unwrap();
        assert_eq!(cancelled.error_message.as_deref(), Some(CANCEL_REASON));
        assert!(!orch.drivers().is_driving(&id));
        assert_eq!(orch.get_job(&job_id).await.unwrap().status, JobStatus::Failed);

        let late = orch
            .report_progress(
                &job_id,
                &JobReport {
                    status: Some(JobStatus::Completed),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(late, Err(Error::StateTransition(_))));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_after_cancel_resumes_driving() {
        let orch = orchestrator();
        let id = orch.start(request("proj", "find buyers")).await.unwrap();
        orch.cancel(&id).await.unwrap();

        let outcome = orch.recover(&id).await.unwrap();
        assert!(matches!(
            outcome,
            AdvanceOutcome::Dispatched {
                phase: Phase::Analysis,
                ..
            }
        ));
        assert!(orch.drivers().is_driving(&id));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_all_and_watchdog_lifecycle() {
        let orch = orchestrator();
        let id = orch.start(request("proj", "find buyers")).await.unwrap();
        orch.drivers().cancel(&id);

        assert_eq!(orch.resume_all().await.unwrap(), 1);
        orch.spawn_watchdog();
        orch.spawn_watchdog();
        orch.shutdown().await;
        assert_eq!(orch.drivers().active(), 0);
    }
}
