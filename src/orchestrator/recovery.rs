//! Recovery / advance controller.
//!
//! The only component that moves a run from one phase to the next. Every
//! decision is taken on a freshly read row and every write is conditional on
//! the version that was read, so the driver, the watchdog, `recover` and
//! `cancel` can all race over the same run without dispatching a phase twice.
//!
//! Advance protocol for `finished → next`:
//! 1. re-read the run and check it still sits on `finished` (and, when given,
//!    that the finished job is the linked one); otherwise `Superseded`
//! 2. conditionally write `current_phase = next` and remember the version
//! 3. sleep the inter-phase delay
//! 4. re-read; any write during the delay (cancel, another recover) wins
//! 5. create the job, conditionally link its handle, dispatch

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::executor::PhaseExecutor;
use super::lifecycle;
use super::types::{JobStatus, Phase, PipelineRun, PipelineStatus};
use crate::store::StateStore;
use crate::types::{Error, OrchestrationConfig, PhaseJobId, PipelineId, Result};

/// Reason recorded on a run cancelled by a user.
pub const CANCEL_REASON: &str = "manually cancelled";

/// What an advance or recover call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// The run is now completed.
    Completed,
    /// A fresh job for `phase` was created, linked and dispatched.
    Dispatched { phase: Phase, job_id: PhaseJobId },
    /// Another actor moved the run first; nothing was written.
    Superseded,
    /// The run was already completed; nothing was written.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct RecoveryController {
    store: Arc<dyn StateStore>,
    executor: PhaseExecutor,
    config: OrchestrationConfig,
}

impl RecoveryController {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: PhaseExecutor,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Persist a new run and dispatch the first phase without delay.
    pub async fn start_run(&self, run: PipelineRun) -> Result<(PipelineRun, AdvanceOutcome)> {
        let run = self.store.insert_run(run).await?;
        tracing::info!(
            "pipeline_started: pipeline_id={}, project_id={}",
            run.id,
            run.project_id
        );
        let outcome = self.dispatch_into(run.clone(), Phase::Search).await?;
        Ok((run, outcome))
    }

    /// Move a run past `finished`.
    pub async fn advance(
        &self,
        pipeline_id: &PipelineId,
        finished: Phase,
        job_id: Option<&PhaseJobId>,
    ) -> Result<AdvanceOutcome> {
        let mut attempts = 0;
        let written = loop {
            let mut run = self.store.get_run(pipeline_id).await?;
            if !sits_on(&run, finished, job_id) {
                tracing::debug!(
                    "advance_superseded: pipeline_id={}, finished={}, status={}, current_phase={:?}",
                    pipeline_id,
                    finished,
                    run.status.as_str(),
                    run.current_phase
                );
                return Ok(AdvanceOutcome::Superseded);
            }

            let now = Utc::now();
            match finished.next() {
                None => lifecycle::complete_run(&mut run, now)?,
                Some(next) => {
                    run.current_phase = Some(next);
                    run.updated_at = now;
                }
            }

            match self.store.update_run(&run).await {
                Ok(stored) => break stored,
                Err(Error::Conflict(_)) if attempts < self.config.max_conflict_retries => {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        };

        match finished.next() {
            None => {
                tracing::info!("pipeline_completed: pipeline_id={}", pipeline_id);
                Ok(AdvanceOutcome::Completed)
            }
            Some(next) => self.delay_then_dispatch(written, next).await,
        }
    }

    /// Resume a run from wherever it stopped.
    ///
    /// Scans the phases in order: the first without a handle is started; the
    /// last handled phase whose job is not completed is failed and moved past;
    /// if every handle resolves to a completed job the run completes. A failed
    /// run returns to running. Safe to call at any time and repeatedly.
    pub async fn recover(&self, pipeline_id: &PipelineId) -> Result<AdvanceOutcome> {
        let mut attempts = 0;
        loop {
            match self.try_recover(pipeline_id).await {
                Err(Error::Conflict(msg)) if attempts < self.config.max_conflict_retries => {
                    attempts += 1;
                    tracing::debug!(
                        "recover_retry: pipeline_id={}, attempt={}, cause={}",
                        pipeline_id,
                        attempts,
                        msg
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_recover(&self, pipeline_id: &PipelineId) -> Result<AdvanceOutcome> {
        let run = self.store.get_run(pipeline_id).await?;
        if run.status == PipelineStatus::Completed {
            return Ok(AdvanceOutcome::Unchanged);
        }

        for phase in Phase::ALL {
            let Some(job_id) = run.handle(phase) else {
                tracing::info!(
                    "recover_resume: pipeline_id={}, phase={}",
                    pipeline_id,
                    phase
                );
                return self.resume_at(run, phase).await;
            };

            let job = self.store.get_job(job_id).await?;
            if job.status == JobStatus::Completed {
                continue;
            }
            // A later phase already has a job: this one was failed and moved past.
            if phase.next().is_some_and(|next| run.handle(next).is_some()) {
                continue;
            }

            tracing::warn!(
                "recover_stuck_phase: pipeline_id={}, phase={}, job_id={}, status={}",
                pipeline_id,
                phase,
                job.id,
                job.status.as_str()
            );
            if !job.status.is_terminal() {
                self.executor
                    .mark_failed(&job.id, "superseded by recovery")
                    .await?;
            }
            return match phase.next() {
                Some(next) => self.resume_at(run, next).await,
                None => self.finish(run).await,
            };
        }

        self.finish(run).await
    }

    /// Fail every non-terminal job the run references, then the run.
    pub async fn cancel(&self, pipeline_id: &PipelineId) -> Result<PipelineRun> {
        let mut attempts = 0;
        loop {
            let mut run = self.store.get_run(pipeline_id).await?;
            if run.status == PipelineStatus::Completed {
                return Err(Error::state_transition(format!(
                    "pipeline {} already completed",
                    pipeline_id
                )));
            }

            for (phase, job_id) in run.handles() {
                if self.executor.mark_failed(job_id, CANCEL_REASON).await?.is_some() {
                    tracing::debug!(
                        "phase_job_cancelled: pipeline_id={}, phase={}, job_id={}",
                        pipeline_id,
                        phase,
                        job_id
                    );
                }
            }

            lifecycle::fail_run(&mut run, CANCEL_REASON, Utc::now())?;
            match self.store.update_run(&run).await {
                Ok(stored) => {
                    tracing::info!("pipeline_cancelled: pipeline_id={}", pipeline_id);
                    return Ok(stored);
                }
                // A handle may have been linked meanwhile; go around again.
                Err(Error::Conflict(_)) if attempts < self.config.max_conflict_retries => {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fail the run because `phase` failed, but only while the run still sits
    /// on that phase (and job, when given). Returns false when another actor
    /// already moved on.
    pub async fn fail_run(
        &self,
        pipeline_id: &PipelineId,
        phase: Phase,
        job_id: Option<&PhaseJobId>,
        reason: &str,
    ) -> Result<bool> {
        let mut attempts = 0;
        loop {
            let mut run = self.store.get_run(pipeline_id).await?;
            if !sits_on(&run, phase, job_id) {
                return Ok(false);
            }
            lifecycle::fail_run(&mut run, reason, Utc::now())?;
            match self.store.update_run(&run).await {
                Ok(_) => {
                    tracing::warn!(
                        "pipeline_failed: pipeline_id={}, phase={}, reason={}",
                        pipeline_id,
                        phase,
                        reason
                    );
                    return Ok(true);
                }
                Err(Error::Conflict(_)) if attempts < self.config.max_conflict_retries => {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Position the run on `phase` (resuming it if failed) and dispatch.
    /// The first phase goes out immediately; later ones after the delay.
    async fn resume_at(&self, mut run: PipelineRun, phase: Phase) -> Result<AdvanceOutcome> {
        let now = Utc::now();
        lifecycle::resume_run(&mut run, now)?;
        run.current_phase = Some(phase);
        run.updated_at = now;
        let written = self.store.update_run(&run).await?;

        if phase.previous().is_none() {
            self.dispatch_into(written, phase).await
        } else {
            self.delay_then_dispatch(written, phase).await
        }
    }

    async fn finish(&self, mut run: PipelineRun) -> Result<AdvanceOutcome> {
        let now = Utc::now();
        lifecycle::resume_run(&mut run, now)?;
        lifecycle::complete_run(&mut run, now)?;
        self.store.update_run(&run).await?;
        tracing::info!("pipeline_completed: pipeline_id={}", run.id);
        Ok(AdvanceOutcome::Completed)
    }

    async fn delay_then_dispatch(
        &self,
        written: PipelineRun,
        phase: Phase,
    ) -> Result<AdvanceOutcome> {
        if !self.config.inter_phase_delay.is_zero() {
            tracing::debug!(
                "inter_phase_delay: pipeline_id={}, next={}, delay_ms={}",
                written.id,
                phase,
                self.config.inter_phase_delay.as_millis()
            );
            tokio::time::sleep(self.config.inter_phase_delay).await;
        }

        let run = self.store.get_run(&written.id).await?;
        if run.version != written.version {
            tracing::debug!(
                "dispatch_superseded: pipeline_id={}, phase={}, expected_version={}, found={}",
                run.id,
                phase,
                written.version,
                run.version
            );
            return Ok(AdvanceOutcome::Superseded);
        }
        self.dispatch_into(run, phase).await
    }

    /// Create, link and dispatch a job for `phase` on a run already
    /// positioned there.
    async fn dispatch_into(&self, mut run: PipelineRun, phase: Phase) -> Result<AdvanceOutcome> {
        let job = self.executor.create_job(&run, phase).await?;

        run.set_handle(phase, job.id.clone());
        run.updated_at = Utc::now();
        let linked = match self.store.update_run(&run).await {
            Ok(linked) => linked,
            Err(err) => {
                self.executor
                    .mark_failed(&job.id, "run changed before dispatch")
                    .await?;
                return match err {
                    Error::Conflict(_) => Ok(AdvanceOutcome::Superseded),
                    other => Err(other),
                };
            }
        };

        if let Err(err) = self.executor.dispatch(&linked, &job).await {
            self.fail_run(&linked.id, phase, Some(&job.id), &err.to_string())
                .await?;
            return Err(err);
        }

        Ok(AdvanceOutcome::Dispatched {
            phase,
            job_id: job.id,
        })
    }
}

/// Whether `run` is running on `phase` with (when given) `job_id` linked.
fn sits_on(run: &PipelineRun, phase: Phase, job_id: Option<&PhaseJobId>) -> bool {
    run.status == PipelineStatus::Running
        && run.current_phase == Some(phase)
        && job_id.map_or(true, |id| run.handle(phase) == Some(id))
}
