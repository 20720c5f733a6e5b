//! Completion waiter.
//!
//! Suspends until a PhaseJob reaches a terminal status, its phase timeout
//! passes, or the caller cancels. The waiter only stops *waiting*: it never
//! tells the execution system to stop and never writes the job row.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::types::{JobStatus, Phase, PhaseJob};
use crate::store::{ChangeFilter, StateStore};
use crate::types::{Error, PhaseJobId, PhaseTimeouts, PipelineId, Result};

#[derive(Debug, Clone)]
pub struct CompletionWaiter {
    store: Arc<dyn StateStore>,
    timeouts: PhaseTimeouts,
}

impl CompletionWaiter {
    pub fn new(store: Arc<dyn StateStore>, timeouts: PhaseTimeouts) -> Self {
        Self { store, timeouts }
    }

    /// Wait for `job_id` to finish.
    ///
    /// Ok with the completed row; [`Error::PhaseFailed`] when the job failed;
    /// [`Error::Timeout`] once `started_at + timeout(phase)` passes;
    /// [`Error::Cancelled`] when `cancel` fires. The deadline is anchored on
    /// the job's start so a wait resumed after a restart keeps the original
    /// budget.
    pub async fn wait(
        &self,
        job_id: &PhaseJobId,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Result<PhaseJob> {
        // Subscribe before reading so a write between the two is not missed.
        let mut subscription = self.store.subscribe(ChangeFilter::Job(job_id.clone()));

        let job = self.store.get_job(job_id).await?;
        let started_at = job.started_at;
        if let Some(outcome) = resolve(job) {
            return outcome;
        }

        let timeout = self.timeouts.for_phase(phase);
        let budget =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let remaining = (started_at + budget - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let deadline = tokio::time::sleep(remaining);
        tokio::pin!(deadline);

        tracing::debug!(
            "completion_wait_started: job_id={}, phase={}, remaining_secs={}",
            job_id,
            phase,
            remaining.as_secs()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("completion_wait_cancelled: job_id={}", job_id);
                    return Err(Error::cancelled(format!("wait for {} job {}", phase, job_id)));
                }
                _ = &mut deadline => {
                    tracing::warn!(
                        "completion_wait_timeout: job_id={}, phase={}, timeout={}",
                        job_id,
                        phase,
                        humantime_serde::re::humantime::format_duration(timeout)
                    );
                    return Err(Error::timeout(format!(
                        "{} job {} did not finish within {}",
                        phase,
                        job_id,
                        humantime_serde::re::humantime::format_duration(timeout)
                    )));
                }
                change = subscription.recv() => {
                    let Some(change) = change else {
                        return Err(Error::internal("change feed closed"));
                    };
                    if change.status != JobStatus::Completed.as_str()
                        && change.status != JobStatus::Failed.as_str()
                    {
                        continue;
                    }
                    let job = self.store.get_job(job_id).await?;
                    if let Some(outcome) = resolve(job) {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Wait until the run row changes, `max_wait` passes, or `cancel` fires.
    /// Returns true if a change was seen.
    pub async fn wait_for_run_change(
        &self,
        pipeline_id: &PipelineId,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let mut subscription = self.store.subscribe(ChangeFilter::Run(pipeline_id.clone()));
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(max_wait) => false,
            change = subscription.recv() => change.is_some(),
        }
    }
}

fn resolve(job: PhaseJob) -> Option<Result<PhaseJob>> {
    match job.status {
        JobStatus::Completed => Some(Ok(job)),
        JobStatus::Failed => Some(Err(Error::phase_failed(format!(
            "{} job {} failed: {}",
            job.phase,
            job.id,
            job.error_message.as_deref().unwrap_or("reported failed")
        )))),
        _ => None,
    }
}
