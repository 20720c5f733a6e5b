//! Stall watchdog.
//!
//! A server-scheduled loop that looks at every running pipeline and fails
//! jobs whose heartbeat has gone quiet for too long. A job that reports
//! `running` but stopped bumping `updated_at` is exactly the case this
//! catches. A stalled job is failed with a conditional write (a concurrent
//! completion wins), a notification goes out, and the run is recovered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use super::driver::DriverRegistry;
use super::lifecycle;
use super::recovery::{AdvanceOutcome, RecoveryController};
use super::types::{Phase, PipelineStatus};
use crate::types::{Error, PhaseJobId, PipelineId, Result};

/// Transient, user-facing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub pipeline_id: PipelineId,
    pub phase: Phase,
    pub job_id: PhaseJobId,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Statistics from one scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub runs_scanned: usize,
    pub stalls_detected: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The per-run check, shared by the loop and direct callers.
#[derive(Debug, Clone)]
pub struct StallDetector {
    controller: Arc<RecoveryController>,
    drivers: Arc<DriverRegistry>,
    notifier: broadcast::Sender<Notification>,
    threshold: Duration,
}

impl StallDetector {
    pub fn new(
        controller: Arc<RecoveryController>,
        drivers: Arc<DriverRegistry>,
        notifier: broadcast::Sender<Notification>,
    ) -> Self {
        let threshold = controller.config().stall_threshold;
        Self {
            controller,
            drivers,
            notifier,
            threshold,
        }
    }

    /// Check one run as of `now`. Returns the number of jobs declared stalled.
    pub async fn check_run(&self, pipeline_id: &PipelineId, now: DateTime<Utc>) -> Result<usize> {
        let store = self.controller.store();
        let run = store.get_run(pipeline_id).await?;
        if run.status != PipelineStatus::Running {
            return Ok(0);
        }

        let threshold = chrono::Duration::from_std(self.threshold)
            .map_err(|e| Error::internal(format!("stall threshold: {}", e)))?;
        let mut stalled = 0;

        for (phase, job_id) in run.handles() {
            let mut job = store.get_job(job_id).await?;
            if !job.status.is_active() {
                continue;
            }
            let quiet = job.inactivity(now);
            if quiet < threshold {
                continue;
            }

            let message = format!("stalled: no heartbeat for {}s", quiet.num_seconds());
            lifecycle::fail_job(&mut job, message.clone(), now);
            match store.update_job(&job).await {
                Ok(_) => {}
                Err(Error::Conflict(_)) => {
                    tracing::debug!(
                        "stall_check_lost_race: pipeline_id={}, job_id={}",
                        pipeline_id,
                        job_id
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            stalled += 1;
            tracing::warn!(
                "phase_stalled: pipeline_id={}, phase={}, job_id={}, quiet_secs={}",
                pipeline_id,
                phase,
                job_id,
                quiet.num_seconds()
            );
            let _ = self.notifier.send(Notification {
                pipeline_id: pipeline_id.clone(),
                phase,
                job_id: job_id.clone(),
                message,
                at: now,
            });
        }

        if stalled > 0 {
            let outcome = self.controller.recover(pipeline_id).await?;
            tracing::info!(
                "stall_recovered: pipeline_id={}, outcome={:?}",
                pipeline_id,
                outcome
            );
            if matches!(outcome, AdvanceOutcome::Dispatched { .. }) {
                self.drivers.ensure(pipeline_id);
            }
        }
        Ok(stalled)
    }

    /// Check every running run.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ScanStats> {
        let runs = self
            .controller
            .store()
            .runs_with_status(PipelineStatus::Running)
            .await?;
        let mut stats = ScanStats {
            runs_scanned: runs.len(),
            ..Default::default()
        };

        for run in &runs {
            match self.check_run(&run.id, now).await {
                Ok(count) => stats.stalls_detected += count,
                Err(e) => tracing::error!(
                    "stall_check_failed: pipeline_id={}, error={}",
                    run.id,
                    e
                ),
            }
        }

        tracing::debug!(
            "watchdog_scan_completed: runs={}, stalls={}",
            stats.runs_scanned,
            stats.stalls_detected
        );
        stats.completed_at = Some(Utc::now());
        Ok(stats)
    }
}

/// Background loop around a [`StallDetector`].
#[derive(Debug)]
pub struct Watchdog {
    detector: StallDetector,
    period: Duration,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Watchdog {
    pub fn new(detector: StallDetector, period: Duration) -> Self {
        Self {
            detector,
            period,
            stop_tx: None,
        }
    }

    pub fn detector(&self) -> &StallDetector {
        &self.detector
    }

    /// Start the scan loop in the background.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let detector = self.detector.clone();
        let period = self.period;
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = detector.scan(Utc::now()).await {
                            tracing::error!("watchdog_scan_failed: {}", e);
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("watchdog_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the scan loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}
