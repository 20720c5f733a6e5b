//! Pipeline driver.
//!
//! One server-resident task per running pipeline. It waits for the current
//! phase's job to finish and hands the result to the controller. Clients
//! never drive a run themselves: they start it and then watch.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::recovery::{AdvanceOutcome, RecoveryController};
use super::types::PipelineStatus;
use super::waiter::CompletionWaiter;
use crate::types::{Error, PipelineId};

#[derive(Debug, Clone)]
pub struct PipelineDriver {
    controller: Arc<RecoveryController>,
    waiter: CompletionWaiter,
}

impl PipelineDriver {
    pub fn new(controller: Arc<RecoveryController>) -> Self {
        let waiter = CompletionWaiter::new(
            controller.store().clone(),
            controller.config().timeouts.clone(),
        );
        Self { controller, waiter }
    }

    /// Drive `pipeline_id` until it stops running or `cancel` fires.
    pub async fn drive(&self, pipeline_id: &PipelineId, cancel: &CancellationToken) {
        let poll = self.controller.config().handle_poll_interval;
        tracing::debug!("driver_started: pipeline_id={}", pipeline_id);

        while !cancel.is_cancelled() {
            let run = match self.controller.store().get_run(pipeline_id).await {
                Ok(run) => run,
                Err(Error::NotFound(_)) => break,
                Err(e) => {
                    tracing::error!("driver_read_failed: pipeline_id={}, error={}", pipeline_id, e);
                    self.waiter.wait_for_run_change(pipeline_id, poll, cancel).await;
                    continue;
                }
            };
            if run.status != PipelineStatus::Running {
                break;
            }

            // No job linked yet: another actor is inside the inter-phase window.
            let Some((phase, job_id)) = run
                .current_phase
                .and_then(|phase| run.handle(phase).map(|id| (phase, id.clone())))
            else {
                self.waiter.wait_for_run_change(pipeline_id, poll, cancel).await;
                continue;
            };

            let result = match self.waiter.wait(&job_id, phase, cancel).await {
                Ok(_) => self
                    .controller
                    .advance(pipeline_id, phase, Some(&job_id))
                    .await
                    .map(|outcome| {
                        if let AdvanceOutcome::Dispatched { phase, job_id } = outcome {
                            tracing::debug!(
                                "driver_advanced: pipeline_id={}, phase={}, job_id={}",
                                pipeline_id,
                                phase,
                                job_id
                            );
                        }
                    }),
                Err(Error::Cancelled(_)) => break,
                Err(err @ (Error::PhaseFailed(_) | Error::Timeout(_))) => self
                    .controller
                    .fail_run(pipeline_id, phase, Some(&job_id), &err.to_string())
                    .await
                    .map(|_| ()),
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {}
                // The run row already carries the dispatch error.
                Err(Error::Dispatch(_)) => {}
                Err(e) => {
                    tracing::error!(
                        "driver_step_failed: pipeline_id={}, phase={}, error={}",
                        pipeline_id,
                        phase,
                        e
                    );
                    self.waiter.wait_for_run_change(pipeline_id, poll, cancel).await;
                }
            }
        }

        tracing::debug!("driver_stopped: pipeline_id={}", pipeline_id);
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug)]
struct Slot {
    generation: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    /// Set when someone asked for a driver while this one may be exiting.
    rearm: bool,
}

#[derive(Debug, Default)]
struct Slots {
    next_generation: u64,
    by_pipeline: HashMap<PipelineId, Slot>,
}

/// At most one driver task per pipeline.
#[derive(Debug)]
pub struct DriverRegistry {
    driver: PipelineDriver,
    root: CancellationToken,
    slots: Arc<Mutex<Slots>>,
}

impl DriverRegistry {
    pub fn new(driver: PipelineDriver) -> Self {
        Self {
            driver,
            root: CancellationToken::new(),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    /// Make sure a driver is running for `pipeline_id`. Returns true if a new
    /// task was spawned.
    pub fn ensure(&self, pipeline_id: &PipelineId) -> bool {
        if self.root.is_cancelled() {
            return false;
        }

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.by_pipeline.get_mut(pipeline_id) {
            slot.rearm = true;
            return false;
        }

        slots.next_generation += 1;
        let generation = slots.next_generation;
        let cancel = self.root.child_token();
        let task = {
            let driver = self.driver.clone();
            let registry = self.slots.clone();
            let id = pipeline_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    driver.drive(&id, &cancel).await;
                    let mut slots = registry.lock();
                    match slots.by_pipeline.get_mut(&id) {
                        Some(slot) if slot.generation == generation => {
                            if slot.rearm && !cancel.is_cancelled() {
                                slot.rearm = false;
                            } else {
                                slots.by_pipeline.remove(&id);
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            })
        };

        slots.by_pipeline.insert(
            pipeline_id.clone(),
            Slot {
                generation,
                cancel,
                handle: Some(task),
                rearm: false,
            },
        );
        tracing::debug!(
            "driver_spawned: pipeline_id={}, generation={}",
            pipeline_id,
            generation
        );
        true
    }

    /// Abandon the driver's wait. Does not touch any row.
    pub fn cancel(&self, pipeline_id: &PipelineId) -> bool {
        let slot = self.slots.lock().by_pipeline.remove(pipeline_id);
        match slot {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_driving(&self, pipeline_id: &PipelineId) -> bool {
        self.slots.lock().by_pipeline.contains_key(pipeline_id)
    }

    pub fn active(&self) -> usize {
        self.slots.lock().by_pipeline.len()
    }

    /// Cancel every driver and wait for the tasks to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.slots.lock();
            slots
                .by_pipeline
                .drain()
                .filter_map(|(_, mut slot)| slot.handle.take())
                .collect()
        };
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("driver_join_failed: error={}", e);
            }
        }
        tracing::info!("drivers_stopped: count={}", count);
    }
}
