//! Progress aggregation.
//!
//! Each phase contributes at most 25 points to a 0-100 composite. Search is
//! time-based; the other three count loops against an expected maximum. A
//! maximum of zero means the total is unknown, and the phase renders as
//! indeterminate instead of sitting at 0%.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::types::{IterationMaxima, JobStatus, Phase, PhaseJob, PipelineRun, PipelineStatus};
use crate::types::{PhaseJobId, ProgressConfig};

/// Points one phase can contribute.
pub const PHASE_WEIGHT: f64 = 25.0;

/// Ceiling for any run that has not completed.
const INCOMPLETE_CEILING: f64 = 99.0;

/// How a phase should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseDisplayState {
    NotStarted,
    Pending,
    Running,
    /// Running with no known loop maximum (spinner). Not a stall.
    Indeterminate,
    Completed,
    Failed,
}

/// Per-phase progress row of a status view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: Phase,
    pub state: PhaseDisplayState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<PhaseJobId>,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Share of the composite, 0-25.
    pub contribution: f64,
    /// Same formula scaled to 0-100.
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Contribution of one phase, clamped to `[0, 25]`.
///
/// `elapsed` only matters for the time-based phase, `iteration`/`max_loops`
/// only for the others.
pub fn phase_contribution(
    phase: Phase,
    status: JobStatus,
    iteration: u32,
    max_loops: u32,
    elapsed: Duration,
    full_after: Duration,
) -> f64 {
    match status {
        JobStatus::Completed | JobStatus::Failed => PHASE_WEIGHT,
        JobStatus::Pending => 0.0,
        JobStatus::Running | JobStatus::Alive => {
            let ratio = if phase.is_time_based() {
                if full_after.is_zero() {
                    1.0
                } else {
                    elapsed.as_secs_f64() / full_after.as_secs_f64()
                }
            } else if max_loops == 0 {
                0.0
            } else {
                f64::from(iteration) / f64::from(max_loops)
            };
            (ratio * PHASE_WEIGHT).clamp(0.0, PHASE_WEIGHT)
        }
    }
}

/// Sum of contributions clamped to `[0, 100]`; exactly 100 only for a
/// completed run.
pub fn composite(contributions: &[f64], status: PipelineStatus) -> f64 {
    if status == PipelineStatus::Completed {
        return 100.0;
    }
    contributions
        .iter()
        .sum::<f64>()
        .clamp(0.0, INCOMPLETE_CEILING)
}

/// Builds per-phase rows and the composite for a run.
#[derive(Debug, Clone)]
pub struct ProgressCalculator {
    search_full_after: Duration,
    defaults: IterationMaxima,
}

impl ProgressCalculator {
    pub fn new(config: &ProgressConfig) -> Self {
        Self {
            search_full_after: config.search_full_after,
            defaults: IterationMaxima {
                analysis: config.analysis_max_loops,
                content_generation: config.content_generation_max_loops,
                content_refinement: config.content_refinement_max_loops,
            },
        }
    }

    /// Expected loops for `phase`: the run's snapshot wins over config.
    pub fn max_loops(&self, run: &PipelineRun, phase: Phase) -> u32 {
        let maxima = run.config.expected_iterations.unwrap_or(self.defaults);
        match phase {
            Phase::Search => 0,
            Phase::Analysis => maxima.analysis,
            Phase::ContentGeneration => maxima.content_generation,
            Phase::ContentRefinement => maxima.content_refinement,
        }
    }

    pub fn phase_progress(
        &self,
        run: &PipelineRun,
        phase: Phase,
        job: Option<&PhaseJob>,
        now: DateTime<Utc>,
    ) -> PhaseProgress {
        let max_iterations = self.max_loops(run, phase);
        let Some(job) = job else {
            return PhaseProgress {
                phase,
                state: PhaseDisplayState::NotStarted,
                job_id: None,
                iteration: 0,
                max_iterations,
                contribution: 0.0,
                percent: 0.0,
                error_message: None,
                updated_at: None,
            };
        };

        let elapsed = (now - job.started_at).to_std().unwrap_or(Duration::ZERO);
        let contribution = phase_contribution(
            phase,
            job.status,
            job.iteration,
            max_iterations,
            elapsed,
            self.search_full_after,
        );
        let state = match job.status {
            JobStatus::Pending => PhaseDisplayState::Pending,
            JobStatus::Completed => PhaseDisplayState::Completed,
            JobStatus::Failed => PhaseDisplayState::Failed,
            JobStatus::Running | JobStatus::Alive
                if !phase.is_time_based() && max_iterations == 0 =>
            {
                PhaseDisplayState::Indeterminate
            }
            JobStatus::Running | JobStatus::Alive => PhaseDisplayState::Running,
        };

        PhaseProgress {
            phase,
            state,
            job_id: Some(job.id.clone()),
            iteration: job.iteration,
            max_iterations,
            contribution,
            percent: contribution * (100.0 / PHASE_WEIGHT),
            error_message: job.error_message.clone(),
            updated_at: Some(job.updated_at),
        }
    }

    /// Rows for all four phases in order, plus the composite.
    ///
    /// `jobs` holds whatever jobs of the run could be loaded; only the ones
    /// the run's handles reference are used.
    pub fn summarize(
        &self,
        run: &PipelineRun,
        jobs: &[PhaseJob],
        now: DateTime<Utc>,
    ) -> (Vec<PhaseProgress>, f64) {
        let phases: Vec<PhaseProgress> = Phase::ALL
            .into_iter()
            .map(|phase| {
                let job = run
                    .handle(phase)
                    .and_then(|id| jobs.iter().find(|job| &job.id == id));
                self.phase_progress(run, phase, job, now)
            })
            .collect();
        let contributions: Vec<f64> = phases.iter().map(|p| p.contribution).collect();
        let total = composite(&contributions, run.status);
        (phases, total)
    }
}

impl Default for ProgressCalculator {
    fn default() -> Self {
        Self::new(&ProgressConfig::default())
    }
}
