//! Row lifecycle rules.
//!
//! PhaseJob:
//! ```text
//! PENDING → RUNNING ⇄ ALIVE → {COMPLETED | FAILED}
//!    └──────────────────────→ {COMPLETED | FAILED}
//! ```
//! PipelineRun:
//! ```text
//! RUNNING → {COMPLETED | FAILED},  FAILED → RUNNING (recover only)
//! ```
//! Terminal jobs are immutable. `updated_at` never moves backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{JobStatus, PhaseJob, PipelineRun, PipelineStatus};
use crate::types::{Error, Result};

impl JobStatus {
    /// Check if transition is valid.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        match (self, to) {
            // COMPLETED and FAILED are terminal
            (JobStatus::Completed | JobStatus::Failed, _) => false,
            (JobStatus::Running | JobStatus::Alive, JobStatus::Pending) => false,
            _ => true,
        }
    }
}

impl PipelineStatus {
    /// Check if transition is valid.
    pub fn can_transition_to(self, to: PipelineStatus) -> bool {
        matches!(
            (self, to),
            (PipelineStatus::Running, PipelineStatus::Completed)
                | (PipelineStatus::Running, PipelineStatus::Failed)
                | (PipelineStatus::Failed, PipelineStatus::Running)
                | (PipelineStatus::Failed, PipelineStatus::Failed)
        )
    }
}

/// Heartbeat or terminal report pushed by the external execution system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Apply a report to a job. Every accepted report is a heartbeat.
pub fn apply_report(job: &mut PhaseJob, report: &JobReport, now: DateTime<Utc>) -> Result<()> {
    if job.status.is_terminal() {
        return Err(Error::state_transition(format!(
            "job {} is {} and no longer accepts reports",
            job.id,
            job.status.as_str()
        )));
    }

    if let Some(status) = report.status {
        if !job.status.can_transition_to(status) {
            return Err(Error::state_transition(format!(
                "cannot move job {} from {} to {}",
                job.id,
                job.status.as_str(),
                status.as_str()
            )));
        }
        job.status = status;
    }

    if let Some(iteration) = report.iteration {
        job.iteration = job.iteration.max(iteration);
    }
    if let Some(summary) = &report.result_summary {
        job.result_summary = Some(summary.clone());
    }
    if let Some(message) = &report.error_message {
        job.error_message = Some(message.clone());
    }

    touch(job, now);
    if job.status.is_terminal() {
        job.completed_at = Some(job.updated_at);
    }
    Ok(())
}

/// Force a non-terminal job to failed. Returns false if it was already terminal.
pub fn fail_job(job: &mut PhaseJob, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
    if job.status.is_terminal() {
        return false;
    }
    job.status = JobStatus::Failed;
    job.error_message = Some(reason.into());
    touch(job, now);
    job.completed_at = Some(job.updated_at);
    true
}

fn touch(job: &mut PhaseJob, now: DateTime<Utc>) {
    if now > job.updated_at {
        job.updated_at = now;
    }
}

/// Mark a run completed.
pub fn complete_run(run: &mut PipelineRun, now: DateTime<Utc>) -> Result<()> {
    transition_run(run, PipelineStatus::Completed, now)?;
    run.current_phase = None;
    run.error_message = None;
    run.completed_at = Some(now);
    Ok(())
}

/// Mark a run failed with a reason.
pub fn fail_run(run: &mut PipelineRun, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
    transition_run(run, PipelineStatus::Failed, now)?;
    run.error_message = Some(reason.into());
    Ok(())
}

/// Return a failed run to running (recover is the only caller).
pub fn resume_run(run: &mut PipelineRun, now: DateTime<Utc>) -> Result<()> {
    if run.status == PipelineStatus::Running {
        return Ok(());
    }
    transition_run(run, PipelineStatus::Running, now)?;
    run.error_message = None;
    Ok(())
}

fn transition_run(run: &mut PipelineRun, to: PipelineStatus, now: DateTime<Utc>) -> Result<()> {
    if !run.status.can_transition_to(to) {
        return Err(Error::state_transition(format!(
            "cannot move pipeline {} from {} to {}",
            run.id,
            run.status.as_str(),
            to.as_str()
        )));
    }
    run.status = to;
    run.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::{Phase, RunConfig};
    use crate::types::{ProjectId, UserId};
    use chrono::Duration;

    fn sample_run() -> PipelineRun {
        PipelineRun::new(
            ProjectId::from_string("proj").unwrap(),
            UserId::from_string("user").unwrap(),
            RunConfig::default(),
        )
    }

    fn report(status: JobStatus) -> JobReport {
        JobReport {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_state_transitions() {
        let run = sample_run();
        let mut job = PhaseJob::new(&run, Phase::Search);
        let now = job.updated_at;

        apply_report(&mut job, &report(JobStatus::Running), now).unwrap();
        assert_eq!(job.status, JobStatus::Running);

        apply_report(&mut job, &report(JobStatus::Alive), now).unwrap();
        apply_report(&mut job, &report(JobStatus::Running), now).unwrap();
        assert!(apply_report(&mut job, &report(JobStatus::Pending), now).is_err());

        apply_report(&mut job, &report(JobStatus::Completed), now).unwrap();
        assert_eq!(job.completed_at, Some(job.updated_at));
    }

    #[test]
    fn test_terminal_job_is_immutable() {
        let run = sample_run();
        let mut job = PhaseJob::new(&run, Phase::Analysis);
        let now = Utc::now();
        apply_report(&mut job, &report(JobStatus::Failed), now).unwrap();

        let before = job.clone();
        let heartbeat = JobReport {
            iteration: Some(7),
            ..Default::default()
        };
        assert!(matches!(
            apply_report(&mut job, &heartbeat, now + Duration::seconds(5)),
            Err(Error::StateTransition(_))
        ));
        assert_eq!(job, before);
        assert!(!fail_job(&mut job, "late", now));
    }

    #[test]
    fn test_updated_at_never_moves_backwards() {
        let run = sample_run();
        let mut job = PhaseJob::new(&run, Phase::Analysis);
        let now = job.updated_at;

        apply_report(&mut job, &report(JobStatus::Running), now + Duration::seconds(30)).unwrap();
        let bumped = job.updated_at;
        apply_report(&mut job, &JobReport::default(), now).unwrap();
        assert_eq!(job.updated_at, bumped);
    }

    #[test]
    fn test_iteration_only_grows() {
        let run = sample_run();
        let mut job = PhaseJob::new(&run, Phase::ContentGeneration);
        let now = Utc::now();
        let mut heartbeat = JobReport {
            iteration: Some(4),
            ..Default::default()
        };
        apply_report(&mut job, &heartbeat, now).unwrap();
        heartbeat.iteration = Some(2);
        apply_report(&mut job, &heartbeat, now).unwrap();
        assert_eq!(job.iteration, 4);
    }

    #[test]
    fn test_run_transitions() {
        let mut run = sample_run();
        let now = Utc::now();

        fail_run(&mut run, "boom", now).unwrap();
        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("boom"));

        resume_run(&mut run, now).unwrap();
        assert_eq!(run.status, PipelineStatus::Running);
        assert!(run.error_message.is_none());

        complete_run(&mut run, now).unwrap();
        assert_eq!(run.current_phase, None);
        assert_eq!(run.completed_at, Some(now));

        assert!(fail_run(&mut run, "too late", now).is_err());
        assert!(resume_run(&mut run, now).is_err());
    }
}
