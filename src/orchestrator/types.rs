//! Orchestrator types: Phase, PipelineRun, PhaseJob and their statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, PhaseJobId, PipelineId, ProjectId, Result, UserId};

// =============================================================================
// Phase
// =============================================================================

/// One of the four fixed, strictly ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Search,
    Analysis,
    ContentGeneration,
    ContentRefinement,
}

impl Phase {
    /// The fixed execution order.
    pub const ALL: [Phase; 4] = [
        Phase::Search,
        Phase::Analysis,
        Phase::ContentGeneration,
        Phase::ContentRefinement,
    ];

    pub fn index(self) -> usize {
        match self {
            Phase::Search => 0,
            Phase::Analysis => 1,
            Phase::ContentGeneration => 2,
            Phase::ContentRefinement => 3,
        }
    }

    pub fn next(self) -> Option<Phase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(self) -> Option<Phase> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Search => "search",
            Phase::Analysis => "analysis",
            Phase::ContentGeneration => "content_generation",
            Phase::ContentRefinement => "content_refinement",
        }
    }

    /// Progress for the search phase is derived from elapsed time; the rest
    /// count discrete loops.
    pub fn is_time_based(self) -> bool {
        self == Phase::Search
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    /// Accepts canonical names plus the `_conversational` / `_batch` variants
    /// the execution system reports for some runs.
    fn from_str(s: &str) -> Result<Self> {
        let base = s
            .strip_suffix("_conversational")
            .or_else(|| s.strip_suffix("_batch"))
            .unwrap_or(s);
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == base)
            .ok_or_else(|| Error::validation(format!("unknown phase: {}", s)))
    }
}

// =============================================================================
// Statuses
// =============================================================================

/// PipelineRun status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Running,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }
}

impl FromStr for PipelineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(PipelineStatus::Running),
            "completed" => Ok(PipelineStatus::Completed),
            "failed" => Ok(PipelineStatus::Failed),
            other => Err(Error::validation(format!("unknown pipeline status: {}", other))),
        }
    }
}

/// PhaseJob status as reported by the external execution system.
///
/// ```text
/// PENDING → {RUNNING | ALIVE} ⇄ … → {COMPLETED | FAILED}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Alive,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses the watchdog inspects for heartbeat staleness.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Alive)
    }

    /// Statuses a cancel must force to failed.
    pub fn is_cancellable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running | JobStatus::Alive)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Alive => "alive",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "alive" => Ok(JobStatus::Alive),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::validation(format!("unknown job status: {}", other))),
        }
    }
}

// =============================================================================
// Config snapshot
// =============================================================================

/// Search criteria handed to the search phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
}

/// Message template chosen for content generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
}

/// Sender details embedded in generated content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactBlock {
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Expected loop counts for the iteration-based phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationMaxima {
    #[serde(default)]
    pub analysis: u32,
    #[serde(default)]
    pub content_generation: u32,
    #[serde(default)]
    pub content_refinement: u32,
}

/// Immutable snapshot of the start request, stored on the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub search_criteria: SearchCriteria,
    pub goal: String,
    #[serde(default)]
    pub template: TemplateSelection,
    #[serde(default)]
    pub contact: ContactBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_iterations: Option<IterationMaxima>,
}

// =============================================================================
// Rows
// =============================================================================

/// The overall multi-phase execution triggered by one start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: PipelineId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub status: PipelineStatus,
    pub current_phase: Option<Phase>,
    pub config: RunConfig,
    pub search_job: Option<PhaseJobId>,
    pub analysis_job: Option<PhaseJobId>,
    pub generation_job: Option<PhaseJobId>,
    pub refinement_job: Option<PhaseJobId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every write.
    pub version: u64,
}

impl PipelineRun {
    /// New run positioned at the first phase with no job dispatched yet.
    pub fn new(project_id: ProjectId, user_id: UserId, config: RunConfig) -> Self {
        let now = Utc::now();
        Self {
            id: PipelineId::new(),
            project_id,
            user_id,
            status: PipelineStatus::Running,
            current_phase: Some(Phase::Search),
            config,
            search_job: None,
            analysis_job: None,
            generation_job: None,
            refinement_job: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        }
    }

    pub fn handle(&self, phase: Phase) -> Option<&PhaseJobId> {
        match phase {
            Phase::Search => self.search_job.as_ref(),
            Phase::Analysis => self.analysis_job.as_ref(),
            Phase::ContentGeneration => self.generation_job.as_ref(),
            Phase::ContentRefinement => self.refinement_job.as_ref(),
        }
    }

    pub fn set_handle(&mut self, phase: Phase, job_id: PhaseJobId) {
        let slot = match phase {
            Phase::Search => &mut self.search_job,
            Phase::Analysis => &mut self.analysis_job,
            Phase::ContentGeneration => &mut self.generation_job,
            Phase::ContentRefinement => &mut self.refinement_job,
        };
        *slot = Some(job_id);
    }

    /// All linked handles in phase order.
    pub fn handles(&self) -> Vec<(Phase, &PhaseJobId)> {
        Phase::ALL
            .into_iter()
            .filter_map(|phase| self.handle(phase).map(|id| (phase, id)))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.status == PipelineStatus::Running
    }
}

/// One execution attempt of one phase, updated by the external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseJob {
    pub id: PhaseJobId,
    pub pipeline_id: PipelineId,
    pub project_id: ProjectId,
    pub phase: Phase,
    pub status: JobStatus,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    /// Bumped by the store on every write.
    pub version: u64,
}

impl PhaseJob {
    pub fn new(run: &PipelineRun, phase: Phase) -> Self {
        let now = Utc::now();
        Self {
            id: PhaseJobId::new(),
            pipeline_id: run.id.clone(),
            project_id: run.project_id.clone(),
            phase,
            status: JobStatus::Pending,
            iteration: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            result_summary: None,
            error_message: None,
            version: 0,
        }
    }

    /// Time since the last heartbeat.
    pub fn inactivity(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}
