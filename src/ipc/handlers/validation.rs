//! Shared IPC input validation helpers.
//!
//! Client-supplied ids and counters are checked here before they reach the
//! orchestrator.

use crate::types::{Error, PhaseJobId, PipelineId, ProjectId, Result};
use serde_json::Value;

use crate::ipc::router::str_field;

/// Require a non-negative i64 value.
pub fn require_non_negative_i64(value: i64, field: &str) -> Result<i64> {
    if value < 0 {
        return Err(Error::validation(format!(
            "{field} must be non-negative, got {value}"
        )));
    }
    Ok(value)
}

/// Parse an iteration counter: non-negative and within u32 range.
pub fn parse_iteration(value: i64, field: &str) -> Result<u32> {
    require_non_negative_i64(value, field)?;
    u32::try_from(value)
        .map_err(|_| Error::validation(format!("{field} value {value} exceeds u32 range")))
}

pub fn pipeline_id(body: &Value) -> Result<PipelineId> {
    PipelineId::from_string(str_field(body, "pipeline_id")?)
        .map_err(|e| Error::validation(format!("pipeline_id: {}", e)))
}

pub fn job_id(body: &Value) -> Result<PhaseJobId> {
    PhaseJobId::from_string(str_field(body, "job_id")?)
        .map_err(|e| Error::validation(format!("job_id: {}", e)))
}

pub fn project_id(body: &Value) -> Result<ProjectId> {
    ProjectId::from_string(str_field(body, "project_id")?)
        .map_err(|e| Error::validation(format!("project_id: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_iteration_bounds() {
        assert_eq!(parse_iteration(7, "iteration").unwrap(), 7);
        assert!(parse_iteration(-1, "iteration").is_err());
        assert!(parse_iteration(i64::from(u32::MAX) + 1, "iteration").is_err());
    }

    #[test]
    fn test_ids_must_be_present_and_non_blank() {
        assert!(pipeline_id(&json!({})).is_err());
        assert!(job_id(&json!({"job_id": "  "})).is_err());
        assert_eq!(
            project_id(&json!({"project_id": "p-1"})).unwrap().as_str(),
            "p-1"
        );
    }
}
