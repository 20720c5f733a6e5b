//! Phase job service handler for heartbeat / terminal reports from the
//! external execution system, and job lookup.

use crate::ipc::handlers::validation;
use crate::ipc::router::{opt_str_field, DispatchResponse};
use crate::orchestrator::{JobReport, JobStatus, Orchestrator, Phase};
use crate::types::{Error, Result};
use serde_json::Value;

pub async fn handle(orchestrator: &Orchestrator, method: &str, body: Value) -> Result<DispatchResponse> {
    match method {
        "Report" => {
            let job_id = validation::job_id(&body)?;

            // Executors may report a variant phase name; it must still match the job.
            if let Some(phase) = opt_str_field(&body, "phase") {
                let phase: Phase = phase.parse()?;
                let job = orchestrator.get_job(&job_id).await?;
                if job.phase != phase {
                    return Err(Error::validation(format!(
                        "job {} belongs to phase {}, report names {}",
                        job_id, job.phase, phase
                    )));
                }
            }

            let report = parse_report(&body)?;
            let job = orchestrator.report_progress(&job_id, &report).await?;
            Ok(DispatchResponse::Single(serde_json::to_value(job)?))
        }

        "Get" => {
            let job_id = validation::job_id(&body)?;
            let job = orchestrator.get_job(&job_id).await?;
            Ok(DispatchResponse::Single(serde_json::to_value(job)?))
        }

        _ => Err(Error::not_found(format!(
            "Unknown phase_job method: {}",
            method
        ))),
    }
}

fn parse_report(body: &Value) -> Result<JobReport> {
    let status = opt_str_field(body, "status")
        .map(|s| s.parse::<JobStatus>())
        .transpose()?;
    let iteration = match body.get("iteration") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let raw = v
                .as_i64()
                .ok_or_else(|| Error::validation("iteration must be an integer"))?;
            Some(validation::parse_iteration(raw, "iteration")?)
        }
    };

    Ok(JobReport {
        status,
        iteration,
        result_summary: opt_str_field(body, "result_summary"),
        error_message: opt_str_field(body, "error_message"),
    })
}
