//! Request routing.
//!
//! Two services are exposed: `pipeline` for clients that start and watch
//! runs, `phase_job` for the execution system reporting on its jobs.

use crate::ipc::handlers;
use crate::orchestrator::Orchestrator;
use crate::types::{Error, IpcConfig, Result};
use serde_json::Value;
use tokio::sync::mpsc;

/// What a handler hands back to the connection loop.
#[allow(missing_debug_implementations)]
pub enum DispatchResponse {
    /// One reply frame.
    Single(Value),
    /// Chunk frames until the sender side is dropped, then an end frame.
    Stream(mpsc::Receiver<Value>),
}

pub async fn route_request(
    orchestrator: &Orchestrator,
    service: &str,
    method: &str,
    body: Value,
    ipc_config: &IpcConfig,
) -> Result<DispatchResponse> {
    match service {
        "pipeline" => handlers::pipeline::handle(orchestrator, method, body, ipc_config).await,
        "phase_job" => handlers::phase_job::handle(orchestrator, method, body).await,
        _ => Err(Error::not_found(format!("no such service: {}", service))),
    }
}

// Body field access for the handlers.

pub fn str_field(body: &Value, key: &str) -> Result<String> {
    match body.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(Error::validation(format!("{} must be a string", key))),
        None => Err(Error::validation(format!("missing field: {}", key))),
    }
}

/// Non-empty string field, if present.
pub fn opt_str_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}
