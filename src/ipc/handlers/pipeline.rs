//! Pipeline service handler: Start, GetStatus, Cancel, Recover and the Notifications stream.

use crate::ipc::handlers::validation;
use crate::ipc::router::{opt_str_field, str_field, DispatchResponse};
use crate::orchestrator::{Orchestrator, RunConfig, StartRequest};
use crate::types::{Error, IpcConfig, PipelineId, Result};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

pub async fn handle(
    orchestrator: &Orchestrator,
    method: &str,
    body: Value,
    ipc_config: &IpcConfig,
) -> Result<DispatchResponse> {
    match method {
        "Start" => {
            let project_id = str_field(&body, "project_id")?;
            let user_id = str_field(&body, "user_id")?;
            let config: RunConfig = serde_json::from_value(
                body.get("config")
                    .cloned()
                    .ok_or_else(|| Error::validation("missing field: config"))?,
            )
            .map_err(|e| Error::validation(format!("Invalid config: {}", e)))?;

            let pipeline_id = orchestrator
                .start(StartRequest {
                    project_id,
                    user_id,
                    config,
                })
                .await?;
            Ok(DispatchResponse::Single(serde_json::json!({
                "pipeline_id": pipeline_id,
            })))
        }

        "GetStatus" => {
            // By pipeline when given, else the project's most recent run.
            let view = match opt_str_field(&body, "pipeline_id") {
                Some(_) => {
                    orchestrator
                        .get_pipeline(&validation::pipeline_id(&body)?)
                        .await?
                }
                None => {
                    orchestrator
                        .get_status(&validation::project_id(&body)?)
                        .await?
                }
            };
            Ok(DispatchResponse::Single(serde_json::to_value(view)?))
        }

        "Cancel" => {
            let pipeline_id = validation::pipeline_id(&body)?;
            let run = orchestrator.cancel(&pipeline_id).await?;
            Ok(DispatchResponse::Single(serde_json::to_value(run)?))
        }

        "Recover" => {
            let pipeline_id = validation::pipeline_id(&body)?;
            let outcome = orchestrator.recover(&pipeline_id).await?;
            Ok(DispatchResponse::Single(serde_json::to_value(outcome)?))
        }

        "Notifications" => {
            let filter = opt_str_field(&body, "pipeline_id")
                .map(PipelineId::from_string)
                .transpose()
                .map_err(|e| Error::validation(format!("pipeline_id: {}", e)))?;
            let mut notifications = orchestrator.notifications();

            // Bridge broadcast::Receiver<Notification> → bounded mpsc::Receiver<Value>
            let (tx, rx) = mpsc::channel(ipc_config.stream_channel_capacity);
            tokio::spawn(async move {
                loop {
                    let received = tokio::select! {
                        // Consumer disconnected
                        _ = tx.closed() => break,
                        received = notifications.recv() => received,
                    };
                    let note = match received {
                        Ok(note) => note,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("notification_stream_lagged: skipped={}", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if filter.as_ref().is_some_and(|id| id != &note.pipeline_id) {
                        continue;
                    }
                    let chunk = match serde_json::to_value(&note) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            tracing::error!("notification_encode_failed: {}", e);
                            continue;
                        }
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });

            Ok(DispatchResponse::Stream(rx))
        }

        _ => Err(Error::not_found(format!(
            "Unknown pipeline method: {}",
            method
        ))),
    }
}
