//! IPC integration tests: codec, router, orchestrator and reply over a real socket.

use async_trait::async_trait;
use prospector_core::ipc::codec::{
    read_frame, write_frame, Frame, MSG_ERROR, MSG_REQUEST, MSG_RESPONSE, MSG_STREAM_CHUNK,
};
use prospector_core::ipc::IpcServer;
use prospector_core::orchestrator::{DispatchRequest, Orchestrator, PhaseTransport};
use prospector_core::store::MemoryStore;
use prospector_core::types::{IpcConfig, PipelineId};
use prospector_core::{Config, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

struct AcceptAll;

#[async_trait]
impl PhaseTransport for AcceptAll {
    async fn dispatch(&self, _request: &DispatchRequest) -> Result<()> {
        Ok(())
    }
}

/// Helper: spin up an IpcServer on a random port, return (addr, orchestrator).
async fn start_test_server() -> (std::net::SocketAddr, Arc<Orchestrator>) {
    let mut config = Config::default();
    config.orchestration.inter_phase_delay = Duration::ZERO;
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(AcceptAll),
        &config,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = IpcServer::new(orchestrator.clone(), addr, IpcConfig::default());
    tokio::spawn(async move {
        let _ = server.serve_on(listener).await;
    });

    (addr, orchestrator)
}

fn parse_id(raw: &str) -> PipelineId {
    PipelineId::from_string(raw).unwrap()
}

async fn send(stream: &mut TcpStream, service: &str, method: &str, body: Value) {
    let request = json!({
        "id": "test-1",
        "service": service,
        "method": method,
        "body": body,
    });
    let frame = Frame::encode(MSG_REQUEST, &request).unwrap();
    write_frame(stream, &frame).await.unwrap();
}

async fn receive(stream: &mut TcpStream) -> (u8, Value) {
    let frame = read_frame(stream, 16 * 1024 * 1024).await.unwrap().unwrap();
    (frame.msg_type, frame.decode().unwrap())
}

/// Helper: send a request frame, receive and decode the response.
async fn round_trip(stream: &mut TcpStream, service: &str, method: &str, body: Value) -> (u8, Value) {
    send(stream, service, method, body).await;
    receive(stream).await
}

async fn start_pipeline(stream: &mut TcpStream, project: &str) -> String {
    let (msg_type, response) = round_trip(
        stream,
        "pipeline",
        "Start",
        json!({
            "project_id": project,
            "user_id": "user-1",
            "config": {
                "goal": "book demos with logistics firms",
                "search_criteria": {"keywords": ["freight"], "locations": ["Rotterdam"]},
                "contact": {"sender_name": "Ana", "company": "Acme"},
            },
        }),
    )
    .await;
    assert_eq!(msg_type, MSG_RESPONSE, "{response}");
    response["body"]["pipeline_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_start_and_get_status() {
    let (addr, _orch) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let pipeline_id = start_pipeline(&mut stream, "proj-1").await;

    let (msg_type, response) =
        round_trip(&mut stream, "pipeline", "GetStatus", json!({"project_id": "proj-1"})).await;
    assert_eq!(msg_type, MSG_RESPONSE);
    let body = &response["body"];
    assert_eq!(body["run"]["id"], pipeline_id.as_str());
    assert_eq!(body["run"]["status"], "running");
    assert_eq!(body["run"]["current_phase"], "search");
    assert_eq!(body["phases"].as_array().unwrap().len(), 4);
    assert_eq!(body["phases"][0]["state"], "pending");
    assert_eq!(body["phases"][1]["state"], "not_started");
}

#[tokio::test]
async fn test_report_advances_pipeline() {
    let (addr, _orch) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let pipeline_id = start_pipeline(&mut stream, "proj-2").await;

    let (_, status) = round_trip(
        &mut stream,
        "pipeline",
        "GetStatus",
        json!({"pipeline_id": pipeline_id}),
    )
    .await;
    let search_job = status["body"]["run"]["search_job"].as_str().unwrap().to_string();

    let (msg_type, response) = round_trip(
        &mut stream,
        "phase_job",
        "Report",
        json!({"job_id": search_job, "phase": "search_batch", "status": "running", "iteration": 2}),
    )
    .await;
    assert_eq!(msg_type, MSG_RESPONSE, "{response}");
    assert_eq!(response["body"]["status"], "running");
    assert_eq!(response["body"]["iteration"], 2);

    let (msg_type, _) = round_trip(
        &mut stream,
        "phase_job",
        "Report",
        json!({"job_id": search_job, "status": "completed", "result_summary": "42 leads"}),
    )
    .await;
    assert_eq!(msg_type, MSG_RESPONSE);

    // The driver picks the completion up from the change feed.
    let mut current = Value::Null;
    for _ in 0..100 {
        let (_, status) = round_trip(
            &mut stream,
            "pipeline",
            "GetStatus",
            json!({"pipeline_id": pipeline_id}),
        )
        .await;
        current = status["body"].clone();
        if current["run"]["current_phase"] == "analysis" && !current["run"]["analysis_job"].is_null() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(current["run"]["current_phase"], "analysis");
    assert_eq!(current["phases"][0]["state"], "completed");
    assert_eq!(current["phases"][1]["state"], "pending");
    assert_eq!(current["composite_progress"], 25.0);
}

#[tokio::test]
async fn test_report_with_wrong_phase_is_rejected() {
    let (addr, orch) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let pipeline_id = start_pipeline(&mut stream, "proj-3").await;
    let run = orch
        .get_pipeline(&parse_id(&pipeline_id))
        .await
        .unwrap()
        .run;

    let (msg_type, response) = round_trip(
        &mut stream,
        "phase_job",
        "Report",
        json!({"job_id": run.search_job.unwrap(), "phase": "analysis", "status": "running"}),
    )
    .await;
    assert_eq!(msg_type, MSG_ERROR);
    assert_eq!(response["error"]["code"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn test_cancel_then_recover() {
    let (addr, _orch) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let pipeline_id = start_pipeline(&mut stream, "proj-4").await;

    let (msg_type, response) =
        round_trip(&mut stream, "pipeline", "Cancel", json!({"pipeline_id": pipeline_id})).await;
    assert_eq!(msg_type, MSG_RESPONSE);
    assert_eq!(response["body"]["status"], "failed");
    assert_eq!(response["body"]["error_message"], "manually cancelled");

    let (msg_type, response) =
        round_trip(&mut stream, "pipeline", "Recover", json!({"pipeline_id": pipeline_id})).await;
    assert_eq!(msg_type, MSG_RESPONSE);
    assert_eq!(response["body"]["outcome"], "dispatched");
    assert_eq!(response["body"]["phase"], "analysis");
}

#[tokio::test]
async fn test_validation_and_unknown_routes() {
    let (addr, _orch) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (msg_type, response) = round_trip(
        &mut stream,
        "pipeline",
        "Start",
        json!({"project_id": "p", "user_id": "u", "config": {"goal": ""}}),
    )
    .await;
    assert_eq!(msg_type, MSG_ERROR);
    assert_eq!(response["error"]["code"], "INVALID_ARGUMENT");

    let (msg_type, response) =
        round_trip(&mut stream, "pipeline", "GetStatus", json!({"project_id": "none"})).await;
    assert_eq!(msg_type, MSG_ERROR);
    assert_eq!(response["error"]["code"], "NOT_FOUND");

    let (msg_type, response) = round_trip(&mut stream, "nonexistent", "Foo", json!({})).await;
    assert_eq!(msg_type, MSG_ERROR);
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_notifications_stream_reports_stall() {
    let (addr, orch) = start_test_server().await;
    let mut control = TcpStream::connect(addr).await.unwrap();
    let pipeline_id = start_pipeline(&mut control, "proj-5").await;
    let run = orch.get_pipeline(&parse_id(&pipeline_id)).await.unwrap().run;
    let search_job = run.search_job.unwrap();
    round_trip(
        &mut control,
        "phase_job",
        "Report",
        json!({"job_id": search_job, "status": "running"}),
    )
    .await;

    let mut listener = TcpStream::connect(addr).await.unwrap();
    send(
        &mut listener,
        "pipeline",
        "Notifications",
        json!({"pipeline_id": pipeline_id}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = orch
        .check_stalls(chrono::Utc::now() + chrono::Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(stats.stalls_detected, 1);

    let (msg_type, chunk) = receive(&mut listener).await;
    assert_eq!(msg_type, MSG_STREAM_CHUNK);
    assert_eq!(chunk["body"]["job_id"], search_job.as_str());
    assert_eq!(chunk["body"]["phase"], "search");
    assert!(chunk["body"]["message"]
        .as_str()
        .unwrap()
        .starts_with("stalled: no heartbeat for"));
}
