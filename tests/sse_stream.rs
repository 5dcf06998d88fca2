//! Tests for the Server-Sent-Events adapter.

use axum::response::IntoResponse;
use http_body_util::BodyExt;

use fleet_exec::events::{ExecEvent, OutputStream};
use fleet_exec::session::ExecutionRequest;
use fleet_exec::sse::{event_stream, to_sse_event};
use fleet_exec::ExecutionEngine;

fn request(node: &str) -> ExecutionRequest {
    ExecutionRequest::new(node, "uname", ["-a"])
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_sse_body_carries_named_events() {
    let engine = ExecutionEngine::default();
    let id = engine.create_session(request("mate-1")).unwrap();
    let sub = engine.attach(&id).unwrap();

    engine.append_output(&id, OutputStream::Stdout, "Linux");
    engine.complete_execution(&id, 0);

    let response = event_stream(sub).into_response();
    assert_eq!(
        response.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );
    let text = body_text(response).await;

    let start = text.find("event: start").expect("start event");
    let chunk = text.find("event: chunk").expect("chunk event");
    let done = text.find("event: done").expect("done event");
    assert!(start < chunk && chunk < done);
    assert!(text.contains(&format!(r#""sessionId":"{id}""#)));
    assert!(text.contains(r#""content":"Linux""#));
    assert!(text.contains(r#""exitCode":0"#));
}

#[tokio::test]
async fn test_sse_error_event() {
    let engine = ExecutionEngine::default();
    let id = engine.create_session(request("mate-1")).unwrap();
    let sub = engine.attach(&id).unwrap();
    engine.fail_execution(&id, "node offline");

    let text = body_text(event_stream(sub).into_response()).await;
    assert!(text.contains("event: error"));
    assert!(text.contains(r#""error":"node offline""#));
    assert!(!text.contains("event: done"));
}

#[tokio::test]
async fn test_dropping_response_deregisters_subscriber() {
    let engine = ExecutionEngine::default();
    let id = engine.create_session(request("mate-1")).unwrap();
    let sub = engine.attach(&id).unwrap();
    assert!(engine.channels().is_attached(&id));

    let response = event_stream(sub).into_response();
    drop(response);

    assert!(!engine.channels().is_attached(&id));
    // the execution itself carries on
    engine.append_output(&id, OutputStream::Stdout, "still here");
    let entry = engine.complete_execution(&id, 0).unwrap();
    assert_eq!(entry.output, "still here");
}

#[test]
fn test_to_sse_event_encodes_payload() {
    assert!(to_sse_event(&ExecEvent::chunk(OutputStream::Stderr, "x")).is_ok());
    assert!(to_sse_event(&ExecEvent::Error { error: "e".into() }).is_ok());
}
