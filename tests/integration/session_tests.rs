//! Integration tests for `Session` exchange serialisation and teardown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio::io::{duplex, split};

use stdio_bridge::protocol::codec::LineCodec;
use stdio_bridge::protocol::envelope::RpcRequest;
use stdio_bridge::session::spawner::Launcher;
use stdio_bridge::session::Session;
use stdio_bridge::AppError;

use super::test_helpers::{raw, raw_text, PeerBehavior, ScriptedLauncher};

fn numbered(id: &str) -> RpcRequest {
    RpcRequest::new(Some(raw_text(id)), "m", None)
}

#[tokio::test]
async fn response_id_echoes_request_id_in_every_form() {
    let launcher = ScriptedLauncher::new(PeerBehavior::Echo);
    let session = launcher.launch("ids").expect("launch");

    for id in [Some("7"), Some(r#""req-7""#), Some("null"), None] {
        let request = RpcRequest::new(id.map(raw_text), "ping", Some(raw(json!({}))));
        let response = session.exchange(&request, None).await.expect("exchange");
        assert_eq!(response.id_json(), id, "id must be echoed exactly");
    }
}

#[tokio::test]
async fn numeric_ids_and_params_are_relayed_as_written() {
    let launcher = ScriptedLauncher::new(PeerBehavior::Echo);
    let session = launcher.launch("numbers").expect("launch");

    for id in ["123456789012345678901234", "1E2", "-0.0"] {
        let request = RpcRequest::new(
            Some(raw_text(id)),
            "m",
            Some(raw_text(r#"{"z":1,"a":2,"x":1e400}"#)),
        );
        let response = session.exchange(&request, None).await.expect("exchange");
        assert_eq!(response.id_json(), Some(id));
        assert_eq!(response.result_json(), Some(r#"{"z":1,"a":2,"x":1e400}"#));
    }
}

#[tokio::test]
async fn concurrent_exchanges_never_interleave() {
    let launcher = ScriptedLauncher::new(PeerBehavior::EchoAfter(Duration::from_millis(5)));
    let session = Arc::new(launcher.launch("shared").expect("launch"));

    let calls = (0..24).map(|n| {
        let session = Arc::clone(&session);
        async move {
            let marker = format!("caller-{n}");
            let request = RpcRequest::new(
                Some(raw(json!(n))),
                "echo",
                Some(raw(json!({ "marker": marker }))),
            );
            let response = session.exchange(&request, None).await.expect("exchange");
            (n, marker, response)
        }
    });
    let spawned: Vec<_> = calls.map(tokio::spawn).collect();
    let results = join_all(spawned).await;

    for joined in results {
        let (n, marker, response) = joined.expect("task");
        assert_eq!(response.id_json(), Some(n.to_string().as_str()));
        assert_eq!(
            response.result_json(),
            Some(format!(r#"{{"marker":"{marker}"}}"#).as_str())
        );
    }
    assert!(
        !launcher.overlap_detected(),
        "a request reached the peer before the previous reply was read"
    );
}

#[tokio::test]
async fn decode_failure_leaves_session_open() {
    let launcher = ScriptedLauncher::new(PeerBehavior::Garbage);
    let session = launcher.launch("garbage").expect("launch");

    for _ in 0..2 {
        let result = session.exchange(&numbered("1"), None).await;
        assert!(matches!(result, Err(AppError::ProtocolDecode(_))), "got: {result:?}");
    }
    assert!(!session.is_closed());
}

#[tokio::test]
async fn silent_peer_times_out() {
    let launcher = ScriptedLauncher::new(PeerBehavior::Silent);
    let session = launcher.launch("silent").expect("launch");

    let result = session
        .exchange(&numbered("1"), Some(Duration::from_millis(100)))
        .await;

    match result {
        Err(AppError::TransportTimeout(msg)) => assert!(msg.contains("no response")),
        other => panic!("expected TransportTimeout, got: {other:?}"),
    }
    assert!(!session.is_broken(), "the request was written in full");
}

#[tokio::test]
async fn late_reply_after_timeout_is_not_handed_to_the_next_caller() {
    let launcher = ScriptedLauncher::new(PeerBehavior::EchoAfter(Duration::from_millis(300)));
    let session = launcher.launch("late").expect("launch");

    let first = RpcRequest::new(Some(raw_text("1")), "m", Some(raw(json!({"who": "first"}))));
    let timed_out = session
        .exchange(&first, Some(Duration::from_millis(100)))
        .await;
    assert!(
        matches!(timed_out, Err(AppError::TransportTimeout(_))),
        "got: {timed_out:?}"
    );

    let second = RpcRequest::new(Some(raw_text("2")), "m", Some(raw(json!({"who": "second"}))));
    let response = session.exchange(&second, None).await.expect("second exchange");

    assert_eq!(response.id_json(), Some("2"));
    assert_eq!(response.result_json(), Some(r#"{"who":"second"}"#));
    assert!(!session.is_broken());
}

#[tokio::test]
async fn interrupted_write_marks_session_broken() {
    // A tiny pipe nobody reads: the write of a large request stalls.
    let (ours, _stalled_peer) = duplex(64);
    let (read, write) = split(ours);
    let session = Session::from_streams("stalled", write, read, LineCodec::new());

    let big = RpcRequest::new(Some(raw_text("1")), "m", Some(raw(json!("x".repeat(4096)))));
    let result = session.exchange(&big, Some(Duration::from_millis(50))).await;
    assert!(matches!(result, Err(AppError::TransportTimeout(_))), "got: {result:?}");
    assert!(session.is_broken());

    let next = session.exchange(&numbered("2"), Some(Duration::from_millis(50))).await;
    assert!(matches!(next, Err(AppError::TransportWrite(_))), "got: {next:?}");
}

#[tokio::test]
async fn close_is_idempotent() {
    let launcher = ScriptedLauncher::new(PeerBehavior::Echo);
    let session = Arc::new(launcher.launch("twice").expect("launch"));

    let (a, b) = tokio::join!(session.close(), session.close());
    a.expect("first close");
    b.expect("concurrent close");
    session.close().await.expect("repeated close");
    assert!(session.is_closed());
}

#[tokio::test]
async fn exchange_after_close_is_rejected() {
    let launcher = ScriptedLauncher::new(PeerBehavior::Echo);
    let session = launcher.launch("closed").expect("launch");
    session.close().await.expect("close");

    let result = session.exchange(&numbered("1"), None).await;
    assert!(matches!(result, Err(AppError::SessionClosed(_))), "got: {result:?}");
}

#[tokio::test]
async fn close_during_exchange_fails_the_exchange_without_panicking() {
    let launcher = ScriptedLauncher::new(PeerBehavior::Silent);
    let session = Arc::new(launcher.launch("racing").expect("launch"));

    let pending = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.exchange(&numbered("1"), None).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.is_busy());
    tokio::time::timeout(Duration::from_secs(5), session.close())
        .await
        .expect("close must not wait on the stuck exchange")
        .expect("close");

    let result = pending.await.expect("exchange task must not panic");
    assert!(matches!(result, Err(AppError::SessionClosed(_))), "got: {result:?}");
}

#[tokio::test]
async fn last_activity_advances_on_exchange() {
    let launcher = ScriptedLauncher::new(PeerBehavior::Echo);
    let session = launcher.launch("activity").expect("launch");
    let before = session.last_activity();
    assert_eq!(before, session.created_at());
    assert!(!session.is_busy());

    tokio::time::sleep(Duration::from_millis(10)).await;
    session.exchange(&numbered("1"), None).await.expect("exchange");

    assert!(session.last_activity() > before);
    assert_eq!(session.key(), "activity");
    assert_eq!(session.pid(), None);
}
