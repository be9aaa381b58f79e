//! Integration tests for process-backed sessions.
//!
//! These spawn real executables (`cat`, `sh`, `sleep`, `true`) and only run
//! on Unix.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;

use stdio_bridge::protocol::envelope::{RawJson, RpcRequest};
use stdio_bridge::session::spawner::{Launcher, ProcessLauncher, SpawnConfig};
use stdio_bridge::session::{EvictionPolicy, SessionRegistry};
use stdio_bridge::AppError;

use super::test_helpers::raw_text;

fn launcher(command: &str, args: &[&str]) -> ProcessLauncher {
    let mut config = SpawnConfig::new(command);
    config.args = args.iter().map(|a| (*a).to_owned()).collect();
    config.shutdown_grace = Duration::from_millis(200);
    ProcessLauncher::new(config)
}

/// A request that `cat` reflects back as a well-formed response line.
fn reflected(id: Option<RawJson>) -> RpcRequest {
    RpcRequest::new(id, "echo", Some(raw_text(r#"{"k":"v"}"#)))
}

#[tokio::test]
async fn cat_round_trip_preserves_id() {
    let session = launcher("cat", &[]).launch("cat-1").expect("spawn cat");
    assert!(session.pid().is_some());

    let response = session
        .exchange(&reflected(Some(raw_text("7"))), Some(Duration::from_secs(5)))
        .await
        .expect("exchange");
    assert_eq!(response.id_json(), Some("7"));
    assert_eq!(response.jsonrpc.as_deref(), Some("2.0"));

    let response = session
        .exchange(&reflected(None), Some(Duration::from_secs(5)))
        .await
        .expect("exchange");
    assert_eq!(response.id_json(), None);

    let response = session
        .exchange(
            &reflected(Some(raw_text("123456789012345678901234"))),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("exchange");
    assert_eq!(response.id_json(), Some("123456789012345678901234"));

    session.close().await.expect("close");
}

#[tokio::test]
async fn concurrent_requests_to_cat_each_get_their_own_line() {
    let session = Arc::new(launcher("cat", &[]).launch("cat-many").expect("spawn cat"));

    let tasks = (0..20).map(|n| {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            let request = RpcRequest::new(Some(raw_text(&n.to_string())), "echo", None);
            (n, session.exchange(&request, Some(Duration::from_secs(5))).await)
        })
    });

    for joined in join_all(tasks).await {
        let (n, result) = joined.expect("task");
        let response = result.expect("exchange");
        assert_eq!(response.id_json(), Some(n.to_string().as_str()));
    }
    session.close().await.expect("close");
}

#[tokio::test]
async fn missing_executable_is_process_start_error() {
    let result = launcher("definitely-not-a-real-binary-4f1c", &[]).launch("nope");
    assert!(matches!(result, Err(AppError::ProcessStart(_))), "got: {result:?}");
}

#[tokio::test]
async fn registry_surfaces_spawn_failure() {
    let registry = SessionRegistry::new(
        Arc::new(launcher("definitely-not-a-real-binary-4f1c", &[])),
        Duration::from_secs(60),
        EvictionPolicy::Fixed,
    );

    let result = registry.resolve("nope").await;

    assert!(matches!(result, Err(AppError::ProcessStart(_))));
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn exited_child_yields_transport_error() {
    let session = launcher("true", &[]).launch("exits").expect("spawn true");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = session
        .exchange(&reflected(Some(raw_text("1"))), Some(Duration::from_secs(5)))
        .await;

    assert!(
        matches!(
            result,
            Err(AppError::TransportWrite(_) | AppError::TransportRead(_))
        ),
        "got: {result:?}"
    );
    session.close().await.expect("close");
}

#[tokio::test]
async fn stderr_output_does_not_disturb_stdout() {
    let session = launcher("sh", &["-c", "echo boom >&2; exec cat"])
        .launch("noisy")
        .expect("spawn sh");

    let response = session
        .exchange(&reflected(Some(raw_text(r#""s-1""#))), Some(Duration::from_secs(5)))
        .await
        .expect("exchange");
    assert_eq!(response.id_json(), Some(r#""s-1""#));

    session.close().await.expect("close");
}

#[tokio::test]
async fn child_sees_its_session_key() {
    let session = launcher(
        "sh",
        &[
            "-c",
            r#"read -r _; printf '{"jsonrpc":"2.0","id":1,"result":"%s"}\n' "$STDIO_BRIDGE_SESSION_KEY""#,
        ],
    )
    .launch("tenant-9")
    .expect("spawn sh");

    let response = session
        .exchange(&reflected(Some(raw_text("1"))), Some(Duration::from_secs(5)))
        .await
        .expect("exchange");
    assert_eq!(response.result_json(), Some(r#""tenant-9""#));

    session.close().await.expect("close");
}

#[tokio::test]
async fn stderr_written_during_shutdown_is_still_drained() {
    let marker_dir = tempfile::tempdir().expect("tempdir");
    let marker = marker_dir.path().join("stderr-ok");
    let script = format!(
        "cat >/dev/null; echo 'shutting down' >&2 && touch '{}'",
        marker.display()
    );
    let session = launcher("sh", &["-c", &script])
        .launch("farewell")
        .expect("spawn sh");

    session.close().await.expect("close");

    assert!(
        marker.exists(),
        "the child's stderr write after stdin closed must succeed"
    );
}

#[tokio::test]
async fn close_kills_a_child_that_ignores_stdin() {
    let session = launcher("sleep", &["30"]).launch("sleepy").expect("spawn sleep");

    let started = Instant::now();
    session.close().await.expect("close");

    assert!(
        started.elapsed() < Duration::from_secs(5),
        "close must kill after the grace period"
    );
    assert!(session.is_closed());
}

#[tokio::test]
async fn closing_twice_is_ok() {
    let session = launcher("cat", &[]).launch("twice").expect("spawn cat");
    session.close().await.expect("first close");
    session.close().await.expect("second close");
}
