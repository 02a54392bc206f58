//! Request pipeline integration tests against a canned local HTTP server.
//!
//! Each connection serves exactly one scripted response and closes, so the
//! accept count equals the pipeline's attempt count.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tablelink::api::{ApiClient, ApiErrorKind};
use tablelink::config::ApiConfig;

struct TestServer {
    addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    accept_times: Arc<Mutex<Vec<Instant>>>,
}

/// Serve the scripted responses one connection at a time; the last entry
/// repeats once the script runs out.
async fn spawn_server(responses: Vec<String>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let accept_times = Arc::new(Mutex::new(Vec::new()));

    let accepts_clone = accepts.clone();
    let times_clone = accept_times.clone();
    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            accepts_clone.fetch_add(1, Ordering::SeqCst);
            times_clone.lock().push(Instant::now());

            let response = responses[served.min(responses.len() - 1)].clone();
            served += 1;
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    TestServer {
        addr,
        accepts,
        accept_times,
    }
}

fn http_response(status: u16, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    };
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
}

fn client_for(addr: SocketAddr, max_retries: u32, backoff_unit: Duration) -> ApiClient {
    ApiClient::new(ApiConfig {
        base_url: format!("http://{}", addr),
        auth_token: Some("table-session-token".into()),
        request_timeout: Duration::from_secs(2),
        max_retries,
        retry_backoff_unit: backoff_unit,
    })
    .unwrap()
}

#[tokio::test]
async fn recoverable_failure_retries_until_exhaustion() {
    let server = spawn_server(vec![http_response(500, "{}")]).await;
    let client = client_for(server.addr, 2, Duration::from_millis(10));

    let err = client
        .send(Method::GET, "/table/state", None, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ApiErrorKind::Server);
    assert!(err.recoverable);
    assert_eq!(err.status, 500);
    // max_retries = 2 -> exactly 3 attempts
    assert_eq!(server.accepts.load(Ordering::SeqCst), 3);

    let stats = client.stats().snapshot();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.successes, 0);
}

#[tokio::test]
async fn non_recoverable_failure_makes_a_single_attempt() {
    let server = spawn_server(vec![http_response(404, "{}")]).await;
    let client = client_for(server.addr, 3, Duration::from_millis(10));

    let err = client
        .send(Method::GET, "/table/unknown", None, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ApiErrorKind::Client);
    assert!(!err.recoverable);
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let server = spawn_server(vec![
        http_response(503, "{}"),
        http_response(200, r#"{"round": 17, "phase": "betting"}"#),
    ])
    .await;
    let client = client_for(server.addr, 3, Duration::from_millis(10));

    let value = client
        .send(Method::GET, "/table/state", None, None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(value["round"], 17);
    assert_eq!(server.accepts.load(Ordering::SeqCst), 2);

    let stats = client.stats().snapshot();
    assert_eq!(stats.attempts, 2);
    assert_eq!(stats.successes, 1);
}

#[tokio::test]
async fn retry_delays_follow_the_backoff_curve() {
    let server = spawn_server(vec![http_response(500, "{}")]).await;
    let unit = Duration::from_millis(50);
    let client = client_for(server.addr, 2, unit);

    client
        .send(Method::GET, "/table/state", None, None)
        .await
        .unwrap_err();

    let times = server.accept_times.lock().clone();
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    // 1 unit, then 2 units; sleeps guarantee at-least durations
    assert!(first_gap >= Duration::from_millis(45), "{:?}", first_gap);
    assert!(second_gap >= Duration::from_millis(90), "{:?}", second_gap);
    assert!(second_gap >= first_gap);
}

#[tokio::test]
async fn auth_failure_fires_both_callbacks_once() {
    let server = spawn_server(vec![http_response(401, "{}")]).await;
    let client = client_for(server.addr, 3, Duration::from_millis(10));

    let auth_hits = Arc::new(AtomicUsize::new(0));
    let error_hits = Arc::new(AtomicUsize::new(0));
    let c = auth_hits.clone();
    client.set_auth_failure_callback(Box::new(move |err| {
        assert_eq!(err.status, 401);
        c.fetch_add(1, Ordering::SeqCst);
    }));
    let c = error_hits.clone();
    client.set_error_callback(Box::new(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    }));

    let err = client
        .send(Method::POST, "/session/refresh", None, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ApiErrorKind::Auth);
    assert!(!err.recoverable);
    // Not retried, each callback exactly once
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);
    assert_eq!(auth_hits.load(Ordering::SeqCst), 1);
    assert_eq!(error_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_body_is_a_null_result_not_an_error() {
    let server = spawn_server(vec![http_response(200, "")]).await;
    let client = client_for(server.addr, 1, Duration::from_millis(10));

    let value = client
        .send(Method::POST, "/table/sit-out", None, None)
        .await
        .unwrap();
    assert!(value.is_none());

    let stats = client.stats().snapshot();
    assert_eq!(stats.successes, 1);
}

#[tokio::test]
async fn malformed_body_is_a_deserialization_error() {
    let server = spawn_server(vec![http_response(200, "<html>maintenance</html>")]).await;
    let client = client_for(server.addr, 3, Duration::from_millis(10));

    let err = client
        .send(Method::GET, "/table/state", None, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ApiErrorKind::Deserialization);
    assert!(!err.recoverable);
    assert_eq!(err.status, 200);
    // Never retried
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_interceptors_shape_the_outgoing_request() {
    let server = spawn_server(vec![http_response(200, r#"{"ok": true}"#)]).await;
    let client = client_for(server.addr, 1, Duration::from_millis(10));

    client.add_request_interceptor(Box::new(|builder| {
        builder.header("X-Table-Id", "baccarat-12")
    }));
    let seen = Arc::new(AtomicUsize::new(0));
    let c = seen.clone();
    client.add_response_interceptor(Box::new(move |ctx| {
        assert_eq!(ctx.status, 200);
        c.fetch_add(1, Ordering::SeqCst);
    }));

    client
        .send(Method::GET, "/table/state", None, None)
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
