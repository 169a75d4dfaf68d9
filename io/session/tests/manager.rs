//! Integration tests for the session manager.
//!
//! Each test runs a small in-process HTTP/2 server built on `h2` and drives
//! the manager against it.

use session::{SessionConfig, SessionManager, SessionState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// How the test server treats requests.
#[derive(Clone, Copy)]
enum Behavior {
    /// Respond 200 after the delay.
    Respond(Duration),
    /// Never respond.
    Hang,
    /// Complete the handshake, then stop driving the connection.
    Stall,
    /// Close the connection as soon as a request arrives.
    Hangup,
}

struct TestServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    goaway: watch::Sender<bool>,
}

async fn start_server(behavior: Behavior) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let (goaway, goaway_rx) = watch::channel(false);

    let accepted = connections.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let mut goaway = goaway_rx.clone();
            tokio::spawn(async move {
                let Ok(mut conn) = h2::server::handshake(socket).await else {
                    return;
                };
                if let Behavior::Stall = behavior {
                    let _conn = conn;
                    std::future::pending::<()>().await;
                    return;
                }

                let mut shutting_down = false;
                loop {
                    let next = if shutting_down {
                        conn.accept().await
                    } else {
                        tokio::select! {
                            next = conn.accept() => next,
                            _ = goaway.changed() => {
                                conn.graceful_shutdown();
                                shutting_down = true;
                                continue;
                            }
                        }
                    };
                    let Some(Ok((_request, mut respond))) = next else {
                        break;
                    };
                    if let Behavior::Hangup = behavior {
                        return;
                    }
                    tokio::spawn(async move {
                        match behavior {
                            Behavior::Respond(delay) => tokio::time::sleep(delay).await,
                            _ => std::future::pending::<()>().await,
                        }
                        let response = http::Response::builder().status(200).body(()).unwrap();
                        let _ = respond.send_response(response, true);
                    });
                }
            });
        }
    });

    TestServer {
        addr,
        connections,
        goaway,
    }
}

fn request(addr: SocketAddr) -> http::Request<()> {
    http::Request::builder()
        .method("POST")
        .uri(format!("http://{addr}/demo.Greeter/SayHello"))
        .body(())
        .unwrap()
}

fn config(toml_str: &str) -> SessionConfig {
    toml::from_str(toml_str).unwrap()
}

async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_concurrent_acquires_share_one_session() {
    let server = start_server(Behavior::Respond(Duration::ZERO)).await;
    let manager = SessionManager::new(SessionConfig::default());

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let manager = manager.clone();
        let addr = server.addr;
        tasks.push(tokio::spawn(async move { manager.acquire(addr).await }));
    }

    let mut leases = Vec::new();
    for task in tasks {
        leases.push(task.await.unwrap().unwrap());
    }

    assert_eq!(manager.sessions_created(), 1);
    assert_eq!(manager.session_count(server.addr), 1);
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(manager.open_streams(server.addr), 50);

    drop(leases);
    assert_eq!(manager.open_streams(server.addr), 0);
    assert_eq!(manager.state(server.addr), Some(SessionState::Ready));
}

#[tokio::test]
async fn test_lease_carries_a_request() {
    let server = start_server(Behavior::Respond(Duration::ZERO)).await;
    let manager = SessionManager::new(SessionConfig::default());

    let mut lease = manager.acquire(server.addr).await.unwrap();
    let (response, _send) = lease.send_request(request(server.addr), true).unwrap();
    let response = response.await.unwrap();
    assert_eq!(response.status(), 200);

    manager.release(lease);
    assert_eq!(manager.open_streams(server.addr), 0);

    // the session is reused
    let _lease = manager.acquire(server.addr).await.unwrap();
    assert_eq!(manager.sessions_created(), 1);
}

#[tokio::test]
async fn test_connect_failure_is_unavailable() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let manager = SessionManager::new(SessionConfig::default());

    let err = manager.acquire(addr).await.unwrap_err();
    let status: rpc::Status = err.into();
    assert_eq!(status.code(), rpc::Code::Unavailable);
    assert_eq!(manager.sessions_created(), 0);
    assert_eq!(manager.session_count(addr), 0);
}

#[tokio::test]
async fn test_idle_session_is_evicted() {
    let server = start_server(Behavior::Respond(Duration::ZERO)).await;
    let manager = SessionManager::new(config("idle_timeout_ms = 50"));

    drop(manager.acquire(server.addr).await.unwrap());
    assert_eq!(manager.session_count(server.addr), 1);

    assert!(
        wait_until(Duration::from_secs(2), || manager.session_count(server.addr) == 0).await,
        "idle session was not closed"
    );

    // the next acquire opens a fresh session
    let _lease = manager.acquire(server.addr).await.unwrap();
    assert_eq!(manager.sessions_created(), 2);
}

#[tokio::test]
async fn test_evicted_targets_leave_no_pool_behind() {
    let first = start_server(Behavior::Respond(Duration::ZERO)).await;
    let second = start_server(Behavior::Respond(Duration::ZERO)).await;
    let manager = SessionManager::new(config("idle_timeout_ms = 30"));

    drop(manager.acquire(first.addr).await.unwrap());
    drop(manager.acquire(second.addr).await.unwrap());
    assert_eq!(manager.target_count(), 2);

    assert!(
        wait_until(Duration::from_secs(2), || manager.target_count() == 0).await,
        "empty pools were kept"
    );
    assert_eq!(manager.state(first.addr), None);

    // a held lease keeps its pool
    let _lease = manager.acquire(first.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.target_count(), 1);
}

#[tokio::test]
async fn test_idle_eviction_never_cancels_in_flight_stream() {
    let server = start_server(Behavior::Respond(Duration::from_millis(300))).await;
    let manager = SessionManager::new(config("idle_timeout_ms = 20"));

    let mut lease = manager.acquire(server.addr).await.unwrap();
    let (response, _send) = lease.send_request(request(server.addr), true).unwrap();

    // several reaper periods pass while the stream is open
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.evict_idle(), 0);
    assert_eq!(manager.state(server.addr), Some(SessionState::Ready));

    let response = response.await.unwrap();
    assert_eq!(response.status(), 200);
    drop(lease);

    assert!(
        wait_until(Duration::from_secs(2), || manager.session_count(server.addr) == 0).await,
        "session was not closed once idle"
    );
}

#[tokio::test]
async fn test_goaway_opens_replacement_session() {
    let server = start_server(Behavior::Respond(Duration::ZERO)).await;
    let manager = SessionManager::new(SessionConfig::default());

    drop(manager.acquire(server.addr).await.unwrap());
    server.goaway.send(true).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || manager.session_count(server.addr) == 0).await,
        "client did not observe GOAWAY"
    );

    let mut lease = manager.acquire(server.addr).await.unwrap();
    assert_eq!(manager.sessions_created(), 2);
    let (response, _send) = lease.send_request(request(server.addr), true).unwrap();
    assert_eq!(response.await.unwrap().status(), 200);
}

#[tokio::test]
async fn test_unanswered_ping_closes_session() {
    let server = start_server(Behavior::Stall).await;
    let manager = SessionManager::new(config(
        r#"
        ping_interval_ms = 20
        ping_timeout_ms = 50
        ping_idle = true
        "#,
    ));

    let lease = manager.acquire(server.addr).await.unwrap();
    let session = lease.session().clone();
    drop(lease);

    assert!(
        wait_until(Duration::from_secs(2), || session.state() == SessionState::Closed).await,
        "session survived an unanswered PING"
    );
    let reason = session.close_reason().unwrap();
    assert_eq!(reason.code(), rpc::Code::Unavailable);
    assert_eq!(reason.message(), Some("PING timed out"));
}

#[tokio::test]
async fn test_shutdown_aborts_streams_after_drain_timeout() {
    let server = start_server(Behavior::Hang).await;
    let manager = SessionManager::new(config("drain_timeout_ms = 50"));

    let mut lease = manager.acquire(server.addr).await.unwrap();
    let (response, _send) = lease.send_request(request(server.addr), true).unwrap();

    let start = Instant::now();
    manager.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(2));

    let err = tokio::time::timeout(Duration::from_secs(2), response)
        .await
        .expect("stream was not aborted")
        .unwrap_err();
    let status = lease.status_for(&err);
    assert_eq!(status.code(), rpc::Code::Unavailable);

    drop(lease);
    assert_eq!(manager.open_streams(server.addr), 0);
    assert!(matches!(
        manager.acquire(server.addr).await,
        Err(session::SessionError::Shutdown)
    ));
}

#[tokio::test]
async fn test_shutdown_waits_for_streams_within_drain_timeout() {
    let server = start_server(Behavior::Respond(Duration::from_millis(100))).await;
    let manager = SessionManager::new(config("drain_timeout_ms = 2000"));

    let mut lease = manager.acquire(server.addr).await.unwrap();
    let (response, _send) = lease.send_request(request(server.addr), true).unwrap();

    let shutdown = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.shutdown().await })
    };

    assert_eq!(response.await.unwrap().status(), 200);
    drop(lease);

    tokio::time::timeout(Duration::from_secs(2), shutdown)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manager.session_count(server.addr), 0);
}

#[tokio::test]
async fn test_connection_loss_is_unavailable() {
    let server = start_server(Behavior::Hangup).await;
    let manager = SessionManager::new(SessionConfig::default());

    let mut lease = manager.acquire(server.addr).await.unwrap();
    let (response, _send) = lease.send_request(request(server.addr), true).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(2), response)
        .await
        .expect("broken connection was not noticed")
        .unwrap_err();
    assert_eq!(lease.status_for(&err).code(), rpc::Code::Unavailable);

    drop(lease);
    assert!(
        wait_until(Duration::from_secs(2), || manager.session_count(server.addr) == 0).await,
        "broken session was kept"
    );
}

#[tokio::test]
async fn test_goaway_marks_busy_session_closing() {
    let server = start_server(Behavior::Respond(Duration::from_millis(500))).await;
    let manager = SessionManager::new(SessionConfig::default());

    let mut lease = manager.acquire(server.addr).await.unwrap();
    let (response, _send) = lease.send_request(request(server.addr), true).unwrap();
    server.goaway.send(true).unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            manager.state(server.addr) == Some(SessionState::Closing)
        })
        .await,
        "session stayed ready after GOAWAY"
    );
    assert_eq!(lease.session().state(), SessionState::Closing);

    // the in-flight stream still completes
    assert_eq!(response.await.unwrap().status(), 200);
    drop(lease);
    assert!(
        wait_until(Duration::from_secs(2), || manager.session_count(server.addr) == 0).await,
        "drained session was not closed"
    );
}
