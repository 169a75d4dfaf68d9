//! Graceful shutdown of the transport server.

use bytes::Bytes;
use rpc::{Code, MethodDescriptor, Protocol, ServiceDescriptor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use transport::config::Config;
use transport::{CallOptions, Client, Server, ServerHandle, UnaryReply, unary_fn};

const SLOW: &str = "/demo.Slow/Wait";

fn config(toml_str: &str) -> Config {
    toml::from_str(toml_str).unwrap()
}

/// Starts a server whose handler sleeps for the number of milliseconds in
/// the request body.
async fn start_server(config: &Config) -> (SocketAddr, ServerHandle, tokio::task::JoinHandle<()>) {
    let service = ServiceDescriptor::new("demo.Slow")
        .method(MethodDescriptor::unary("Wait", "demo.WaitRequest", "demo.WaitReply"));
    let server = Server::builder()
        .register(
            service,
            unary_fn(|request| async move {
                let millis = std::str::from_utf8(&request.message)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(UnaryReply::new("done"))
            }),
        )
        .unwrap()
        .build(config)
        .unwrap();

    let handle = server.handle();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (addr, handle, serving)
}

async fn wait_for_active(handle: &ServerHandle, count: usize) {
    let start = Instant::now();
    while handle.active_calls() < count {
        assert!(start.elapsed() < Duration::from_secs(2), "call never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_call() {
    let (addr, handle, serving) = start_server(&config("[server]\ndrain_timeout_ms = 2000")).await;
    let client = Client::new(&Config::default());

    let call = tokio::spawn(async move {
        client
            .unary(addr, SLOW, CallOptions::new(Protocol::Grpc), Bytes::from_static(b"200"))
            .await
    });
    wait_for_active(&handle, 1).await;

    let start = Instant::now();
    handle.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(2));

    let response = call.await.unwrap();
    assert!(response.is_ok(), "{:?}", response.status);
    assert_eq!(response.message.as_deref(), Some(&b"done"[..]));

    tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .expect("server did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_aborts_calls_after_drain_timeout() {
    let (addr, handle, serving) = start_server(&config("[server]\ndrain_timeout_ms = 100")).await;
    let client = Arc::new(Client::new(&Config::default()));

    let mut calls = Vec::new();
    for protocol in [Protocol::Grpc, Protocol::Triple] {
        let client = Arc::clone(&client);
        calls.push(tokio::spawn(async move {
            client
                .unary(addr, SLOW, CallOptions::new(protocol), Bytes::from_static(b"10000"))
                .await
        }));
    }
    wait_for_active(&handle, 2).await;

    let start = Instant::now();
    handle.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(handle.active_calls(), 0);

    for call in calls {
        let response = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("call was not aborted")
            .unwrap();
        assert_eq!(response.status.code(), Code::Unavailable);
    }

    tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .expect("server did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_no_calls_accepted_after_shutdown() {
    let (addr, handle, serving) = start_server(&Config::default()).await;
    let client = Client::new(&Config::default());

    let response = client
        .unary(addr, SLOW, CallOptions::new(Protocol::Triple), Bytes::from_static(b"0"))
        .await;
    assert!(response.is_ok(), "{:?}", response.status);

    handle.shutdown().await;
    serving.await.unwrap();

    let fresh = Client::new(&Config::default());
    let response = fresh
        .unary(
            addr,
            SLOW,
            CallOptions::new(Protocol::Triple).timeout(Duration::from_secs(1)),
            Bytes::from_static(b"0"),
        )
        .await;
    assert_eq!(response.status.code(), Code::Unavailable);
}
