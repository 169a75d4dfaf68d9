//! End-to-end calls between the transport client and server.
//!
//! Each test starts a server on an ephemeral port with a small greeter
//! service and drives it with a real client.

use bytes::Bytes;
use rpc::{CallKind, Code, Encoding, HeaderSet, MethodDescriptor, Protocol, ServiceDescriptor, Status};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use transport::config::Config;
use transport::{
    CallOptions, Client, Server, ServerHandle, SharedHandler, UnaryReply, handler_fn, unary_fn,
};

const SAY_HELLO: &str = "/demo.Greeter/SayHello";
const CHAT: &str = "/demo.Greeter/Chat";
const PROTOCOLS: [Protocol; 3] = [Protocol::Grpc, Protocol::GrpcWeb, Protocol::Triple];

fn config(toml_str: &str) -> Config {
    toml::from_str(toml_str).unwrap()
}

fn greeter() -> ServiceDescriptor {
    ServiceDescriptor::new("demo.Greeter")
        .method(MethodDescriptor::unary("SayHello", "demo.HelloRequest", "demo.HelloReply"))
        .method(MethodDescriptor::new(
            "Chat",
            CallKind::BidiStreaming,
            "demo.HelloRequest",
            "demo.HelloReply",
        ))
}

/// Greets every request message. Request metadata steers it:
/// `x-delay-ms` sleeps before reading, `x-fail` returns that status code.
fn greeter_handler(invocations: Arc<AtomicUsize>) -> SharedHandler {
    handler_fn(move |mut call, mut responder| {
        let invocations = Arc::clone(&invocations);
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = call.metadata().get("x-delay-ms").and_then(|v| v.parse().ok()) {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if let Some(code) = call.metadata().get("x-fail").and_then(|v| v.parse().ok()) {
                return Err(Status::new(Code::from_u32(code), "requested failure"));
            }

            let unary = call.info().method.kind.is_unary();
            let mut count = 0;
            while let Some(message) = call.message().await? {
                if count == 0 {
                    let mut headers = HeaderSet::new();
                    headers.set("x-greeter", "demo");
                    responder.send_headers(headers).await?;
                }
                count += 1;
                let mut reply = b"hello, ".to_vec();
                reply.extend_from_slice(&message);
                responder.send(Bytes::from(reply)).await?;
                if unary {
                    break;
                }
            }

            let mut trailers = HeaderSet::new();
            trailers.set("x-count", count.to_string());
            Ok(trailers)
        }
    })
}

struct TestServer {
    addr: SocketAddr,
    handle: ServerHandle,
    invocations: Arc<AtomicUsize>,
}

async fn start_server(config: &Config, service: ServiceDescriptor) -> TestServer {
    let invocations = Arc::new(AtomicUsize::new(0));
    let server = Server::builder()
        .register(service, greeter_handler(Arc::clone(&invocations)))
        .unwrap()
        .build(config)
        .unwrap();
    let handle = server.handle();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    TestServer {
        addr,
        handle,
        invocations,
    }
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
async fn test_unary_within_timeout_succeeds() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Client::new(&Config::default());

    for protocol in PROTOCOLS {
        let options = CallOptions::new(protocol)
            .timeout(Duration::from_millis(500))
            .metadata("x-delay-ms", "10");
        let response = client
            .unary(server.addr, SAY_HELLO, options, Bytes::from_static(b"world"))
            .await;

        assert!(response.is_ok(), "{protocol}: {:?}", response.status);
        assert_eq!(response.message.as_deref(), Some(&b"hello, world"[..]), "{protocol}");
        assert_eq!(response.headers.get("x-greeter"), Some("demo"), "{protocol}");
        assert_eq!(response.trailers.get("x-count"), Some("1"), "{protocol}");
        assert!(
            response.headers.keys().all(|k| !k.starts_with("trailer-")),
            "{protocol}: trailers leaked into headers"
        );
        assert!(!response.trailers.contains_key("grpc-status"), "{protocol}");
    }
    assert_eq!(server.invocations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_handler_error_reaches_client() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Client::new(&Config::default());

    for protocol in PROTOCOLS {
        let options = CallOptions::new(protocol).metadata("x-fail", "5");
        let response = client
            .unary(server.addr, SAY_HELLO, options, Bytes::from_static(b"world"))
            .await;

        assert_eq!(response.status.code(), Code::NotFound, "{protocol}");
        assert_eq!(response.status.message(), Some("requested failure"), "{protocol}");
        assert!(response.message.is_none(), "{protocol}");
    }
}

#[tokio::test]
async fn test_unknown_method_is_unimplemented() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Client::new(&Config::default());

    for protocol in PROTOCOLS {
        let response = client
            .unary(
                server.addr,
                "/demo.Greeter/Missing",
                CallOptions::new(protocol),
                Bytes::from_static(b"world"),
            )
            .await;
        assert_eq!(response.status.code(), Code::Unimplemented, "{protocol}");
    }
    assert_eq!(server.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_group_mismatch_never_reaches_handler() {
    let server = start_server(&Config::default(), greeter().group("billing")).await;
    let client = Client::new(&Config::default());

    let response = client
        .unary(
            server.addr,
            SAY_HELLO,
            CallOptions::new(Protocol::Triple).group("other"),
            Bytes::from_static(b"world"),
        )
        .await;
    assert_eq!(response.status.code(), Code::Unimplemented);
    assert_eq!(server.invocations.load(Ordering::SeqCst), 0);

    let response = client
        .unary(
            server.addr,
            SAY_HELLO,
            CallOptions::new(Protocol::Triple).group("billing"),
            Bytes::from_static(b"world"),
        )
        .await;
    assert!(response.is_ok(), "{:?}", response.status);
    assert_eq!(server.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_deadline_exceeded_releases_stream() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Client::new(&Config::default());

    for protocol in PROTOCOLS {
        let options = CallOptions::new(protocol)
            .timeout(Duration::from_millis(100))
            .metadata("x-delay-ms", "2000");
        let start = Instant::now();
        let response = client
            .unary(server.addr, SAY_HELLO, options, Bytes::from_static(b"world"))
            .await;

        assert_eq!(response.status.code(), Code::DeadlineExceeded, "{protocol}");
        assert!(start.elapsed() < Duration::from_secs(1), "{protocol}");
        assert_eq!(client.sessions().open_streams(server.addr), 0, "{protocol}");
    }

    assert!(
        wait_until(Duration::from_secs(2), || server.handle.active_calls() == 0).await,
        "server kept running expired handlers"
    );
}

#[tokio::test]
async fn test_server_enforces_caller_deadline() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Client::new(&Config::default());

    // no client-side deadline; only the server sees the timeout header
    let options = CallOptions::new(Protocol::Triple)
        .metadata("tri-service-timeout", "50")
        .metadata("x-delay-ms", "2000");
    let start = Instant::now();
    let response = client
        .unary(server.addr, SAY_HELLO, options, Bytes::from_static(b"world"))
        .await;

    assert_eq!(response.status.code(), Code::DeadlineExceeded);
    assert!(start.elapsed() < Duration::from_secs(1));

    let options = CallOptions::new(Protocol::Grpc)
        .metadata("grpc-timeout", "50m")
        .metadata("x-delay-ms", "2000");
    let response = client
        .unary(server.addr, SAY_HELLO, options, Bytes::from_static(b"world"))
        .await;
    assert_eq!(response.status.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn test_bidi_stream_round_trip() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Client::new(&Config::default());

    for protocol in PROTOCOLS {
        let mut call = client
            .call(server.addr, CHAT, CallOptions::new(protocol))
            .await
            .unwrap();

        call.send(Bytes::from_static(b"alice")).await.unwrap();
        let reply = call.message().await.unwrap();
        assert_eq!(reply.as_deref(), Some(&b"hello, alice"[..]), "{protocol}");
        assert_eq!(
            call.response_headers().await.unwrap().get("x-greeter"),
            Some("demo"),
            "{protocol}"
        );

        call.send(Bytes::from_static(b"bob")).await.unwrap();
        let reply = call.message().await.unwrap();
        assert_eq!(reply.as_deref(), Some(&b"hello, bob"[..]), "{protocol}");

        call.close_send().unwrap();
        assert_eq!(call.message().await.unwrap(), None, "{protocol}");

        let result = call.finish().await;
        assert!(result.status.is_ok(), "{protocol}: {:?}", result.status);
        assert_eq!(result.trailers.get("x-count"), Some("2"), "{protocol}");
    }
    assert_eq!(client.sessions().open_streams(server.addr), 0);
}

#[tokio::test]
async fn test_streaming_deadline_cancels_call() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Client::new(&Config::default());

    let mut call = client
        .call(
            server.addr,
            CHAT,
            CallOptions::new(Protocol::Triple).timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    // the handler waits for a message that never comes
    let err = call.message().await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert_eq!(call.status().map(|s| s.code()), Some(Code::DeadlineExceeded));
    assert_eq!(client.sessions().open_streams(server.addr), 0);

    let result = call.finish().await;
    assert_eq!(result.status.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn test_unary_over_http1() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Client::new(&Config::default());

    for protocol in [Protocol::Triple, Protocol::GrpcWeb] {
        let options = CallOptions::new(protocol)
            .http1(true)
            .timeout(Duration::from_secs(2));
        let response = client
            .unary(server.addr, SAY_HELLO, options, Bytes::from_static(b"world"))
            .await;

        assert!(response.is_ok(), "{protocol}: {:?}", response.status);
        assert_eq!(response.message.as_deref(), Some(&b"hello, world"[..]), "{protocol}");
        assert_eq!(response.trailers.get("x-count"), Some("1"), "{protocol}");
    }

    let response = client
        .unary(
            server.addr,
            SAY_HELLO,
            CallOptions::new(Protocol::Triple).http1(true).metadata("x-fail", "7"),
            Bytes::from_static(b"world"),
        )
        .await;
    assert_eq!(response.status.code(), Code::PermissionDenied);
}

#[tokio::test]
async fn test_http1_refused_when_disabled() {
    let server = start_server(&config("[server]\nhttp1 = false"), greeter()).await;
    let client = Client::new(&Config::default());

    let response = client
        .unary(
            server.addr,
            SAY_HELLO,
            CallOptions::new(Protocol::Triple)
                .http1(true)
                .timeout(Duration::from_secs(2)),
            Bytes::from_static(b"world"),
        )
        .await;
    assert!(!response.is_ok());

    // HTTP/2 still works
    let response = client
        .unary(
            server.addr,
            SAY_HELLO,
            CallOptions::new(Protocol::Triple),
            Bytes::from_static(b"world"),
        )
        .await;
    assert!(response.is_ok(), "{:?}", response.status);
}

#[tokio::test]
async fn test_gzip_messages_round_trip() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Client::new(&Config::default());
    let payload = Bytes::from(vec![b'a'; 8192]);
    let mut expected = b"hello, ".to_vec();
    expected.extend_from_slice(&payload);

    for protocol in PROTOCOLS {
        let options = CallOptions::new(protocol).compression(Encoding::Gzip);
        let response = client
            .unary(server.addr, SAY_HELLO, options, payload.clone())
            .await;

        assert!(response.is_ok(), "{protocol}: {:?}", response.status);
        assert_eq!(response.message.as_deref(), Some(&expected[..]), "{protocol}");
    }

    let mut call = client
        .call(server.addr, CHAT, CallOptions::new(Protocol::Grpc).compression(Encoding::Gzip))
        .await
        .unwrap();
    call.send(payload.clone()).await.unwrap();
    assert_eq!(call.message().await.unwrap().as_deref(), Some(&expected[..]));
    call.close_send().unwrap();
    assert!(call.finish().await.status.is_ok());
}

#[tokio::test]
async fn test_oversized_request_is_rejected() {
    let server = start_server(&config("[server]\nread_max_bytes = \"1KB\""), greeter()).await;
    let client = Client::new(&Config::default());
    let payload = Bytes::from(vec![b'a'; 4096]);

    for protocol in PROTOCOLS {
        let response = client
            .unary(server.addr, SAY_HELLO, CallOptions::new(protocol), payload.clone())
            .await;
        assert_eq!(response.status.code(), Code::ResourceExhausted, "{protocol}");
    }
}

#[tokio::test]
async fn test_concurrent_calls_share_one_session() {
    let server = start_server(&Config::default(), greeter()).await;
    let client = Arc::new(Client::new(&Config::default()));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let client = Arc::clone(&client);
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            let message = Bytes::from(format!("caller {i}"));
            client
                .unary(addr, SAY_HELLO, CallOptions::new(Protocol::Grpc), message)
                .await
        }));
    }
    for task in tasks {
        let response = task.await.unwrap();
        assert!(response.is_ok(), "{:?}", response.status);
    }

    assert_eq!(client.sessions().sessions_created(), 1);
    assert_eq!(client.sessions().open_streams(server.addr), 0);
}

#[tokio::test]
async fn test_invalid_trailers_become_internal() {
    let service = ServiceDescriptor::new("demo.Leaky")
        .method(MethodDescriptor::unary("Get", "demo.GetRequest", "demo.GetReply"));
    let server = Server::builder()
        .register(
            service,
            unary_fn(|_request| async move {
                Ok(UnaryReply::new("value")
                    .trailer("x-a", "ok")
                    .trailer("x-bad", "v\r\ngrpc-status: 5\r\ngrpc-message: injected")
                    .trailer("x-c", "c"))
            }),
        )
        .unwrap()
        .build(&Config::default())
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    let client = Client::new(&Config::default());

    for protocol in PROTOCOLS {
        let response = client
            .unary(addr, "/demo.Leaky/Get", CallOptions::new(protocol), Bytes::from_static(b"k"))
            .await;

        assert_eq!(response.status.code(), Code::Internal, "{protocol}: {:?}", response.status);
        assert_ne!(response.status.message(), Some("injected"), "{protocol}");
        assert!(response.message.is_none(), "{protocol}");
        assert!(!response.trailers.contains_key("x-c"), "{protocol}");
    }
}
