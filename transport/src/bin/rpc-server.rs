//! RPC server binary serving a health and an echo service.
//!
//! Payloads are opaque bytes: the echo service returns what it receives.

use bytes::Bytes;
use clap::Parser;
use rpc::{CallKind, HeaderSet, MethodDescriptor, ServiceDescriptor, Status};
use std::path::PathBuf;
use transport::config::Config;
use transport::{Responder, Server, ServerCall, UnaryReply, handler_fn, logging, signal, unary_fn};

#[derive(Parser)]
#[command(name = "rpc-server")]
#[command(about = "gRPC, gRPC-Web and Triple server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("No config file specified. Pass a config path or use --print-config");
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut shutdown = signal::install_signal_handler()?;
        let server = build_server(&config)?;
        let handle = server.handle();
        let listener = server.bind().await?;

        let serving = tokio::spawn(server.serve(listener));
        let _ = shutdown.wait_for(|signalled| *signalled).await;
        handle.shutdown().await;
        serving.await??;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn build_server(config: &Config) -> Result<Server, transport::Error> {
    let health_service = ServiceDescriptor::new("rpc.health.v1.Health")
        .method(MethodDescriptor::unary("Check", "rpc.health.v1.CheckRequest", "rpc.health.v1.CheckResponse"));
    let echo_service = ServiceDescriptor::new("rpc.echo.v1.Echo")
        .method(MethodDescriptor::unary("Echo", "rpc.echo.v1.Message", "rpc.echo.v1.Message"))
        .method(MethodDescriptor::new(
            "EchoStream",
            CallKind::BidiStreaming,
            "rpc.echo.v1.Message",
            "rpc.echo.v1.Message",
        ));

    let server = Server::builder()
        .register(
            health_service,
            unary_fn(|_request| async { Ok::<_, Status>(UnaryReply::new(Bytes::from_static(b"SERVING"))) }),
        )?
        .register(echo_service, handler_fn(echo))?
        .build(config)?;
    Ok(server)
}

async fn echo(mut call: ServerCall, mut responder: Responder) -> Result<HeaderSet, Status> {
    while let Some(message) = call.message().await? {
        responder.send(message).await?;
    }
    let mut trailers = HeaderSet::new();
    trailers.set("echo-count", responder.messages_sent().to_string());
    Ok(trailers)
}

fn print_default_config() {
    let config = r#"# RPC server configuration

[server]
# Address to listen on
address = "0.0.0.0:50051"
# Upper bound on a caller supplied timeout
max_timeout_ms = 300000
# How long shutdown waits for in-flight calls before aborting them
drain_timeout_ms = 10000
# Largest accepted message after decompression
read_max_bytes = "4MB"
# Compression algorithms, in preference order
accept_compression = ["gzip", "deflate"]
# Responses smaller than this are sent uncompressed
compress_min_bytes = "1KB"
# Reject Triple requests without tri-protocol-version
require_protocol_version = false
# Serve HTTP/1.1 alongside HTTP/2
http1 = true

[client]
# default_timeout_ms = 5000
read_max_bytes = "4MB"
accept_compression = ["gzip", "deflate"]
compress_min_bytes = "1KB"

[session]
connect_timeout_ms = 5000
# Keepalive PING interval; unset disables keepalive
# ping_interval_ms = 30000
ping_timeout_ms = 15000
ping_idle = false
idle_timeout_ms = 900000
drain_timeout_ms = 5000
max_sessions_per_target = 1

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
# Can be overridden with RUST_LOG environment variable
level = "info"
# Log format: "pretty", "compact" or "json"
format = "pretty"
timestamps = true
target = true
thread_names = false

[content_types]
grpc = ["application/grpc", "application/grpc+*"]
grpc_web = ["application/grpc-web", "application/grpc-web+*"]
triple_unary = ["application/proto", "application/json"]
triple_stream = ["application/connect+proto", "application/connect+json"]
"#;
    print!("{}", config);
}
