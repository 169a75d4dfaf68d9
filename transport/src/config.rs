//! Transport configuration.
//!
//! One TOML file configures the server listener, client defaults, the
//! session pool, logging, and the content types mapped to each protocol.

use rpc::{ContentTypes, Encoding};
use serde::Deserialize;
use session::SessionConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub content_types: ContentTypesConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.server.validate()?;
        self.client.validate()?;
        self.session.validate()?;
        self.content_types.validate()?;
        Ok(())
    }
}

/// Inbound listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_address")]
    pub address: SocketAddr,

    /// Upper bound on a caller supplied timeout.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// How long shutdown waits for in-flight calls before aborting them.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Largest message accepted, after decompression (e.g. "4MB").
    #[serde(default = "default_read_max_bytes", deserialize_with = "deserialize_size")]
    pub read_max_bytes: usize,

    /// Compression algorithms the server reads and writes, in preference
    /// order.
    #[serde(default = "default_accept_compression")]
    pub accept_compression: Vec<String>,

    /// Responses smaller than this are never compressed.
    #[serde(default = "default_compress_min_bytes", deserialize_with = "deserialize_size")]
    pub compress_min_bytes: usize,

    /// Reject Triple requests without `tri-protocol-version`.
    #[serde(default)]
    pub require_protocol_version: bool,

    /// Serve HTTP/1.1 alongside HTTP/2.
    #[serde(default = "default_true")]
    pub http1: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_timeout_ms: default_max_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            read_max_bytes: default_read_max_bytes(),
            accept_compression: default_accept_compression(),
            compress_min_bytes: default_compress_min_bytes(),
            require_protocol_version: false,
            http1: true,
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Configured compression algorithms. Call after `validate`.
    pub fn encodings(&self) -> Vec<Encoding> {
        parse_encodings(&self.accept_compression).unwrap_or_default()
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_timeout_ms == 0 {
            return Err("server.max_timeout_ms must be greater than 0".into());
        }
        if self.read_max_bytes == 0 {
            return Err("server.read_max_bytes must be greater than 0".into());
        }
        parse_encodings(&self.accept_compression).map(|_| ())
    }
}

/// Defaults applied to outbound calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Timeout for calls that do not set their own.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,

    /// Largest response message accepted, after decompression.
    #[serde(default = "default_read_max_bytes", deserialize_with = "deserialize_size")]
    pub read_max_bytes: usize,

    /// Compression algorithms the client accepts, in preference order.
    #[serde(default = "default_accept_compression")]
    pub accept_compression: Vec<String>,

    /// Requests smaller than this are never compressed.
    #[serde(default = "default_compress_min_bytes", deserialize_with = "deserialize_size")]
    pub compress_min_bytes: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            read_max_bytes: default_read_max_bytes(),
            accept_compression: default_accept_compression(),
            compress_min_bytes: default_compress_min_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

impl ClientConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Configured compression algorithms. Call after `validate`.
    pub fn encodings(&self) -> Vec<Encoding> {
        parse_encodings(&self.accept_compression).unwrap_or_default()
    }

    fn validate(&self) -> Result<(), String> {
        if self.default_timeout_ms == Some(0) {
            return Err("client.default_timeout_ms must be greater than 0".into());
        }
        if self.read_max_bytes == 0 {
            return Err("client.read_max_bytes must be greater than 0".into());
        }
        parse_encodings(&self.accept_compression).map(|_| ())
    }
}

/// Content types recognised for each protocol. Entries ending in `*`
/// match by prefix.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentTypesConfig {
    #[serde(default = "default_grpc_types")]
    pub grpc: Vec<String>,
    #[serde(default = "default_grpc_web_types")]
    pub grpc_web: Vec<String>,
    #[serde(default = "default_triple_unary_types")]
    pub triple_unary: Vec<String>,
    #[serde(default = "default_triple_stream_types")]
    pub triple_stream: Vec<String>,
}

impl Default for ContentTypesConfig {
    fn default() -> Self {
        ContentTypes::default().into()
    }
}

impl From<ContentTypes> for ContentTypesConfig {
    fn from(types: ContentTypes) -> Self {
        Self {
            grpc: types.grpc,
            grpc_web: types.grpc_web,
            triple_unary: types.triple_unary,
            triple_stream: types.triple_stream,
        }
    }
}

impl From<&ContentTypesConfig> for ContentTypes {
    fn from(config: &ContentTypesConfig) -> Self {
        ContentTypes {
            grpc: config.grpc.clone(),
            grpc_web: config.grpc_web.clone(),
            triple_unary: config.triple_unary.clone(),
            triple_stream: config.triple_stream.clone(),
        }
    }
}

impl ContentTypesConfig {
    fn validate(&self) -> Result<(), String> {
        let lists = [
            ("grpc", &self.grpc),
            ("grpc_web", &self.grpc_web),
            ("triple_unary", &self.triple_unary),
            ("triple_stream", &self.triple_stream),
        ];
        for (name, list) in lists {
            if list.is_empty() {
                return Err(format!("content_types.{name} must not be empty"));
            }
            if list.iter().any(|t| t.trim().is_empty()) {
                return Err(format!("content_types.{name} contains an empty entry"));
            }
        }
        Ok(())
    }
}

fn default_grpc_types() -> Vec<String> {
    ContentTypes::default().grpc
}

fn default_grpc_web_types() -> Vec<String> {
    ContentTypes::default().grpc_web
}

fn default_triple_unary_types() -> Vec<String> {
    ContentTypes::default().triple_unary
}

fn default_triple_stream_types() -> Vec<String> {
    ContentTypes::default().triple_stream
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration. `RUST_LOG` overrides `level`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target (module path).
    #[serde(default = "default_true")]
    pub target: bool,

    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

fn default_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 50051))
}

fn default_max_timeout_ms() -> u64 {
    rpc::dispatch::DEFAULT_MAX_TIMEOUT_MS
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_read_max_bytes() -> usize {
    rpc::frame::MAX_MESSAGE_SIZE
}

fn default_accept_compression() -> Vec<String> {
    vec!["gzip".to_string(), "deflate".to_string()]
}

fn default_compress_min_bytes() -> usize {
    rpc::compression::DEFAULT_COMPRESS_MIN_BYTES
}

fn default_user_agent() -> String {
    format!("rpc-transport/{}", env!("CARGO_PKG_VERSION"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn parse_encodings(names: &[String]) -> Result<Vec<Encoding>, String> {
    names
        .iter()
        .map(|name| {
            name.parse::<Encoding>()
                .map_err(|_| format!("unsupported compression algorithm: {name}"))
        })
        .collect()
}

/// Deserialize a size string like "4MB" or a plain number into bytes.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64KB" or "4MB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {num_str}"))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {suffix}")),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.address.port(), 50051);
        assert_eq!(config.server.read_max_bytes, 4 * 1024 * 1024);
        assert_eq!(config.server.encodings(), vec![Encoding::Gzip, Encoding::Deflate]);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(ContentTypes::from(&config.content_types), ContentTypes::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            address = "127.0.0.1:9000"
            read_max_bytes = "64KB"
            max_timeout_ms = 1000
            accept_compression = ["deflate"]
            require_protocol_version = true

            [client]
            default_timeout_ms = 250

            [session]
            ping_interval_ms = 10000
            idle_timeout_ms = 60000

            [logging]
            level = "debug"
            format = "json"
            timestamps = false

            [content_types]
            triple_unary = ["application/x-tri"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.read_max_bytes, 64 * 1024);
        assert_eq!(config.server.encodings(), vec![Encoding::Deflate]);
        assert!(config.server.require_protocol_version);
        assert_eq!(config.client.default_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.session.ping_interval_ms, Some(10_000));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.content_types.triple_unary, vec!["application/x-tri"]);
        assert_eq!(config.content_types.grpc, ContentTypes::default().grpc);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config: Config =
            toml::from_str("[server]\naccept_compression = [\"br\"]").unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("[content_types]\ngrpc = []").unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("[session]\nmax_sessions_per_target = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("[server]\nport = 1").is_err());
        assert!(toml::from_str::<Config>("[tracing]").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), Ok(1024));
        assert_eq!(parse_size("4MB"), Ok(4 * 1024 * 1024));
        assert_eq!(parse_size("16 kib"), Ok(16 * 1024));
        assert!(parse_size("").is_err());
        assert!(parse_size("12XB").is_err());
    }
}
