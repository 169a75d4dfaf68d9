//! Session pool configuration.

use serde::Deserialize;
use std::time::Duration;

/// Tuning for the session pool. Durations are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// TCP connect plus HTTP/2 handshake budget.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Interval between keepalive PINGs. Unset disables keepalive.
    #[serde(default)]
    pub ping_interval_ms: Option<u64>,

    /// How long to wait for a PING acknowledgement.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Also ping sessions with no open streams.
    #[serde(default)]
    pub ping_idle: bool,

    /// Close sessions with no streams for this long. Unset keeps them open.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: Option<u64>,

    /// How long a closing session may wait for its streams to finish.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Upper bound on concurrent sessions per target.
    #[serde(default = "default_max_sessions_per_target")]
    pub max_sessions_per_target: usize,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_ping_timeout_ms() -> u64 {
    15_000
}

fn default_idle_timeout_ms() -> Option<u64> {
    Some(900_000)
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_max_sessions_per_target() -> usize {
    1
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_interval_ms: None,
            ping_timeout_ms: default_ping_timeout_ms(),
            ping_idle: false,
            idle_timeout_ms: default_idle_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            max_sessions_per_target: default_max_sessions_per_target(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms.map(Duration::from_millis)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout_ms == 0 {
            return Err("session.connect_timeout_ms must be greater than 0".into());
        }
        if self.ping_interval_ms == Some(0) {
            return Err("session.ping_interval_ms must be greater than 0".into());
        }
        if self.ping_timeout_ms == 0 {
            return Err("session.ping_timeout_ms must be greater than 0".into());
        }
        if self.idle_timeout_ms == Some(0) {
            return Err("session.idle_timeout_ms must be greater than 0".into());
        }
        if self.max_sessions_per_target == 0 {
            return Err("session.max_sessions_per_target must be at least 1".into());
        }
        Ok(())
    }
}
