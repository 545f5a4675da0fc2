//! Socket configuration.
//!
//! Loaded from an optional JSON file, then overridden by environment
//! variables. The token is never written to or read from the file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How long a join waits for its reply.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long [`Socket::request`](crate::Socket::request) waits for its reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for a [`Socket`](crate::Socket).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SocketConfig {
    /// Socket endpoint. `http(s)://` is rewritten to `ws(s)://`.
    pub url: String,
    /// Bearer token appended as `?token=`. Never serialized.
    #[serde(skip)]
    pub token: Option<String>,
    /// Join reply window in milliseconds.
    pub join_timeout_ms: u64,
    /// Request reply window in milliseconds.
    pub reply_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/socket/websocket".to_string(),
            token: None,
            join_timeout_ms: duration_ms(DEFAULT_JOIN_TIMEOUT),
            reply_timeout_ms: duration_ms(DEFAULT_REPLY_TIMEOUT),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl SocketConfig {
    /// Config for `url` with default timeouts.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    /// Apply `PHX_SOCKET_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable timeout values are logged and ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("PHX_SOCKET_URL") {
            self.url = url;
        }
        if let Some(token) = var("PHX_SOCKET_TOKEN") {
            self.token = Some(token);
        }
        for (key, slot) in [
            ("PHX_SOCKET_JOIN_TIMEOUT_MS", &mut self.join_timeout_ms),
            ("PHX_SOCKET_REPLY_TIMEOUT_MS", &mut self.reply_timeout_ms),
        ] {
            if let Some(raw) = var(key) {
                match raw.parse() {
                    Ok(ms) => *slot = ms,
                    Err(e) => log::warn!("Ignoring {key}={raw}: {e}"),
                }
            }
        }
    }

    /// Join reply window.
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Request reply window.
    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}
