//! Connection configuration.
//!
//! Values are layered (lowest to highest priority):
//! 1. **Compiled defaults**: [`ConnectionConfig::default()`]
//! 2. **JSON file**: optional, keys match the field names
//! 3. **Environment variables**: `KURENTO_*` (e.g. `KURENTO_CONNECT_TIMEOUT_MS`)

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConfigError;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "KURENTO_";

/// Settings for a single [`Connection`](crate::Connection).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server address, e.g. `ws://127.0.0.1:8888`.
    pub url: String,
    /// Path appended to `url` when dialing (default `"/kurento"`).
    pub path: String,
    /// Value of the `Origin` header sent with the handshake.
    pub origin: String,
    /// Bound on the TCP + WebSocket handshake.
    pub connect_timeout_ms: u64,
    /// Default reply deadline used by [`Connection::call`](crate::Connection::call).
    /// `None` waits until the reply arrives or the connection closes.
    pub reply_timeout_ms: Option<u64>,
    /// Bound on flushing the close frame during shutdown.
    pub close_timeout_ms: u64,
    /// Buffered notifications per subscription before the delivery pool takes over.
    pub subscription_buffer: usize,
    /// Maximum notifications parked in the delivery pool at once.
    pub max_inflight_deliveries: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8888".into(),
            path: "/kurento".into(),
            origin: "http://127.0.0.1".into(),
            connect_timeout_ms: 5_000,
            reply_timeout_ms: None,
            close_timeout_ms: 5_000,
            subscription_buffer: 64,
            max_inflight_deliveries: 256,
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl ConnectionConfig {
    /// Defaults pointed at the given server address.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// The layered figment: defaults, then `path` (if any), then `KURENTO_*` env vars.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            debug!(?path, "layering connection config file");
            figment = figment.merge(Json::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load and validate configuration from all layers.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "connect_timeout_ms must be > 0".into(),
            ));
        }
        if self.close_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "close_timeout_ms must be > 0".into(),
            ));
        }
        if self.reply_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue(
                "reply_timeout_ms must be > 0 when set".into(),
            ));
        }
        if self.subscription_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "subscription_buffer must be > 0".into(),
            ));
        }
        if self.max_inflight_deliveries == 0 {
            return Err(ConfigError::InvalidValue(
                "max_inflight_deliveries must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Full endpoint: `url` joined with `path`.
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.path.is_empty() {
            base.to_owned()
        } else if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }

    /// Handshake deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Default reply deadline, if any.
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }

    /// Close-frame flush deadline.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
