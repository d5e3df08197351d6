//! Bridge configuration and change notification.
//!
//! The core only reads configuration. Whoever owns persistence pushes new
//! values through [`ConfigHandle`], and running components observe them via
//! [`ConfigHandle::subscribe`].

use std::{path::{Path, PathBuf}, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

/// Default controller address.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8765";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid server URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// Silence longer than this closes the connection.
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 90_000,
        }
    }
}

/// Sandbox limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_code_bytes: usize,
    pub max_concurrent: usize,
    /// Interpreter operation budget in constrained mode.
    pub max_operations: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            max_code_bytes: 64 * 1024,
            max_concurrent: 8,
            max_operations: 50_000_000,
        }
    }
}

impl ExecutorConfig {
    /// Effective timeout for a request, clamped to the configured maximum.
    #[must_use]
    pub fn timeout_for(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Controller base address; the session path is appended.
    pub server_url: String,
    /// Permit `unsafe: true` commands.
    pub allow_full_trust: bool,
    pub request_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub lock_ttl_ms: u64,
    /// Identity file; the platform data directory is used when unset.
    pub identity_path: Option<PathBuf>,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub executor: ExecutorConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            allow_full_trust: false,
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            lock_ttl_ms: 60_000,
            identity_path: None,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl TetherConfig {
    /// Load from an optional TOML file, apply `TETHER_*` overrides and validate.
    ///
    /// A missing file yields defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without overrides or validation.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TETHER_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(flag) = lookup("TETHER_ALLOW_FULL_TRUST") {
            self.allow_full_trust = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(path) = lookup("TETHER_IDENTITY_PATH") {
            self.identity_path = Some(PathBuf::from(path));
        }
    }

    /// Check invariants between fields.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_server_url(&self.server_url)?;
        if self.reconnect.base_delay_ms == 0 {
            return Err(invalid("reconnect.base_delay_ms", "must be positive"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(invalid(
                "reconnect.max_delay_ms",
                "must not be below reconnect.base_delay_ms",
            ));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(invalid("heartbeat.interval_ms", "must be positive"));
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(invalid(
                "heartbeat.timeout_ms",
                "must exceed heartbeat.interval_ms",
            ));
        }
        if self.executor.max_concurrent == 0 {
            return Err(invalid("executor.max_concurrent", "must be positive"));
        }
        if self.executor.default_timeout_ms == 0 {
            return Err(invalid("executor.default_timeout_ms", "must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

/// Parse and check a controller address.
///
/// # Errors
/// Returns error unless `raw` is a `ws` or `wss` URL with a host.
pub fn parse_server_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Shared, observable configuration.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<TetherConfig>>,
}

impl ConfigHandle {
    /// Wrap an initial configuration.
    #[must_use]
    pub fn new(config: TetherConfig) -> Self {
        let (tx, _) = watch::channel(config);
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn current(&self) -> TetherConfig {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TetherConfig> {
        self.tx.subscribe()
    }

    /// Apply an edit; subscribers are notified only if something changed.
    pub fn update(&self, edit: impl FnOnce(&mut TetherConfig)) -> bool {
        self.tx.send_if_modified(|config| {
            let before = config.clone();
            edit(config);
            *config != before
        })
    }

    /// Toggle full-trust execution.
    pub fn set_allow_full_trust(&self, allow: bool) -> bool {
        self.update(|c| c.allow_full_trust = allow)
    }

    /// Point the bridge at a new controller.
    ///
    /// # Errors
    /// Returns error if `url` is not a valid controller address.
    pub fn set_server_url(&self, url: impl Into<String>) -> Result<bool, ConfigError> {
        let url = url.into();
        parse_server_url(&url)?;
        Ok(self.update(|c| c.server_url = url))
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(TetherConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        tokio_test::assert_ok!(TetherConfig::default().validate());
    }

    #[test]
    fn parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(
            &path,
            "server_url = \"ws://example.test:9000\"\nallow_full_trust = true\n\n[heartbeat]\ninterval_ms = 1000\ntimeout_ms = 3000\n",
        )
        .unwrap();

        let config = TetherConfig::from_file(&path).unwrap();
        assert_eq!(config.server_url, "ws://example.test:9000");
        assert!(config.allow_full_trust);
        assert_eq!(config.heartbeat.interval_ms, 1000);
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("TETHER_SERVER_URL", "wss://remote.test"),
            ("TETHER_ALLOW_FULL_TRUST", "yes"),
        ]
        .into_iter()
        .collect();
        let mut config = TetherConfig::default();
        config.apply_env_overrides(|k| vars.get(k).map(ToString::to_string));
        assert_eq!(config.server_url, "wss://remote.test");
        assert!(config.allow_full_trust);
        assert!(config.identity_path.is_none());
    }

    #[test]
    fn rejects_http_url() {
        let config = TetherConfig {
            server_url: "http://127.0.0.1:1".into(),
            ..TetherConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn rejects_heartbeat_timeout_below_interval() {
        let mut config = TetherConfig::default();
        config.heartbeat.timeout_ms = config.heartbeat.interval_ms;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "heartbeat.timeout_ms", .. })
        ));
    }

    #[test]
    fn timeout_is_clamped() {
        let exec = ExecutorConfig::default();
        assert_eq!(exec.timeout_for(None), Duration::from_millis(30_000));
        assert_eq!(exec.timeout_for(Some(0)), Duration::from_millis(30_000));
        assert_eq!(exec.timeout_for(Some(5)), Duration::from_millis(5));
        assert_eq!(exec.timeout_for(Some(u64::MAX)), Duration::from_millis(300_000));
    }

    #[tokio::test]
    async fn handle_notifies_only_on_change() {
        let handle = ConfigHandle::default();
        let mut rx = handle.subscribe();

        assert!(!handle.set_allow_full_trust(false));
        assert!(!rx.has_changed().unwrap());

        assert!(handle.set_allow_full_trust(true));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().allow_full_trust);

        assert!(handle.set_server_url("ws://other.test:1").unwrap());
        assert_eq!(handle.current().server_url, "ws://other.test:1");
        assert!(handle.set_server_url("ftp://nope").is_err());
    }
}
