// Relay server configuration.
//
// Centralizes environment variable parsing with defaults suitable for local
// development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1234;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_PERSIST_WAIT_MS: u64 = 2_000;
pub const DEFAULT_PERSIST_MAX_WAIT_MS: u64 = 10_000;
pub const DEFAULT_CONTENT_FIELD: &str = "content";

/// Core relay configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Interval between heartbeat pings on every connection.
    pub ping_interval: Duration,
    /// Debounced save settings.
    pub persist: PersistConfig,
    /// SQLite database for document state. No persistence when unset.
    pub db_path: Option<PathBuf>,
    /// Whether documents garbage-collect deleted content.
    pub gc: bool,
    /// Log filter directive (e.g. `info`, `cosync_relay=debug`).
    pub log_filter: String,
}

/// Timing and projection settings for the debounced content save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistConfig {
    /// Quiet period after the last update before a save fires.
    pub wait: Duration,
    /// Upper bound between the first unsaved update and its save.
    pub max_wait: Duration,
    /// Root text type projected into the content store.
    pub content_field: String,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(DEFAULT_PERSIST_WAIT_MS),
            max_wait: Duration::from_millis(DEFAULT_PERSIST_MAX_WAIT_MS),
            content_field: DEFAULT_CONTENT_FIELD.to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            persist: PersistConfig::default(),
            db_path: None,
            gc: true,
            log_filter: "info".into(),
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `COSYNC_HOST` | `0.0.0.0` |
    /// | `COSYNC_PORT` | `1234` |
    /// | `COSYNC_PING_INTERVAL_MS` | `30000` |
    /// | `COSYNC_PERSIST_WAIT_MS` | `2000` |
    /// | `COSYNC_PERSIST_MAX_WAIT_MS` | `10000` |
    /// | `COSYNC_DB_PATH` | *(none)* |
    /// | `COSYNC_GC` | `true` |
    /// | `COSYNC_CONTENT_FIELD` | `content` |
    /// | `COSYNC_LOG_FILTER` | `RUST_LOG`, else `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COSYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("COSYNC_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let millis = |key: &str, default: u64| {
            env(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .unwrap_or(default)
        };
        let ping_interval =
            Duration::from_millis(millis("COSYNC_PING_INTERVAL_MS", DEFAULT_PING_INTERVAL_MS));
        let wait = Duration::from_millis(millis("COSYNC_PERSIST_WAIT_MS", DEFAULT_PERSIST_WAIT_MS));
        let max_wait = Duration::from_millis(millis(
            "COSYNC_PERSIST_MAX_WAIT_MS",
            DEFAULT_PERSIST_MAX_WAIT_MS,
        ))
        .max(wait);

        let content_field = env("COSYNC_CONTENT_FIELD")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_FIELD.into());

        let db_path = env("COSYNC_DB_PATH").ok().filter(|v| !v.is_empty()).map(PathBuf::from);

        let gc = env("COSYNC_GC")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "off"))
            .unwrap_or(true);

        let log_filter = env("COSYNC_LOG_FILTER")
            .or_else(|_| env("RUST_LOG"))
            .unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            ping_interval,
            persist: PersistConfig { wait, max_wait, content_field },
            db_path,
            gc,
            log_filter,
        }
    }
}
