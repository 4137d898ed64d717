//! Application-level configuration loading.
//!
//! Settings come from an optional JSON file and are then overridden by environment variables.
//! Every section has built-in defaults so an empty or missing file still yields a usable
//! configuration.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/relay.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "SCORE_RELAY_CONFIG_PATH";

/// Which persistence backend the process installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// MongoDB, supervised and reconnected in the background.
    #[default]
    Mongo,
    /// Process-local maps; state is lost on restart.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Selected persistence backend.
    pub storage: StorageBackend,
    /// MongoDB connection settings.
    pub mongo: MongoSettings,
    /// Background scheduler cadence.
    pub scheduler: SchedulerSettings,
    /// Synchronization run parameters.
    pub sync: SyncSettings,
    /// Failure backoff policy.
    pub retry: RetrySettings,
    /// Retention windows for the cleanup sweep.
    pub retention: RetentionSettings,
    /// Upstream API endpoints and client credentials.
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct MongoSettings {
    pub uri: String,
    pub database: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct SchedulerSettings {
    pub poll_interval_secs: u64,
    pub target_timeout_secs: u64,
    pub stale_claim_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct SyncSettings {
    pub lock_ttl_secs: u64,
    pub refresh_lookahead_secs: u64,
    pub upstream_call_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct RetrySettings {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
    pub unavailable_cooldown_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct RetentionSettings {
    pub completed_hours: u32,
    pub failed_days: u32,
    pub audit_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub request_timeout_secs: u64,
}

impl AppConfig {
    /// Load the configuration from disk, then apply environment overrides.
    pub fn load() -> Self {
        let mut config = Self::from_file();
        config.apply_overrides(|name| env::var(name).ok());
        config
    }

    fn from_file() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded relay configuration");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Apply overrides looked up through `lookup`. Unparseable numbers are ignored with a warning.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(uri) = lookup("MONGO_URI") {
            self.mongo.uri = uri;
        }
        if let Some(db) = lookup("MONGO_DB") {
            self.mongo.database = Some(db);
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(err) => warn!(value = %port, error = %err, "ignoring invalid PORT"),
            }
        }
        if let Some(backend) = lookup("STORAGE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "memory" => self.storage = StorageBackend::Memory,
                "mongo" | "mongodb" => self.storage = StorageBackend::Mongo,
                other => warn!(value = %other, "ignoring unknown STORAGE_BACKEND"),
            }
        }
        if let Some(url) = lookup("UPSTREAM_BASE_URL") {
            self.upstream.base_url = url;
        }
        if let Some(url) = lookup("UPSTREAM_TOKEN_URL") {
            self.upstream.token_url = url;
        }
        if let Some(id) = lookup("UPSTREAM_CLIENT_ID") {
            self.upstream.client_id = id;
        }
        if let Some(secret) = lookup("UPSTREAM_CLIENT_SECRET") {
            self.upstream.client_secret = secret;
        }
    }
}

impl SchedulerSettings {
    /// Delay between two scheduler ticks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Upper bound on one target's synchronization inside a tick.
    pub fn target_timeout(&self) -> Duration {
        Duration::from_secs(self.target_timeout_secs)
    }

    /// Age after which a `processing` row is considered abandoned.
    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_after_secs)
    }
}

impl SyncSettings {
    /// Lease length of the per-target coordination lock.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Credentials expiring within this window are refreshed before use.
    pub fn refresh_lookahead(&self) -> Duration {
        Duration::from_secs(self.refresh_lookahead_secs)
    }

    /// Deadline for a single upstream read or write inside a run.
    pub fn upstream_call_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_call_timeout_secs)
    }
}

impl RetrySettings {
    #[allow(missing_docs)]
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    #[allow(missing_docs)]
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Fixed wait after the upstream reports itself unavailable.
    pub fn unavailable_cooldown(&self) -> Duration {
        Duration::from_secs(self.unavailable_cooldown_secs)
    }
}

impl RetentionSettings {
    /// Audit retention as a duration.
    pub fn audit_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.audit_days) * 86_400)
    }
}

impl UpstreamSettings {
    /// Per-request timeout applied by the HTTP client.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            storage: StorageBackend::default(),
            mongo: MongoSettings::default(),
            scheduler: SchedulerSettings::default(),
            sync: SyncSettings::default(),
            retry: RetrySettings::default(),
            retention: RetentionSettings::default(),
            upstream: UpstreamSettings::default(),
        }
    }
}

impl Default for MongoSettings {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".into(),
            database: None,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            target_timeout_secs: 120,
            stale_claim_after_secs: 900,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 60,
            refresh_lookahead_secs: 300,
            upstream_call_timeout_secs: 30,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 8 * 3_600,
            max_attempts: 10,
            unavailable_cooldown_secs: 600,
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            completed_hours: 24,
            failed_days: 7,
            audit_days: 14,
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000/api".into(),
            token_url: "http://localhost:9000/oauth/token".into(),
            client_id: String::new(),
            client_secret: String::new(),
            request_timeout_secs: 30,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "scheduler": { "poll_interval_secs": 5 } }"#)
                .expect("valid config");

        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.scheduler.target_timeout(), Duration::from_secs(120));
        assert_eq!(config.retry, RetrySettings::default());
        assert_eq!(config.storage, StorageBackend::Mongo);
    }

    #[test]
    fn environment_overrides_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MONGO_URI", "mongodb://db:27017"),
            ("PORT", "9090"),
            ("STORAGE_BACKEND", "Memory"),
            ("UPSTREAM_CLIENT_ID", "relay"),
        ]);
        let mut config = AppConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|value| value.to_string()));

        assert_eq!(config.mongo.uri, "mongodb://db:27017");
        assert_eq!(config.port, 9090);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.upstream.client_id, "relay");
    }

    #[test]
    fn invalid_port_override_is_ignored() {
        let mut config = AppConfig::default();
        config.apply_overrides(|name| (name == "PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn default_retention_matches_sweep_windows() {
        let retention = RetentionSettings::default();
        assert_eq!(retention.completed_hours, 24);
        assert_eq!(retention.failed_days, 7);
        assert_eq!(retention.audit_retention(), Duration::from_secs(14 * 86_400));
    }
}
