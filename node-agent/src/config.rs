//! Configuration management
//!
//! Handles two layers:
//! - Bootstrap settings (TOML in the OS config dir): data directory,
//!   master key source, initial endpoint and log level
//! - Runtime settings (versioned document in the data store): everything
//!   that may change while the agent runs, by local command or remote push
//!
//! Runtime changes are validated as a whole; a rejected key leaves the
//! current configuration untouched.

use crate::error::{Classify, ErrorClass};
use crate::records::Category;
use crate::store::{ConfigDocument, MasterKeySource, RetentionPolicy, SecureDataStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Environment variable overriding the bootstrap file location
pub const CONFIG_ENV: &str = "NODE_AGENT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown config key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("could not find config directory")]
    NoConfigDir,

    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config encode error: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        match self {
            ConfigError::Store(e) => e.class(),
            ConfigError::Io(_) | ConfigError::NoConfigDir => ErrorClass::Fatal,
            _ => ErrorClass::Validation,
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

// -------------------------------------------------------------------
// Bootstrap file
// -------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub security: SecuritySection,
    pub control_plane: ControlPlaneSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    pub data_dir: PathBuf,
    pub database_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecuritySection {
    pub master_key: MasterKeySource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneSection {
    pub endpoint: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("node-agent");
        Self::with_data_dir(data_dir)
    }
}

impl AgentConfig {
    /// Defaults rooted at `data_dir`, master key kept next to the database
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            security: SecuritySection {
                master_key: MasterKeySource::File {
                    path: data_dir.join("master.key"),
                },
            },
            agent: AgentSection {
                data_dir,
                database_file: "agent.db".to_string(),
            },
            control_plane: ControlPlaneSection {
                endpoint: "http://localhost:8000".to_string(),
                request_timeout_secs: 30,
            },
            logging: LoggingSection {
                level: "info".to_string(),
            },
        }
    }

    /// Load config from `path`, `NODE_AGENT_CONFIG`, or the OS-specific location.
    /// A missing file yields defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            Ok(toml::from_str(&content)?)
        } else {
            // First time setup - return default config
            Ok(Self::default())
        }
    }

    /// Save config to `path` or the OS-specific location
    pub async fn save(&self, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };
        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&config_path, toml::to_string_pretty(self)?).await?;
        Ok(config_path)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("node-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn database_path(&self) -> PathBuf {
        self.agent.data_dir.join(&self.agent.database_file)
    }

    /// Working directories of script and process modules
    pub fn modules_dir(&self) -> PathBuf {
        self.agent.data_dir.join("modules")
    }

    /// Registration token dropped by the operator
    pub fn token_file(&self) -> PathBuf {
        self.agent.data_dir.join("registration.token")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.control_plane.request_timeout_secs.max(1))
    }
}

// -------------------------------------------------------------------
// Runtime settings
// -------------------------------------------------------------------

/// Documented runtime keys, in display order
pub const KEYS: &[(&str, &str)] = &[
    ("sampling.interval_secs", "Seconds between resource samples"),
    ("sampling.timeout_secs", "Per-category sampling timeout"),
    ("log_level", "trace, debug, info, warn or error"),
    ("control_plane.url", "Base URL of the control plane"),
    ("retention.metrics_days", "Days metric samples are kept"),
    ("retention.logs_days", "Days log entries are kept"),
    ("retention.task_logs_days", "Days task log entries are kept"),
    ("retention.communication_days", "Days communication journal is kept"),
    ("retention.config_backups_days", "Days prior config versions are kept"),
    ("queue.max_pending", "Undelivered records kept per category"),
    ("delivery.batch_size", "Records per delivery request"),
    ("delivery.backoff_base_secs", "First retry delay"),
    ("delivery.backoff_max_secs", "Retry delay ceiling"),
    ("commands.poll_interval_secs", "Seconds between command polls"),
    ("commands.permitted_actions", "Comma-separated inbound actions accepted"),
    ("session.rotation_hours", "Session key lifetime"),
    ("session.grace_minutes", "Validity of the previous session key"),
    ("modules.max_restarts", "Automatic restarts before a module stays failed"),
    ("modules.restart_backoff_secs", "First restart delay"),
    ("modules.restart_backoff_max_secs", "Restart delay ceiling"),
    ("modules.stop_grace_secs", "Grace period before forced termination"),
    ("modules.poll_interval_secs", "Seconds between supervision polls"),
    ("modules.poll_timeout_secs", "Bound on a single backend poll"),
    ("modules.allowed_commands", "Comma-separated executables modules may run"),
    ("modules.allowed_images", "Comma-separated container image prefixes"),
];

pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "apt", "yum", "brew", "systemctl", "service", "docker", "pip", "npm", "git", "python3", "node", "sh",
    "bash",
];

pub const ALL_ACTIONS: &[&str] = &[
    "module.deploy",
    "module.stop",
    "module.redeploy",
    "module.remove",
    "config.update",
    "agent.status",
    "metrics.collect",
];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Typed view of the runtime config document
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub version: u64,
    pub sampling_interval: Duration,
    pub sample_timeout: Duration,
    pub log_level: String,
    pub control_plane_url: String,
    pub retention_days: BTreeMap<Category, u32>,
    pub max_pending: usize,
    pub batch_size: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub command_poll_interval: Duration,
    pub permitted_actions: BTreeSet<String>,
    pub rotation_period: Duration,
    pub rotation_grace: Duration,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub restart_backoff_max: Duration,
    pub stop_grace: Duration,
    pub module_poll_interval: Duration,
    pub module_poll_timeout: Duration,
    pub allowed_commands: BTreeSet<String>,
    pub allowed_images: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: 0,
            sampling_interval: Duration::from_secs(60),
            sample_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
            control_plane_url: "http://localhost:8000".to_string(),
            retention_days: Category::ALL
                .iter()
                .map(|c| (*c, c.default_retention_days()))
                .collect(),
            max_pending: 10_000,
            batch_size: 100,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            command_poll_interval: Duration::from_secs(15),
            permitted_actions: ALL_ACTIONS.iter().map(|s| s.to_string()).collect(),
            rotation_period: Duration::from_secs(24 * 3600),
            rotation_grace: Duration::from_secs(60 * 60),
            max_restarts: 3,
            restart_backoff: Duration::from_secs(5),
            restart_backoff_max: Duration::from_secs(300),
            stop_grace: Duration::from_secs(10),
            module_poll_interval: Duration::from_secs(5),
            module_poll_timeout: Duration::from_secs(5),
            allowed_commands: DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            allowed_images: Vec::new(),
        }
    }
}

fn parse_u64(key: &str, value: &str, min: u64, max: u64) -> Result<u64, ConfigError> {
    let n: u64 = value
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("'{}' is not a non-negative integer", value)))?;
    if n < min || n > max {
        return Err(invalid(key, format!("must be between {} and {}", min, max)));
    }
    Ok(n)
}

fn parse_secs(key: &str, value: &str, min: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_u64(key, value, min, 30 * 86_400)?))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn join<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    items.into_iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

fn retention_key(category: Category) -> String {
    format!("retention.{}_days", category.as_str())
}

impl RuntimeConfig {
    /// Set one key from its string form
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        if let Some(category) = Category::ALL.into_iter().find(|c| retention_key(*c) == key) {
            let days = parse_u64(key, value, 1, 3650)? as u32;
            self.retention_days.insert(category, days);
            return Ok(());
        }

        match key {
            "sampling.interval_secs" => self.sampling_interval = parse_secs(key, value, 1)?,
            "sampling.timeout_secs" => self.sample_timeout = parse_secs(key, value, 1)?,
            "log_level" => {
                let level = value.trim().to_ascii_lowercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(invalid(key, format!("expected one of {}", LOG_LEVELS.join(", "))));
                }
                self.log_level = level;
            }
            "control_plane.url" => {
                let url = reqwest::Url::parse(value.trim()).map_err(|e| invalid(key, e.to_string()))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(invalid(key, "scheme must be http or https"));
                }
                self.control_plane_url = value.trim().trim_end_matches('/').to_string();
            }
            "queue.max_pending" => self.max_pending = parse_u64(key, value, 1, 10_000_000)? as usize,
            "delivery.batch_size" => self.batch_size = parse_u64(key, value, 1, 1000)? as usize,
            "delivery.backoff_base_secs" => self.backoff_base = parse_secs(key, value, 1)?,
            "delivery.backoff_max_secs" => self.backoff_max = parse_secs(key, value, 1)?,
            "commands.poll_interval_secs" => self.command_poll_interval = parse_secs(key, value, 1)?,
            "commands.permitted_actions" => {
                let actions = parse_list(value);
                if let Some(unknown) = actions.iter().find(|a| !ALL_ACTIONS.contains(&a.as_str())) {
                    return Err(invalid(key, format!("unknown action {}", unknown)));
                }
                self.permitted_actions = actions.into_iter().collect();
            }
            "session.rotation_hours" => {
                self.rotation_period = Duration::from_secs(parse_u64(key, value, 1, 24 * 365)? * 3600)
            }
            "session.grace_minutes" => {
                self.rotation_grace = Duration::from_secs(parse_u64(key, value, 0, 7 * 24 * 60)? * 60)
            }
            "modules.max_restarts" => self.max_restarts = parse_u64(key, value, 0, 1000)? as u32,
            "modules.restart_backoff_secs" => self.restart_backoff = parse_secs(key, value, 1)?,
            "modules.restart_backoff_max_secs" => self.restart_backoff_max = parse_secs(key, value, 1)?,
            "modules.stop_grace_secs" => self.stop_grace = parse_secs(key, value, 1)?,
            "modules.poll_interval_secs" => self.module_poll_interval = parse_secs(key, value, 1)?,
            "modules.poll_timeout_secs" => self.module_poll_timeout = parse_secs(key, value, 1)?,
            "modules.allowed_commands" => self.allowed_commands = parse_list(value).into_iter().collect(),
            "modules.allowed_images" => self.allowed_images = parse_list(value),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// String form of one key
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(category) = Category::ALL.into_iter().find(|c| retention_key(*c) == key) {
            return self.retention_days.get(&category).map(|d| d.to_string());
        }

        let value = match key {
            "sampling.interval_secs" => self.sampling_interval.as_secs().to_string(),
            "sampling.timeout_secs" => self.sample_timeout.as_secs().to_string(),
            "log_level" => self.log_level.clone(),
            "control_plane.url" => self.control_plane_url.clone(),
            "queue.max_pending" => self.max_pending.to_string(),
            "delivery.batch_size" => self.batch_size.to_string(),
            "delivery.backoff_base_secs" => self.backoff_base.as_secs().to_string(),
            "delivery.backoff_max_secs" => self.backoff_max.as_secs().to_string(),
            "commands.poll_interval_secs" => self.command_poll_interval.as_secs().to_string(),
            "commands.permitted_actions" => join(&self.permitted_actions),
            "session.rotation_hours" => (self.rotation_period.as_secs() / 3600).to_string(),
            "session.grace_minutes" => (self.rotation_grace.as_secs() / 60).to_string(),
            "modules.max_restarts" => self.max_restarts.to_string(),
            "modules.restart_backoff_secs" => self.restart_backoff.as_secs().to_string(),
            "modules.restart_backoff_max_secs" => self.restart_backoff_max.as_secs().to_string(),
            "modules.stop_grace_secs" => self.stop_grace.as_secs().to_string(),
            "modules.poll_interval_secs" => self.module_poll_interval.as_secs().to_string(),
            "modules.poll_timeout_secs" => self.module_poll_timeout.as_secs().to_string(),
            "modules.allowed_commands" => join(&self.allowed_commands),
            "modules.allowed_images" => join(&self.allowed_images),
            _ => return None,
        };
        Some(value)
    }

    /// Every documented key with its current value
    pub fn to_values(&self) -> BTreeMap<String, String> {
        KEYS.iter()
            .filter_map(|(key, _)| self.get(key).map(|v| (key.to_string(), v)))
            .collect()
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.backoff_max < self.backoff_base {
            return Err(invalid("delivery.backoff_max_secs", "must not be below delivery.backoff_base_secs"));
        }
        if self.restart_backoff_max < self.restart_backoff {
            return Err(invalid(
                "modules.restart_backoff_max_secs",
                "must not be below modules.restart_backoff_secs",
            ));
        }
        Ok(())
    }

    pub fn from_values(values: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        Self::default().with_changes(values)
    }

    pub fn from_document(doc: &ConfigDocument) -> Result<Self, ConfigError> {
        let mut config = Self::from_values(&doc.values)?;
        config.version = doc.version;
        Ok(config)
    }

    /// Apply every change or none of them
    pub fn with_changes(&self, changes: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        for (key, value) in changes {
            next.set(key, value)?;
        }
        next.check()?;
        Ok(next)
    }

    /// Keys whose value differs between `self` and `other`
    pub fn diff(&self, other: &RuntimeConfig) -> Vec<String> {
        KEYS.iter()
            .filter(|(key, _)| self.get(key) != other.get(key))
            .map(|(key, _)| key.to_string())
            .collect()
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            days: self.retention_days.clone(),
            max_pending: self.max_pending,
        }
    }
}

/// Outcome of an accepted config change
#[derive(Debug, Clone, Serialize)]
pub struct ConfigChange {
    pub version: u64,
    pub changed: Vec<String>,
}

/// Load the runtime config, seeding it from bootstrap settings on first run
pub fn load_runtime(store: &SecureDataStore, bootstrap: &AgentConfig) -> Result<RuntimeConfig, ConfigError> {
    if let Some(doc) = store.config_document()? {
        return RuntimeConfig::from_document(&doc);
    }

    let mut seed = BTreeMap::new();
    seed.insert("control_plane.url".to_string(), bootstrap.control_plane.endpoint.clone());
    seed.insert("log_level".to_string(), bootstrap.logging.level.clone());
    let config = RuntimeConfig::from_values(&seed)?;

    let doc = store.save_config_document(config.to_values(), "bootstrap")?;
    info!("Seeded runtime config (version {})", doc.version);
    Ok(RuntimeConfig { version: doc.version, ..config })
}

/// Validate and persist `changes` on top of `current`
pub fn apply_changes(
    store: &SecureDataStore,
    current: &RuntimeConfig,
    changes: &BTreeMap<String, String>,
    source: &str,
) -> Result<(RuntimeConfig, ConfigChange), ConfigError> {
    let next = current.with_changes(changes)?;
    let changed = current.diff(&next);
    let doc = store.save_config_document(next.to_values(), source)?;
    info!("Config version {} from {}: {:?}", doc.version, source, changed);

    Ok((
        RuntimeConfig { version: doc.version, ..next },
        ConfigChange {
            version: doc.version,
            changed,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::test_store;

    fn changes(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults_roundtrip_through_values() {
        let config = RuntimeConfig::default();
        let values = config.to_values();
        assert_eq!(values.len(), KEYS.len());
        assert_eq!(values["retention.metrics_days"], "30");
        assert_eq!(RuntimeConfig::from_values(&values).unwrap(), config);
    }

    #[test]
    fn test_invalid_change_is_not_partially_applied() {
        let config = RuntimeConfig::default();
        let err = config
            .with_changes(&changes(&[("sampling.interval_secs", "5"), ("log_level", "loud")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(config.sampling_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = RuntimeConfig::default()
            .with_changes(&changes(&[("sampling.jitter", "3")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_)));
    }

    #[test]
    fn test_cross_field_checks() {
        let err = RuntimeConfig::default()
            .with_changes(&changes(&[("delivery.backoff_max_secs", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = RuntimeConfig::default()
            .with_changes(&changes(&[("delivery.backoff_base_secs", "600")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_url_validation() {
        let mut config = RuntimeConfig::default();
        assert!(config.set("control_plane.url", "ftp://example.com").is_err());
        config.set("control_plane.url", "https://cp.example.com/").unwrap();
        assert_eq!(config.control_plane_url, "https://cp.example.com");
    }

    #[test]
    fn test_diff_reports_changed_keys() {
        let base = RuntimeConfig::default();
        let next = base
            .with_changes(&changes(&[("retention.logs_days", "14"), ("log_level", "debug")]))
            .unwrap();
        assert_eq!(base.diff(&next), vec!["log_level".to_string(), "retention.logs_days".to_string()]);
        assert_eq!(next.retention_policy().days[&Category::Logs], 14);
    }

    #[test]
    fn test_load_runtime_seeds_from_bootstrap() {
        let (dir, store) = test_store();
        let mut bootstrap = AgentConfig::with_data_dir(dir.path());
        bootstrap.control_plane.endpoint = "https://cp.internal:8443".to_string();

        let config = load_runtime(&store, &bootstrap).unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.control_plane_url, "https://cp.internal:8443");

        let (next, change) =
            apply_changes(&store, &config, &changes(&[("sampling.interval_secs", "30")]), "local-cli").unwrap();
        assert_eq!(change.version, 2);
        assert_eq!(change.changed, vec!["sampling.interval_secs".to_string()]);
        assert_eq!(next.sampling_interval, Duration::from_secs(30));

        let reloaded = load_runtime(&store, &bootstrap).unwrap();
        assert_eq!(reloaded, next);
        assert_eq!(store.config_history(5).unwrap()[0].version, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let loaded = AgentConfig::load(Some(&path)).await.unwrap();
        assert_eq!(loaded.control_plane.request_timeout_secs, 30);

        let config = AgentConfig::with_data_dir(dir.path().join("data"));
        config.save(Some(&path)).await.unwrap();
        let reread = AgentConfig::load(Some(&path)).await.unwrap();
        assert_eq!(reread, config);
        assert_eq!(reread.database_path(), dir.path().join("data").join("agent.db"));
    }
}
