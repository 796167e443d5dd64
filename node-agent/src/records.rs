//! Plaintext record types exchanged with the data store
//!
//! Components never see ciphertext: they hand these structures to the
//! store, which serializes, seals and checksums them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Record categories of the durable queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Metrics,
    Logs,
    TaskLogs,
    Communication,
    ConfigBackups,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Metrics,
        Category::Logs,
        Category::TaskLogs,
        Category::Communication,
        Category::ConfigBackups,
    ];

    /// Categories drained towards the control plane
    pub const DELIVERABLE: [Category; 3] = [Category::Metrics, Category::Logs, Category::TaskLogs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Metrics => "metrics",
            Category::Logs => "logs",
            Category::TaskLogs => "task_logs",
            Category::Communication => "communication",
            Category::ConfigBackups => "config_backups",
        }
    }

    pub fn default_retention_days(&self) -> u32 {
        match self {
            Category::Metrics => 30,
            Category::Logs => 7,
            Category::TaskLogs => 90,
            Category::Communication => 7,
            Category::ConfigBackups => 90,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "metrics" => Ok(Category::Metrics),
            "logs" => Ok(Category::Logs),
            "task_logs" => Ok(Category::TaskLogs),
            "communication" => Ok(Category::Communication),
            "config_backups" => Ok(Category::ConfigBackups),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}

/// Drop priority inside a bounded queue (lowest goes first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

/// Sampled metric families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricCategory {
    Cpu,
    Memory,
    Disk,
    Network,
    SystemInfo,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 5] = [
        MetricCategory::Cpu,
        MetricCategory::Memory,
        MetricCategory::Disk,
        MetricCategory::Network,
        MetricCategory::SystemInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricCategory::Cpu => "cpu",
            MetricCategory::Memory => "memory",
            MetricCategory::Disk => "disk",
            MetricCategory::Network => "network",
            MetricCategory::SystemInfo => "system-info",
        }
    }
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s || c.as_str().replace('-', "_") == s)
            .ok_or_else(|| format!("unknown metric category: {}", s))
    }
}

/// One sample of one metric family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub category: MetricCategory,
    pub value: Value,
}

/// Log severity, ordered from least to most important
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn priority(&self) -> Priority {
        match self {
            Severity::Debug => Priority::Low,
            Severity::Info => Priority::Normal,
            Severity::Warn => Priority::High,
            Severity::Error => Priority::Critical,
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Structured log line persisted for delivery and export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl LogEntry {
    pub fn new(severity: Severity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            source: source.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn info(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, source, message)
    }

    pub fn warn(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warn, source, message)
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, source, message)
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Outcome of one module invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Failure,
    Timeout,
}

/// Append-only execution record written by the module manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub module_id: String,
    pub invoked_at: DateTime<Utc>,
    pub outcome: TaskOutcome,
    pub duration_ms: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub output_excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Journal line for one exchange with the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationLogEntry {
    pub direction: Direction,
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: String,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommunicationLogEntry {
    pub fn new(direction: Direction, endpoint: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            direction,
            endpoint: endpoint.into(),
            timestamp: Utc::now(),
            outcome: outcome.into(),
            retry_count: 0,
            detail: None,
        }
    }

    pub fn retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parsing_accepts_cli_spellings() {
        assert_eq!("task-logs".parse::<Category>().unwrap(), Category::TaskLogs);
        assert_eq!("Metrics".parse::<Category>().unwrap(), Category::Metrics);
        assert!("bogus".parse::<Category>().is_err());
    }

    #[test]
    fn test_metric_category_wire_name() {
        let json = serde_json::to_string(&MetricCategory::SystemInfo).unwrap();
        assert_eq!(json, "\"system-info\"");
        assert_eq!("system_info".parse::<MetricCategory>().unwrap(), MetricCategory::SystemInfo);
    }

    #[test]
    fn test_severity_orders_drop_priority() {
        assert!(Severity::Debug.priority() < Severity::Error.priority());
        assert_eq!(Priority::from_i64(7), Priority::Critical);
        assert_eq!(Priority::from_i64(-1), Priority::Low);
    }
}
