//! Wire types exchanged with the control plane

use crate::records::Category;
use crate::store::{RecordId, StoredRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Set when a known device re-registers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub registration_token: String,
    pub system_info: Value,
    pub agent_version: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationGrant {
    pub device_id: String,
    pub session_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: RecordId,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl From<&StoredRecord> for TelemetryRecord {
    fn from(record: &StoredRecord) -> Self {
        Self {
            id: record.id,
            seq: record.seq,
            timestamp: record.timestamp,
            payload: record.value(),
        }
    }
}

/// One category's records, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub device_id: String,
    pub category: Category,
    pub records: Vec<TelemetryRecord>,
}

impl TelemetryBatch {
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id).collect()
    }
}

/// Acknowledgement of a batch. Without `accepted` every record counts as accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAck {
    #[serde(default)]
    pub accepted: Option<Vec<RecordId>>,
}

/// Command as received, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundCommand {
    pub command_id: String,
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Accepted,
    Rejected,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Accepted => "accepted",
            CommandStatus::Rejected => "rejected",
            CommandStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReport {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationRequest {
    pub new_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct CommandList {
    #[serde(default)]
    pub commands: Vec<InboundCommand>,
}
