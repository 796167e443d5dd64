//! Module records and their lifecycle state machine

use super::ModuleError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Observed lifecycle state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Registered,
    Deploying,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ModuleState {
    pub const ALL: [ModuleState; 6] = [
        ModuleState::Registered,
        ModuleState::Deploying,
        ModuleState::Running,
        ModuleState::Stopping,
        ModuleState::Stopped,
        ModuleState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Registered => "registered",
            ModuleState::Deploying => "deploying",
            ModuleState::Running => "running",
            ModuleState::Stopping => "stopping",
            ModuleState::Stopped => "stopped",
            ModuleState::Failed => "failed",
        }
    }

    /// The complete transition table
    pub fn can_transition(self, to: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, to),
            (Registered, Deploying)
                | (Deploying, Running)
                | (Deploying, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Failed, Deploying)
                | (Stopped, Registered)
                | (Failed, Registered)
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State the operator asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Process,
    Container,
    Script,
}

fn default_interpreter() -> String {
    "sh".to_string()
}

/// Backend-specific launch description, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSpec {
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Script {
        #[serde(default = "default_interpreter")]
        interpreter: String,
        body: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Container {
        image: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl BackendSpec {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendSpec::Process { .. } => BackendKind::Process,
            BackendSpec::Script { .. } => BackendKind::Script,
            BackendSpec::Container { .. } => BackendKind::Container,
        }
    }
}

/// Deployment request for one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub module_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub backend: BackendSpec,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// Persisted lifecycle record. The module manager is its only writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub module_id: String,
    pub backend: BackendKind,
    pub desired: DesiredState,
    pub state: ModuleState,
    pub version: String,
    pub last_transition: DateTime<Utc>,
    pub restart_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub spec: ModuleSpec,
}

impl ModuleRecord {
    pub fn new(spec: ModuleSpec) -> Self {
        Self {
            module_id: spec.module_id.clone(),
            backend: spec.backend.kind(),
            desired: DesiredState::Running,
            state: ModuleState::Registered,
            version: spec.version.clone(),
            last_transition: Utc::now(),
            restart_count: 0,
            last_error: None,
            spec,
        }
    }

    /// Move to `to`, or fail leaving the record untouched
    pub fn transition(&mut self, to: ModuleState) -> Result<(), ModuleError> {
        if !self.state.can_transition(to) {
            return Err(ModuleError::InvalidTransition {
                module_id: self.module_id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.last_transition = Utc::now();
        Ok(())
    }

    /// Replace the launch description on redeploy
    pub fn apply_spec(&mut self, spec: ModuleSpec) {
        self.backend = spec.backend.kind();
        self.version = spec.version.clone();
        self.spec = spec;
    }
}
