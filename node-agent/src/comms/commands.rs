//! Inbound command validation and dispatch
//!
//! A raw `InboundCommand` becomes a typed `AgentCommand` only after its
//! action, permission, target and parameters all check out. Typed commands
//! travel over bounded channels: module actions to the module manager,
//! everything else to the coordinator.

use super::protocol::{CommandReport, CommandStatus, InboundCommand};
use super::CommsError;
use crate::config::{ConfigChange, ConfigError, ALL_ACTIONS};
use crate::coordinator::HealthReport;
use crate::error::{Classify, ErrorClass};
use crate::modules::{CommandPolicy, ModuleAction, ModuleError, ModuleManagerHandle, ModuleSpec};
use crate::monitor::TickReport;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq)]
pub enum ModuleCommand {
    Deploy(ModuleSpec),
    Stop(String),
    Redeploy { module_id: String, spec: Option<ModuleSpec> },
    Remove(String),
}

/// A validated inbound command
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    Module(ModuleCommand),
    UpdateConfig(BTreeMap<String, String>),
    Status,
    CollectMetrics,
}

/// Requests served by the coordinator
#[derive(Debug)]
pub enum ControlRequest {
    UpdateConfig {
        changes: BTreeMap<String, String>,
        source: String,
        reply: oneshot::Sender<Result<ConfigChange, ConfigError>>,
    },
    Status {
        reply: oneshot::Sender<HealthReport>,
    },
    CollectMetrics {
        reply: oneshot::Sender<TickReport>,
    },
}

fn rejected(reason: impl Into<String>) -> CommsError {
    CommsError::Validation(reason.into())
}

fn target(command: &InboundCommand) -> Result<String, CommsError> {
    let target = command
        .target
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| rejected(format!("{} requires a target", command.action)))?;
    CommandPolicy::check_module_id(target).map_err(|e| rejected(e.to_string()))?;
    Ok(target.to_string())
}

fn module_spec(command: &InboundCommand, target: &str) -> Result<ModuleSpec, CommsError> {
    let spec: ModuleSpec = serde_json::from_value(command.parameters.clone())
        .map_err(|e| rejected(format!("invalid module spec: {}", e)))?;
    if spec.module_id != target {
        return Err(rejected(format!(
            "target {} does not match spec module_id {}",
            target, spec.module_id
        )));
    }
    Ok(spec)
}

fn has_parameters(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

fn config_changes(parameters: &Value) -> Result<BTreeMap<String, String>, CommsError> {
    let Value::Object(map) = parameters else {
        return Err(rejected("config.update parameters must be an object"));
    };
    if map.is_empty() {
        return Err(rejected("config.update carries no changes"));
    }
    map.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(rejected(format!("value of {} must be a scalar", key))),
            };
            Ok((key.clone(), value))
        })
        .collect()
}

/// Schema and permission check. Nothing is dispatched unless this succeeds.
pub fn validate(command: &InboundCommand, permitted: &BTreeSet<String>) -> Result<AgentCommand, CommsError> {
    if command.command_id.trim().is_empty() {
        return Err(rejected("command has no id"));
    }
    if !ALL_ACTIONS.contains(&command.action.as_str()) {
        return Err(rejected(format!("unknown action {}", command.action)));
    }
    if !permitted.contains(&command.action) {
        return Err(rejected(format!("action {} is not permitted", command.action)));
    }

    let command = match command.action.split_once('.') {
        Some(("module", verb)) => {
            let action: ModuleAction = verb.parse().map_err(|e: ModuleError| rejected(e.to_string()))?;
            let target = target(command)?;
            AgentCommand::Module(match action {
                ModuleAction::Deploy => ModuleCommand::Deploy(module_spec(command, &target)?),
                ModuleAction::Stop => ModuleCommand::Stop(target),
                ModuleAction::Remove => ModuleCommand::Remove(target),
                ModuleAction::Redeploy => {
                    let spec = if has_parameters(&command.parameters) {
                        Some(module_spec(command, &target)?)
                    } else {
                        None
                    };
                    ModuleCommand::Redeploy {
                        module_id: target,
                        spec,
                    }
                }
            })
        }
        _ => match command.action.as_str() {
            "config.update" => AgentCommand::UpdateConfig(config_changes(&command.parameters)?),
            "agent.status" => AgentCommand::Status,
            "metrics.collect" => AgentCommand::CollectMetrics,
            other => return Err(rejected(format!("unknown action {}", other))),
        },
    };
    Ok(command)
}

/// Outcome of executing a validated command
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub status: CommandStatus,
    pub detail: Option<String>,
    pub result: Option<Value>,
}

impl Execution {
    fn accepted(result: Option<Value>) -> Self {
        Self {
            status: CommandStatus::Accepted,
            detail: None,
            result,
        }
    }

    /// Command failed validation and was never dispatched
    pub fn rejected(detail: String) -> Self {
        Self::refused(ErrorClass::Validation, detail)
    }

    fn refused(class: ErrorClass, detail: String) -> Self {
        let status = if class == ErrorClass::Validation {
            CommandStatus::Rejected
        } else {
            CommandStatus::Failed
        };
        Self {
            status,
            detail: Some(detail),
            result: None,
        }
    }

    pub fn report(self, command_id: &str) -> CommandReport {
        CommandReport {
            command_id: command_id.to_string(),
            status: self.status,
            detail: self.detail,
            result: self.result,
        }
    }
}

/// Routes typed commands to their owners
#[derive(Clone)]
pub struct Dispatcher {
    modules: ModuleManagerHandle,
    control: mpsc::Sender<ControlRequest>,
}

impl Dispatcher {
    pub fn new(modules: ModuleManagerHandle, control: mpsc::Sender<ControlRequest>) -> Self {
        Self { modules, control }
    }

    async fn module(&self, command: ModuleCommand) -> Result<Option<Value>, ModuleError> {
        let record = match command {
            ModuleCommand::Deploy(spec) => Some(self.modules.deploy(spec).await?),
            ModuleCommand::Stop(id) => Some(self.modules.stop(id).await?),
            ModuleCommand::Redeploy { module_id, spec } => Some(self.modules.redeploy(module_id, spec).await?),
            ModuleCommand::Remove(id) => {
                self.modules.remove(id).await?;
                None
            }
        };
        Ok(record.and_then(|r| serde_json::to_value(r).ok()))
    }

    async fn control<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControlRequest) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.control.send(build(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn execute(&self, command: AgentCommand) -> Execution {
        let unavailable = || Execution::refused(ErrorClass::Transient, "coordinator unavailable".to_string());

        match command {
            AgentCommand::Module(command) => match self.module(command).await {
                Ok(result) => Execution::accepted(result),
                Err(e) => Execution::refused(e.class(), e.to_string()),
            },
            AgentCommand::UpdateConfig(changes) => {
                let outcome = self
                    .control(|reply| ControlRequest::UpdateConfig {
                        changes,
                        source: "control-plane".to_string(),
                        reply,
                    })
                    .await;
                match outcome {
                    Some(Ok(change)) => Execution::accepted(serde_json::to_value(change).ok()),
                    Some(Err(e)) => Execution::refused(e.class(), e.to_string()),
                    None => unavailable(),
                }
            }
            AgentCommand::Status => match self.control(|reply| ControlRequest::Status { reply }).await {
                Some(report) => Execution::accepted(serde_json::to_value(report).ok()),
                None => unavailable(),
            },
            AgentCommand::CollectMetrics => {
                match self.control(|reply| ControlRequest::CollectMetrics { reply }).await {
                    Some(report) => Execution::accepted(serde_json::to_value(report).ok()),
                    None => unavailable(),
                }
            }
        }
    }
}
