//! Allow-list checks applied before any backend is invoked

use super::state::{BackendSpec, ModuleSpec};
use super::ModuleError;
use crate::config::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Lifecycle actions a caller may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleAction {
    Deploy,
    Stop,
    Redeploy,
    Remove,
}

impl FromStr for ModuleAction {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy" => Ok(ModuleAction::Deploy),
            "stop" => Ok(ModuleAction::Stop),
            "redeploy" => Ok(ModuleAction::Redeploy),
            "remove" => Ok(ModuleAction::Remove),
            other => Err(ModuleError::CommandRejected(format!("unknown module action '{}'", other))),
        }
    }
}

const MAX_ID_LEN: usize = 64;

/// Executables and images modules may use
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPolicy {
    commands: BTreeSet<String>,
    images: Vec<String>,
}

fn rejected(reason: impl Into<String>) -> ModuleError {
    ModuleError::CommandRejected(reason.into())
}

impl CommandPolicy {
    pub fn new(commands: impl IntoIterator<Item = String>, images: impl IntoIterator<Item = String>) -> Self {
        Self {
            commands: commands.into_iter().collect(),
            images: images.into_iter().collect(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.allowed_commands.iter().cloned(), config.allowed_images.iter().cloned())
    }

    /// Module ids name working directories and containers
    pub fn check_module_id(id: &str) -> Result<(), ModuleError> {
        let valid = !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && !id.starts_with('.')
            && !id.starts_with('-')
            && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(rejected(format!("invalid module id '{}'", id)))
        }
    }

    fn check_command(&self, command: &str) -> Result<(), ModuleError> {
        // Bare names only; a path could point anywhere
        if command.contains('/') || command.contains('\\') || !self.commands.contains(command) {
            return Err(rejected(format!("command '{}' is not allowed", command)));
        }
        Ok(())
    }

    fn check_image(&self, image: &str) -> Result<(), ModuleError> {
        if image.is_empty() || image.starts_with('-') {
            return Err(rejected(format!("invalid image '{}'", image)));
        }
        if !self.images.iter().any(|prefix| image.starts_with(prefix.as_str())) {
            return Err(rejected(format!("image '{}' is not allowed", image)));
        }
        Ok(())
    }

    pub fn check(&self, spec: &ModuleSpec) -> Result<(), ModuleError> {
        Self::check_module_id(&spec.module_id)?;

        if let Some(key) = spec
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(rejected(format!("invalid environment variable name '{}'", key)));
        }

        match &spec.backend {
            BackendSpec::Process { command, .. } => self.check_command(command),
            BackendSpec::Script { interpreter, body, .. } => {
                if body.trim().is_empty() {
                    return Err(rejected("script body is empty"));
                }
                self.check_command(interpreter)
            }
            BackendSpec::Container { image, .. } => self.check_image(image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(backend: BackendSpec) -> ModuleSpec {
        ModuleSpec {
            module_id: "mod-1".into(),
            version: "1".into(),
            backend,
            env: BTreeMap::new(),
        }
    }

    fn process(command: &str) -> BackendSpec {
        BackendSpec::Process {
            command: command.into(),
            args: vec![],
        }
    }

    #[test]
    fn test_default_allow_list() {
        let policy = CommandPolicy::from_config(&RuntimeConfig::default());
        assert!(policy.check(&spec(process("python3"))).is_ok());
        assert!(policy.check(&spec(process("rm"))).is_err());
        assert!(policy.check(&spec(process("/tmp/python3"))).is_err());
    }

    #[test]
    fn test_images_need_explicit_prefix() {
        let container = |image: &str| {
            spec(BackendSpec::Container {
                image: image.into(),
                args: vec![],
            })
        };
        let closed = CommandPolicy::new(Vec::new(), Vec::new());
        assert!(closed.check(&container("registry.local/collector:1")).is_err());

        let open = CommandPolicy::new(Vec::new(), vec!["registry.local/".to_string()]);
        assert!(open.check(&container("registry.local/collector:1")).is_ok());
        assert!(open.check(&container("docker.io/evil")).is_err());
    }

    #[test]
    fn test_module_ids_and_actions() {
        assert!(CommandPolicy::check_module_id("sensor_v2.1").is_ok());
        assert!(CommandPolicy::check_module_id("../etc").is_err());
        assert!(CommandPolicy::check_module_id("").is_err());
        assert_eq!("stop".parse::<ModuleAction>().unwrap(), ModuleAction::Stop);
        assert!(matches!("format".parse::<ModuleAction>(), Err(ModuleError::CommandRejected(_))));
    }

    #[test]
    fn test_empty_script_rejected() {
        let policy = CommandPolicy::from_config(&RuntimeConfig::default());
        let script = spec(BackendSpec::Script {
            interpreter: "sh".into(),
            body: "  ".into(),
            args: vec![],
        });
        assert!(matches!(policy.check(&script), Err(ModuleError::CommandRejected(_))));
    }
}
