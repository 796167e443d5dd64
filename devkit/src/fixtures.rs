/*!
Fixtures pour tests: métriques fixes, modules et commandes prêts à l'emploi
*/

use chrono::Utc;
use node_agent::comms::protocol::InboundCommand;
use node_agent::modules::{BackendSpec, ModuleSpec};
use node_agent::monitor::MetricSource;
use node_agent::records::MetricCategory;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source de métriques déterministe: chaque échantillon porte un compteur
#[derive(Default)]
pub struct StaticMetricSource {
    samples: AtomicU64,
}

impl StaticMetricSource {
    pub fn samples_taken(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl MetricSource for StaticMetricSource {
    fn sample(&self, category: MetricCategory) -> anyhow::Result<Value> {
        let n = self.samples.fetch_add(1, Ordering::Relaxed);
        let value = match category {
            MetricCategory::SystemInfo => json!({
                "hostname": "devkit-host",
                "os": "linux",
                "arch": "x86_64",
            }),
            other => json!({ "category": other.as_str(), "sample": n }),
        };
        Ok(value)
    }
}

fn script(module_id: &str, body: &str) -> ModuleSpec {
    ModuleSpec {
        module_id: module_id.to_string(),
        version: "1.0.0".to_string(),
        backend: BackendSpec::Script {
            interpreter: "sh".to_string(),
            body: body.to_string(),
            args: Vec::new(),
        },
        env: BTreeMap::new(),
    }
}

/// Module qui tourne jusqu'à son arrêt
pub fn long_running_module(module_id: &str) -> ModuleSpec {
    script(module_id, "while true; do sleep 1; done")
}

/// Module qui échoue immédiatement avec le code 3
pub fn crashing_module(module_id: &str) -> ModuleSpec {
    script(module_id, "echo boom >&2; exit 3")
}

/// Module dont la commande n'est pas autorisée
pub fn forbidden_module(module_id: &str) -> ModuleSpec {
    ModuleSpec {
        module_id: module_id.to_string(),
        version: "1.0.0".to_string(),
        backend: BackendSpec::Process {
            command: "rm".to_string(),
            args: vec!["-rf".to_string(), "/tmp/nothing".to_string()],
        },
        env: BTreeMap::new(),
    }
}

/// Commande brute telle qu'envoyée par le control plane
pub fn command(command_id: &str, action: &str, target: Option<&str>, parameters: Value) -> InboundCommand {
    InboundCommand {
        command_id: command_id.to_string(),
        action: action.to_string(),
        target: target.map(str::to_string),
        parameters,
        issued_at: Some(Utc::now()),
    }
}

pub fn deploy_command(command_id: &str, spec: &ModuleSpec) -> InboundCommand {
    let parameters = serde_json::to_value(spec).unwrap_or(Value::Null);
    command(command_id, "module.deploy", Some(&spec.module_id), parameters)
}

pub fn stop_command(command_id: &str, module_id: &str) -> InboundCommand {
    command(command_id, "module.stop", Some(module_id), Value::Null)
}

pub fn config_command(command_id: &str, changes: &[(&str, &str)]) -> InboundCommand {
    let parameters: serde_json::Map<String, Value> = changes
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
    command(command_id, "config.update", None, Value::Object(parameters))
}
