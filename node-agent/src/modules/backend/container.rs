//! Container backend driving the docker CLI

use super::{truncate_tail, PollStatus, StopOutcome, OUTPUT_TAIL_BYTES};
use crate::modules::ModuleError;
use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Bound on a single docker CLI call other than `stop`
const CLI_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub struct ContainerHandle {
    docker: String,
    container_id: String,
}

async fn docker(bin: &str, args: &[&str], limit: Duration) -> Result<Output, ModuleError> {
    let call = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(limit, call).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(ModuleError::Backend(format!("{} {}: {}", bin, args.first().unwrap_or(&""), e))),
        Err(_) => Err(ModuleError::Backend(format!(
            "{} {} timed out",
            bin,
            args.first().unwrap_or(&"")
        ))),
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

pub fn container_name(module_id: &str) -> String {
    format!("node-agent-{}", module_id)
}

pub(super) async fn start(
    bin: &str,
    module_id: &str,
    image: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> Result<ContainerHandle, ModuleError> {
    let name = container_name(module_id);

    // Leftover from a previous agent run
    let _ = docker(bin, &["rm", "-f", &name], CLI_TIMEOUT).await;

    let env_pairs: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    let mut argv: Vec<&str> = vec!["run", "-d", "--name", &name];
    for pair in &env_pairs {
        argv.push("-e");
        argv.push(pair);
    }
    argv.push(image);
    argv.extend(args.iter().map(String::as_str));

    let output = docker(bin, &argv, CLI_TIMEOUT)
        .await
        .map_err(|e| ModuleError::StartFailed(e.to_string()))?;
    if !output.status.success() {
        return Err(ModuleError::StartFailed(format!("docker run failed: {}", stderr_of(&output))));
    }

    let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if container_id.is_empty() {
        return Err(ModuleError::StartFailed("docker run returned no container id".to_string()));
    }
    debug!("Started container {} for module {}", container_id, module_id);
    Ok(ContainerHandle {
        docker: bin.to_string(),
        container_id,
    })
}

/// Parse `docker inspect` output of the form "<running> <exit code> <oom killed>"
fn parse_state(line: &str) -> Result<PollStatus, ModuleError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        ["true", ..] => Ok(PollStatus::Running),
        ["false", _, "true"] => Ok(PollStatus::Crashed("out of memory".to_string())),
        ["false", code, ..] => code
            .parse()
            .map(PollStatus::Exited)
            .map_err(|_| ModuleError::Backend(format!("unexpected inspect output: {}", line))),
        _ => Err(ModuleError::Backend(format!("unexpected inspect output: {}", line))),
    }
}

impl ContainerHandle {
    pub fn short_id(&self) -> &str {
        &self.container_id[..self.container_id.len().min(12)]
    }

    pub(super) async fn poll(&mut self) -> Result<PollStatus, ModuleError> {
        let output = docker(
            &self.docker,
            &[
                "inspect",
                "-f",
                "{{.State.Running}} {{.State.ExitCode}} {{.State.OOMKilled}}",
                &self.container_id,
            ],
            CLI_TIMEOUT,
        )
        .await?;

        if !output.status.success() {
            // Removed behind our back
            return Ok(PollStatus::Crashed(format!("container gone: {}", stderr_of(&output))));
        }
        parse_state(String::from_utf8_lossy(&output.stdout).trim())
    }

    pub(super) async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, ModuleError> {
        let grace_secs = grace.as_secs().max(1).to_string();
        let stopped = docker(
            &self.docker,
            &["stop", "--time", &grace_secs, &self.container_id],
            grace + Duration::from_secs(5),
        )
        .await;

        let forced = match stopped {
            Ok(output) if output.status.success() => false,
            Ok(output) => {
                warn!("docker stop {} failed: {}", self.short_id(), stderr_of(&output));
                self.kill().await?;
                true
            }
            Err(e) => {
                warn!("docker stop {} failed: {}", self.short_id(), e);
                self.kill().await?;
                true
            }
        };

        let exit_code = match self.poll().await {
            Ok(PollStatus::Exited(code)) => Some(code),
            _ => None,
        };
        if let Err(e) = docker(&self.docker, &["rm", "-f", &self.container_id], CLI_TIMEOUT).await {
            warn!("Could not remove container {}: {}", self.short_id(), e);
        }
        Ok(StopOutcome { forced, exit_code })
    }

    async fn kill(&self) -> Result<(), ModuleError> {
        let output = docker(&self.docker, &["kill", &self.container_id], CLI_TIMEOUT).await?;
        if !output.status.success() {
            return Err(ModuleError::Backend(format!("docker kill failed: {}", stderr_of(&output))));
        }
        Ok(())
    }

    pub(super) async fn excerpt(&mut self) -> String {
        match docker(&self.docker, &["logs", "--tail", "50", &self.container_id], CLI_TIMEOUT).await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                truncate_tail(text.trim_end(), OUTPUT_TAIL_BYTES)
            }
            Err(e) => format!("logs unavailable: {}", e),
        }
    }
}
