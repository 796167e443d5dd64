//! Execution backends
//!
//! Every backend offers the same three capabilities: start a module from its
//! spec, poll the resulting handle, stop it within a grace period. The
//! handle is a closed variant selected by the module's declared backend kind.

mod container;
mod process;
mod script;

pub use container::ContainerHandle;
pub use process::ProcessHandle;

use super::state::{BackendSpec, ModuleSpec};
use super::ModuleError;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes of module output kept for task logs
pub const OUTPUT_TAIL_BYTES: usize = 4096;

/// Where and how backends run modules
#[derive(Debug, Clone)]
pub struct BackendContext {
    /// Parent of per-module working directories
    pub work_root: PathBuf,
    /// Container CLI
    pub docker_bin: String,
}

impl BackendContext {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            docker_bin: "docker".to_string(),
        }
    }

    pub fn module_dir(&self, module_id: &str) -> PathBuf {
        self.work_root.join(module_id)
    }
}

/// Observation from one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    Exited(i32),
    Crashed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    /// Grace period ran out and the module was killed
    pub forced: bool,
    pub exit_code: Option<i32>,
}

/// Live module started by a backend
#[derive(Debug)]
pub enum ModuleHandle {
    Process(ProcessHandle),
    Container(ContainerHandle),
}

/// Start `spec` with the backend its kind selects
pub async fn start(spec: &ModuleSpec, ctx: &BackendContext) -> Result<ModuleHandle, ModuleError> {
    let dir = ctx.module_dir(&spec.module_id);
    match &spec.backend {
        BackendSpec::Process { command, args } => {
            prepare_dir(&dir).await?;
            process::spawn(command, args, &spec.env, &dir).map(ModuleHandle::Process)
        }
        BackendSpec::Script {
            interpreter,
            body,
            args,
        } => {
            prepare_dir(&dir).await?;
            script::start(interpreter, body, args, &spec.env, &dir)
                .await
                .map(ModuleHandle::Process)
        }
        BackendSpec::Container { image, args } => {
            container::start(&ctx.docker_bin, &spec.module_id, image, args, &spec.env)
                .await
                .map(ModuleHandle::Container)
        }
    }
}

async fn prepare_dir(dir: &Path) -> Result<(), ModuleError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ModuleError::StartFailed(format!("cannot create {}: {}", dir.display(), e)))
}

impl ModuleHandle {
    pub async fn poll(&mut self) -> Result<PollStatus, ModuleError> {
        match self {
            ModuleHandle::Process(handle) => handle.poll(),
            ModuleHandle::Container(handle) => handle.poll().await,
        }
    }

    /// Graceful stop, escalating to forced termination after `grace`
    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, ModuleError> {
        match self {
            ModuleHandle::Process(handle) => handle.stop(grace).await,
            ModuleHandle::Container(handle) => handle.stop(grace).await,
        }
    }

    /// Tail of the module's output
    pub async fn excerpt(&mut self) -> String {
        match self {
            ModuleHandle::Process(handle) => handle.excerpt().await,
            ModuleHandle::Container(handle) => handle.excerpt().await,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ModuleHandle::Process(handle) => match handle.pid() {
                Some(pid) => format!("pid {}", pid),
                None => "exited process".to_string(),
            },
            ModuleHandle::Container(handle) => format!("container {}", handle.short_id()),
        }
    }
}

/// Last lines of output, bounded in bytes
#[derive(Debug, Default)]
pub struct OutputTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl OutputTail {
    pub fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > OUTPUT_TAIL_BYTES && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
            }
        }
    }

    pub fn excerpt(&self) -> String {
        let joined = self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        truncate_tail(&joined, OUTPUT_TAIL_BYTES)
    }
}

/// Keep at most `max` trailing bytes on a char boundary
pub fn truncate_tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
