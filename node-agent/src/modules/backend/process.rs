//! Native process backend

use super::{OutputTail, PollStatus, StopOutcome};
use crate::modules::ModuleError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    exited: Option<PollStatus>,
    tail: Arc<Mutex<OutputTail>>,
    readers: Vec<JoinHandle<()>>,
}

fn capture<R>(stream: Option<R>, tail: &Arc<Mutex<OutputTail>>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = stream?;
    let tail = tail.clone();
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tail.lock().push(line);
        }
    }))
}

/// Spawn `program` in `cwd` with output captured
pub(super) fn spawn(
    program: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    cwd: &Path,
) -> Result<ProcessHandle, ModuleError> {
    let mut child = Command::new(program)
        .args(args)
        .envs(env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ModuleError::StartFailed(format!("{}: {}", program, e)))?;

    let tail = Arc::new(Mutex::new(OutputTail::default()));
    let readers = [
        capture(child.stdout.take(), &tail),
        capture(child.stderr.take(), &tail),
    ]
    .into_iter()
    .flatten()
    .collect();

    let pid = child.id();
    debug!("Spawned {} as pid {:?}", program, pid);
    Ok(ProcessHandle {
        child,
        pid,
        exited: None,
        tail,
        readers,
    })
}

fn status_of(status: std::process::ExitStatus) -> PollStatus {
    if let Some(code) = status.code() {
        return PollStatus::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return PollStatus::Crashed(format!("terminated by signal {}", signal));
        }
    }
    PollStatus::Crashed("terminated abnormally".to_string())
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        if self.exited.is_some() {
            None
        } else {
            self.pid
        }
    }

    pub(super) fn poll(&mut self) -> Result<PollStatus, ModuleError> {
        if let Some(status) = &self.exited {
            return Ok(status.clone());
        }
        match self.child.try_wait() {
            Ok(None) => Ok(PollStatus::Running),
            Ok(Some(status)) => {
                let status = status_of(status);
                self.exited = Some(status.clone());
                Ok(status)
            }
            Err(e) => Err(ModuleError::Backend(format!("wait failed: {}", e))),
        }
    }

    #[cfg(unix)]
    fn terminate(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.pid {
            Some(pid) => match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => true,
                Err(e) => {
                    warn!("SIGTERM to pid {} failed: {}", pid, e);
                    false
                }
            },
            None => false,
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }

    pub(super) async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, ModuleError> {
        if let PollStatus::Exited(code) = self.poll()? {
            return Ok(StopOutcome {
                forced: false,
                exit_code: Some(code),
            });
        }

        if self.terminate() {
            if let Ok(waited) = tokio::time::timeout(grace, self.child.wait()).await {
                let status = waited.map_err(|e| ModuleError::Backend(e.to_string()))?;
                self.exited = Some(status_of(status));
                return Ok(StopOutcome {
                    forced: false,
                    exit_code: status.code(),
                });
            }
            warn!("Pid {:?} ignored SIGTERM for {:?}, killing", self.pid, grace);
        }

        self.child
            .kill()
            .await
            .map_err(|e| ModuleError::Backend(format!("kill failed: {}", e)))?;
        self.exited = Some(PollStatus::Crashed("killed".to_string()));
        Ok(StopOutcome {
            forced: true,
            exit_code: None,
        })
    }

    pub(super) async fn excerpt(&mut self) -> String {
        // Let readers drain what the process wrote before exiting
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(Duration::from_millis(250), reader).await.is_err() {
                abort.abort();
            }
        }
        self.tail.lock().excerpt()
    }
}
