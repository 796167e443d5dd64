//! Manager task and its request handle

use super::backend::{self, BackendContext, ModuleHandle, PollStatus, StopOutcome};
use super::policy::CommandPolicy;
use super::state::{DesiredState, ModuleRecord, ModuleSpec, ModuleState};
use super::ModuleError;
use crate::backoff::exponential;
use crate::config::RuntimeConfig;
use crate::records::{Category, LogEntry, Severity, TaskLogEntry, TaskOutcome};
use crate::store::{EntityKind, SecureDataStore};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

const SOURCE: &str = "module_manager";
const CHANNEL_CAPACITY: usize = 32;
const START_TIMEOUT: Duration = Duration::from_secs(120);
/// Consecutive poll timeouts before a module counts as crashed
const MAX_POLL_TIMEOUTS: u32 = 3;
/// Extra time granted to stop tasks beyond the shutdown grace
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

type Reply<T> = oneshot::Sender<Result<T, ModuleError>>;

enum Request {
    Deploy {
        spec: ModuleSpec,
        reply: Reply<ModuleRecord>,
    },
    Stop {
        module_id: String,
        reply: Reply<ModuleRecord>,
    },
    Redeploy {
        module_id: String,
        spec: Option<ModuleSpec>,
        reply: Reply<ModuleRecord>,
    },
    Remove {
        module_id: String,
        reply: Reply<()>,
    },
    List {
        reply: Reply<Vec<ModuleRecord>>,
    },
    Shutdown {
        grace: Duration,
        reply: Reply<()>,
    },
}

/// Cloneable front end of the manager task
#[derive(Clone)]
pub struct ModuleManagerHandle {
    tx: mpsc::Sender<Request>,
}

impl ModuleManagerHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, ModuleError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| ModuleError::Unavailable)?;
        rx.await.map_err(|_| ModuleError::Unavailable)?
    }

    /// Register and start a new module
    pub async fn deploy(&self, spec: ModuleSpec) -> Result<ModuleRecord, ModuleError> {
        self.request(|reply| Request::Deploy { spec, reply }).await
    }

    /// Resolves once the module has stopped
    pub async fn stop(&self, module_id: impl Into<String>) -> Result<ModuleRecord, ModuleError> {
        let module_id = module_id.into();
        self.request(|reply| Request::Stop { module_id, reply }).await
    }

    /// Restart a module from scratch, optionally with a new spec
    pub async fn redeploy(
        &self,
        module_id: impl Into<String>,
        spec: Option<ModuleSpec>,
    ) -> Result<ModuleRecord, ModuleError> {
        let module_id = module_id.into();
        self.request(|reply| Request::Redeploy { module_id, spec, reply })
            .await
    }

    pub async fn remove(&self, module_id: impl Into<String>) -> Result<(), ModuleError> {
        let module_id = module_id.into();
        self.request(|reply| Request::Remove { module_id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<ModuleRecord>, ModuleError> {
        self.request(|reply| Request::List { reply }).await
    }

    /// Refuse new deployments, stop everything, end the manager task
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ModuleError> {
        self.request(|reply| Request::Shutdown { grace, reply }).await
    }
}

/// Follow-up once a stop completes
enum AfterStop {
    Reply(Reply<ModuleRecord>),
    Remove(Reply<()>),
    Redeploy(Option<ModuleSpec>, Reply<ModuleRecord>),
    Shutdown,
}

impl AfterStop {
    fn fail(self, err: ModuleError) {
        match self {
            AfterStop::Reply(reply) | AfterStop::Redeploy(_, reply) => {
                let _ = reply.send(Err(err));
            }
            AfterStop::Remove(reply) => {
                let _ = reply.send(Err(err));
            }
            AfterStop::Shutdown => warn!("Stop during shutdown failed: {}", err),
        }
    }
}

struct RunningModule {
    handle: ModuleHandle,
    started_at: DateTime<Utc>,
    started: Instant,
    poll_timeouts: u32,
}

struct StartDone {
    module_id: String,
    result: Result<ModuleHandle, ModuleError>,
}

struct StopDone {
    module_id: String,
    started: Option<(DateTime<Utc>, Instant)>,
    result: Result<StopOutcome, ModuleError>,
    excerpt: String,
    after: AfterStop,
}

pub struct ModuleManager {
    store: Arc<SecureDataStore>,
    config: watch::Receiver<RuntimeConfig>,
    ctx: BackendContext,
    rx: mpsc::Receiver<Request>,
    records: BTreeMap<String, ModuleRecord>,
    running: HashMap<String, RunningModule>,
    restarts: HashMap<String, Instant>,
    /// Callers waiting for a start in flight
    launching: HashMap<String, Option<Reply<ModuleRecord>>>,
    starts: JoinSet<StartDone>,
    stops: JoinSet<StopDone>,
    accepting: bool,
}

fn respond<T>(reply: Option<Reply<T>>, result: Result<T, ModuleError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

impl ModuleManager {
    /// Reload persisted records and start the manager task
    pub fn spawn(
        store: Arc<SecureDataStore>,
        config: watch::Receiver<RuntimeConfig>,
        ctx: BackendContext,
    ) -> Result<(ModuleManagerHandle, JoinHandle<()>), ModuleError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut manager = ModuleManager {
            store,
            config,
            ctx,
            rx,
            records: BTreeMap::new(),
            running: HashMap::new(),
            restarts: HashMap::new(),
            launching: HashMap::new(),
            starts: JoinSet::new(),
            stops: JoinSet::new(),
            accepting: true,
        };
        let resume = manager.recover()?;
        let task = tokio::spawn(manager.run(resume));
        Ok((ModuleManagerHandle { tx }, task))
    }

    /// Settle records left mid-lifecycle by a previous process. Returns
    /// modules stopped by an agent shutdown that should run again.
    fn recover(&mut self) -> Result<Vec<String>, ModuleError> {
        let records: Vec<ModuleRecord> = self.store.list_entities(EntityKind::Module)?;
        for record in records {
            self.records.insert(record.module_id.clone(), record);
        }

        let mut resume = Vec::new();
        let snapshot: Vec<(String, ModuleState, DesiredState)> = self
            .records
            .values()
            .map(|r| (r.module_id.clone(), r.state, r.desired))
            .collect();
        for (id, state, desired) in snapshot {
            match state {
                ModuleState::Running | ModuleState::Deploying => {
                    self.enter_failed(&id, "agent restarted while module was active".to_string())?;
                }
                ModuleState::Stopping => {
                    self.transition(&id, ModuleState::Stopped, "stop completed across restart")?;
                }
                ModuleState::Stopped if desired == DesiredState::Running => resume.push(id),
                _ => {}
            }
        }

        info!("Recovered {} module records", self.records.len());
        Ok(resume)
    }

    // ---------------------------------------------------------------
    // Record bookkeeping
    // ---------------------------------------------------------------

    fn audit(&self, severity: Severity, message: String) {
        match severity {
            Severity::Error => error!("{}", message),
            Severity::Warn => warn!("{}", message),
            _ => info!("{}", message),
        }
        if let Err(e) = self.store.log(&LogEntry::new(severity, SOURCE, message)) {
            debug!("Could not persist module audit entry: {}", e);
        }
    }

    /// Apply `change` and persist; memory is updated only once the store accepted it
    fn update(&mut self, module_id: &str, change: impl FnOnce(&mut ModuleRecord)) -> Result<ModuleRecord, ModuleError> {
        let mut next = self
            .records
            .get(module_id)
            .cloned()
            .ok_or_else(|| ModuleError::NotFound(module_id.to_string()))?;
        change(&mut next);
        self.store.save_entity(EntityKind::Module, module_id, &next)?;
        self.records.insert(module_id.to_string(), next.clone());
        Ok(next)
    }

    fn transition_with(
        &mut self,
        module_id: &str,
        to: ModuleState,
        reason: &str,
        change: impl FnOnce(&mut ModuleRecord),
    ) -> Result<ModuleRecord, ModuleError> {
        let current = self
            .records
            .get(module_id)
            .ok_or_else(|| ModuleError::NotFound(module_id.to_string()))?;
        let from = current.state;
        let mut checked = current.clone();
        checked.transition(to)?;

        let record = self.update(module_id, |record| {
            record.state = checked.state;
            record.last_transition = checked.last_transition;
            change(record);
        })?;
        self.audit(
            if to == ModuleState::Failed {
                Severity::Warn
            } else {
                Severity::Info
            },
            format!("module {}: {} -> {} ({})", module_id, from, to, reason),
        );
        Ok(record)
    }

    fn transition(&mut self, module_id: &str, to: ModuleState, reason: &str) -> Result<ModuleRecord, ModuleError> {
        self.transition_with(module_id, to, reason, |_| {})
    }

    fn write_task_log(
        &self,
        module_id: &str,
        invoked_at: DateTime<Utc>,
        outcome: TaskOutcome,
        duration: Duration,
        exit_code: Option<i32>,
        output_excerpt: String,
    ) {
        let entry = TaskLogEntry {
            module_id: module_id.to_string(),
            invoked_at,
            outcome,
            duration_ms: duration.as_millis() as u64,
            exit_code,
            output_excerpt,
        };
        if let Err(e) = self.store.put_json(Category::TaskLogs, &entry) {
            warn!("Could not persist task log for {}: {}", module_id, e);
        }
    }

    fn enter_failed(&mut self, module_id: &str, reason: String) -> Result<ModuleRecord, ModuleError> {
        let record = self.transition_with(module_id, ModuleState::Failed, &reason, |r| {
            r.last_error = Some(reason.clone())
        })?;
        self.schedule_restart(&record);
        Ok(record)
    }

    fn schedule_restart(&mut self, record: &ModuleRecord) {
        if record.desired != DesiredState::Running || !self.accepting {
            return;
        }
        let (max_restarts, base, cap) = {
            let config = self.config.borrow();
            (config.max_restarts, config.restart_backoff, config.restart_backoff_max)
        };

        if record.restart_count >= max_restarts {
            self.audit(
                Severity::Error,
                format!(
                    "module {} stays failed after {} restarts: {}",
                    record.module_id,
                    record.restart_count,
                    record.last_error.as_deref().unwrap_or("unknown error")
                ),
            );
            return;
        }

        let delay = exponential(base, cap, record.restart_count);
        info!(
            "Module {} restart {}/{} in {:?}",
            record.module_id,
            record.restart_count + 1,
            max_restarts,
            delay
        );
        self.restarts.insert(record.module_id.clone(), Instant::now() + delay);
    }

    // ---------------------------------------------------------------
    // Lifecycle operations
    // ---------------------------------------------------------------

    /// Enter Deploying and start the backend off the manager task. The
    /// outcome (Running or Failed) is settled by `finish_launch`.
    fn launch(&mut self, module_id: &str, reply: Option<Reply<ModuleRecord>>) {
        let record = match self.transition(module_id, ModuleState::Deploying, "deploy") {
            Ok(record) => record,
            Err(e) => return respond(reply, Err(e)),
        };
        let policy_check = CommandPolicy::from_config(&self.config.borrow()).check(&record.spec);
        if let Err(e) = policy_check {
            let result = self.start_failed(module_id, e);
            return respond(reply, result);
        }

        let spec = record.spec;
        let ctx = self.ctx.clone();
        let module_id = module_id.to_string();
        self.launching.insert(module_id.clone(), reply);
        self.starts.spawn(async move {
            let result = match timeout(START_TIMEOUT, backend::start(&spec, &ctx)).await {
                Ok(result) => result,
                Err(_) => Err(ModuleError::StartFailed(format!("start timed out after {:?}", START_TIMEOUT))),
            };
            StartDone { module_id, result }
        });
    }

    async fn finish_launch(&mut self, done: StartDone) {
        let StartDone { module_id, result } = done;
        let reply = self.launching.remove(&module_id).flatten();

        let result = match result {
            Ok(handle) => self.enter_running(&module_id, handle).await,
            Err(e) => self.start_failed(&module_id, e),
        };
        if let (Err(e), None) = (&result, &reply) {
            warn!("Start of module {} failed: {}", module_id, e);
        }
        respond(reply, result);

        if !self.accepting && self.running.contains_key(&module_id) {
            let grace = self.config.borrow().stop_grace;
            self.begin_stop(&module_id, "agent shutdown", DesiredState::Running, grace, AfterStop::Shutdown);
        }
    }

    /// Deploying -> Running
    async fn enter_running(&mut self, module_id: &str, handle: ModuleHandle) -> Result<ModuleRecord, ModuleError> {
        let described = handle.describe();
        self.running.insert(
            module_id.to_string(),
            RunningModule {
                handle,
                started_at: Utc::now(),
                started: Instant::now(),
                poll_timeouts: 0,
            },
        );
        match self.transition(module_id, ModuleState::Running, &format!("started as {}", described)) {
            Ok(record) => Ok(record),
            Err(e) => {
                if let Some(mut orphan) = self.running.remove(module_id) {
                    let _ = orphan.handle.stop(Duration::from_secs(1)).await;
                }
                Err(e)
            }
        }
    }

    /// Deploying -> Failed. Always returns the start error (or the error
    /// recording it).
    fn start_failed(&mut self, module_id: &str, e: ModuleError) -> Result<ModuleRecord, ModuleError> {
        self.write_task_log(module_id, Utc::now(), TaskOutcome::Failure, Duration::ZERO, None, e.to_string());
        if matches!(e, ModuleError::CommandRejected(_)) {
            // Policy changed since registration; retrying cannot help
            self.transition_with(module_id, ModuleState::Failed, "rejected by policy", |r| {
                r.last_error = Some(e.to_string())
            })?;
        } else {
            self.enter_failed(module_id, e.to_string())?;
        }
        Err(e)
    }

    /// Validate and persist a new record; returns its id
    fn register(&mut self, spec: ModuleSpec) -> Result<String, ModuleError> {
        if !self.accepting {
            return Err(ModuleError::ShuttingDown);
        }
        CommandPolicy::from_config(&self.config.borrow()).check(&spec)?;
        if self.records.contains_key(&spec.module_id) {
            return Err(ModuleError::AlreadyExists(spec.module_id));
        }

        let record = ModuleRecord::new(spec);
        let module_id = record.module_id.clone();
        self.store.save_entity(EntityKind::Module, &module_id, &record)?;
        self.records.insert(module_id.clone(), record);
        self.audit(Severity::Info, format!("module {} registered", module_id));
        Ok(module_id)
    }

    /// Stopped/Failed -> Registered -> Deploying
    fn redeploy(&mut self, module_id: &str, spec: Option<ModuleSpec>, reply: Option<Reply<ModuleRecord>>) {
        match self.reset_for_redeploy(module_id, spec) {
            Ok(()) => self.launch(module_id, reply),
            Err(e) => respond(reply, Err(e)),
        }
    }

    fn reset_for_redeploy(&mut self, module_id: &str, spec: Option<ModuleSpec>) -> Result<(), ModuleError> {
        if !self.accepting {
            return Err(ModuleError::ShuttingDown);
        }
        let state = self
            .records
            .get(module_id)
            .map(|r| r.state)
            .ok_or_else(|| ModuleError::NotFound(module_id.to_string()))?;

        let reset = |record: &mut ModuleRecord| {
            if let Some(spec) = spec {
                record.apply_spec(spec);
            }
            record.restart_count = 0;
            record.desired = DesiredState::Running;
            record.last_error = None;
        };

        match state {
            ModuleState::Stopped | ModuleState::Failed => {
                self.restarts.remove(module_id);
                self.transition_with(module_id, ModuleState::Registered, "redeploy", reset)?;
            }
            ModuleState::Registered => {
                self.update(module_id, reset)?;
            }
            other => {
                return Err(ModuleError::CommandRejected(format!(
                    "module {} is {}, cannot redeploy",
                    module_id, other
                )))
            }
        }
        Ok(())
    }

    /// Running -> Stopping; the stop itself runs off the manager task
    fn begin_stop(&mut self, module_id: &str, reason: &str, desired: DesiredState, grace: Duration, after: AfterStop) {
        if let Err(e) = self.transition_with(module_id, ModuleState::Stopping, reason, |r| r.desired = desired) {
            after.fail(e);
            return;
        }

        let running = self.running.remove(module_id);
        let module_id = module_id.to_string();
        self.stops.spawn(async move {
            match running {
                Some(mut running) => {
                    let result = running.handle.stop(grace).await;
                    let excerpt = running.handle.excerpt().await;
                    StopDone {
                        module_id,
                        started: Some((running.started_at, running.started)),
                        result,
                        excerpt,
                        after,
                    }
                }
                None => StopDone {
                    module_id,
                    started: None,
                    result: Ok(StopOutcome {
                        forced: false,
                        exit_code: None,
                    }),
                    excerpt: String::new(),
                    after,
                },
            }
        });
    }

    /// Stopping -> Stopped, then whatever the stop was for
    async fn finish_stop(&mut self, done: StopDone) {
        let StopDone {
            module_id,
            started,
            result,
            excerpt,
            after,
        } = done;

        let (outcome, exit_code, note) = match &result {
            Ok(stop) if stop.forced => (TaskOutcome::Timeout, stop.exit_code, "killed after grace period".to_string()),
            Ok(stop) => (TaskOutcome::Success, stop.exit_code, "stopped".to_string()),
            Err(e) => (TaskOutcome::Failure, None, format!("stop error: {}", e)),
        };
        if let Some((started_at, started)) = started {
            self.write_task_log(&module_id, started_at, outcome, started.elapsed(), exit_code, excerpt);
        }
        if result.is_err() {
            self.audit(Severity::Warn, format!("module {}: {}", module_id, note));
        }

        let stopped = self.transition(&module_id, ModuleState::Stopped, &note);
        match after {
            AfterStop::Reply(reply) => {
                let _ = reply.send(stopped);
            }
            AfterStop::Remove(reply) => {
                let _ = reply.send(stopped.and_then(|_| self.delete(&module_id)));
            }
            AfterStop::Redeploy(spec, reply) => match stopped {
                Ok(_) => self.redeploy(&module_id, spec, Some(reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            AfterStop::Shutdown => {
                if let Err(e) = stopped {
                    warn!("Module {} did not settle during shutdown: {}", module_id, e);
                }
            }
        }
    }

    fn delete(&mut self, module_id: &str) -> Result<(), ModuleError> {
        self.store.delete_entity(EntityKind::Module, module_id)?;
        self.records.remove(module_id);
        self.restarts.remove(module_id);

        let dir = self.ctx.module_dir(module_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("Could not remove {}: {}", dir.display(), e);
            }
        }
        self.audit(Severity::Info, format!("module {} removed", module_id));
        Ok(())
    }

    // ---------------------------------------------------------------
    // Supervision
    // ---------------------------------------------------------------

    async fn supervise(&mut self) {
        let limit = self.config.borrow().module_poll_timeout;
        let ids: Vec<String> = self.running.keys().cloned().collect();

        for id in ids {
            let Some(running) = self.running.get_mut(&id) else { continue };
            let (status, unresponsive) = match timeout(limit, running.handle.poll()).await {
                Ok(Ok(status)) => {
                    running.poll_timeouts = 0;
                    (status, false)
                }
                Ok(Err(e)) => {
                    warn!("Poll of module {} failed: {}", id, e);
                    continue;
                }
                Err(_) => {
                    running.poll_timeouts += 1;
                    if running.poll_timeouts < MAX_POLL_TIMEOUTS {
                        warn!("Poll of module {} timed out ({})", id, running.poll_timeouts);
                        continue;
                    }
                    let reason = format!("unresponsive for {} polls", running.poll_timeouts);
                    (PollStatus::Crashed(reason), true)
                }
            };

            if status != PollStatus::Running {
                self.handle_exit(&id, status, unresponsive).await;
            }
        }
    }

    async fn handle_exit(&mut self, module_id: &str, status: PollStatus, unresponsive: bool) {
        let Some(mut running) = self.running.remove(module_id) else { return };
        if unresponsive {
            let _ = running.handle.stop(Duration::from_secs(1)).await;
        }
        let excerpt = running.handle.excerpt().await;
        let elapsed = running.started.elapsed();

        let result = match status {
            PollStatus::Running => return,
            PollStatus::Exited(0) => {
                self.write_task_log(module_id, running.started_at, TaskOutcome::Success, elapsed, Some(0), excerpt);
                self.transition(module_id, ModuleState::Stopping, "exited cleanly")
                    .and_then(|_| {
                        self.transition_with(module_id, ModuleState::Stopped, "completed", |r| {
                            r.desired = DesiredState::Stopped
                        })
                    })
            }
            PollStatus::Exited(code) => {
                self.write_task_log(module_id, running.started_at, TaskOutcome::Failure, elapsed, Some(code), excerpt);
                self.enter_failed(module_id, format!("exited with code {}", code))
            }
            PollStatus::Crashed(reason) => {
                let outcome = if unresponsive {
                    TaskOutcome::Timeout
                } else {
                    TaskOutcome::Failure
                };
                self.write_task_log(module_id, running.started_at, outcome, elapsed, None, excerpt);
                self.enter_failed(module_id, reason)
            }
        };
        if let Err(e) = result {
            error!("Could not record exit of module {}: {}", module_id, e);
        }
    }

    fn run_due_restarts(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .restarts
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            self.restarts.remove(&id);
            if let Err(e) = self.update(&id, |r| r.restart_count += 1) {
                error!("Could not record restart of {}: {}", id, e);
                continue;
            }
            self.launch(&id, None);
        }
    }

    // ---------------------------------------------------------------
    // Request loop
    // ---------------------------------------------------------------

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Deploy { spec, reply } => match self.register(spec) {
                Ok(module_id) => self.launch(&module_id, Some(reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Request::Stop { module_id, reply } => {
                let Some(record) = self.records.get(&module_id) else {
                    let _ = reply.send(Err(ModuleError::NotFound(module_id)));
                    return;
                };
                match record.state {
                    ModuleState::Running => {
                        let grace = self.config.borrow().stop_grace;
                        self.begin_stop(
                            &module_id,
                            "stop requested",
                            DesiredState::Stopped,
                            grace,
                            AfterStop::Reply(reply),
                        );
                    }
                    ModuleState::Failed if self.restarts.contains_key(&module_id) => {
                        // Cancel the pending restart; the record stays failed
                        self.restarts.remove(&module_id);
                        let _ = reply.send(self.update(&module_id, |r| r.desired = DesiredState::Stopped));
                    }
                    from => {
                        let _ = reply.send(Err(ModuleError::InvalidTransition {
                            module_id,
                            from,
                            to: ModuleState::Stopping,
                        }));
                    }
                }
            }
            Request::Redeploy { module_id, spec, reply } => {
                if let Some(spec) = &spec {
                    let checked = if spec.module_id != module_id {
                        Err(ModuleError::CommandRejected(format!(
                            "spec for {} sent to {}",
                            spec.module_id, module_id
                        )))
                    } else {
                        CommandPolicy::from_config(&self.config.borrow()).check(spec)
                    };
                    if let Err(e) = checked {
                        let _ = reply.send(Err(e));
                        return;
                    }
                }
                let state = self.records.get(&module_id).map(|r| r.state);
                if state == Some(ModuleState::Running) && self.accepting {
                    let grace = self.config.borrow().stop_grace;
                    self.begin_stop(
                        &module_id,
                        "redeploy requested",
                        DesiredState::Running,
                        grace,
                        AfterStop::Redeploy(spec, reply),
                    );
                } else {
                    self.redeploy(&module_id, spec, Some(reply));
                }
            }
            Request::Remove { module_id, reply } => match self.records.get(&module_id).map(|r| r.state) {
                None => {
                    let _ = reply.send(Err(ModuleError::NotFound(module_id)));
                }
                Some(ModuleState::Running) => {
                    let grace = self.config.borrow().stop_grace;
                    self.begin_stop(
                        &module_id,
                        "remove requested",
                        DesiredState::Stopped,
                        grace,
                        AfterStop::Remove(reply),
                    );
                }
                Some(state @ (ModuleState::Stopping | ModuleState::Deploying)) => {
                    let _ = reply.send(Err(ModuleError::CommandRejected(format!(
                        "module {} is {}",
                        module_id, state
                    ))));
                }
                Some(_) => {
                    let _ = reply.send(self.delete(&module_id));
                }
            },
            Request::List { reply } => {
                let _ = reply.send(Ok(self.records.values().cloned().collect()));
            }
            Request::Shutdown { reply, .. } => {
                // Handled by the run loop
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn shutdown(&mut self, grace: Duration) {
        self.accepting = false;
        self.restarts.clear();

        let running: Vec<String> = self.running.keys().cloned().collect();
        info!("Stopping {} running modules", running.len());
        for id in running {
            self.begin_stop(&id, "agent shutdown", DesiredState::Running, grace, AfterStop::Shutdown);
        }

        // Starts still in flight are stopped as soon as they settle
        let deadline = Instant::now() + grace + SHUTDOWN_SLACK;
        while !self.stops.is_empty() || !self.starts.is_empty() {
            tokio::select! {
                Some(joined) = self.starts.join_next(), if !self.starts.is_empty() => match joined {
                    Ok(done) => self.finish_launch(done).await,
                    Err(e) => error!("Start task failed: {}", e),
                },
                Some(joined) = self.stops.join_next(), if !self.stops.is_empty() => match joined {
                    Ok(done) => self.finish_stop(done).await,
                    Err(e) => error!("Stop task failed: {}", e),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "{} module stops and {} starts did not finish in time, aborting",
                        self.stops.len(),
                        self.starts.len()
                    );
                    self.stops.abort_all();
                    self.starts.abort_all();
                    self.launching.clear();
                    break;
                }
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        self.config.borrow().module_poll_interval
    }

    async fn run(mut self, resume: Vec<String>) {
        for id in resume {
            info!("Resuming module {} stopped by agent shutdown", id);
            if let Err(e) = self.reset_for_redeploy(&id, None) {
                warn!("Could not resume module {}: {}", id, e);
                continue;
            }
            self.launch(&id, None);
        }

        info!("Module manager started with {} modules", self.records.len());
        let mut next_poll = Instant::now() + self.poll_interval();

        loop {
            let restart_at = self.restarts.values().min().copied();
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(Request::Shutdown { grace, reply }) => {
                        self.shutdown(grace).await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(request) => self.handle(request).await,
                    None => {
                        let grace = self.config.borrow().stop_grace;
                        self.shutdown(grace).await;
                        break;
                    }
                },
                Some(joined) = self.starts.join_next(), if !self.starts.is_empty() => match joined {
                    Ok(done) => self.finish_launch(done).await,
                    Err(e) => error!("Start task failed: {}", e),
                },
                Some(joined) = self.stops.join_next(), if !self.stops.is_empty() => match joined {
                    Ok(done) => self.finish_stop(done).await,
                    Err(e) => error!("Stop task failed: {}", e),
                },
                _ = tokio::time::sleep_until(restart_at.unwrap_or(next_poll)), if restart_at.is_some() => {
                    self.run_due_restarts();
                }
                _ = tokio::time::sleep_until(next_poll) => {
                    self.supervise().await;
                    next_poll = Instant::now() + self.poll_interval();
                }
            }
        }
        info!("Module manager stopped");
    }
}
