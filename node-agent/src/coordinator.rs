//! Agent Coordinator
//!
//! Owns every subsystem and the state they share. Startup order: store,
//! integrity scan, runtime config, resource monitor, module manager, then
//! the communication manager. Config changes, whether local or pushed, go
//! through the coordinator, which persists them and fans them out over a
//! watch channel. Shutdown runs in reverse with bounded waits.

use crate::comms::{
    AgentEvent, CommunicationManager, ControlPlane, ControlRequest, Dispatcher, HttpControlPlane, LinkStatus,
    RegistrationToken, TokenSource,
};
use crate::config::{self, AgentConfig, ConfigChange, ConfigError, RuntimeConfig};
use crate::error::Classify;
use crate::logging::LogControl;
use crate::modules::{BackendContext, ModuleManager, ModuleManagerHandle};
use crate::monitor::{MetricSource, ResourceMonitor, SysinfoSource};
use crate::records::{Category, LogEntry};
use crate::store::{MasterKey, SecureDataStore};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "coordinator";
const CONTROL_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 32;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);
/// Bound on joining every loop after cancellation
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Point-in-time view of the agent
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub device_id: Option<String>,
    pub config_version: u64,
    pub link: LinkStatus,
    pub pending: BTreeMap<String, usize>,
    pub quarantined: usize,
    pub modules: BTreeMap<String, usize>,
    pub storage_ok: bool,
}

/// State shared with subsystems, owned by the coordinator
#[derive(Clone)]
pub struct AgentState {
    pub store: Arc<SecureDataStore>,
    pub config: Arc<watch::Sender<RuntimeConfig>>,
    pub device_id: Arc<watch::Sender<Option<String>>>,
    pub modules: ModuleManagerHandle,
    pub link: watch::Receiver<LinkStatus>,
    pub started: Instant,
}

impl AgentState {
    pub fn runtime_config(&self) -> RuntimeConfig {
        self.config.borrow().clone()
    }

    pub async fn health(&self) -> HealthReport {
        let (pending, quarantined, storage_ok) = match self.store.stats() {
            Ok(stats) => (
                stats
                    .categories
                    .iter()
                    .filter(|c| Category::DELIVERABLE.contains(&c.category))
                    .map(|c| (c.category.to_string(), c.pending))
                    .collect(),
                stats.quarantined,
                true,
            ),
            Err(e) => {
                warn!("Store statistics unavailable: {}", e);
                (BTreeMap::new(), 0, false)
            }
        };

        let mut modules = BTreeMap::new();
        if let Ok(records) = self.modules.list().await {
            for record in records {
                *modules.entry(record.state.to_string()).or_insert(0) += 1;
            }
        }

        HealthReport {
            generated_at: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            device_id: self.device_id.borrow().clone(),
            config_version: self.config.borrow().version,
            link: self.link.borrow().clone(),
            pending,
            quarantined,
            modules,
            storage_ok,
        }
    }
}

/// Assembles an [`Agent`]. Everything except the bootstrap config has a
/// production default.
pub struct AgentBuilder {
    bootstrap: AgentConfig,
    plane: Option<Arc<dyn ControlPlane>>,
    source: Option<Arc<dyn MetricSource>>,
    token: Option<RegistrationToken>,
    master_key: Option<MasterKey>,
    log_control: Option<LogControl>,
    housekeeping_interval: Duration,
}

impl AgentBuilder {
    pub fn new(bootstrap: AgentConfig) -> Self {
        Self {
            bootstrap,
            plane: None,
            source: None,
            token: None,
            master_key: None,
            log_control: None,
            housekeeping_interval: HOUSEKEEPING_INTERVAL,
        }
    }

    pub fn control_plane(mut self, plane: Arc<dyn ControlPlane>) -> Self {
        self.plane = Some(plane);
        self
    }

    pub fn metric_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn registration_token(mut self, token: Option<RegistrationToken>) -> Self {
        self.token = token;
        self
    }

    /// Use this master key instead of the configured source
    pub fn master_key(mut self, key: MasterKey) -> Self {
        self.master_key = Some(key);
        self
    }

    pub fn log_control(mut self, control: LogControl) -> Self {
        self.log_control = Some(control);
        self
    }

    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub async fn start(self) -> Result<Agent> {
        let bootstrap = self.bootstrap;
        tokio::fs::create_dir_all(&bootstrap.agent.data_dir)
            .await
            .with_context(|| format!("Failed to create {}", bootstrap.agent.data_dir.display()))?;

        // 1. Store
        let master = match self.master_key {
            Some(key) => key,
            None => {
                let (key, created) = MasterKey::load_or_create(&bootstrap.security.master_key)
                    .context("Failed to load master key")?;
                if created {
                    info!("Created a new master key");
                }
                key
            }
        };
        let store = Arc::new(
            SecureDataStore::open(bootstrap.database_path(), master).context("Failed to open data store")?,
        );

        // 2. Integrity
        let integrity = store.verify_integrity().context("Integrity scan failed")?;
        if integrity.quarantined > 0 {
            warn!("{} records quarantined during startup scan", integrity.quarantined);
        }

        // 3. Runtime config
        let runtime = config::load_runtime(&store, &bootstrap).context("Failed to load runtime config")?;
        store.set_retention(runtime.retention_policy());
        if let Some(control) = &self.log_control {
            if let Err(e) = control.set_level(&runtime.log_level) {
                warn!("Keeping current log level: {:#}", e);
            }
        }
        info!("Runtime config version {}", runtime.version);

        let (config_tx, config_rx) = watch::channel(runtime.clone());
        let config_tx = Arc::new(config_tx);
        let (device_tx, device_rx) = watch::channel(None);
        let device_tx = Arc::new(device_tx);
        let stop = CancellationToken::new();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // 4. Resource monitor
        let source: Arc<dyn MetricSource> = match self.source {
            Some(source) => source,
            None => Arc::new(SysinfoSource::new()),
        };
        let monitor = ResourceMonitor::new(store.clone(), source.clone(), config_rx.clone(), device_rx);
        tasks.push(("resource monitor", tokio::spawn(monitor.clone().run(stop.clone()))));

        // 5. Module manager
        let (modules, module_task) = ModuleManager::spawn(
            store.clone(),
            config_rx.clone(),
            BackendContext::new(bootstrap.modules_dir()),
        )
        .context("Failed to start module manager")?;

        // 6. Communication manager
        let plane: Arc<dyn ControlPlane> = match self.plane {
            Some(plane) => plane,
            None => Arc::new(
                HttpControlPlane::new(&runtime.control_plane_url, bootstrap.request_timeout())
                    .context("Invalid control plane endpoint")?,
            ),
        };
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let mut tokens: Vec<TokenSource> = self.token.into_iter().map(TokenSource::Inline).collect();
        tokens.push(TokenSource::File(bootstrap.token_file()));

        let comms = CommunicationManager::new(
            store.clone(),
            plane.clone(),
            source,
            config_rx,
            device_tx.clone(),
            events_tx.clone(),
            Dispatcher::new(modules.clone(), control_tx),
        )
        .with_token_sources(tokens);
        for (name, handle) in ["registration", "delivery", "commands", "rotation"]
            .into_iter()
            .zip(comms.spawn(stop.clone()))
        {
            tasks.push((name, handle));
        }

        let state = AgentState {
            store: store.clone(),
            config: config_tx,
            device_id: device_tx,
            modules,
            link: comms.link(),
            started: Instant::now(),
        };

        tasks.push((
            "housekeeping",
            tokio::spawn(housekeeping(state.clone(), events_tx, self.housekeeping_interval, stop.clone())),
        ));

        let (reload_tx, reload_rx) = mpsc::channel(1);
        audit(&store, LogEntry::info(SOURCE, format!("agent {} started", env!("CARGO_PKG_VERSION"))));
        info!("Agent started");

        Ok(Agent {
            state,
            monitor,
            comms,
            plane,
            log_control: self.log_control,
            control_rx,
            events_rx,
            reload_tx,
            reload_rx,
            stop,
            tasks,
            module_task,
        })
    }
}

fn audit(store: &SecureDataStore, entry: LogEntry) {
    if let Err(e) = store.log(&entry) {
        debug!("Could not persist coordinator log entry: {}", e);
    }
}

/// Periodic retention cleanup, grace key retirement, storage probe and health record
async fn housekeeping(
    state: AgentState,
    events: mpsc::Sender<AgentEvent>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = state.store.health_check() {
            error!("Storage probe failed: {}", e);
            let _ = events.send(AgentEvent::StorageFault(e.to_string())).await;
            continue;
        }
        match state.store.cleanup_expired() {
            Ok(report) if report.total() > 0 => debug!("Housekeeping removed {} expired records", report.total()),
            Ok(_) => {}
            Err(e) => warn!("Retention cleanup failed: {}", e),
        }
        match state.store.retire_grace_keys() {
            Ok(0) => {}
            Ok(n) => info!("Re-sealed {} rows under the active key", n),
            Err(e) => warn!("Grace key retirement failed: {}", e),
        }

        let report = state.health().await;
        let context = serde_json::to_value(&report).unwrap_or_default();
        audit(&state.store, LogEntry::info(SOURCE, "health report").with_context(context));
    }
    debug!("Housekeeping stopped");
}

/// Triggers a reload of the runtime config from the store
#[derive(Clone)]
pub struct Reloader(mpsc::Sender<()>);

impl Reloader {
    pub fn trigger(&self) {
        let _ = self.0.try_send(());
    }
}

/// A running agent
pub struct Agent {
    state: AgentState,
    monitor: ResourceMonitor,
    comms: CommunicationManager,
    plane: Arc<dyn ControlPlane>,
    log_control: Option<LogControl>,
    control_rx: mpsc::Receiver<ControlRequest>,
    events_rx: mpsc::Receiver<AgentEvent>,
    reload_tx: mpsc::Sender<()>,
    reload_rx: mpsc::Receiver<()>,
    stop: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    module_task: JoinHandle<()>,
}

impl Agent {
    pub fn builder(bootstrap: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(bootstrap)
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn comms(&self) -> &CommunicationManager {
        &self.comms
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn reloader(&self) -> Reloader {
        Reloader(self.reload_tx.clone())
    }

    /// Validate, persist and propagate a config change
    pub fn apply_config(
        &self,
        changes: &BTreeMap<String, String>,
        source: &str,
    ) -> Result<ConfigChange, ConfigError> {
        let current = self.state.runtime_config();
        let (next, change) = config::apply_changes(&self.state.store, &current, changes, source)?;
        self.propagate(next);
        audit(
            &self.state.store,
            LogEntry::info(
                SOURCE,
                format!("config version {} from {}: {}", change.version, source, change.changed.join(", ")),
            ),
        );
        Ok(change)
    }

    /// Pick up a config document changed behind the agent's back
    pub fn reload_config(&self) -> Result<Option<ConfigChange>, ConfigError> {
        let Some(doc) = self.state.store.config_document()? else {
            return Ok(None);
        };
        let current = self.state.runtime_config();
        if doc.version == current.version {
            return Ok(None);
        }
        let next = RuntimeConfig::from_document(&doc)?;
        let change = ConfigChange {
            version: next.version,
            changed: current.diff(&next),
        };
        info!("Reloaded config version {}: {:?}", change.version, change.changed);
        self.propagate(next);
        Ok(Some(change))
    }

    fn propagate(&self, next: RuntimeConfig) {
        let current = self.state.runtime_config();
        self.state.store.set_retention(next.retention_policy());

        if next.log_level != current.log_level {
            if let Some(control) = &self.log_control {
                if let Err(e) = control.set_level(&next.log_level) {
                    warn!("Log level not applied: {:#}", e);
                }
            }
        }
        if next.control_plane_url != current.control_plane_url {
            match self.plane.set_endpoint(&next.control_plane_url) {
                Ok(()) => info!("Control plane endpoint now {}", next.control_plane_url),
                Err(e) => warn!("Endpoint not applied: {}", e),
            }
        }
        self.state.config.send_replace(next);
    }

    async fn serve(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::UpdateConfig { changes, source, reply } => {
                let _ = reply.send(self.apply_config(&changes, &source));
            }
            ControlRequest::Status { reply } => {
                let _ = reply.send(self.state.health().await);
            }
            ControlRequest::CollectMetrics { reply } => {
                let _ = reply.send(self.monitor.sample_once().await);
            }
        }
    }

    fn on_event(&mut self, event: AgentEvent) -> Result<()> {
        match event {
            AgentEvent::Registered { device_id } => info!("Device registered as {}", device_id),
            AgentEvent::AuthenticationRejected { device_id, detail } => {
                error!(
                    "CONTROL PLANE REJECTED THE SESSION KEY of device {} ({}). Place a new registration token in the data directory to re-register.",
                    device_id, detail
                );
            }
            AgentEvent::StorageFault(detail) => {
                error!("Storage fault: {}", detail);
                if self.state.store.health_check().is_ok() {
                    debug!("Store healthy again, no restart needed");
                    return Ok(());
                }
                self.state
                    .store
                    .recover()
                    .and_then(|_| self.state.store.health_check())
                    .with_context(|| format!("Data store unrecoverable after fault: {}", detail))?;
                warn!("Data store restarted after fault");
                audit(
                    &self.state.store,
                    LogEntry::warn(SOURCE, format!("data store restarted after fault: {}", detail)),
                );
            }
        }
        Ok(())
    }

    /// Serve requests and events until `shutdown` resolves, then stop everything
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(request) = self.control_rx.recv() => self.serve(request).await,
                Some(event) = self.events_rx.recv() => {
                    if let Err(e) = self.on_event(event) {
                        error!("{:#}", e);
                        break Err(e);
                    }
                }
                Some(()) = self.reload_rx.recv() => {
                    if let Err(e) = self.reload_config() {
                        warn!("Config reload failed: {}", e);
                    }
                }
            }
        };

        self.shutdown().await?;
        outcome
    }

    /// Stop modules, cancel every loop, flush the store
    pub async fn shutdown(mut self) -> Result<()> {
        let grace = self.state.runtime_config().stop_grace;
        audit(&self.state.store, LogEntry::info(SOURCE, "agent stopping"));

        match tokio::time::timeout(grace + JOIN_TIMEOUT, self.state.modules.shutdown(grace)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Module shutdown: {}", e),
            Err(_) => warn!("Modules did not stop within {:?}", grace + JOIN_TIMEOUT),
        }

        self.stop.cancel();
        let deadline = tokio::time::Instant::now() + JOIN_TIMEOUT;
        for (name, task) in self.tasks.drain(..) {
            let abort = task.abort_handle();
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => debug!("{} stopped", name),
                Ok(Err(e)) => warn!("{} ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("{} did not stop in time, aborting", name);
                    abort.abort();
                }
            }
        }
        let abort = self.module_task.abort_handle();
        if tokio::time::timeout_at(deadline, &mut self.module_task).await.is_err() {
            abort.abort();
        }

        audit(&self.state.store, LogEntry::info(SOURCE, "agent stopped"));
        if let Err(e) = self.state.store.flush() {
            if e.class().is_cross_cutting() {
                bail!("Final flush failed: {}", e);
            }
            warn!("Final flush failed: {}", e);
        }
        info!("Agent stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::protocol::*;
    use crate::comms::{CommsError, LinkState, Session};
    use crate::records::MetricCategory;
    use async_trait::async_trait;
    use serde_json::Value;

    /// Control plane that is never reachable
    struct Offline;

    #[async_trait]
    impl ControlPlane for Offline {
        async fn register(&self, _: &RegistrationRequest) -> Result<RegistrationGrant, CommsError> {
            Err(CommsError::Transient("offline".to_string()))
        }
        async fn deliver(&self, _: &Session, _: &TelemetryBatch) -> Result<DeliveryAck, CommsError> {
            Err(CommsError::Transient("offline".to_string()))
        }
        async fn poll_commands(&self, _: &Session) -> Result<Vec<InboundCommand>, CommsError> {
            Err(CommsError::Transient("offline".to_string()))
        }
        async fn report_command(&self, _: &Session, _: &CommandReport) -> Result<(), CommsError> {
            Err(CommsError::Transient("offline".to_string()))
        }
        async fn confirm_rotation(&self, _: &Session, _: &str) -> Result<(), CommsError> {
            Err(CommsError::Transient("offline".to_string()))
        }
        fn set_endpoint(&self, _: &str) -> Result<(), CommsError> {
            Ok(())
        }
        fn endpoint(&self) -> String {
            "offline".to_string()
        }
    }

    struct Fixed;

    impl MetricSource for Fixed {
        fn sample(&self, category: MetricCategory) -> anyhow::Result<Value> {
            Ok(serde_json::json!({ "category": category.as_str() }))
        }
    }

    async fn start(dir: &std::path::Path) -> Agent {
        Agent::builder(AgentConfig::with_data_dir(dir))
            .control_plane(Arc::new(Offline))
            .metric_source(Arc::new(Fixed))
            .master_key(MasterKey::from_bytes([7u8; 32]))
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_startup_samples_and_reports_health() {
        let dir = tempfile::tempdir().unwrap();
        let agent = start(dir.path()).await;

        let report = agent.state().health().await;
        assert_eq!(report.link.state, LinkState::Unregistered);
        assert_eq!(report.device_id, None);
        assert!(report.storage_ok);
        assert_eq!(report.config_version, 1);

        let tick = agent.monitor().sample_once().await;
        assert_eq!(tick.sampled.len(), MetricCategory::ALL.len());
        assert!(agent.state().store.pending_count(Category::Metrics).unwrap() >= 5);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_config_change_propagates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let agent = start(dir.path()).await;
        let mut watcher = agent.state().config.subscribe();

        let changes: BTreeMap<String, String> = [
            ("sampling.interval_secs".to_string(), "15".to_string()),
            ("retention.metrics_days".to_string(), "3".to_string()),
        ]
        .into();
        let change = agent.apply_config(&changes, "test").unwrap();
        assert_eq!(change.version, 2);
        assert!(watcher.has_changed().unwrap());
        assert_eq!(watcher.borrow_and_update().sampling_interval, Duration::from_secs(15));
        assert_eq!(agent.state().store.retention().days[&Category::Metrics], 3);

        let bad: BTreeMap<String, String> = [("sampling.interval_secs".to_string(), "soon".to_string())].into();
        assert!(agent.apply_config(&bad, "test").is_err());
        assert_eq!(agent.state().runtime_config().version, 2);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_picks_up_external_change() {
        let dir = tempfile::tempdir().unwrap();
        let agent = start(dir.path()).await;

        let store = &agent.state().store;
        let mut values = agent.state().runtime_config().to_values();
        values.insert("log_level".to_string(), "debug".to_string());
        store.save_config_document(values, "local-cli").unwrap();

        let change = agent.reload_config().unwrap().unwrap();
        assert_eq!(change.changed, vec!["log_level".to_string()]);
        assert_eq!(agent.state().runtime_config().log_level, "debug");
        assert!(agent.reload_config().unwrap().is_none());

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown_signal() {
        let dir = tempfile::tempdir().unwrap();
        let agent = start(dir.path()).await;
        let store = agent.state().store.clone();

        tokio::time::timeout(
            Duration::from_secs(15),
            agent.run(tokio::time::sleep(Duration::from_millis(100))),
        )
        .await
        .unwrap()
        .unwrap();

        let logs: Vec<LogEntry> = store
            .export(Category::Logs, None, 50)
            .unwrap()
            .iter()
            .map(|r| r.json().unwrap())
            .collect();
        assert_eq!(logs[0].message, "agent stopped");
    }
}
