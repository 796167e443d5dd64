//! Communication Manager
//!
//! Owns the link to the control plane: registration, the authenticated
//! session, store-and-forward delivery of queued records, inbound command
//! intake and periodic session key rotation. Each concern runs as its own
//! task; they share nothing but the store, the link status and the
//! cancellation token.
//!
//! Transient failures are retried forever with capped backoff. A rejected
//! session key parks every loop until a new key is obtained by
//! re-registration.

mod commands;
mod delivery;
mod inbound;
pub mod protocol;
mod registration;
mod session;
mod transport;

pub use commands::{validate, AgentCommand, ControlRequest, Dispatcher, Execution, ModuleCommand};
pub use inbound::RecentCommands;
pub use registration::{register, RegistrationToken, TokenSource, TOKEN_VALIDITY_MINUTES};
pub use transport::{check_endpoint, ControlPlane, HttpControlPlane};

use crate::error::{Classify, ErrorClass};
use crate::monitor::MetricSource;
use crate::records::{Category, CommunicationLogEntry, LogEntry, MetricCategory};
use crate::store::{mask, Credential, SecureDataStore, StoreError};
use crate::config::RuntimeConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "communication_manager";
/// Fallback re-check while waiting for a usable session
const SESSION_RECHECK: Duration = Duration::from_secs(5);
const SYSTEM_INFO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("session key rejected: {0}")]
    AuthenticationRejected(String),

    #[error("control plane unreachable: {0}")]
    Transient(String),

    #[error("device is not registered")]
    NotRegistered,

    #[error("invalid command: {0}")]
    Validation(String),

    #[error("control plane refused request ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for CommsError {
    fn class(&self) -> ErrorClass {
        match self {
            CommsError::RegistrationRejected(_) | CommsError::AuthenticationRejected(_) => ErrorClass::Authentication,
            CommsError::Transient(_) | CommsError::Protocol(_) => ErrorClass::Transient,
            CommsError::Store(e) => e.class(),
            _ => ErrorClass::Validation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No credential yet
    Unregistered,
    /// Credential present, no exchange completed yet
    Connecting,
    Online,
    /// Last exchange failed transiently
    Offline,
    /// Session key rejected; waiting for re-registration
    ReauthRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub last_delivery: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(skip)]
    rejected_generation: Option<u32>,
}

impl LinkStatus {
    fn new(state: LinkState) -> Self {
        Self {
            state,
            last_delivery: None,
            last_error: None,
            rejected_generation: None,
        }
    }
}

/// Notifications for the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Registered { device_id: String },
    AuthenticationRejected { device_id: String, detail: String },
    StorageFault(String),
}

/// Credentials used to authenticate one exchange
#[derive(Clone, PartialEq)]
pub struct Session {
    pub device_id: String,
    pub session_key: String,
    pub key_generation: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.device_id)
            .field("session_key", &mask(&self.session_key))
            .field("key_generation", &self.key_generation)
            .finish()
    }
}

impl From<&Credential> for Session {
    fn from(credential: &Credential) -> Self {
        Self {
            device_id: credential.device_id.clone(),
            session_key: credential.session_key.clone(),
            key_generation: credential.key_generation,
        }
    }
}

/// Sleep for `delay`; true when `stop` fired first
async fn pause(stop: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

struct Shared {
    store: Arc<SecureDataStore>,
    plane: Arc<dyn ControlPlane>,
    source: Arc<dyn MetricSource>,
    config: watch::Receiver<RuntimeConfig>,
    device_id: Arc<watch::Sender<Option<String>>>,
    link: watch::Sender<LinkStatus>,
    events: mpsc::Sender<AgentEvent>,
    dispatcher: Dispatcher,
    tokens: Vec<TokenSource>,
}

/// Cloneable handle; every clone drives the same link
#[derive(Clone)]
pub struct CommunicationManager {
    inner: Arc<Shared>,
}

impl CommunicationManager {
    pub fn new(
        store: Arc<SecureDataStore>,
        plane: Arc<dyn ControlPlane>,
        source: Arc<dyn MetricSource>,
        config: watch::Receiver<RuntimeConfig>,
        device_id: Arc<watch::Sender<Option<String>>>,
        events: mpsc::Sender<AgentEvent>,
        dispatcher: Dispatcher,
    ) -> Self {
        let state = match store.credential() {
            Ok(Some(credential)) => {
                device_id.send_replace(Some(credential.device_id));
                LinkState::Connecting
            }
            _ => LinkState::Unregistered,
        };
        let (link, _) = watch::channel(LinkStatus::new(state));

        Self {
            inner: Arc::new(Shared {
                store,
                plane,
                source,
                config,
                device_id,
                link,
                events,
                dispatcher,
                tokens: Vec::new(),
            }),
        }
    }

    /// Where registration tokens are looked for, in order.
    /// Must be called before the handle is cloned.
    pub fn with_token_sources(mut self, tokens: Vec<TokenSource>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.tokens = tokens,
            None => warn!("Token sources ignored: communication manager already shared"),
        }
        self
    }

    pub fn link(&self) -> watch::Receiver<LinkStatus> {
        self.inner.link.subscribe()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.inner.link.borrow().clone()
    }

    pub fn plane(&self) -> Arc<dyn ControlPlane> {
        self.inner.plane.clone()
    }

    /// Session for the stored credential, ignoring link state
    pub fn current_session(&self) -> Result<Session, CommsError> {
        let credential = self.inner.store.credential()?.ok_or(CommsError::NotRegistered)?;
        Ok(Session::from(&credential))
    }

    /// Start registration, delivery, command and rotation loops
    pub fn spawn(&self, stop: CancellationToken) -> Vec<JoinHandle<()>> {
        info!("Communication manager starting ({:?})", self.inner.link.borrow().state);
        vec![
            tokio::spawn(self.clone().registration_loop(stop.clone())),
            tokio::spawn(self.clone().outbound_loop(stop.clone())),
            tokio::spawn(self.clone().inbound_loop(stop.clone())),
            tokio::spawn(self.clone().rotation_loop(stop)),
        ]
    }

    // ---------------------------------------------------------------
    // Shared helpers
    // ---------------------------------------------------------------

    fn journal(&self, entry: CommunicationLogEntry) {
        if let Err(e) = self.inner.store.put_json(Category::Communication, &entry) {
            debug!("Could not journal exchange: {}", e);
            self.storage_fault(&e);
        }
    }

    fn audit(&self, entry: LogEntry) {
        if let Err(e) = self.inner.store.log(&entry) {
            debug!("Could not persist log entry: {}", e);
            self.storage_fault(&e);
        }
    }

    fn storage_fault(&self, e: &StoreError) {
        if e.class() == ErrorClass::Fatal {
            let _ = self.inner.events.try_send(AgentEvent::StorageFault(e.to_string()));
        }
    }

    fn mark_online(&self, delivered: bool) {
        self.inner.link.send_if_modified(|status| {
            let changed = status.state != LinkState::Online;
            if status.state == LinkState::ReauthRequired {
                return false;
            }
            if changed {
                info!("Control plane link online");
            }
            status.state = LinkState::Online;
            status.last_error = None;
            if delivered {
                status.last_delivery = Some(Utc::now());
            }
            changed || delivered
        });
    }

    /// Wait until a credential exists whose key has not been rejected
    async fn session(&self, stop: &CancellationToken) -> Option<Session> {
        let mut link = self.inner.link.subscribe();
        loop {
            let blocked = {
                let status = link.borrow_and_update();
                if status.state == LinkState::ReauthRequired {
                    status.rejected_generation
                } else {
                    None
                }
            };

            match self.inner.store.credential() {
                Ok(Some(credential)) if blocked != Some(credential.key_generation) => {
                    return Some(Session::from(&credential));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Could not read credential: {}", e);
                    self.storage_fault(&e);
                }
            }

            tokio::select! {
                _ = stop.cancelled() => return None,
                _ = link.changed() => {}
                _ = tokio::time::sleep(SESSION_RECHECK) => {}
            }
        }
    }

    fn auth_rejected(&self, session: &Session, detail: &str) {
        let mut first = false;
        self.inner.link.send_modify(|status| {
            first = !(status.state == LinkState::ReauthRequired
                && status.rejected_generation == Some(session.key_generation));
            status.state = LinkState::ReauthRequired;
            status.rejected_generation = Some(session.key_generation);
            status.last_error = Some(detail.to_string());
        });
        if !first {
            return;
        }

        error!(
            "Session key generation {} rejected by control plane: {}. Re-registration required.",
            session.key_generation, detail
        );
        self.audit(LogEntry::error(
            SOURCE,
            format!("session key rejected ({}); provide a new registration token", detail),
        ));
        let _ = self.inner.events.try_send(AgentEvent::AuthenticationRejected {
            device_id: session.device_id.clone(),
            detail: detail.to_string(),
        });
    }

    /// Record a failed exchange and return how long to wait before the next one
    fn after_failure(&self, session: &Session, what: &str, e: CommsError, backoff: &mut crate::backoff::Backoff) -> Duration {
        match e {
            CommsError::AuthenticationRejected(detail) => {
                self.auth_rejected(session, &detail);
                Duration::ZERO
            }
            CommsError::Store(e) => {
                error!("{} failed on local storage: {}", what, e);
                self.storage_fault(&e);
                backoff.next_delay()
            }
            other => {
                let delay = backoff.next_delay();
                warn!("{} failed (attempt {}): {}; retrying in {:?}", what, backoff.attempts(), other, delay);
                self.inner.link.send_if_modified(|status| {
                    if status.state == LinkState::ReauthRequired {
                        return false;
                    }
                    status.state = LinkState::Offline;
                    status.last_error = Some(other.to_string());
                    true
                });
                delay
            }
        }
    }

    fn backoff(&self) -> crate::backoff::Backoff {
        let config = self.inner.config.borrow();
        crate::backoff::Backoff::new(config.backoff_base, config.backoff_max)
    }

    fn refresh_backoff(&self, backoff: &mut crate::backoff::Backoff) {
        let config = self.inner.config.borrow();
        backoff.reconfigure(config.backoff_base, config.backoff_max);
    }

    // ---------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------

    async fn system_info(&self) -> Value {
        let source = self.inner.source.clone();
        let task = tokio::task::spawn_blocking(move || source.sample(MetricCategory::SystemInfo));
        match tokio::time::timeout(SYSTEM_INFO_TIMEOUT, task).await {
            Ok(Ok(Ok(info))) => info,
            _ => {
                warn!("System info unavailable for registration");
                Value::Object(Default::default())
            }
        }
    }

    /// Register with `token` now, bypassing the token sources
    pub async fn register_now(&self, token: &RegistrationToken) -> Result<Credential, CommsError> {
        let info = self.system_info().await;
        let credential = register(&self.inner.store, self.inner.plane.as_ref(), token, info).await?;

        self.inner.device_id.send_replace(Some(credential.device_id.clone()));
        self.inner.link.send_modify(|status| {
            status.state = LinkState::Connecting;
            status.rejected_generation = None;
            status.last_error = None;
        });
        self.audit(LogEntry::info(
            SOURCE,
            format!(
                "registered as device {} (key generation {})",
                credential.device_id, credential.key_generation
            ),
        ));
        let _ = self.inner.events.try_send(AgentEvent::Registered {
            device_id: credential.device_id.clone(),
        });
        Ok(credential)
    }

    fn needs_registration(&self) -> bool {
        if self.inner.link.borrow().state == LinkState::ReauthRequired {
            return true;
        }
        matches!(self.inner.store.credential(), Ok(None))
    }

    async fn registration_loop(self, stop: CancellationToken) {
        let mut backoff = self.backoff();
        let mut refused: HashSet<String> = HashSet::new();
        let mut link = self.link();
        let recheck = self.inner.config.borrow().command_poll_interval.max(Duration::from_secs(1));

        loop {
            let mut wait = recheck;
            if self.needs_registration() {
                let candidate = self
                    .inner
                    .tokens
                    .iter()
                    .find_map(|source| source.read().filter(|t| !refused.contains(&t.digest())).map(|t| (source, t)));

                match candidate {
                    Some((source, token)) => match self.register_now(&token).await {
                        Ok(_) => {
                            backoff.reset();
                            source.discard();
                            continue;
                        }
                        Err(e) if e.class() == ErrorClass::Transient => {
                            wait = backoff.next_delay();
                            warn!("Registration attempt failed: {}; retrying in {:?}", e, wait);
                        }
                        Err(e) => {
                            refused.insert(token.digest());
                            error!("Registration failed: {}", e);
                            self.audit(LogEntry::error(SOURCE, format!("registration failed: {}", e)));
                        }
                    },
                    None => debug!("Waiting for a registration token"),
                }
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = link.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("Registration loop stopped");
    }
}


#[cfg(test)]
mod tests {
    use super::testing::rig;
    use super::*;
    use crate::backoff::Backoff;

    #[tokio::test]
    async fn test_registration_publishes_device_id() {
        let mut rig = rig();
        assert_eq!(rig.comms.link_status().state, LinkState::Unregistered);
        assert!(matches!(rig.comms.current_session(), Err(CommsError::NotRegistered)));

        let session = rig.registered().await;
        assert_eq!(*rig.device_id.borrow(), Some(session.device_id.clone()));
        assert_eq!(rig.comms.link_status().state, LinkState::Connecting);
        assert_eq!(
            rig.events.recv().await,
            Some(AgentEvent::Registered {
                device_id: "dev-fake".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_rejected_key_parks_until_reregistration() {
        let mut rig = rig();
        let session = rig.registered().await;
        let _ = rig.events.recv().await;
        let stop = CancellationToken::new();

        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(10));
        let wait = rig.comms.after_failure(
            &session,
            "delivery",
            CommsError::AuthenticationRejected("401 Unauthorized".to_string()),
            &mut backoff,
        );
        assert_eq!(wait, Duration::ZERO);
        assert_eq!(rig.comms.link_status().state, LinkState::ReauthRequired);
        assert!(matches!(
            rig.events.recv().await,
            Some(AgentEvent::AuthenticationRejected { .. })
        ));

        // Parked: no session is handed out for the rejected key
        let parked = tokio::time::timeout(Duration::from_millis(200), rig.comms.session(&stop)).await;
        assert!(parked.is_err());

        let renewed = rig.registered().await;
        assert_eq!(renewed.device_id, session.device_id);
        assert!(renewed.key_generation > session.key_generation);
        let resumed = rig.comms.session(&stop).await.unwrap();
        assert_eq!(resumed, renewed);
    }

    #[tokio::test]
    async fn test_transient_failure_marks_offline_with_backoff() {
        let rig = rig();
        let session = rig.registered().await;
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40));

        let delays: Vec<Duration> = (0..4)
            .map(|_| {
                rig.comms.after_failure(
                    &session,
                    "delivery",
                    CommsError::Transient("connection refused".to_string()),
                    &mut backoff,
                )
            })
            .collect();
        assert_eq!(delays.last(), Some(&Duration::from_millis(40)));
        assert_eq!(rig.comms.link_status().state, LinkState::Offline);

        rig.comms.mark_online(true);
        let status = rig.comms.link_status();
        assert_eq!(status.state, LinkState::Online);
        assert!(status.last_delivery.is_some());
    }

    #[tokio::test]
    async fn test_loops_stop_on_cancel() {
        let rig = rig();
        let stop = CancellationToken::new();
        let tasks = rig.comms.spawn(stop.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        }
    }
}
