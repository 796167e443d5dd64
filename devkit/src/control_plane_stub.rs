/*!
Control plane en mémoire pour développement sans serveur

Implémente `ControlPlane` de l'agent. Enregistre chaque requête reçue et
permet de simuler une coupure réseau, le rejet de la clé de session ou des
commandes en attente.
*/

use async_trait::async_trait;
use node_agent::comms::protocol::{
    CommandReport, DeliveryAck, InboundCommand, RegistrationGrant, RegistrationRequest, TelemetryBatch,
};
use node_agent::comms::{CommsError, ControlPlane, Session};
use node_agent::records::Category;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct StubState {
    endpoint: String,
    online: bool,
    reject_sessions: bool,
    grants: u32,
    registrations: Vec<RegistrationRequest>,
    batches: Vec<TelemetryBatch>,
    commands: VecDeque<InboundCommand>,
    reports: Vec<CommandReport>,
    rotations: Vec<String>,
    /// Clés de session refusées par le serveur
    revoked: Vec<String>,
}

/// Control plane simulé, clonable et partagé entre test et agent
#[derive(Clone)]
pub struct StubControlPlane {
    state: Arc<Mutex<StubState>>,
}

impl Default for StubControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl StubControlPlane {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StubState {
                endpoint: "http://stub.invalid".to_string(),
                online: true,
                ..StubState::default()
            })),
        }
    }

    /// Simule une coupure (ou le retour) du réseau
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
        log::info!("🔌 [STUB] Control plane {}", if online { "online" } else { "offline" });
    }

    /// Le serveur refuse désormais la clé de session courante
    pub fn revoke_current_key(&self) {
        let mut state = self.state.lock();
        state.reject_sessions = true;
        log::info!("⛔ [STUB] Session keys revoked");
    }

    /// Ajoute une commande à délivrer au prochain poll
    pub fn queue_command(&self, command: InboundCommand) {
        log::info!("📨 [STUB] Queued command {} ({})", command.command_id, command.action);
        self.state.lock().commands.push_back(command);
    }

    pub fn registrations(&self) -> Vec<RegistrationRequest> {
        self.state.lock().registrations.clone()
    }

    pub fn batches(&self) -> Vec<TelemetryBatch> {
        self.state.lock().batches.clone()
    }

    /// Enregistrements reçus pour une catégorie, dans l'ordre d'arrivée
    pub fn delivered(&self, category: Category) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .batches
            .iter()
            .filter(|b| b.category == category)
            .flat_map(|b| b.records.iter().map(|r| r.payload.clone()))
            .collect()
    }

    pub fn reports(&self) -> Vec<CommandReport> {
        self.state.lock().reports.clone()
    }

    pub fn report_for(&self, command_id: &str) -> Option<CommandReport> {
        self.state
            .lock()
            .reports
            .iter()
            .rev()
            .find(|r| r.command_id == command_id)
            .cloned()
    }

    pub fn rotations(&self) -> Vec<String> {
        self.state.lock().rotations.clone()
    }

    fn check_online(state: &StubState) -> Result<(), CommsError> {
        if state.online {
            Ok(())
        } else {
            Err(CommsError::Transient("stub control plane offline".to_string()))
        }
    }

    fn authorize(state: &StubState, session: &Session) -> Result<(), CommsError> {
        Self::check_online(state)?;
        if state.revoked.contains(&session.session_key) {
            return Err(CommsError::AuthenticationRejected(format!(
                "session key of {} revoked",
                session.device_id
            )));
        }
        Ok(())
    }

    fn apply_revocation(state: &mut StubState, session: &Session) {
        if state.reject_sessions {
            state.revoked.push(session.session_key.clone());
            state.reject_sessions = false;
        }
    }
}

#[async_trait]
impl ControlPlane for StubControlPlane {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationGrant, CommsError> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        if state
            .registrations
            .iter()
            .any(|r| r.registration_token == request.registration_token)
        {
            return Err(CommsError::RegistrationRejected("token already used".to_string()));
        }
        state.registrations.push(request.clone());
        state.grants += 1;
        log::info!("🤝 [STUB] Registration #{}", state.grants);

        Ok(RegistrationGrant {
            device_id: request.device_id.clone().unwrap_or_else(|| "stub-device".to_string()),
            session_key: format!("stub-key-{}", state.grants),
            endpoint: None,
        })
    }

    async fn deliver(&self, session: &Session, batch: &TelemetryBatch) -> Result<DeliveryAck, CommsError> {
        let mut state = self.state.lock();
        Self::apply_revocation(&mut state, session);
        Self::authorize(&state, session)?;
        state.batches.push(batch.clone());
        Ok(DeliveryAck::default())
    }

    async fn poll_commands(&self, session: &Session) -> Result<Vec<InboundCommand>, CommsError> {
        let mut state = self.state.lock();
        Self::apply_revocation(&mut state, session);
        Self::authorize(&state, session)?;
        Ok(state.commands.drain(..).collect())
    }

    async fn report_command(&self, session: &Session, report: &CommandReport) -> Result<(), CommsError> {
        let mut state = self.state.lock();
        Self::authorize(&state, session)?;
        state.reports.push(report.clone());
        Ok(())
    }

    async fn confirm_rotation(&self, session: &Session, new_key: &str) -> Result<(), CommsError> {
        let mut state = self.state.lock();
        Self::authorize(&state, session)?;
        state.rotations.push(new_key.to_string());
        Ok(())
    }

    fn set_endpoint(&self, url: &str) -> Result<(), CommsError> {
        node_agent::comms::check_endpoint(url)?;
        self.state.lock().endpoint = url.to_string();
        Ok(())
    }

    fn endpoint(&self) -> String {
        self.state.lock().endpoint.clone()
    }
}
