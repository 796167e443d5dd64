//! Registration tokens and the registration exchange

use super::protocol::RegistrationRequest;
use super::transport::ControlPlane;
use super::CommsError;
use crate::records::{Category, CommunicationLogEntry, Direction};
use crate::store::{token_digest, Credential, SecureDataStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Registration tokens are honoured for this long after they were obtained
pub const TOKEN_VALIDITY_MINUTES: i64 = 30;

/// Opaque, server-issued bearer token
#[derive(Clone, PartialEq)]
pub struct RegistrationToken {
    value: String,
    pub obtained_at: DateTime<Utc>,
}

impl std::fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationToken")
            .field("digest", &self.digest())
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

impl RegistrationToken {
    pub fn new(value: impl Into<String>, obtained_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into().trim().to_string(),
            obtained_at,
        }
    }

    pub fn digest(&self) -> String {
        token_digest(&self.value)
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.obtained_at > Duration::minutes(TOKEN_VALIDITY_MINUTES)
    }
}

/// Where a registration token may come from
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Given on the command line or environment when the agent started
    Inline(RegistrationToken),
    /// Dropped into a file; obtained at the file's modification time
    File(PathBuf),
}

impl TokenSource {
    pub fn read(&self) -> Option<RegistrationToken> {
        match self {
            TokenSource::Inline(token) => Some(token.clone()),
            TokenSource::File(path) => {
                let value = std::fs::read_to_string(path).ok()?;
                if value.trim().is_empty() {
                    return None;
                }
                let obtained_at = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Some(RegistrationToken::new(value, obtained_at))
            }
        }
    }

    /// Forget a file token once it has been used
    pub fn discard(&self) {
        if let TokenSource::File(path) = self {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

fn journal(store: &SecureDataStore, entry: CommunicationLogEntry) {
    if let Err(e) = store.put_json(Category::Communication, &entry) {
        debug!("Could not journal registration: {}", e);
    }
}

/// Exchange `token` for a credential. Expired or reused tokens are refused
/// locally; nothing is stored unless the control plane grants the request.
pub async fn register(
    store: &SecureDataStore,
    plane: &dyn ControlPlane,
    token: &RegistrationToken,
    system_info: Value,
) -> Result<Credential, CommsError> {
    let now = Utc::now();
    let digest = token.digest();

    if token.expired(now) {
        journal(
            store,
            CommunicationLogEntry::new(Direction::Outbound, "register", "rejected").detail("token expired"),
        );
        return Err(CommsError::RegistrationRejected(format!(
            "token obtained at {} is older than {} minutes",
            token.obtained_at, TOKEN_VALIDITY_MINUTES
        )));
    }
    if store.is_token_consumed(&digest)? {
        journal(
            store,
            CommunicationLogEntry::new(Direction::Outbound, "register", "rejected").detail("token already used"),
        );
        return Err(CommsError::RegistrationRejected("token already consumed".to_string()));
    }

    let existing = store.credential()?;
    let request = RegistrationRequest {
        device_id: existing.as_ref().map(|c| c.device_id.clone()),
        registration_token: token.value.clone(),
        system_info,
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: now,
    };

    let grant = match plane.register(&request).await {
        Ok(grant) => grant,
        Err(e) => {
            journal(
                store,
                CommunicationLogEntry::new(Direction::Outbound, "register", "failed").detail(e.to_string()),
            );
            return Err(match e {
                CommsError::AuthenticationRejected(detail) | CommsError::Rejected { detail, .. } => {
                    CommsError::RegistrationRejected(detail)
                }
                other => other,
            });
        }
    };

    if grant.device_id.trim().is_empty() || grant.session_key.is_empty() {
        return Err(CommsError::Protocol("registration grant is missing identity".to_string()));
    }

    let credential = store
        .complete_registration(&digest, &grant.device_id, &grant.session_key, grant.endpoint)
        .map_err(|e| match e {
            StoreError::TokenConsumed => CommsError::RegistrationRejected("token already consumed".to_string()),
            StoreError::DeviceMismatch { stored, offered } => {
                warn!("Control plane offered device {} but this host is {}", offered, stored);
                CommsError::RegistrationRejected(format!("device id mismatch ({} != {})", offered, stored))
            }
            other => CommsError::Store(other),
        })?;

    journal(
        store,
        CommunicationLogEntry::new(Direction::Outbound, "register", "registered").detail(credential.device_id.clone()),
    );
    info!("Registered as device {}", credential.device_id);
    Ok(credential)
}
