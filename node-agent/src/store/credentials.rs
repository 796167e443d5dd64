//! Device credential and registration token journal
//!
//! Exactly one credential exists per device. Every mutation is a
//! read-modify-write under the writer lock, so rotation and re-registration
//! never race each other.

use super::entities::EntityKind;
use super::{crypto, SecureDataStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

const CREDENTIAL_NAME: &str = "device";

/// Identity and session material issued by the control plane
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub device_id: String,
    pub session_key: String,
    pub key_generation: u32,
    pub rotated_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub previous_key: Option<String>,
    #[serde(default)]
    pub previous_valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("device_id", &self.device_id)
            .field("session_key", &mask(&self.session_key))
            .field("key_generation", &self.key_generation)
            .field("rotated_at", &self.rotated_at)
            .field("rotation_pending", &self.pending_key.is_some())
            .finish()
    }
}

/// Keep the first four characters of a secret
pub fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}{}", visible, "*".repeat(secret.chars().count().saturating_sub(4).min(12)))
}

impl Credential {
    pub fn masked_session_key(&self) -> String {
        mask(&self.session_key)
    }

    /// Whether the session key is older than `period`
    pub fn rotation_due(&self, period: Duration, now: DateTime<Utc>) -> bool {
        self.rotated_at + period <= now
    }

    /// Whether the previous key is still inside its grace window
    pub fn previous_key_valid(&self, now: DateTime<Utc>) -> bool {
        self.previous_key.is_some() && self.previous_valid_until.map(|t| now < t).unwrap_or(false)
    }
}

impl SecureDataStore {
    pub fn credential(&self) -> Result<Option<Credential>, StoreError> {
        self.load_entity(EntityKind::Credential, CREDENTIAL_NAME)
    }

    pub fn is_token_consumed(&self, digest: &str) -> Result<bool, StoreError> {
        let conn = self.reader.lock();
        let consumed: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM consumed_tokens WHERE digest = ?1)",
            [digest],
            |row| row.get(0),
        )?;
        Ok(consumed)
    }

    /// Persist the outcome of a successful registration and journal the
    /// token as consumed, atomically. A fresh device gets a new credential;
    /// a known device gets its session key reissued. The device id never changes.
    pub fn complete_registration(
        &self,
        token_digest: &str,
        device_id: &str,
        session_key: &str,
        endpoint: Option<String>,
    ) -> Result<Credential, StoreError> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let consumed: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM consumed_tokens WHERE digest = ?1)",
            [token_digest],
            |row| row.get(0),
        )?;
        if consumed {
            return Err(StoreError::TokenConsumed);
        }

        let credential = {
            let keys = self.keys.read();
            let existing: Option<Credential> =
                Self::read_entity_locked(&tx, &keys, EntityKind::Credential, CREDENTIAL_NAME)?;
            let now = Utc::now();

            let credential = match existing {
                None => Credential {
                    device_id: device_id.to_string(),
                    session_key: session_key.to_string(),
                    key_generation: 1,
                    rotated_at: now,
                    registered_at: now,
                    previous_key: None,
                    previous_valid_until: None,
                    pending_key: None,
                    endpoint,
                },
                Some(existing) if existing.device_id == device_id => Credential {
                    session_key: session_key.to_string(),
                    key_generation: existing.key_generation + 1,
                    rotated_at: now,
                    previous_key: None,
                    previous_valid_until: None,
                    pending_key: None,
                    endpoint: endpoint.or(existing.endpoint),
                    ..existing
                },
                Some(existing) => {
                    return Err(StoreError::DeviceMismatch {
                        stored: existing.device_id,
                        offered: device_id.to_string(),
                    })
                }
            };

            Self::write_entity(
                &tx,
                &keys,
                EntityKind::Credential,
                CREDENTIAL_NAME,
                &serde_json::to_vec(&credential)?,
            )?;
            credential
        };

        tx.execute(
            "INSERT INTO consumed_tokens (digest, consumed_at) VALUES (?1, ?2)",
            params![token_digest, Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;

        info!(
            "Stored credential for device {} (generation {})",
            credential.device_id, credential.key_generation
        );
        Ok(credential)
    }

    /// Apply `change` to the stored credential under the writer lock
    fn update_credential(
        &self,
        change: impl FnOnce(&mut Credential) -> Result<(), StoreError>,
    ) -> Result<Credential, StoreError> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let credential = {
            let keys = self.keys.read();
            let mut credential: Credential =
                Self::read_entity_locked(&tx, &keys, EntityKind::Credential, CREDENTIAL_NAME)?
                    .ok_or(StoreError::NoCredential)?;
            change(&mut credential)?;
            Self::write_entity(
                &tx,
                &keys,
                EntityKind::Credential,
                CREDENTIAL_NAME,
                &serde_json::to_vec(&credential)?,
            )?;
            credential
        };
        tx.commit()?;
        Ok(credential)
    }

    /// Record a candidate session key awaiting control-plane confirmation
    pub fn stage_session_key(&self, new_key: &str) -> Result<Credential, StoreError> {
        self.update_credential(|credential| {
            credential.pending_key = Some(new_key.to_string());
            Ok(())
        })
    }

    /// Promote the staged key. The old key stays valid for `grace`.
    pub fn confirm_session_key(&self, grace: Duration) -> Result<Credential, StoreError> {
        let credential = self.update_credential(|credential| {
            let pending = credential.pending_key.take().ok_or(StoreError::NoPendingRotation)?;
            let now = Utc::now();
            credential.previous_key = Some(std::mem::replace(&mut credential.session_key, pending));
            credential.previous_valid_until = Some(now + grace);
            credential.key_generation += 1;
            credential.rotated_at = now;
            Ok(())
        })?;
        info!("Session key rotated to generation {}", credential.key_generation);
        Ok(credential)
    }

    /// Drop a staged key after a failed confirmation
    pub fn abort_session_key(&self) -> Result<Credential, StoreError> {
        self.update_credential(|credential| {
            credential.pending_key = None;
            Ok(())
        })
    }
}

/// Digest under which a registration token is journaled
pub fn token_digest(token: &str) -> String {
    crypto::token_digest(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::test_store;

    #[test]
    fn test_registration_creates_single_credential() {
        let (_dir, store) = test_store();
        assert!(store.credential().unwrap().is_none());

        let cred = store
            .complete_registration(&token_digest("tok-1"), "dev-42", "key-a", None)
            .unwrap();
        assert_eq!(cred.device_id, "dev-42");
        assert_eq!(cred.key_generation, 1);
        assert!(store.is_token_consumed(&token_digest("tok-1")).unwrap());
        assert_eq!(store.credential().unwrap().unwrap().session_key, "key-a");
    }

    #[test]
    fn test_consumed_token_cannot_be_reused() {
        let (_dir, store) = test_store();
        store
            .complete_registration(&token_digest("tok-1"), "dev-42", "key-a", None)
            .unwrap();

        let err = store
            .complete_registration(&token_digest("tok-1"), "dev-42", "key-b", None)
            .unwrap_err();
        assert!(matches!(err, StoreError::TokenConsumed));
        assert_eq!(store.credential().unwrap().unwrap().session_key, "key-a");
    }

    #[test]
    fn test_reregistration_keeps_device_id() {
        let (_dir, store) = test_store();
        store
            .complete_registration(&token_digest("tok-1"), "dev-42", "key-a", None)
            .unwrap();

        let reissued = store
            .complete_registration(&token_digest("tok-2"), "dev-42", "key-b", None)
            .unwrap();
        assert_eq!(reissued.key_generation, 2);
        assert_eq!(reissued.session_key, "key-b");

        let err = store
            .complete_registration(&token_digest("tok-3"), "dev-99", "key-c", None)
            .unwrap_err();
        assert!(matches!(err, StoreError::DeviceMismatch { .. }));
        assert!(!store.is_token_consumed(&token_digest("tok-3")).unwrap());
    }

    #[test]
    fn test_session_rotation_confirm() {
        let (_dir, store) = test_store();
        store
            .complete_registration(&token_digest("tok"), "dev", "old-key", None)
            .unwrap();

        store.stage_session_key("new-key").unwrap();
        let cred = store.credential().unwrap().unwrap();
        assert_eq!(cred.session_key, "old-key");
        assert_eq!(cred.pending_key.as_deref(), Some("new-key"));

        let rotated = store.confirm_session_key(Duration::minutes(60)).unwrap();
        assert_eq!(rotated.session_key, "new-key");
        assert_eq!(rotated.previous_key.as_deref(), Some("old-key"));
        assert_eq!(rotated.key_generation, 2);
        assert!(rotated.previous_key_valid(Utc::now()));
        assert!(rotated.pending_key.is_none());
    }

    #[test]
    fn test_session_rotation_abort_keeps_current_key() {
        let (_dir, store) = test_store();
        store
            .complete_registration(&token_digest("tok"), "dev", "old-key", None)
            .unwrap();

        store.stage_session_key("new-key").unwrap();
        let cred = store.abort_session_key().unwrap();
        assert_eq!(cred.session_key, "old-key");
        assert!(cred.pending_key.is_none());
        assert!(matches!(
            store.confirm_session_key(Duration::minutes(1)),
            Err(StoreError::NoPendingRotation)
        ));
    }

    #[test]
    fn test_rotation_without_credential() {
        let (_dir, store) = test_store();
        assert!(matches!(store.stage_session_key("k"), Err(StoreError::NoCredential)));
    }

    #[test]
    fn test_rotation_due() {
        let now = Utc::now();
        let cred = Credential {
            device_id: "d".into(),
            session_key: "abcdefgh".into(),
            key_generation: 1,
            rotated_at: now - Duration::hours(25),
            registered_at: now - Duration::hours(25),
            previous_key: None,
            previous_valid_until: None,
            pending_key: None,
            endpoint: None,
        };
        assert!(cred.rotation_due(Duration::hours(24), now));
        assert!(!cred.rotation_due(Duration::hours(48), now));
        assert_eq!(cred.masked_session_key(), "abcd****");
        assert!(!format!("{:?}", cred).contains("abcdefgh"));
    }
}
