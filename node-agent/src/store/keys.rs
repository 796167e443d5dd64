//! Key management for the data store
//!
//! - Master key read from a 0600 file or the OS keyring, created on first use
//! - Data keys wrapped by the master key and kept in `encryption_keys`
//! - Exactly one active data key; rotated keys linger in grace state until
//!   every record they sealed has been rewritten

use super::crypto::{self, KeyBytes, KEY_SIZE};
use super::StoreError;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use keyring::Entry;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where the master key lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MasterKeySource {
    File { path: PathBuf },
    Keyring { service: String, account: String },
}

/// Key-encryption key protecting the data keys
#[derive(Clone)]
pub struct MasterKey(KeyBytes);

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

impl MasterKey {
    pub fn from_bytes(bytes: KeyBytes) -> Self {
        Self(bytes)
    }

    /// Load the master key, generating and persisting it when absent.
    /// Returns the key and whether it was just created.
    pub fn load_or_create(source: &MasterKeySource) -> Result<(Self, bool), StoreError> {
        match source {
            MasterKeySource::File { path } => Self::from_file(path),
            MasterKeySource::Keyring { service, account } => Self::from_keyring(service, account),
        }
    }

    fn from_file(path: &Path) -> Result<(Self, bool), StoreError> {
        if path.exists() {
            let encoded = std::fs::read_to_string(path)?;
            return Ok((Self(decode_key(encoded.trim())?), false));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let key = crypto::generate_key();
        std::fs::write(path, STANDARD.encode(key))?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(path)?.permissions();
            permissions.set_mode(0o600);
            std::fs::set_permissions(path, permissions)?;
        }

        info!("Generated new master key at {}", path.display());
        Ok((Self(key), true))
    }

    fn from_keyring(service: &str, account: &str) -> Result<(Self, bool), StoreError> {
        let entry = Entry::new(service, account).map_err(|e| StoreError::Crypto(e.to_string()))?;

        match entry.get_password() {
            Ok(encoded) => Ok((Self(decode_key(encoded.trim())?), false)),
            Err(keyring::Error::NoEntry) => {
                let key = crypto::generate_key();
                entry
                    .set_password(&STANDARD.encode(key))
                    .map_err(|e| StoreError::Crypto(e.to_string()))?;
                info!("Generated new master key in OS keyring ({}/{})", service, account);
                Ok((Self(key), true))
            }
            Err(e) => Err(StoreError::Crypto(e.to_string())),
        }
    }

    pub(crate) fn wrap(&self, key: &KeyBytes) -> Result<Vec<u8>, StoreError> {
        Ok(crypto::seal(&self.0, key)?)
    }

    pub(crate) fn unwrap_key(&self, wrapped: &[u8]) -> Result<KeyBytes, StoreError> {
        let raw = crypto::open(&self.0, wrapped)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| StoreError::Crypto(format!("wrapped key has {} bytes", raw.len())))
    }
}

fn decode_key(encoded: &str) -> Result<KeyBytes, StoreError> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Crypto(format!("master key is not base64: {}", e)))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| StoreError::Crypto(format!("master key must be {} bytes, got {}", KEY_SIZE, raw.len())))
}

/// Lifecycle of a data key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Active,
    Grace,
    Retired,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Active => "active",
            KeyState::Grace => "grace",
            KeyState::Retired => "retired",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "active" => Ok(KeyState::Active),
            "grace" => Ok(KeyState::Grace),
            "retired" => Ok(KeyState::Retired),
            other => Err(StoreError::Crypto(format!("unknown key state: {}", other))),
        }
    }
}

/// Public view of a data key, never exposes material
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub id: i64,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

struct DataKey {
    info: KeyInfo,
    material: Option<KeyBytes>,
}

/// In-memory view of `encryption_keys`, reloaded after every rotation
pub(crate) struct KeyRing {
    keys: BTreeMap<i64, DataKey>,
}

impl KeyRing {
    /// Load every key, creating the first active key on a fresh database
    pub fn load(conn: &Connection, master: &MasterKey) -> Result<Self, StoreError> {
        let has_active: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM encryption_keys WHERE state = 'active')",
            [],
            |row| row.get(0),
        )?;
        if !has_active {
            Self::insert_active(conn, master)?;
            info!("Initialized first data encryption key");
        }

        let mut stmt =
            conn.prepare("SELECT id, wrapped_key, state, created_at, retired_at FROM encryption_keys")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<Vec<u8>>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;

        let mut keys = BTreeMap::new();
        for row in rows {
            let (id, wrapped, state, created_at, retired_at) = row?;
            let state = KeyState::parse(&state)?;
            let material = match (state, wrapped) {
                (KeyState::Retired, _) | (_, None) => None,
                (_, Some(wrapped)) => Some(master.unwrap_key(&wrapped)?),
            };
            keys.insert(
                id,
                DataKey {
                    info: KeyInfo {
                        id,
                        state,
                        created_at: from_millis(created_at),
                        retired_at: retired_at.map(from_millis),
                    },
                    material,
                },
            );
        }
        debug!("Loaded {} data keys", keys.len());
        Ok(Self { keys })
    }

    /// Insert a new active key. Callers demote the previous one in the same transaction.
    pub fn insert_active(conn: &Connection, master: &MasterKey) -> Result<i64, StoreError> {
        let wrapped = master.wrap(&crypto::generate_key())?;
        conn.execute(
            "INSERT INTO encryption_keys (wrapped_key, state, created_at) VALUES (?1, 'active', ?2)",
            params![wrapped, Utc::now().timestamp_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn active(&self) -> Result<(i64, &KeyBytes), StoreError> {
        self.keys
            .values()
            .filter(|k| k.info.state == KeyState::Active)
            .find_map(|k| k.material.as_ref().map(|m| (k.info.id, m)))
            .ok_or_else(|| StoreError::Crypto("no active data key".to_string()))
    }

    pub fn material(&self, id: i64) -> Result<&KeyBytes, StoreError> {
        self.keys
            .get(&id)
            .and_then(|k| k.material.as_ref())
            .ok_or_else(|| StoreError::Crypto(format!("data key {} is not available", id)))
    }

    pub fn grace_ids(&self) -> Vec<i64> {
        self.keys
            .values()
            .filter(|k| k.info.state == KeyState::Grace)
            .map(|k| k.info.id)
            .collect()
    }

    pub fn info(&self) -> Vec<KeyInfo> {
        self.keys.values().map(|k| k.info.clone()).collect()
    }
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_master_key_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = MasterKeySource::File { path: dir.path().join("keys").join("master.key") };

        let (first, created) = MasterKey::load_or_create(&source).unwrap();
        assert!(created);
        let (second, created) = MasterKey::load_or_create(&source).unwrap();
        assert!(!created);
        assert_eq!(first.0, second.0);
    }

    #[cfg(unix)]
    #[test]
    fn test_master_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        MasterKey::load_or_create(&MasterKeySource::File { path: path.clone() }).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_garbage_master_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        std::fs::write(&path, "not a key").unwrap();
        assert!(MasterKey::load_or_create(&MasterKeySource::File { path }).is_err());
    }

    #[test]
    fn test_wrap_roundtrip() {
        let master = MasterKey::from_bytes(crypto::generate_key());
        let key = crypto::generate_key();
        let wrapped = master.wrap(&key).unwrap();
        assert_eq!(master.unwrap_key(&wrapped).unwrap(), key);
    }
}
