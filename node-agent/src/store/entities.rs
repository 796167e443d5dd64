//! Keyed documents: module records, the device credential, the config singleton
//!
//! Entities follow the same seal + checksum discipline as queued records.
//! A corrupt entity is quarantined and the load fails with `Integrity`.

use super::crypto::{self, KeyBytes};
use super::keys::KeyRing;
use super::{unseal, SecureDataStore, StoreError};
use crate::records::{Category, Priority};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Entity families stored in the `entities` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Module,
    Credential,
    Config,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Module => "module",
            EntityKind::Credential => "credential",
            EntityKind::Config => "config",
        }
    }
}

const CONFIG_NAME: &str = "runtime";

/// Versioned key/value configuration singleton
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub version: u64,
    pub values: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
    pub source: String,
}

struct RawEntity {
    kind: String,
    name: String,
    key_id: i64,
    payload: Vec<u8>,
    checksum: String,
}

impl SecureDataStore {
    pub fn save_entity<T: Serialize>(&self, kind: EntityKind, name: &str, value: &T) -> Result<(), StoreError> {
        let plain = serde_json::to_vec(value)?;
        let conn = self.writer.lock();
        let keys = self.keys.read();
        Self::write_entity(&conn, &keys, kind, name, &plain)
    }

    pub(super) fn write_entity(
        conn: &Connection,
        keys: &KeyRing,
        kind: EntityKind,
        name: &str,
        plain: &[u8],
    ) -> Result<(), StoreError> {
        let (key_id, key) = keys.active()?;
        let sealed = crypto::seal(key, plain)?;
        let checksum = crypto::checksum(&sealed);
        conn.execute(
            "INSERT INTO entities (kind, name, version, key_id, payload, checksum, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6)
             ON CONFLICT(kind, name) DO UPDATE SET
                version = version + 1, key_id = excluded.key_id, payload = excluded.payload,
                checksum = excluded.checksum, updated_at = excluded.updated_at",
            params![kind.as_str(), name, key_id, sealed, checksum, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Load one entity. `Ok(None)` when absent.
    pub fn load_entity<T: DeserializeOwned>(&self, kind: EntityKind, name: &str) -> Result<Option<T>, StoreError> {
        let (raw, opened) = {
            let keys = self.keys.read();
            let raw = {
                let conn = self.reader.lock();
                Self::fetch_raw_entity(&conn, kind, name)?
            };
            let Some(raw) = raw else { return Ok(None) };
            let opened = unseal(&keys, raw.key_id, &raw.payload, &raw.checksum);
            (raw, opened)
        };
        match opened {
            Ok(plain) => Ok(Some(serde_json::from_slice(&plain)?)),
            Err(reason) => {
                self.quarantine_entities(vec![(raw, reason.clone())])?;
                Err(StoreError::Integrity(format!("{} entity {}: {}", kind.as_str(), name, reason)))
            }
        }
    }

    /// Read and decode an entity on the writer connection, for read-modify-write
    pub(super) fn read_entity_locked<T: DeserializeOwned>(
        conn: &Connection,
        keys: &KeyRing,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<T>, StoreError> {
        let Some(raw) = Self::fetch_raw_entity(conn, kind, name)? else {
            return Ok(None);
        };
        let plain = unseal(keys, raw.key_id, &raw.payload, &raw.checksum)
            .map_err(|reason| StoreError::Integrity(format!("{} entity {}: {}", kind.as_str(), name, reason)))?;
        Ok(Some(serde_json::from_slice(&plain)?))
    }

    fn fetch_raw_entity(conn: &Connection, kind: EntityKind, name: &str) -> Result<Option<RawEntity>, StoreError> {
        Ok(conn
            .query_row(
                "SELECT kind, name, key_id, payload, checksum FROM entities WHERE kind = ?1 AND name = ?2",
                params![kind.as_str(), name],
                raw_entity,
            )
            .optional()?)
    }

    /// All entities of a kind; corrupt ones are quarantined and skipped
    pub fn list_entities<T: DeserializeOwned>(&self, kind: EntityKind) -> Result<Vec<T>, StoreError> {
        let mut values = Vec::new();
        let mut bad = Vec::new();
        {
            let keys = self.keys.read();
            let rows: Vec<RawEntity> = {
                let conn = self.reader.lock();
                let mut stmt = conn.prepare(
                    "SELECT kind, name, key_id, payload, checksum FROM entities WHERE kind = ?1 ORDER BY name",
                )?;
                let rows = stmt.query_map([kind.as_str()], raw_entity)?;
                rows.collect::<Result<_, _>>()?
            };
            for raw in rows {
                match unseal(&keys, raw.key_id, &raw.payload, &raw.checksum) {
                    Ok(plain) => match serde_json::from_slice(&plain) {
                        Ok(value) => values.push(value),
                        Err(e) => bad.push((raw, format!("undecodable payload: {}", e))),
                    },
                    Err(reason) => bad.push((raw, reason)),
                }
            }
        }
        self.quarantine_entities(bad)?;
        Ok(values)
    }

    pub fn delete_entity(&self, kind: EntityKind, name: &str) -> Result<bool, StoreError> {
        let conn = self.writer.lock();
        let deleted = conn.execute(
            "DELETE FROM entities WHERE kind = ?1 AND name = ?2",
            params![kind.as_str(), name],
        )?;
        Ok(deleted > 0)
    }

    /// Quarantine entities that are unchanged since they were read
    fn quarantine_entities(&self, bad: Vec<(RawEntity, String)>) -> Result<usize, StoreError> {
        if bad.is_empty() {
            return Ok(0);
        }
        let mut moved = Vec::with_capacity(bad.len());
        {
            let mut conn = self.writer.lock();
            let tx = conn.transaction()?;
            for (raw, reason) in bad {
                let deleted = tx.execute(
                    "DELETE FROM entities WHERE kind = ?1 AND name = ?2 AND checksum = ?3",
                    params![raw.kind, raw.name, raw.checksum],
                )?;
                if deleted == 0 {
                    continue;
                }
                Self::quarantine_in_tx(
                    &tx,
                    "entity",
                    &format!("{}/{}", raw.kind, raw.name),
                    &raw.kind,
                    Some(&raw.payload),
                    Some(&raw.checksum),
                    &reason,
                )?;
                moved.push((raw, reason));
            }
            tx.commit()?;
        }
        for (raw, reason) in &moved {
            warn!("Quarantined {} entity {}: {}", raw.kind, raw.name, reason);
            self.raise_quarantine_log(&raw.kind, &raw.name, reason);
        }
        Ok(moved.len())
    }

    /// Integrity pass over all entities: (valid, quarantined)
    pub(super) fn verify_entities(&self) -> Result<(usize, usize), StoreError> {
        let mut valid = 0;
        let mut bad = Vec::new();
        {
            let keys = self.keys.read();
            let rows: Vec<RawEntity> = {
                let conn = self.reader.lock();
                let mut stmt = conn.prepare("SELECT kind, name, key_id, payload, checksum FROM entities")?;
                let rows = stmt.query_map([], raw_entity)?;
                rows.collect::<Result<_, _>>()?
            };
            for raw in rows {
                match unseal(&keys, raw.key_id, &raw.payload, &raw.checksum) {
                    Ok(_) => valid += 1,
                    Err(reason) => bad.push((raw, reason)),
                }
            }
        }
        let quarantined = self.quarantine_entities(bad)?;
        Ok((valid, quarantined))
    }

    /// Re-seal entities under `grace_id` with the active key
    pub(super) fn reseal_entities_in_tx(
        tx: &Transaction<'_>,
        keys: &KeyRing,
        grace_id: i64,
        active_id: i64,
        active: &KeyBytes,
        quarantined: &mut Vec<(String, String, String)>,
    ) -> Result<usize, StoreError> {
        let rows: Vec<RawEntity> = {
            let mut stmt =
                tx.prepare("SELECT kind, name, key_id, payload, checksum FROM entities WHERE key_id = ?1")?;
            let rows = stmt.query_map([grace_id], raw_entity)?;
            rows.collect::<Result<_, _>>()?
        };

        let mut rewritten = 0;
        for raw in rows {
            match unseal(keys, raw.key_id, &raw.payload, &raw.checksum) {
                Ok(plain) => {
                    let sealed = crypto::seal(active, &plain)?;
                    let checksum = crypto::checksum(&sealed);
                    tx.execute(
                        "UPDATE entities SET key_id = ?1, payload = ?2, checksum = ?3 WHERE kind = ?4 AND name = ?5",
                        params![active_id, sealed, checksum, raw.kind, raw.name],
                    )?;
                    rewritten += 1;
                }
                Err(reason) => {
                    let id = format!("{}/{}", raw.kind, raw.name);
                    Self::quarantine_in_tx(
                        tx,
                        "entity",
                        &id,
                        &raw.kind,
                        Some(&raw.payload),
                        Some(&raw.checksum),
                        &reason,
                    )?;
                    tx.execute(
                        "DELETE FROM entities WHERE kind = ?1 AND name = ?2",
                        params![raw.kind, raw.name],
                    )?;
                    quarantined.push((raw.kind, id, reason));
                }
            }
        }
        Ok(rewritten)
    }

    // ---------------------------------------------------------------
    // Config singleton
    // ---------------------------------------------------------------

    pub fn config_document(&self) -> Result<Option<ConfigDocument>, StoreError> {
        self.load_entity(EntityKind::Config, CONFIG_NAME)
    }

    /// Replace the config document. The prior version is preserved as a
    /// `config_backups` record in the same transaction.
    pub fn save_config_document(
        &self,
        values: BTreeMap<String, String>,
        source: &str,
    ) -> Result<ConfigDocument, StoreError> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let doc = {
            let keys = self.keys.read();
            let previous: Option<ConfigDocument> =
                Self::read_entity_locked(&tx, &keys, EntityKind::Config, CONFIG_NAME)?;

            let version = match &previous {
                Some(prev) => {
                    Self::insert_record(
                        &tx,
                        &keys,
                        Category::ConfigBackups,
                        Utc::now(),
                        Priority::High,
                        &serde_json::to_vec(prev)?,
                    )?;
                    prev.version + 1
                }
                None => 1,
            };

            let doc = ConfigDocument {
                version,
                values,
                updated_at: Utc::now(),
                source: source.to_string(),
            };
            Self::write_entity(&tx, &keys, EntityKind::Config, CONFIG_NAME, &serde_json::to_vec(&doc)?)?;
            doc
        };
        tx.commit()?;

        debug!("Saved config version {} from {}", doc.version, doc.source);
        Ok(doc)
    }

    /// Prior config versions, newest first
    pub fn config_history(&self, limit: usize) -> Result<Vec<ConfigDocument>, StoreError> {
        self.export(Category::ConfigBackups, None, limit)?
            .iter()
            .map(|record| record.json())
            .collect()
    }
}

fn raw_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntity> {
    Ok(RawEntity {
        kind: row.get(0)?,
        name: row.get(1)?,
        key_id: row.get(2)?,
        payload: row.get(3)?,
        checksum: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::test_store;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[test]
    fn test_entity_save_load_delete() {
        let (_dir, store) = test_store();
        let widget = Widget { name: "alpha".into(), count: 3 };
        store.save_entity(EntityKind::Module, "alpha", &widget).unwrap();

        let loaded: Option<Widget> = store.load_entity(EntityKind::Module, "alpha").unwrap();
        assert_eq!(loaded, Some(widget));
        assert!(store.delete_entity(EntityKind::Module, "alpha").unwrap());
        assert!(!store.delete_entity(EntityKind::Module, "alpha").unwrap());
        assert!(store.load_entity::<Widget>(EntityKind::Module, "alpha").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entity_is_quarantined() {
        let (_dir, store) = test_store();
        store.save_entity(EntityKind::Module, "a", &Widget { name: "a".into(), count: 1 }).unwrap();
        store.save_entity(EntityKind::Module, "b", &Widget { name: "b".into(), count: 2 }).unwrap();
        store
            .writer
            .lock()
            .execute("UPDATE entities SET checksum = '00' WHERE name = 'a'", [])
            .unwrap();

        let listed: Vec<Widget> = store.list_entities(EntityKind::Module).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "b");
        assert_eq!(store.stats().unwrap().quarantined, 1);
    }

    #[test]
    fn test_corrupt_entity_load_fails_with_integrity() {
        let (_dir, store) = test_store();
        store.save_entity(EntityKind::Module, "a", &Widget { name: "a".into(), count: 1 }).unwrap();
        store
            .writer
            .lock()
            .execute("UPDATE entities SET payload = x'0102' WHERE name = 'a'", [])
            .unwrap();

        let err = store.load_entity::<Widget>(EntityKind::Module, "a").unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[test]
    fn test_config_versions_keep_backups() {
        let (_dir, store) = test_store();
        assert!(store.config_document().unwrap().is_none());

        let mut values = BTreeMap::new();
        values.insert("log_level".to_string(), "info".to_string());
        let first = store.save_config_document(values.clone(), "defaults").unwrap();
        assert_eq!(first.version, 1);

        values.insert("log_level".to_string(), "debug".to_string());
        let second = store.save_config_document(values, "local-cli").unwrap();
        assert_eq!(second.version, 2);

        let current = store.config_document().unwrap().unwrap();
        assert_eq!(current.values["log_level"], "debug");

        let history = store.config_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].values["log_level"], "info");
    }

    #[test]
    fn test_verify_integrity_covers_entities() {
        let (_dir, store) = test_store();
        store.save_entity(EntityKind::Module, "a", &Widget { name: "a".into(), count: 1 }).unwrap();
        store
            .writer
            .lock()
            .execute("UPDATE entities SET checksum = 'x'", [])
            .unwrap();

        let report = store.verify_integrity().unwrap();
        assert_eq!(report.quarantined, 1);
        assert_eq!(report.by_category["entities"].quarantined, 1);
    }
}
