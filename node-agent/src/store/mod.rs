//! Secure Data Store
//!
//! Single authoritative persistence layer of the agent:
//! - AES-256-GCM encryption at rest with rotating data keys
//! - SHA-256 checksum over every sealed payload, quarantine on mismatch
//! - Durable FIFO outbound queue per record category, bounded while offline
//! - Retention-based cleanup and full integrity scans
//!
//! Writes go through one writer connection guarded by a mutex. Reads use a
//! second connection and observe the last committed snapshot (WAL mode).
//! Lock order is writer, then key ring, then reader. Nothing takes the
//! writer while holding the key ring. Reads hold the key ring across the
//! query and the verification so rows and keys come from the same state.

pub mod crypto;
mod credentials;
mod entities;
mod keys;
mod schema;

pub use credentials::{mask, token_digest, Credential};
pub use entities::{ConfigDocument, EntityKind};
pub use keys::{KeyInfo, KeyState, MasterKey, MasterKeySource};

use crate::error::{Classify, ErrorClass};
use crate::records::{Category, LogEntry, Priority};
use chrono::{DateTime, Utc};
use keys::{from_millis, KeyRing};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identifier assigned to a stored record
pub type RecordId = i64;

const SCAN_CHUNK: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage fault: {0}")]
    StorageFault(String),

    #[error("integrity check failed for {0}")]
    Integrity(String),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("a credential already exists for device {0}")]
    CredentialExists(String),

    #[error("device id mismatch: stored {stored}, offered {offered}")]
    DeviceMismatch { stored: String, offered: String },

    #[error("registration token already consumed")]
    TokenConsumed,

    #[error("no credential stored")]
    NoCredential,

    #[error("no session rotation in progress")]
    NoPendingRotation,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::StorageFault(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::StorageFault(e.to_string())
    }
}

impl From<crypto::CryptoError> for StoreError {
    fn from(e: crypto::CryptoError) -> Self {
        StoreError::Crypto(e.to_string())
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::StorageFault(_) | StoreError::Crypto(_) => ErrorClass::Fatal,
            StoreError::Integrity(_) => ErrorClass::Integrity,
            _ => ErrorClass::Validation,
        }
    }
}

/// A verified, decrypted record
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub category: Category,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub delivered: bool,
    pub payload: Vec<u8>,
}

impl StoredRecord {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Payload as JSON, or a base64 string when it is not JSON
    pub fn value(&self) -> serde_json::Value {
        use base64::{engine::general_purpose::STANDARD, Engine};
        serde_json::from_slice(&self.payload)
            .unwrap_or_else(|_| serde_json::Value::String(STANDARD.encode(&self.payload)))
    }
}

/// Retention windows and queue bound
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    pub days: BTreeMap<Category, u32>,
    pub max_pending: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            days: Category::ALL
                .iter()
                .map(|c| (*c, c.default_retention_days()))
                .collect(),
            max_pending: 10_000,
        }
    }
}

impl RetentionPolicy {
    pub fn window(&self, category: Category) -> Duration {
        let days = self
            .days
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_retention_days());
        Duration::from_secs(u64::from(days) * 86_400)
    }
}

/// Result of a full integrity scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub valid: usize,
    pub quarantined: usize,
    pub by_category: BTreeMap<String, CategoryIntegrity>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryIntegrity {
    pub valid: usize,
    pub quarantined: usize,
}

/// Per-category counts deleted by retention cleanup
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub deleted: BTreeMap<Category, usize>,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.deleted.values().sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStats {
    pub category: Category,
    pub total: usize,
    pub pending: usize,
    pub delivered: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Database-wide statistics for the operator CLI and health reports
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub path: PathBuf,
    pub file_size_bytes: u64,
    pub categories: Vec<CategoryStats>,
    pub quarantined: usize,
    pub entities: usize,
    pub keys: Vec<KeyInfo>,
}

impl StoreStats {
    pub fn pending(&self, category: Category) -> usize {
        self.categories
            .iter()
            .find(|c| c.category == category)
            .map(|c| c.pending)
            .unwrap_or(0)
    }
}

/// Encrypted row as read from disk
struct RawRecord {
    id: RecordId,
    category: String,
    seq: i64,
    timestamp_ms: i64,
    priority: i64,
    key_id: i64,
    payload: Vec<u8>,
    checksum: String,
    delivered: bool,
}

/// Where a scan chunk ended
struct RowPosition {
    id: RecordId,
    seq: i64,
}

/// Outcome of reading and verifying one chunk of rows
struct ScanChunk {
    read: usize,
    last: Option<RowPosition>,
    bad: Vec<(RawRecord, String)>,
}

const RECORD_COLUMNS: &str =
    "id, category, seq, timestamp_ms, priority, key_id, payload, checksum, delivered";

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        category: row.get(1)?,
        seq: row.get(2)?,
        timestamp_ms: row.get(3)?,
        priority: row.get(4)?,
        key_id: row.get(5)?,
        payload: row.get(6)?,
        checksum: row.get(7)?,
        delivered: row.get(8)?,
    })
}

/// Verify checksum then decrypt. The error string is the quarantine reason.
fn unseal(keys: &KeyRing, key_id: i64, payload: &[u8], checksum: &str) -> Result<Vec<u8>, String> {
    if crypto::checksum(payload) != checksum {
        return Err("checksum mismatch".to_string());
    }
    let key = keys.material(key_id).map_err(|e| e.to_string())?;
    crypto::open(key, payload).map_err(|e| e.to_string())
}

/// Encrypted-at-rest store backed by one SQLite file
pub struct SecureDataStore {
    path: PathBuf,
    master: MasterKey,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    keys: RwLock<KeyRing>,
    policy: RwLock<RetentionPolicy>,
}

impl SecureDataStore {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>, master: MasterKey) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Self::open_connection(&path)?;
        schema::migrate(&writer)?;
        let keys = KeyRing::load(&writer, &master)?;
        let reader = Self::open_connection(&path)?;

        info!("Opened data store at {}", path.display());
        Ok(Self {
            path,
            master,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            keys: RwLock::new(keys),
            policy: RwLock::new(RetentionPolicy::default()),
        })
    }

    fn open_connection(path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(path)?;
        // WAL lets the reader connection proceed while the writer commits
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reopen both connections and reload keys (controlled restart)
    pub fn recover(&self) -> Result<(), StoreError> {
        warn!("Reopening data store at {}", self.path.display());
        let writer = Self::open_connection(&self.path)?;
        schema::migrate(&writer)?;
        let keys = KeyRing::load(&writer, &self.master)?;
        let reader = Self::open_connection(&self.path)?;

        *self.writer.lock() = writer;
        *self.reader.lock() = reader;
        *self.keys.write() = keys;
        Ok(())
    }

    /// Cheap liveness probe of the write path
    pub fn health_check(&self) -> Result<(), StoreError> {
        let conn = self.writer.lock();
        conn.query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn set_retention(&self, policy: RetentionPolicy) {
        *self.policy.write() = policy;
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.policy.read().clone()
    }

    // ---------------------------------------------------------------
    // Outbound queue
    // ---------------------------------------------------------------

    /// Store a payload now with normal priority
    pub fn put(&self, category: Category, payload: &[u8]) -> Result<RecordId, StoreError> {
        self.put_at(category, Utc::now(), Priority::Normal, payload)
    }

    pub fn put_json<T: Serialize>(&self, category: Category, value: &T) -> Result<RecordId, StoreError> {
        self.put(category, &serde_json::to_vec(value)?)
    }

    /// Persist a log entry; its severity decides the drop priority
    pub fn log(&self, entry: &LogEntry) -> Result<RecordId, StoreError> {
        self.put_at(
            Category::Logs,
            entry.timestamp,
            entry.severity.priority(),
            &serde_json::to_vec(entry)?,
        )
    }

    /// Store a payload with an explicit timestamp and priority
    pub fn put_at(
        &self,
        category: Category,
        timestamp: DateTime<Utc>,
        priority: Priority,
        payload: &[u8],
    ) -> Result<RecordId, StoreError> {
        let max_pending = self.policy.read().max_pending;

        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let id = {
            let keys = self.keys.read();
            Self::insert_record(&tx, &keys, category, timestamp, priority, payload)?
        };
        let dropped = Self::enforce_bound(&tx, category, max_pending, id)?;
        tx.commit()?;

        if dropped > 0 {
            debug!("Queue bound reached for {}: dropped {} oldest records", category, dropped);
        }
        Ok(id)
    }

    fn insert_record(
        tx: &Transaction<'_>,
        keys: &KeyRing,
        category: Category,
        timestamp: DateTime<Utc>,
        priority: Priority,
        payload: &[u8],
    ) -> Result<RecordId, StoreError> {
        let (key_id, key) = keys.active()?;
        let sealed = crypto::seal(key, payload)?;
        let checksum = crypto::checksum(&sealed);

        let seq: i64 = tx
            .query_row(
                "SELECT next_seq FROM category_sequences WHERE category = ?1",
                [category.as_str()],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(1),
                other => Err(other),
            })?;
        tx.execute(
            "INSERT INTO category_sequences (category, next_seq) VALUES (?1, ?2)
             ON CONFLICT(category) DO UPDATE SET next_seq = excluded.next_seq",
            params![category.as_str(), seq + 1],
        )?;

        tx.execute(
            "INSERT INTO records (category, seq, timestamp_ms, priority, key_id, payload, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                category.as_str(),
                seq,
                timestamp.timestamp_millis(),
                priority as i64,
                key_id,
                sealed,
                checksum
            ],
        )?;
        Ok(tx.last_insert_rowid())
    }

    /// Drop undelivered records beyond the bound, lowest priority then oldest
    /// first. The record just written (`keep`) is never the one dropped.
    fn enforce_bound(
        tx: &Transaction<'_>,
        category: Category,
        max_pending: usize,
        keep: RecordId,
    ) -> Result<usize, StoreError> {
        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM records WHERE category = ?1 AND delivered = 0",
            [category.as_str()],
            |row| row.get(0),
        )?;
        let overflow = pending - max_pending as i64;
        if overflow <= 0 {
            return Ok(0);
        }

        let dropped = tx.execute(
            "DELETE FROM records WHERE id IN (
                SELECT id FROM records WHERE category = ?1 AND delivered = 0 AND id != ?3
                ORDER BY priority ASC, seq ASC LIMIT ?2
            )",
            params![category.as_str(), overflow, keep],
        )?;
        Ok(dropped)
    }

    /// Up to `limit` undelivered records in ascending sequence order.
    /// Records failing verification are quarantined and skipped.
    pub fn fetch_pending(&self, category: Category, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let mut verified = Vec::new();
        let mut after_seq = 0i64;

        while verified.len() < limit {
            let wanted = limit - verified.len();
            let chunk = self.scan(
                &format!(
                    "SELECT {} FROM records WHERE category = ?1 AND delivered = 0 AND seq > ?2
                     ORDER BY seq ASC LIMIT ?3",
                    RECORD_COLUMNS
                ),
                params![category.as_str(), after_seq, wanted as i64],
                |record| verified.push(record),
            )?;
            let Some(last) = chunk.last else { break };
            after_seq = last.seq;
            self.quarantine_records(chunk.bad)?;

            if chunk.read < wanted {
                break;
            }
        }
        Ok(verified)
    }

    /// Read rows and verify them against the same key ring snapshot.
    /// The ring stays locked across the read so a key retirement cannot
    /// commit rewritten rows and drop the old key in between.
    fn scan(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        accept: impl FnMut(StoredRecord),
    ) -> Result<ScanChunk, StoreError> {
        let keys = self.keys.read();
        let rows: Vec<RawRecord> = {
            let conn = self.reader.lock();
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, raw_record)?;
            rows.collect::<Result<_, _>>()?
        };
        let read = rows.len();
        let last = rows.last().map(|row| RowPosition { id: row.id, seq: row.seq });
        let bad = Self::verify_rows(&keys, rows, accept);
        Ok(ScanChunk { read, last, bad })
    }

    /// Split rows into verified records (passed to `accept`) and failures
    fn verify_rows(
        keys: &KeyRing,
        rows: Vec<RawRecord>,
        mut accept: impl FnMut(StoredRecord),
    ) -> Vec<(RawRecord, String)> {
        let mut bad = Vec::new();
        for row in rows {
            let category = match row.category.parse::<Category>() {
                Ok(category) => category,
                Err(e) => {
                    bad.push((row, e));
                    continue;
                }
            };
            match unseal(keys, row.key_id, &row.payload, &row.checksum) {
                Ok(payload) => accept(StoredRecord {
                    id: row.id,
                    category,
                    seq: row.seq,
                    timestamp: from_millis(row.timestamp_ms),
                    priority: Priority::from_i64(row.priority),
                    delivered: row.delivered,
                    payload,
                }),
                Err(reason) => bad.push((row, reason)),
            }
        }
        bad
    }

    /// Move failed rows into quarantine and raise a log entry for each.
    /// A row rewritten since it was read (new checksum) or already gone is
    /// left alone. Returns the rows actually quarantined.
    fn quarantine_records(&self, bad: Vec<(RawRecord, String)>) -> Result<Vec<(RawRecord, String)>, StoreError> {
        if bad.is_empty() {
            return Ok(bad);
        }
        let mut moved = Vec::with_capacity(bad.len());
        {
            let mut conn = self.writer.lock();
            let tx = conn.transaction()?;
            for (row, reason) in bad {
                let deleted = tx.execute(
                    "DELETE FROM records WHERE id = ?1 AND checksum = ?2",
                    params![row.id, row.checksum],
                )?;
                if deleted == 0 {
                    debug!("Record {} changed since it was read, not quarantined", row.id);
                    continue;
                }
                Self::quarantine_in_tx(
                    &tx,
                    "record",
                    &row.id.to_string(),
                    &row.category,
                    Some(&row.payload),
                    Some(&row.checksum),
                    &reason,
                )?;
                moved.push((row, reason));
            }
            tx.commit()?;
        }

        for (row, reason) in &moved {
            warn!("Quarantined {} record {} (seq {}): {}", row.category, row.id, row.seq, reason);
            self.raise_quarantine_log(&row.category, &row.id.to_string(), reason);
        }
        Ok(moved)
    }

    fn quarantine_in_tx(
        tx: &Transaction<'_>,
        origin: &str,
        original_id: &str,
        category: &str,
        payload: Option<&[u8]>,
        checksum: Option<&str>,
        reason: &str,
    ) -> Result<(), StoreError> {
        tx.execute(
            "INSERT INTO quarantine (origin, original_id, category, payload, checksum, reason, quarantined_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![origin, original_id, category, payload, checksum, reason, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn raise_quarantine_log(&self, category: &str, id: &str, reason: &str) {
        let entry = LogEntry::error("data_store", format!("Quarantined {} {}: {}", category, id, reason))
            .with_context(serde_json::json!({ "category": category, "id": id, "reason": reason }));
        if let Err(e) = self.log(&entry) {
            warn!("Failed to persist quarantine log entry: {}", e);
        }
    }

    /// Mark records delivered. Unknown or already delivered ids are ignored.
    pub fn mark_delivered(&self, ids: &[RecordId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().timestamp_millis();
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE records SET delivered = 1, delivered_at = ?1 WHERE id = ?2 AND delivered = 0",
            )?;
            for id in ids {
                updated += stmt.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    pub fn pending_count(&self, category: Category) -> Result<usize, StoreError> {
        let conn = self.reader.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE category = ?1 AND delivered = 0",
            [category.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ---------------------------------------------------------------
    // Retention
    // ---------------------------------------------------------------

    fn cutoff(older_than: Duration) -> i64 {
        let age = chrono::Duration::from_std(older_than)
            .unwrap_or_else(|_| chrono::Duration::days(365_000));
        Utc::now()
            .checked_sub_signed(age)
            .map(|t| t.timestamp_millis())
            .unwrap_or(i64::MIN)
    }

    /// Delete records of `category` older than `older_than`
    pub fn cleanup(&self, older_than: Duration, category: Category) -> Result<usize, StoreError> {
        let conn = self.writer.lock();
        let deleted = conn.execute(
            "DELETE FROM records WHERE category = ?1 AND timestamp_ms < ?2",
            params![category.as_str(), Self::cutoff(older_than)],
        )?;
        if deleted > 0 {
            debug!("Cleanup removed {} {} records", deleted, category);
        }
        Ok(deleted)
    }

    /// Number of records `cleanup` would delete
    pub fn count_older_than(&self, older_than: Duration, category: Category) -> Result<usize, StoreError> {
        let conn = self.reader.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE category = ?1 AND timestamp_ms < ?2",
            params![category.as_str(), Self::cutoff(older_than)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Apply every category's configured retention window
    pub fn cleanup_expired(&self) -> Result<CleanupReport, StoreError> {
        let policy = self.retention();
        let mut report = CleanupReport::default();
        for category in Category::ALL {
            let deleted = self.cleanup(policy.window(category), category)?;
            report.deleted.insert(category, deleted);
        }
        info!("Retention cleanup removed {} records", report.total());
        Ok(report)
    }

    // ---------------------------------------------------------------
    // Integrity and keys
    // ---------------------------------------------------------------

    /// Recompute every checksum. Individual failures are quarantined and
    /// counted; only a storage fault aborts the scan.
    pub fn verify_integrity(&self) -> Result<IntegrityReport, StoreError> {
        let mut report = IntegrityReport::default();
        let mut after_id = 0i64;

        loop {
            let chunk = self.scan(
                &format!("SELECT {} FROM records WHERE id > ?1 ORDER BY id ASC LIMIT ?2", RECORD_COLUMNS),
                params![after_id, SCAN_CHUNK as i64],
                |record| {
                    report.valid += 1;
                    report
                        .by_category
                        .entry(record.category.to_string())
                        .or_default()
                        .valid += 1;
                },
            )?;
            let Some(last) = chunk.last else { break };
            after_id = last.id;

            let moved = self.quarantine_records(chunk.bad)?;
            for (row, _) in &moved {
                report.by_category.entry(row.category.clone()).or_default().quarantined += 1;
            }
            report.quarantined += moved.len();

            if chunk.read < SCAN_CHUNK {
                break;
            }
        }

        let (valid, quarantined) = self.verify_entities()?;
        report.valid += valid;
        report.quarantined += quarantined;
        if valid + quarantined > 0 {
            let entry = report.by_category.entry("entities".to_string()).or_default();
            entry.valid += valid;
            entry.quarantined += quarantined;
        }

        info!(
            "Integrity scan complete: {} valid, {} quarantined",
            report.valid, report.quarantined
        );
        Ok(report)
    }

    /// Generate a new active key; the previous one enters grace state
    pub fn rotate_key(&self) -> Result<i64, StoreError> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        tx.execute("UPDATE encryption_keys SET state = 'grace' WHERE state = 'active'", [])?;
        let new_id = KeyRing::insert_active(&tx, &self.master)?;
        tx.commit()?;

        *self.keys.write() = KeyRing::load(&conn, &self.master)?;
        info!("Rotated data encryption key (active key {})", new_id);
        Ok(new_id)
    }

    /// Re-seal everything still under a grace key, then discard grace keys.
    /// Returns the number of rows rewritten.
    pub fn retire_grace_keys(&self) -> Result<usize, StoreError> {
        let mut conn = self.writer.lock();
        let grace = self.keys.read().grace_ids();
        if grace.is_empty() {
            return Ok(0);
        }

        let tx = conn.transaction()?;
        let mut rewritten = 0;
        let mut quarantined = Vec::new();
        {
            let keys = self.keys.read();
            let (active_id, active) = keys.active()?;

            for key_id in &grace {
                let rows: Vec<(i64, String, Vec<u8>, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, category, payload, checksum FROM records WHERE key_id = ?1",
                    )?;
                    let rows = stmt.query_map([key_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?;
                    rows.collect::<Result<_, _>>()?
                };
                for (id, category, payload, checksum) in rows {
                    match unseal(&keys, *key_id, &payload, &checksum) {
                        Ok(plain) => {
                            let sealed = crypto::seal(active, &plain)?;
                            let checksum = crypto::checksum(&sealed);
                            tx.execute(
                                "UPDATE records SET key_id = ?1, payload = ?2, checksum = ?3 WHERE id = ?4",
                                params![active_id, sealed, checksum, id],
                            )?;
                            rewritten += 1;
                        }
                        Err(reason) => {
                            Self::quarantine_in_tx(
                                &tx,
                                "record",
                                &id.to_string(),
                                &category,
                                Some(&payload),
                                Some(&checksum),
                                &reason,
                            )?;
                            tx.execute("DELETE FROM records WHERE id = ?1", [id])?;
                            quarantined.push((category, id.to_string(), reason));
                        }
                    }
                }
                rewritten += Self::reseal_entities_in_tx(&tx, &keys, *key_id, active_id, active, &mut quarantined)?;
            }
        }

        tx.execute(
            "UPDATE encryption_keys SET state = 'retired', wrapped_key = NULL, retired_at = ?1
             WHERE state = 'grace'",
            [Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;
        *self.keys.write() = KeyRing::load(&conn, &self.master)?;
        drop(conn);

        for (category, id, reason) in &quarantined {
            self.raise_quarantine_log(category, id, reason);
        }
        info!("Retired {} grace keys after rewriting {} rows", grace.len(), rewritten);
        Ok(rewritten)
    }

    pub fn key_info(&self) -> Vec<KeyInfo> {
        self.keys.read().info()
    }

    // ---------------------------------------------------------------
    // Export and statistics
    // ---------------------------------------------------------------

    /// Verified records of a category, newest first, regardless of delivery state
    pub fn export(
        &self,
        category: Category,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let since_ms = since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let mut records = Vec::new();
        let chunk = self.scan(
            &format!(
                "SELECT {} FROM records WHERE category = ?1 AND timestamp_ms >= ?2
                 ORDER BY seq DESC LIMIT ?3",
                RECORD_COLUMNS
            ),
            params![category.as_str(), since_ms, limit as i64],
            |record| records.push(record),
        )?;
        self.quarantine_records(chunk.bad)?;
        Ok(records)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.reader.lock();
        let mut categories = Vec::new();
        for category in Category::ALL {
            let (total, pending, oldest, newest): (i64, i64, Option<i64>, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(delivered = 0), 0), MIN(timestamp_ms), MAX(timestamp_ms)
                 FROM records WHERE category = ?1",
                [category.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
            categories.push(CategoryStats {
                category,
                total: total as usize,
                pending: pending as usize,
                delivered: (total - pending) as usize,
                oldest: oldest.map(from_millis),
                newest: newest.map(from_millis),
            });
        }
        let quarantined: i64 = conn.query_row("SELECT COUNT(*) FROM quarantine", [], |row| row.get(0))?;
        let entities: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        drop(conn);

        let file_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(StoreStats {
            path: self.path.clone(),
            file_size_bytes,
            categories,
            quarantined: quarantined as usize,
            entities: entities as usize,
            keys: self.key_info(),
        })
    }

    /// Checkpoint the WAL so every committed write lands in the main file
    pub fn flush(&self) -> Result<(), StoreError> {
        let conn = self.writer.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        debug!("Flushed data store WAL");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::records::{MetricCategory, MetricSample, Severity};
    use tempfile::TempDir;

    pub(crate) fn test_store() -> (TempDir, SecureDataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SecureDataStore::open(
            dir.path().join("agent.db"),
            MasterKey::from_bytes(crypto::generate_key()),
        )
        .unwrap();
        (dir, store)
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(days)
    }

    #[test]
    fn test_put_then_fetch_is_byte_identical() {
        let (_dir, store) = test_store();
        let payloads: Vec<&[u8]> = vec![b"{\"cpu\":12.5}", b"\x00\x01binary\xff", b""];
        for payload in &payloads {
            store.put(Category::Metrics, payload).unwrap();
        }

        let fetched = store.fetch_pending(Category::Metrics, 10).unwrap();
        assert_eq!(fetched.len(), 3);
        for (record, expected) in fetched.iter().zip(&payloads) {
            assert_eq!(record.payload.as_slice(), *expected);
        }
        assert_eq!(store.verify_integrity().unwrap().quarantined, 0);
    }

    #[test]
    fn test_sequences_are_per_category_and_fifo() {
        let (_dir, store) = test_store();
        store.put(Category::Metrics, b"m1").unwrap();
        store.put(Category::Logs, b"l1").unwrap();
        store.put(Category::Metrics, b"m2").unwrap();
        store.put(Category::Metrics, b"m3").unwrap();

        let metrics = store.fetch_pending(Category::Metrics, 10).unwrap();
        let seqs: Vec<i64> = metrics.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(metrics[0].payload, b"m1");
        assert_eq!(store.fetch_pending(Category::Logs, 10).unwrap()[0].seq, 1);
    }

    #[test]
    fn test_sequence_numbers_never_reused() {
        let (_dir, store) = test_store();
        let first = store.put_at(Category::Metrics, days_ago(2), Priority::Normal, b"a").unwrap();
        store.mark_delivered(&[first]).unwrap();
        assert_eq!(store.cleanup(Duration::from_secs(86_400), Category::Metrics).unwrap(), 1);
        store.put(Category::Metrics, b"b").unwrap();

        let pending = store.fetch_pending(Category::Metrics, 10).unwrap();
        assert_eq!(pending[0].seq, 2);
    }

    #[test]
    fn test_fetch_respects_limit() {
        let (_dir, store) = test_store();
        for i in 0..5 {
            store.put(Category::Logs, format!("entry-{}", i).as_bytes()).unwrap();
        }
        let batch = store.fetch_pending(Category::Logs, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].payload, b"entry-1");
    }

    #[test]
    fn test_mark_delivered_is_idempotent() {
        let (_dir, store) = test_store();
        let id = store.put(Category::Metrics, b"x").unwrap();

        assert_eq!(store.mark_delivered(&[id]).unwrap(), 1);
        assert_eq!(store.mark_delivered(&[id]).unwrap(), 0);
        assert_eq!(store.mark_delivered(&[9_999]).unwrap(), 0);
        assert!(store.fetch_pending(Category::Metrics, 10).unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_checksum_is_quarantined_on_fetch() {
        let (_dir, store) = test_store();
        let good = store.put(Category::Metrics, b"good").unwrap();
        let bad = store.put(Category::Metrics, b"bad").unwrap();
        store
            .writer
            .lock()
            .execute("UPDATE records SET checksum = 'deadbeef' WHERE id = ?1", [bad])
            .unwrap();

        let fetched = store.fetch_pending(Category::Metrics, 10).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, good);

        let stats = store.stats().unwrap();
        assert_eq!(stats.quarantined, 1);

        let logs = store.fetch_pending(Category::Logs, 10).unwrap();
        let entry: LogEntry = logs[0].json().unwrap();
        assert_eq!(entry.severity, Severity::Error);
        assert!(entry.message.contains("Quarantined"));
    }

    #[test]
    fn test_fetch_fills_limit_past_quarantined_rows() {
        let (_dir, store) = test_store();
        let ids: Vec<RecordId> = (0..4)
            .map(|i| store.put(Category::Metrics, &[i]).unwrap())
            .collect();
        store
            .writer
            .lock()
            .execute("UPDATE records SET payload = x'00' WHERE id = ?1", [ids[0]])
            .unwrap();

        let fetched = store.fetch_pending(Category::Metrics, 3).unwrap();
        let got: Vec<RecordId> = fetched.iter().map(|r| r.id).collect();
        assert_eq!(got, ids[1..].to_vec());
    }

    #[test]
    fn test_verify_integrity_survives_corrupt_records() {
        let (_dir, store) = test_store();
        let mut ids = Vec::new();
        for i in 0..10u8 {
            ids.push(store.put(Category::Metrics, &[i]).unwrap());
        }
        {
            let conn = store.writer.lock();
            conn.execute("UPDATE records SET checksum = 'bad' WHERE id = ?1", [ids[2]]).unwrap();
            conn.execute("UPDATE records SET checksum = 'bad' WHERE id = ?1", [ids[7]]).unwrap();
        }

        let report = store.verify_integrity().unwrap();
        assert_eq!(report.quarantined, 2);
        // the two quarantine log entries are written after the scan snapshot
        assert_eq!(report.by_category["metrics"].valid, 8);
        assert_eq!(report.by_category["metrics"].quarantined, 2);

        let second = store.verify_integrity().unwrap();
        assert_eq!(second.quarantined, 0);
    }

    #[test]
    fn test_cleanup_keeps_records_inside_window() {
        let (_dir, store) = test_store();
        store.put_at(Category::Metrics, days_ago(45), Priority::Normal, b"t-45").unwrap();
        store.put_at(Category::Metrics, days_ago(20), Priority::Normal, b"t-20").unwrap();
        store.put_at(Category::Metrics, days_ago(1), Priority::Normal, b"t-1").unwrap();

        let thirty_days = Duration::from_secs(30 * 86_400);
        assert_eq!(store.count_older_than(thirty_days, Category::Metrics).unwrap(), 1);
        assert_eq!(store.cleanup(thirty_days, Category::Metrics).unwrap(), 1);

        let left: Vec<Vec<u8>> = store
            .fetch_pending(Category::Metrics, 10)
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect();
        assert_eq!(left, vec![b"t-20".to_vec(), b"t-1".to_vec()]);
    }

    #[test]
    fn test_cleanup_expired_uses_per_category_windows() {
        let (_dir, store) = test_store();
        store.put_at(Category::Logs, days_ago(10), Priority::Normal, b"old log").unwrap();
        store.put_at(Category::Metrics, days_ago(10), Priority::Normal, b"recent metric").unwrap();

        let report = store.cleanup_expired().unwrap();
        assert_eq!(report.deleted[&Category::Logs], 1);
        assert_eq!(report.deleted[&Category::Metrics], 0);
    }

    #[test]
    fn test_queue_bound_drops_oldest_pending() {
        let (_dir, store) = test_store();
        store.set_retention(RetentionPolicy { max_pending: 10, ..RetentionPolicy::default() });

        for i in 1..=25 {
            store.put(Category::Metrics, format!("{}", i).as_bytes()).unwrap();
            assert!(store.pending_count(Category::Metrics).unwrap() <= 10);
        }

        let pending = store.fetch_pending(Category::Metrics, 100).unwrap();
        let seqs: Vec<i64> = pending.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (16..=25).collect::<Vec<_>>());
    }

    #[test]
    fn test_queue_bound_drops_low_priority_first() {
        let (_dir, store) = test_store();
        store.set_retention(RetentionPolicy { max_pending: 2, ..RetentionPolicy::default() });

        store.log(&LogEntry::error("test", "important")).unwrap();
        store.log(&LogEntry::new(Severity::Debug, "test", "chatter")).unwrap();
        store.log(&LogEntry::warn("test", "notable")).unwrap();

        let kept: Vec<String> = store
            .fetch_pending(Category::Logs, 10)
            .unwrap()
            .iter()
            .map(|r| r.json::<LogEntry>().unwrap().message)
            .collect();
        assert_eq!(kept, vec!["important".to_string(), "notable".to_string()]);
    }

    #[test]
    fn test_queue_bound_keeps_the_record_just_written() {
        let (_dir, store) = test_store();
        store.set_retention(RetentionPolicy { max_pending: 2, ..RetentionPolicy::default() });

        store.log(&LogEntry::error("test", "first")).unwrap();
        store.log(&LogEntry::error("test", "second")).unwrap();
        let chatter = store.log(&LogEntry::new(Severity::Debug, "test", "chatter")).unwrap();

        let pending = store.fetch_pending(Category::Logs, 10).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().any(|r| r.id == chatter));
        assert_eq!(pending[0].json::<LogEntry>().unwrap().message, "second");
    }

    #[test]
    fn test_delivered_records_do_not_count_against_bound() {
        let (_dir, store) = test_store();
        store.set_retention(RetentionPolicy { max_pending: 2, ..RetentionPolicy::default() });

        let a = store.put(Category::Metrics, b"a").unwrap();
        let b = store.put(Category::Metrics, b"b").unwrap();
        store.mark_delivered(&[a, b]).unwrap();
        store.put(Category::Metrics, b"c").unwrap();
        store.put(Category::Metrics, b"d").unwrap();

        assert_eq!(store.stats().unwrap().categories[0].total, 4);
    }

    #[test]
    fn test_rotate_key_keeps_old_records_readable() {
        let (_dir, store) = test_store();
        let before = store.put(Category::Metrics, b"before rotation").unwrap();
        let (old_id, old_key) = {
            let keys = store.keys.read();
            let (id, key) = keys.active().unwrap();
            (id, *key)
        };

        let new_id = store.rotate_key().unwrap();
        assert_ne!(old_id, new_id);
        let after = store.put(Category::Metrics, b"after rotation").unwrap();

        let fetched = store.fetch_pending(Category::Metrics, 10).unwrap();
        assert_eq!(fetched[0].id, before);
        assert_eq!(fetched[0].payload, b"before rotation");
        assert_eq!(fetched[1].id, after);

        let sealed: Vec<u8> = store
            .writer
            .lock()
            .query_row("SELECT payload FROM records WHERE id = ?1", [after], |row| row.get(0))
            .unwrap();
        assert!(crypto::open(&old_key, &sealed).is_err());

        let states: Vec<KeyState> = store.key_info().iter().map(|k| k.state).collect();
        assert_eq!(states, vec![KeyState::Grace, KeyState::Active]);
    }

    #[test]
    fn test_retire_grace_keys_rewrites_records() {
        let (_dir, store) = test_store();
        store
            .put_json(
                Category::Metrics,
                &MetricSample {
                    timestamp: Utc::now(),
                    device_id: "dev-1".into(),
                    category: MetricCategory::Cpu,
                    value: serde_json::json!({ "percent": 3.5 }),
                },
            )
            .unwrap();
        store.rotate_key().unwrap();

        assert_eq!(store.retire_grace_keys().unwrap(), 1);
        let sample: MetricSample = store.fetch_pending(Category::Metrics, 1).unwrap()[0].json().unwrap();
        assert_eq!(sample.device_id, "dev-1");

        let retired = store.key_info().iter().filter(|k| k.state == KeyState::Retired).count();
        assert_eq!(retired, 1);
        assert_eq!(store.retire_grace_keys().unwrap(), 0);
    }

    #[test]
    fn test_rows_rewritten_by_key_retirement_are_not_quarantined() {
        let (_dir, store) = test_store();
        let id = store.put(Category::Metrics, b"still valid").unwrap();
        store.rotate_key().unwrap();

        let stale: Vec<RawRecord> = {
            let conn = store.reader.lock();
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM records WHERE id = ?1", RECORD_COLUMNS))
                .unwrap();
            let rows = stmt.query_map([id], raw_record).unwrap();
            rows.collect::<Result<_, _>>().unwrap()
        };
        assert_eq!(store.retire_grace_keys().unwrap(), 1);

        let bad = {
            let keys = store.keys.read();
            SecureDataStore::verify_rows(&keys, stale, |_| ())
        };
        assert_eq!(bad.len(), 1);
        assert!(store.quarantine_records(bad).unwrap().is_empty());

        let fetched = store.fetch_pending(Category::Metrics, 10).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].payload, b"still valid");
        assert_eq!(store.stats().unwrap().quarantined, 0);
        assert!(store.fetch_pending(Category::Logs, 10).unwrap().is_empty());
    }

    #[test]
    fn test_reads_race_key_retirement_without_loss() {
        let (_dir, store) = test_store();
        for i in 0..200u32 {
            store.put(Category::Metrics, &i.to_be_bytes()).unwrap();
        }
        let store = std::sync::Arc::new(store);

        let retirer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..5 {
                    store.rotate_key().unwrap();
                    store.retire_grace_keys().unwrap();
                }
            })
        };
        for _ in 0..20 {
            assert_eq!(store.fetch_pending(Category::Metrics, 500).unwrap().len(), 200);
        }
        retirer.join().unwrap();

        assert_eq!(store.verify_integrity().unwrap().quarantined, 0);
        assert_eq!(store.stats().unwrap().quarantined, 0);
    }

    #[test]
    fn test_reopen_preserves_keys_and_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        let master = MasterKey::from_bytes(crypto::generate_key());

        {
            let store = SecureDataStore::open(&path, master.clone()).unwrap();
            store.put(Category::Metrics, b"persisted").unwrap();
            store.flush().unwrap();
        }

        let store = SecureDataStore::open(&path, master).unwrap();
        store.put(Category::Metrics, b"next").unwrap();
        let records = store.fetch_pending(Category::Metrics, 10).unwrap();
        assert_eq!(records[0].payload, b"persisted");
        assert_eq!(records[1].seq, 2);
    }

    #[test]
    fn test_wrong_master_key_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        SecureDataStore::open(&path, MasterKey::from_bytes(crypto::generate_key())).unwrap();

        let err = SecureDataStore::open(&path, MasterKey::from_bytes(crypto::generate_key()))
            .err()
            .unwrap();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_unusable_path_is_storage_fault() {
        let dir = tempfile::tempdir().unwrap();
        let err = SecureDataStore::open(dir.path(), MasterKey::from_bytes(crypto::generate_key()))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::StorageFault(_)));
    }

    #[test]
    fn test_recover_reopens_connections() {
        let (_dir, store) = test_store();
        store.put(Category::Logs, b"before").unwrap();
        store.recover().unwrap();
        store.health_check().unwrap();
        assert_eq!(store.pending_count(Category::Logs).unwrap(), 1);
    }
}
