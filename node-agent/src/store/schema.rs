//! Schema migrations for the agent database

use super::StoreError;
use rusqlite::Connection;
use tracing::info;

/// Run all migrations
pub(crate) fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch())
        )",
        [],
    )?;

    run_migration(conn, "001_initial_schema", MIGRATION_001)?;
    Ok(())
}

/// Run a single migration if not already applied
fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<(), StoreError> {
    let applied: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE name = ?1)",
        [name],
        |row| row.get(0),
    )?;
    if applied {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(sql)?;
    tx.execute("INSERT INTO schema_migrations (name) VALUES (?1)", [name])?;
    tx.commit()?;

    info!("Applied migration: {}", name);
    Ok(())
}

const MIGRATION_001: &str = r#"
-- Data keys, wrapped by the master key
CREATE TABLE IF NOT EXISTS encryption_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wrapped_key BLOB,
    state TEXT NOT NULL CHECK(state IN ('active', 'grace', 'retired')),
    created_at INTEGER NOT NULL,
    retired_at INTEGER
);

-- Queued records (metrics, logs, task logs, communication journal, config backups)
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    seq INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 1,
    key_id INTEGER NOT NULL REFERENCES encryption_keys(id),
    payload BLOB NOT NULL,
    checksum TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    delivered_at INTEGER,
    UNIQUE(category, seq)
);

CREATE INDEX IF NOT EXISTS idx_records_pending ON records(category, delivered, seq);
CREATE INDEX IF NOT EXISTS idx_records_timestamp ON records(category, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_records_key ON records(key_id);

-- Sequence counters survive deletions so numbers are never reused
CREATE TABLE IF NOT EXISTS category_sequences (
    category TEXT PRIMARY KEY,
    next_seq INTEGER NOT NULL
);

-- Named singletons and keyed documents (module records, credential, config)
CREATE TABLE IF NOT EXISTS entities (
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    key_id INTEGER NOT NULL REFERENCES encryption_keys(id),
    payload BLOB NOT NULL,
    checksum TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY(kind, name)
);

CREATE INDEX IF NOT EXISTS idx_entities_key ON entities(key_id);

-- Rows that failed integrity verification
CREATE TABLE IF NOT EXISTS quarantine (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    origin TEXT NOT NULL CHECK(origin IN ('record', 'entity')),
    original_id TEXT NOT NULL,
    category TEXT NOT NULL,
    payload BLOB,
    checksum TEXT,
    reason TEXT NOT NULL,
    quarantined_at INTEGER NOT NULL
);

-- Single-use registration tokens, stored as SHA-256 digests
CREATE TABLE IF NOT EXISTS consumed_tokens (
    digest TEXT PRIMARY KEY,
    consumed_at INTEGER NOT NULL
);
"#;
