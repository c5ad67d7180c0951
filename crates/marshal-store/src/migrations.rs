//! Ordered schema migrations with sha256 content checksums. Each migration
//! runs at most once; a checksum mismatch against a previously applied
//! version is fatal, never silently re-applied.

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::error::StoreError;

pub struct Migration {
    pub version: u32,
    pub sql: &'static str,
}

const V1_BASE: &str = r#"
CREATE TABLE nodes (
    id TEXT PRIMARY KEY,
    identity TEXT NOT NULL UNIQUE,
    hostname TEXT NOT NULL,
    projects TEXT NOT NULL DEFAULT '[]',
    capabilities TEXT NOT NULL DEFAULT '[]',
    resources TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'offline',
    last_heartbeat TEXT,
    connected_at TEXT
);

CREATE TABLE sessions (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL REFERENCES nodes(id),
    project TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    compactions INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0.0,
    model TEXT,
    last_activity TEXT NOT NULL,
    started_at TEXT NOT NULL
);

CREATE TABLE events (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    session_id TEXT,
    kind TEXT NOT NULL,
    fields TEXT NOT NULL DEFAULT '{}',
    received_at TEXT NOT NULL
);

CREATE INDEX idx_sessions_node ON sessions(node_id);
CREATE INDEX idx_sessions_project ON sessions(project);
CREATE INDEX idx_sessions_status ON sessions(status);
CREATE INDEX idx_events_session ON events(session_id);
CREATE INDEX idx_events_kind ON events(kind);
"#;

const V2_DISPATCH: &str = r#"
CREATE TABLE costs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    provider TEXT NOT NULL,
    amount_usd REAL NOT NULL,
    day TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TABLE command_idempotency (
    key_hash TEXT PRIMARY KEY,
    command_id TEXT NOT NULL,
    result TEXT,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    target TEXT NOT NULL,
    args TEXT NOT NULL DEFAULT '{}',
    result_status TEXT NOT NULL,
    error TEXT,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_costs_project_day ON costs(project, day);
CREATE INDEX idx_audit_created ON audit_log(created_at);
"#;

pub const MIGRATIONS: &[Migration] = &[
    Migration { version: 1, sql: V1_BASE },
    Migration { version: 2, sql: V2_DISPATCH },
];

pub fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Apply all pending migrations in ascending version order. Returns the
/// resulting schema version. Safe to call on every startup.
pub fn apply(conn: &Connection) -> Result<u32, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             version INTEGER PRIMARY KEY,
             checksum TEXT NOT NULL,
             applied_at TEXT NOT NULL
         );",
    )?;

    let mut current = 0;
    for migration in MIGRATIONS {
        let computed = checksum(migration.sql);
        let recorded: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE version = ?1",
                [migration.version],
                |row| row.get(0),
            )
            .ok();

        match recorded {
            Some(recorded) if recorded == computed => {
                current = migration.version;
                continue;
            }
            Some(recorded) => {
                return Err(StoreError::MigrationChecksum {
                    version: migration.version,
                    recorded,
                    computed,
                });
            }
            None => {}
        }

        conn.execute_batch("BEGIN")?;
        let applied = conn.execute_batch(migration.sql).and_then(|_| {
            conn.execute(
                "INSERT INTO schema_migrations (version, checksum, applied_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![migration.version, computed, chrono::Utc::now().to_rfc3339()],
            )
            .map(|_| ())
        });
        match applied {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(StoreError::MigrationFailed {
                    version: migration.version,
                    detail: e.to_string(),
                });
            }
        }
        tracing::info!(version = migration.version, "applied schema migration");
        current = migration.version;
    }
    Ok(current)
}
