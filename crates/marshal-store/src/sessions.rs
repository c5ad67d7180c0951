//! Durable session projections, reconciled into the tracker on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use marshal_core::ids::{NodeId, SessionId};
use marshal_core::status::SessionStatus;
use marshal_core::usage::TokenUsage;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub node_id: NodeId,
    pub project: String,
    pub status: SessionStatus,
    pub tokens: TokenUsage,
    pub compactions: u32,
    pub cost_usd: f64,
    pub model: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

pub struct SessionRepo {
    db: Database,
}

const COLUMNS: &str = "id, node_id, project, status, input_tokens, output_tokens, compactions, \
                       cost_usd, model, last_activity, started_at";

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, row), fields(session_id = %row.id, node_id = %row.node_id))]
    pub fn upsert(&self, row: &SessionRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, node_id, project, status, input_tokens, output_tokens,
                                       compactions, cost_usd, model, last_activity, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     input_tokens = excluded.input_tokens,
                     output_tokens = excluded.output_tokens,
                     compactions = excluded.compactions,
                     cost_usd = excluded.cost_usd,
                     model = excluded.model,
                     last_activity = excluded.last_activity",
                rusqlite::params![
                    row.id.as_str(),
                    row.node_id.as_str(),
                    row.project,
                    row.status.to_string(),
                    row.tokens.input_tokens as i64,
                    row.tokens.output_tokens as i64,
                    row.compactions,
                    row.cost_usd,
                    row.model,
                    row.last_activity.to_rfc3339(),
                    row.started_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id, status = %status))]
    pub fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = ?2 WHERE id = ?1",
                rusqlite::params![id.as_str(), status.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    pub fn list(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM sessions ORDER BY started_at"))?;
            let mut rows = stmt.query([])?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                result.push(row_to_session(row)?);
            }
            Ok(result)
        })
    }

    /// Sessions not yet terminal, used for startup reconciliation.
    pub fn list_live(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM sessions WHERE status != 'killed' ORDER BY started_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                result.push(row_to_session(row)?);
            }
            Ok(result)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    /// Remove every session owned by a node (deregistration cleanup).
    #[instrument(skip(self), fields(node_id = %node_id))]
    pub fn delete_for_node(&self, node_id: &NodeId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed =
                conn.execute("DELETE FROM sessions WHERE node_id = ?1", [node_id.as_str()])?;
            Ok(removed)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_raw: String = row_helpers::get(row, 3, "sessions", "status")?;
    let last_activity: String = row_helpers::get(row, 9, "sessions", "last_activity")?;
    let started_at: String = row_helpers::get(row, 10, "sessions", "started_at")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        node_id: NodeId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "node_id")?),
        project: row_helpers::get(row, 2, "sessions", "project")?,
        status: row_helpers::parse_enum(&status_raw, "sessions", "status")?,
        tokens: TokenUsage {
            input_tokens: row_helpers::get::<i64>(row, 4, "sessions", "input_tokens")? as u64,
            output_tokens: row_helpers::get::<i64>(row, 5, "sessions", "output_tokens")? as u64,
        },
        compactions: row_helpers::get(row, 6, "sessions", "compactions")?,
        cost_usd: row_helpers::get(row, 7, "sessions", "cost_usd")?,
        model: row_helpers::get_opt(row, 8, "sessions", "model")?,
        last_activity: parse_time(&last_activity, "last_activity")?,
        started_at: parse_time(&started_at, "started_at")?,
    })
}

fn parse_time(raw: &str, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "sessions",
            column,
            detail: e.to_string(),
        })
}
