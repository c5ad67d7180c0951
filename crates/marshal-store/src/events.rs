use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marshal_core::event::WorkerEvent;
use marshal_core::ids::{EventId, NodeId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRow {
    pub id: EventId,
    pub node_id: NodeId,
    pub session_id: Option<SessionId>,
    pub kind: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub received_at: DateTime<Utc>,
}

pub struct EventRepo {
    db: Database,
}

const COLUMNS: &str = "id, node_id, session_id, kind, fields, received_at";

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append(&self, event: &WorkerEvent) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (id, node_id, session_id, kind, fields, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    event.event_id.as_str(),
                    event.node_id.as_str(),
                    event.session_id.as_ref().map(|s| s.as_str()),
                    event.kind,
                    serde_json::to_string(&event.fields)?,
                    event.received_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent events first.
    pub fn recent(&self, limit: u32) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM events ORDER BY received_at DESC, id DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit])?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                result.push(row_to_event(row)?);
            }
            Ok(result)
        })
    }

    pub fn for_session(&self, session_id: &SessionId, limit: u32) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM events WHERE session_id = ?1
                 ORDER BY received_at DESC, id DESC LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit])?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                result.push(row_to_event(row)?);
            }
            Ok(result)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    let fields_raw: String = row_helpers::get(row, 4, "events", "fields")?;
    let received_at: String = row_helpers::get(row, 5, "events", "received_at")?;
    Ok(EventRow {
        id: EventId::from_raw(row_helpers::get::<String>(row, 0, "events", "id")?),
        node_id: NodeId::from_raw(row_helpers::get::<String>(row, 1, "events", "node_id")?),
        session_id: row_helpers::get_opt::<String>(row, 2, "events", "session_id")?
            .map(SessionId::from_raw),
        kind: row_helpers::get(row, 3, "events", "kind")?,
        fields: row_helpers::parse_json(&fields_raw, "events", "fields")?,
        received_at: DateTime::parse_from_rfc3339(&received_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::CorruptRow {
                table: "events",
                column: "received_at",
                detail: e.to_string(),
            })?,
    })
}
