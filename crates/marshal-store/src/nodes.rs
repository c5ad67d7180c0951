//! Durable node projections. The in-memory registry is the live view;
//! these rows exist so history stays attributable across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use marshal_core::ids::NodeId;
use marshal_core::resources::ResourceSnapshot;
use marshal_core::status::NodeStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: NodeId,
    pub identity: String,
    pub hostname: String,
    pub projects: Vec<String>,
    pub capabilities: Vec<String>,
    pub resources: ResourceSnapshot,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
}

pub struct NodeRepo {
    db: Database,
}

const COLUMNS: &str =
    "id, identity, hostname, projects, capabilities, resources, status, last_heartbeat, connected_at";

impl NodeRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the projection for one node.
    #[instrument(skip(self, row), fields(node_id = %row.id))]
    pub fn upsert(&self, row: &NodeRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO nodes (id, identity, hostname, projects, capabilities, resources,
                                    status, last_heartbeat, connected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                     identity = excluded.identity,
                     hostname = excluded.hostname,
                     projects = excluded.projects,
                     capabilities = excluded.capabilities,
                     resources = excluded.resources,
                     status = excluded.status,
                     last_heartbeat = excluded.last_heartbeat,
                     connected_at = excluded.connected_at",
                rusqlite::params![
                    row.id.as_str(),
                    row.identity,
                    row.hostname,
                    serde_json::to_string(&row.projects)?,
                    serde_json::to_string(&row.capabilities)?,
                    serde_json::to_string(&row.resources)?,
                    row.status.to_string(),
                    row.last_heartbeat.map(|t| t.to_rfc3339()),
                    row.connected_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(node_id = %id, status = %status))]
    pub fn set_status(&self, id: &NodeId, status: NodeStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE nodes SET status = ?2 WHERE id = ?1",
                rusqlite::params![id.as_str(), status.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("node {id}")));
            }
            Ok(())
        })
    }

    pub fn get(&self, id: &NodeId) -> Result<NodeRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM nodes WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_node(row),
                None => Err(StoreError::NotFound(format!("node {id}"))),
            }
        })
    }

    pub fn list(&self) -> Result<Vec<NodeRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM nodes ORDER BY identity"))?;
            let mut rows = stmt.query([])?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                result.push(row_to_node(row)?);
            }
            Ok(result)
        })
    }

    /// Explicit eviction; sessions are removed separately by the caller.
    #[instrument(skip(self), fields(node_id = %id))]
    pub fn delete(&self, id: &NodeId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM nodes WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> Result<NodeRow, StoreError> {
    let projects_raw: String = row_helpers::get(row, 3, "nodes", "projects")?;
    let capabilities_raw: String = row_helpers::get(row, 4, "nodes", "capabilities")?;
    let resources_raw: String = row_helpers::get(row, 5, "nodes", "resources")?;
    let status_raw: String = row_helpers::get(row, 6, "nodes", "status")?;
    let last_heartbeat: Option<String> = row_helpers::get_opt(row, 7, "nodes", "last_heartbeat")?;
    let connected_at: Option<String> = row_helpers::get_opt(row, 8, "nodes", "connected_at")?;

    Ok(NodeRow {
        id: NodeId::from_raw(row_helpers::get::<String>(row, 0, "nodes", "id")?),
        identity: row_helpers::get(row, 1, "nodes", "identity")?,
        hostname: row_helpers::get(row, 2, "nodes", "hostname")?,
        projects: row_helpers::parse_json(&projects_raw, "nodes", "projects")?,
        capabilities: row_helpers::parse_json(&capabilities_raw, "nodes", "capabilities")?,
        resources: row_helpers::parse_json(&resources_raw, "nodes", "resources")?,
        status: row_helpers::parse_enum(&status_raw, "nodes", "status")?,
        last_heartbeat: parse_time(last_heartbeat, "last_heartbeat")?,
        connected_at: parse_time(connected_at, "connected_at")?,
    })
}

fn parse_time(
    raw: Option<String>,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| StoreError::CorruptRow {
                table: "nodes",
                column,
                detail: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(identity: &str) -> NodeRow {
        NodeRow {
            id: NodeId::new(),
            identity: identity.to_string(),
            hostname: "host1".into(),
            projects: vec!["api".into(), "web".into()],
            capabilities: vec!["agent".into()],
            resources: ResourceSnapshot { cpu_pct: 10.0, ram_pct: 20.0, disk_pct: 30.0 },
            status: NodeStatus::Online,
            last_heartbeat: Some(Utc::now()),
            connected_at: Some(Utc::now()),
        }
    }

    #[test]
    fn upsert_and_get() {
        let repo = NodeRepo::new(Database::in_memory().unwrap());
        let row = sample("worker-a");
        repo.upsert(&row).unwrap();
        let loaded = repo.get(&row.id).unwrap();
        assert_eq!(loaded.identity, "worker-a");
        assert_eq!(loaded.projects, vec!["api", "web"]);
        assert_eq!(loaded.status, NodeStatus::Online);
    }

    #[test]
    fn upsert_replaces_descriptive_fields() {
        let repo = NodeRepo::new(Database::in_memory().unwrap());
        let mut row = sample("worker-a");
        repo.upsert(&row).unwrap();
        row.projects = vec!["batch".into()];
        row.hostname = "host2".into();
        repo.upsert(&row).unwrap();
        let loaded = repo.get(&row.id).unwrap();
        assert_eq!(loaded.projects, vec!["batch"]);
        assert_eq!(loaded.hostname, "host2");
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn set_status_unknown_node_errors() {
        let repo = NodeRepo::new(Database::in_memory().unwrap());
        let err = repo.set_status(&NodeId::from_raw("node_missing"), NodeStatus::Offline);
        assert!(matches!(err, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn set_status_and_list() {
        let repo = NodeRepo::new(Database::in_memory().unwrap());
        let row = sample("worker-b");
        repo.upsert(&row).unwrap();
        repo.set_status(&row.id, NodeStatus::Offline).unwrap();
        let all = repo.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, NodeStatus::Offline);
    }

    #[test]
    fn delete_removes_row() {
        let repo = NodeRepo::new(Database::in_memory().unwrap());
        let row = sample("worker-c");
        repo.upsert(&row).unwrap();
        repo.delete(&row.id).unwrap();
        assert!(matches!(repo.get(&row.id), Err(StoreError::NotFound(_))));
    }
}
