use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Append-only audit trail of every dispatched command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub args: serde_json::Value,
    pub result_status: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

pub struct AuditRepo {
    db: Database,
}

impl AuditRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, args), fields(actor, action, target))]
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        args: &serde_json::Value,
        result_status: &str,
        error: Option<&str>,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (actor, action, target, args, result_status, error, duration_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    actor,
                    action,
                    target,
                    serde_json::to_string(args)?,
                    result_status,
                    error,
                    duration_ms as i64,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: u32) -> Result<Vec<AuditEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, actor, action, target, args, result_status, error, duration_ms, created_at
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit])?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                let args_raw: String = row_helpers::get(row, 4, "audit_log", "args")?;
                let created_at: String = row_helpers::get(row, 8, "audit_log", "created_at")?;
                result.push(AuditEntry {
                    id: row_helpers::get(row, 0, "audit_log", "id")?,
                    actor: row_helpers::get(row, 1, "audit_log", "actor")?,
                    action: row_helpers::get(row, 2, "audit_log", "action")?,
                    target: row_helpers::get(row, 3, "audit_log", "target")?,
                    args: row_helpers::parse_json(&args_raw, "audit_log", "args")?,
                    result_status: row_helpers::get(row, 5, "audit_log", "result_status")?,
                    error: row_helpers::get_opt(row, 6, "audit_log", "error")?,
                    duration_ms: row_helpers::get::<i64>(row, 7, "audit_log", "duration_ms")? as u64,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| StoreError::CorruptRow {
                            table: "audit_log",
                            column: "created_at",
                            detail: e.to_string(),
                        })?,
                });
            }
            Ok(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_and_recent() {
        let repo = AuditRepo::new(Database::in_memory().unwrap());
        repo.append("policy:resume_on_idle", "prompt_session", "api", &json!({"session_id": "sess_1"}), "success", None, 120)
            .unwrap();
        repo.append("operator", "kill_session", "api", &json!({"session_id": "sess_1"}), "failure", Some("gone"), 10)
            .unwrap();

        let entries = repo.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "kill_session");
        assert_eq!(entries[0].error.as_deref(), Some("gone"));
        assert_eq!(entries[1].actor, "policy:resume_on_idle");
        assert_eq!(entries[1].args["session_id"], "sess_1");
    }

    #[test]
    fn recent_respects_limit() {
        let repo = AuditRepo::new(Database::in_memory().unwrap());
        for i in 0..5 {
            repo.append("operator", "env_check", "api", &json!({}), "success", None, i).unwrap();
        }
        assert_eq!(repo.recent(2).unwrap().len(), 2);
    }
}
