//! Idempotency records for dispatched commands. The primary-key claim is
//! what guarantees a given key executes against a worker at most once,
//! even across a supervisor restart mid-dispatch.

use chrono::{DateTime, Duration, Utc};
use tracing::instrument;

use marshal_core::command::{CommandResult, CommandStatus};
use marshal_core::ids::CommandId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Outcome of attempting to claim a key before sending.
#[derive(Clone, Debug)]
pub enum Claim {
    /// No live record; the caller owns execution for this key.
    Acquired,
    /// A previous execution finished; return its result without re-sending.
    Completed {
        command_id: CommandId,
        result: CommandResult,
    },
    /// Another dispatch holds the claim but has not recorded a result yet.
    InFlight { command_id: CommandId },
}

pub struct IdempotencyRepo {
    db: Database,
}

impl IdempotencyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Atomically claim `key` for `command_id`. The whole check-then-write
    /// runs under the store's connection lock, so two concurrent retries of
    /// the same key can never both acquire it.
    #[instrument(skip(self), fields(key, command_id = %command_id))]
    pub fn claim(
        &self,
        key: &str,
        command_id: &CommandId,
        ttl: Duration,
    ) -> Result<Claim, StoreError> {
        let now = Utc::now();
        self.db.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT command_id, result, expires_at FROM command_idempotency WHERE key_hash = ?1",
                    [key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(StoreError::from(other)),
                })?;

            if let Some((existing_id, result, expires_at)) = existing {
                let expired = parse_time(&expires_at)? < now;
                if !expired {
                    return match result {
                        Some(raw) => Ok(Claim::Completed {
                            command_id: CommandId::from_raw(existing_id),
                            result: row_helpers::parse_json(&raw, "command_idempotency", "result")?,
                        }),
                        None => Ok(Claim::InFlight {
                            command_id: CommandId::from_raw(existing_id),
                        }),
                    };
                }
                conn.execute("DELETE FROM command_idempotency WHERE key_hash = ?1", [key])?;
            }

            conn.execute(
                "INSERT INTO command_idempotency (key_hash, command_id, result, expires_at, created_at)
                 VALUES (?1, ?2, NULL, ?3, ?4)",
                rusqlite::params![
                    key,
                    command_id.as_str(),
                    (now + ttl).to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;
            Ok(Claim::Acquired)
        })
    }

    /// Record the terminal result for a claimed key (write-then-respond).
    #[instrument(skip(self, result), fields(key, status = %result.status))]
    pub fn complete(&self, key: &str, result: &CommandResult) -> Result<(), StoreError> {
        debug_assert!(result.status.is_terminal());
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE command_idempotency SET result = ?2 WHERE key_hash = ?1",
                rusqlite::params![key, serde_json::to_string(result)?],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("idempotency key {key}")));
            }
            Ok(())
        })
    }

    /// Drop the claim so the caller may retry. Used after timeout/transport
    /// failure, where the command did not observably execute; successful
    /// irreversible commands are completed instead, never released.
    #[instrument(skip(self), fields(key))]
    pub fn release(&self, key: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM command_idempotency WHERE key_hash = ?1", [key])?;
            Ok(())
        })
    }

    /// Remove expired records. Called opportunistically.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let removed =
                conn.execute("DELETE FROM command_idempotency WHERE expires_at < ?1", [now.as_str()])?;
            Ok(removed)
        })
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "command_idempotency",
            column: "expires_at",
            detail: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo() -> IdempotencyRepo {
        IdempotencyRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn first_claim_acquires() {
        let repo = repo();
        let claim = repo.claim("k1", &CommandId::from_raw("cmd_1"), Duration::hours(1)).unwrap();
        assert!(matches!(claim, Claim::Acquired));
    }

    #[test]
    fn second_claim_before_completion_is_in_flight() {
        let repo = repo();
        repo.claim("k1", &CommandId::from_raw("cmd_1"), Duration::hours(1)).unwrap();
        let claim = repo.claim("k1", &CommandId::from_raw("cmd_2"), Duration::hours(1)).unwrap();
        match claim {
            Claim::InFlight { command_id } => assert_eq!(command_id.as_str(), "cmd_1"),
            other => panic!("expected in-flight, got {other:?}"),
        }
    }

    #[test]
    fn completed_claim_returns_stored_result() {
        let repo = repo();
        repo.claim("k1", &CommandId::from_raw("cmd_1"), Duration::hours(1)).unwrap();
        let result = CommandResult::success(json!({"killed": true}), 20);
        repo.complete("k1", &result).unwrap();

        let claim = repo.claim("k1", &CommandId::from_raw("cmd_2"), Duration::hours(1)).unwrap();
        match claim {
            Claim::Completed { command_id, result } => {
                assert_eq!(command_id.as_str(), "cmd_1");
                assert_eq!(result.status, CommandStatus::Success);
                assert_eq!(result.output.unwrap()["killed"], true);
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[test]
    fn released_claim_can_be_reacquired() {
        let repo = repo();
        repo.claim("k1", &CommandId::from_raw("cmd_1"), Duration::hours(1)).unwrap();
        repo.release("k1").unwrap();
        let claim = repo.claim("k1", &CommandId::from_raw("cmd_2"), Duration::hours(1)).unwrap();
        assert!(matches!(claim, Claim::Acquired));
    }

    #[test]
    fn expired_claim_is_reclaimable() {
        let repo = repo();
        repo.claim("k1", &CommandId::from_raw("cmd_1"), Duration::seconds(-5)).unwrap();
        let claim = repo.claim("k1", &CommandId::from_raw("cmd_2"), Duration::hours(1)).unwrap();
        assert!(matches!(claim, Claim::Acquired));
    }

    #[test]
    fn complete_unknown_key_errors() {
        let repo = repo();
        let result = CommandResult::failure("whoops", 1);
        assert!(matches!(repo.complete("nope", &result), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn purge_removes_only_expired() {
        let repo = repo();
        repo.claim("old", &CommandId::from_raw("cmd_1"), Duration::seconds(-5)).unwrap();
        repo.claim("new", &CommandId::from_raw("cmd_2"), Duration::hours(1)).unwrap();
        assert_eq!(repo.purge_expired().unwrap(), 1);
        let claim = repo.claim("new", &CommandId::from_raw("cmd_3"), Duration::hours(1)).unwrap();
        assert!(matches!(claim, Claim::InFlight { .. }));
    }
}
