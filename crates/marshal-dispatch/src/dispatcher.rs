use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use marshal_cluster::{Cluster, ClusterError, TrackedSession};
use marshal_core::command::{CommandResult, CommandSpec, CommandStatus};
use marshal_core::config::DispatchConfig;
use marshal_core::ids::{CommandId, NodeId, SessionId};
use marshal_core::status::SessionStatus;
use marshal_core::wire::ServerFrame;
use marshal_store::{
    AuditRepo, Claim, Database, IdempotencyRepo, SessionRepo, SessionRow, StoreError,
};

use crate::error::DispatchError;
use crate::transport::TransportRegistry;

/// Outcome handed back to the caller. `cached` marks an idempotent replay
/// that never reached a worker.
#[derive(Clone, Debug)]
pub struct Dispatched {
    pub command_id: CommandId,
    pub result: CommandResult,
    pub cached: bool,
}

/// Derive the idempotency key a policy action uses for a given suppression
/// window, so re-evaluations inside one window collapse onto one dispatch.
pub fn policy_idempotency_key(policy: &str, target: &str, window_secs: u64) -> String {
    let bucket = Utc::now().timestamp() as u64 / window_secs.max(1);
    let mut hasher = Sha256::new();
    hasher.update(policy.as_bytes());
    hasher.update(b"\x00");
    hasher.update(target.as_bytes());
    hasher.update(b"\x00");
    hasher.update(bucket.to_be_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub struct Dispatcher {
    cluster: Arc<Cluster>,
    transports: Arc<TransportRegistry>,
    pending: DashMap<CommandId, oneshot::Sender<CommandResult>>,
    config: DispatchConfig,
    sessions: SessionRepo,
    idempotency: IdempotencyRepo,
    audit: AuditRepo,
}

impl Dispatcher {
    pub fn new(
        cluster: Arc<Cluster>,
        transports: Arc<TransportRegistry>,
        db: Database,
        config: DispatchConfig,
    ) -> Self {
        Self {
            cluster,
            transports,
            pending: DashMap::new(),
            config,
            sessions: SessionRepo::new(db.clone()),
            idempotency: IdempotencyRepo::new(db.clone()),
            audit: AuditRepo::new(db),
        }
    }

    /// Run one command end to end: validate, claim the idempotency key,
    /// resolve the project to a live node, send, and wait for the result
    /// (or the dispatch timeout, or `cancel` firing). The worker response
    /// is durably recorded before the caller sees it.
    #[instrument(skip(self, spec, cancel), fields(actor, project, kind = spec.kind()))]
    pub async fn dispatch(
        &self,
        actor: &str,
        project: &str,
        spec: CommandSpec,
        idempotency_key: Option<String>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Dispatched, DispatchError> {
        spec.validate()?;
        let command_id = CommandId::new();

        if let Some(key) = &idempotency_key {
            let ttl = chrono::Duration::seconds(self.config.idempotency_ttl_secs as i64);
            if let Ok(removed) = self.idempotency.purge_expired() {
                if removed > 0 {
                    tracing::debug!(removed, "purged expired idempotency records");
                }
            }
            match self.idempotency.claim(key, &command_id, ttl)? {
                Claim::Acquired => {}
                Claim::Completed { command_id, result } => {
                    tracing::debug!(%command_id, "idempotency hit, returning recorded result");
                    self.audit.append(
                        actor,
                        spec.kind(),
                        project,
                        &serde_json::to_value(&spec).unwrap_or_default(),
                        "deduplicated",
                        None,
                        0,
                    )?;
                    return Ok(Dispatched { command_id, result, cached: true });
                }
                Claim::InFlight { command_id } => {
                    return Err(DispatchError::DuplicateInFlight {
                        key: key.clone(),
                        command_id,
                    });
                }
            }
        }

        match self.execute(project, &command_id, &spec, cancel).await {
            Ok(result) => {
                if let Some(key) = &idempotency_key {
                    if result.status == CommandStatus::Success {
                        // The worker already acted; a bookkeeping failure
                        // must not turn that success into an error.
                        if let Err(err) = self.idempotency.complete(key, &result) {
                            tracing::warn!(key = %key, error = %err, "idempotency record not written");
                        }
                    } else {
                        // Failed and timed-out commands free the key so the
                        // caller can retry with the same one.
                        self.idempotency.release(key)?;
                    }
                }
                self.audit.append(
                    actor,
                    spec.kind(),
                    project,
                    &serde_json::to_value(&spec).unwrap_or_default(),
                    &result.status.to_string(),
                    result.error.as_deref(),
                    result.duration_ms,
                )?;
                Ok(Dispatched { command_id, result, cached: false })
            }
            Err(err) => {
                if let Some(key) = &idempotency_key {
                    self.idempotency.release(key)?;
                }
                self.audit.append(
                    actor,
                    spec.kind(),
                    project,
                    &serde_json::to_value(&spec).unwrap_or_default(),
                    "error",
                    Some(&err.to_string()),
                    0,
                )?;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        project: &str,
        command_id: &CommandId,
        spec: &CommandSpec,
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandResult, DispatchError> {
        let node_id = self
            .cluster
            .resolve_project(project)
            .ok_or_else(|| DispatchError::NoNodeForProject(project.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(command_id.clone(), tx);
        let started = Instant::now();

        let frame = ServerFrame::Command { command_id: command_id.clone(), spec: spec.clone() };
        if let Err(err) = self.transports.send(&node_id, frame).await {
            self.pending.remove(command_id);
            return Err(err);
        }
        tracing::info!(%command_id, node_id = %node_id, kind = spec.kind(), "command sent");

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = tokio::select! {
            outcome = tokio::time::timeout(timeout, rx) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => {
                    self.pending.remove(command_id);
                    return Err(DispatchError::Cancelled(command_id.clone()));
                }
                Err(_) => {
                    self.pending.remove(command_id);
                    tracing::warn!(%command_id, ?timeout, "dispatch timed out");
                    CommandResult::timeout(started.elapsed().as_millis() as u64)
                }
            },
            _ = cancelled(cancel) => {
                self.pending.remove(command_id);
                tracing::debug!(%command_id, "dispatch cancelled");
                return Err(DispatchError::Cancelled(command_id.clone()));
            }
        };

        self.apply_outcome(spec, &node_id, project, &result)?;
        Ok(result)
    }

    /// Route a worker `Result` frame to its waiting dispatch. Returns false
    /// when nothing is waiting (late result after a timeout).
    pub fn complete(&self, command_id: &CommandId, result: CommandResult) -> bool {
        match self.pending.remove(command_id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => {
                tracing::debug!(%command_id, "result for unknown or timed-out command");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fold a successful command's side effects into the tracker and store.
    fn apply_outcome(
        &self,
        spec: &CommandSpec,
        node_id: &NodeId,
        project: &str,
        result: &CommandResult,
    ) -> Result<(), DispatchError> {
        if result.status != CommandStatus::Success {
            return Ok(());
        }
        match spec {
            CommandSpec::CreateSession { model, .. } => {
                let Some(sid) = result
                    .output
                    .as_ref()
                    .and_then(|o| o.get("session_id"))
                    .and_then(|v| v.as_str())
                else {
                    tracing::warn!("create_session succeeded without a session_id in output");
                    return Ok(());
                };
                let session = TrackedSession::new(
                    SessionId::from_raw(sid),
                    node_id.clone(),
                    project,
                    model.clone(),
                );
                match self.cluster.add_session(session.clone()) {
                    Ok(()) => self.sessions.upsert(&session_row(&session))?,
                    Err(ClusterError::DuplicateSession { .. }) => {
                        tracing::debug!(session_id = sid, "session already tracked");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            CommandSpec::KillSession { session_id } => {
                match self.cluster.mark_killed(session_id) {
                    Ok(()) => self.persist_status(session_id, SessionStatus::Killed)?,
                    Err(ClusterError::SessionNotFound(_)) => {
                        tracing::debug!(%session_id, "killed session was not tracked");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            CommandSpec::RestartSession { session_id, .. } => {
                match self.cluster.update_status(session_id, SessionStatus::Running) {
                    Ok(()) => self.persist_status(session_id, SessionStatus::Running)?,
                    Err(ClusterError::SessionNotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            CommandSpec::SessionStatus { session_id } => {
                // A successful status query doubles as a fresh report, which
                // is the restoration path for unreachable sessions.
                let reported = result
                    .output
                    .as_ref()
                    .and_then(|o| o.get("status"))
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<SessionStatus>().ok());
                if let Some(status) = reported {
                    if status != SessionStatus::Unreachable {
                        match self.cluster.restore_from_report(session_id, status) {
                            Ok(()) => self.persist_status(session_id, status)?,
                            Err(ClusterError::SessionNotFound(_)) => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Rows may lag the tracker (a session created before this process
    /// started), so a missing row is not an error here.
    fn persist_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), DispatchError> {
        match self.sessions.set_status(session_id, status) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Resolves when the optional token fires; never resolves without one.
async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Project a tracked session onto its storage row.
pub fn session_row(session: &TrackedSession) -> SessionRow {
    SessionRow {
        id: session.id.clone(),
        node_id: session.node_id.clone(),
        project: session.project.clone(),
        status: session.status,
        tokens: session.tokens,
        compactions: session.compactions,
        cost_usd: session.cost_usd,
        model: session.model.clone(),
        last_activity: session.last_activity,
        started_at: session.started_at,
    }
}
