use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use marshal_cluster::{Cluster, TrackedSession};
use marshal_core::command::{CommandSpec, CommandStatus};
use marshal_core::config::PolicyConfig;
use marshal_core::event::WorkerEvent;
use marshal_core::ids::SessionId;
use marshal_core::status::SessionStatus;
use marshal_dispatch::{policy_idempotency_key, DispatchError, Dispatcher};
use marshal_store::{CostRepo, Database};

use crate::cost::CostProvider;
use crate::handover::{run_handover, HandoverParams};
use crate::retry::{Permit, RetryLedger};

const ACTOR: &str = "policy-engine";

/// The periodic evaluator. Each tick takes one tracker snapshot and runs
/// every enabled policy over it exactly once; slow dispatches never cause
/// re-evaluation within the same tick.
pub struct PolicyEngine {
    cluster: Arc<Cluster>,
    dispatcher: Arc<Dispatcher>,
    config: PolicyConfig,
    retries: RetryLedger,
    costs: Arc<dyn CostProvider>,
    cost_repo: CostRepo,
    events: mpsc::Sender<WorkerEvent>,
    /// Sessions with a handover in flight; skipped by evaluation until the
    /// sequence resolves either way.
    handovers: Arc<Mutex<HashSet<SessionId>>>,
    shutdown: CancellationToken,
}

impl PolicyEngine {
    pub fn new(
        cluster: Arc<Cluster>,
        dispatcher: Arc<Dispatcher>,
        db: Database,
        costs: Arc<dyn CostProvider>,
        config: PolicyConfig,
        events: mpsc::Sender<WorkerEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let retries = RetryLedger::new(config.max_retries, config.retry_reset_seconds);
        Self {
            cluster,
            dispatcher,
            config,
            retries,
            costs,
            cost_repo: CostRepo::new(db),
            events,
            handovers: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        tracing::debug!("policy engine stopped");
                        break;
                    }
                    _ = ticker.tick() => self.evaluate_once().await,
                }
            }
        })
    }

    /// One full evaluation pass over the current snapshot.
    #[instrument(skip(self))]
    pub async fn evaluate_once(self: &Arc<Self>) {
        let snapshot = self.cluster.snapshot();
        for session in &snapshot {
            if session.is_terminal() || session.status == SessionStatus::Unreachable {
                continue;
            }
            if self.handovers.lock().contains(&session.id) {
                continue;
            }
            self.check_resume_on_idle(session).await;
            self.check_restart_on_compaction(session).await;
            self.check_kill_on_cost(session).await;
        }
    }

    async fn check_resume_on_idle(&self, session: &TrackedSession) {
        let policy = &self.config.resume_on_idle;
        if !policy.enabled || session.status != SessionStatus::Idle {
            return;
        }
        let idle_for = Utc::now() - session.last_activity;
        if idle_for < chrono::Duration::seconds(policy.idle_threshold_secs as i64) {
            return;
        }
        let Some(attempt) = self.acquire("resume_on_idle", session).await else {
            return;
        };
        tracing::info!(session_id = %session.id, attempt, "resume-on-idle triggered");
        let spec = CommandSpec::PromptSession {
            session_id: session.id.clone(),
            message: policy.continuation_message.clone(),
        };
        self.dispatch_action("resume_on_idle", session, spec).await;
    }

    async fn check_restart_on_compaction(self: &Arc<Self>, session: &TrackedSession) {
        let policy = &self.config.restart_on_compaction;
        if !policy.enabled {
            return;
        }
        let over_tokens = session.tokens.total() >= policy.token_threshold;
        let over_compactions = session.compactions >= policy.compaction_threshold;
        if !over_tokens && !over_compactions {
            return;
        }
        let Some(attempt) = self.acquire("restart_on_compaction", session).await else {
            return;
        };
        tracing::info!(
            session_id = %session.id,
            attempt,
            tokens = session.tokens.total(),
            compactions = session.compactions,
            "restart-on-compaction triggered"
        );
        self.spawn_handover(session, policy.init_prompt.clone(), policy.handover_max_wait_secs);
    }

    async fn check_kill_on_cost(&self, session: &TrackedSession) {
        let policy = &self.config.kill_on_cost;
        if !policy.enabled {
            return;
        }
        let project_daily = match self.costs.daily_cost(&session.project).await {
            Ok(amount) => {
                if amount > 0.0 {
                    if let Err(err) = self.cost_repo.record(
                        &session.project,
                        "provider",
                        amount,
                        &Utc::now().date_naive().to_string(),
                    ) {
                        tracing::warn!(error = %err, "failed to persist cost record");
                    }
                }
                amount
            }
            Err(err) => {
                tracing::warn!(project = %session.project, error = %err, "cost provider failed");
                0.0
            }
        };
        if session.cost_usd < policy.cost_threshold_usd && project_daily < policy.cost_threshold_usd
        {
            return;
        }
        let Some(attempt) = self.acquire("kill_on_cost", session).await else {
            return;
        };
        tracing::warn!(
            session_id = %session.id,
            attempt,
            session_cost = session.cost_usd,
            project_daily,
            "kill-on-cost triggered"
        );
        let spec = CommandSpec::KillSession { session_id: session.id.clone() };
        self.dispatch_action("kill_on_cost", session, spec).await;
    }

    /// Consult the retry ledger; on first suppression emit the
    /// manual-intervention event.
    async fn acquire(&self, policy: &str, session: &TrackedSession) -> Option<u32> {
        match self
            .retries
            .try_acquire(policy, session.id.as_str(), Utc::now())
        {
            Permit::Allowed { attempt } => Some(attempt),
            Permit::Suppressed { first } => {
                if first {
                    tracing::warn!(policy, session_id = %session.id, "retry ceiling reached, suppressing");
                    self.emit(
                        session,
                        &format!("{policy}.manual_required"),
                        json!({
                            "policy": policy,
                            "max_retries": self.config.max_retries,
                        }),
                    )
                    .await;
                }
                None
            }
        }
    }

    async fn dispatch_action(&self, policy: &str, session: &TrackedSession, spec: CommandSpec) {
        let key =
            policy_idempotency_key(policy, session.id.as_str(), self.config.retry_reset_seconds);
        match self
            .dispatcher
            .dispatch(ACTOR, &session.project, spec, Some(key), Some(&self.shutdown))
            .await
        {
            Ok(dispatched) => {
                if dispatched.result.status == CommandStatus::Success {
                    self.retries.record_success(policy, session.id.as_str());
                }
            }
            Err(DispatchError::DuplicateInFlight { .. }) => {
                tracing::debug!(policy, session_id = %session.id, "action already in flight");
            }
            Err(err) => {
                tracing::warn!(policy, session_id = %session.id, error = %err, "policy dispatch failed");
            }
        }
    }

    fn spawn_handover(self: &Arc<Self>, session: &TrackedSession, init_prompt: String, max_wait_secs: u64) {
        self.handovers.lock().insert(session.id.clone());
        let params = HandoverParams {
            session_id: session.id.clone(),
            project: session.project.clone(),
            init_prompt,
            max_wait: Duration::from_secs(max_wait_secs),
            poll_interval: Duration::from_secs(1),
        };
        let engine = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let outcome = run_handover(
                &engine.cluster,
                &engine.dispatcher,
                ACTOR,
                &params,
                &engine.shutdown,
            )
            .await;
            engine.handovers.lock().remove(&session.id);
            match outcome {
                Ok(new_id) => {
                    engine
                        .retries
                        .record_success("restart_on_compaction", session.id.as_str());
                    engine
                        .emit(
                            &session,
                            "policy.handover_complete",
                            json!({"old_session_id": session.id, "new_session_id": new_id}),
                        )
                        .await;
                }
                Err(err) => {
                    tracing::warn!(session_id = %session.id, error = %err, "handover failed");
                    engine
                        .emit(
                            &session,
                            "policy.handover_failed",
                            json!({"error": err.to_string()}),
                        )
                        .await;
                }
            }
        });
    }

    async fn emit(&self, session: &TrackedSession, kind: &str, fields: serde_json::Value) {
        emit_event(&self.events, session, kind, fields).await;
    }
}

async fn emit_event(
    events: &mpsc::Sender<WorkerEvent>,
    session: &TrackedSession,
    kind: &str,
    fields: serde_json::Value,
) {
    let map = fields.as_object().cloned().unwrap_or_default();
    let event = WorkerEvent::new(session.node_id.clone(), Some(session.id.clone()), kind, map);
    if events.send(event).await.is_err() {
        tracing::debug!(kind, "policy event channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_core::command::CommandResult;
    use marshal_core::config::{DispatchConfig, HeartbeatConfig};
    use marshal_core::ids::NodeId;
    use marshal_core::resources::DegradedThresholds;
    use marshal_core::wire::ServerFrame;
    use marshal_dispatch::TransportRegistry;
    use marshal_store::Database;

    use crate::cost::FixedCostProvider;

    struct Fixture {
        engine: Arc<PolicyEngine>,
        cluster: Arc<Cluster>,
        node_id: NodeId,
        costs: Arc<FixedCostProvider>,
        policy_events: mpsc::Receiver<WorkerEvent>,
        seen_commands: Arc<Mutex<Vec<String>>>,
    }

    /// Wire a cluster, dispatcher, and a fake worker that records every
    /// command kind and answers according to `fail_kinds`.
    fn fixture(config: PolicyConfig, fail_kinds: &'static [&'static str]) -> Fixture {
        let cluster = Arc::new(Cluster::new(
            HeartbeatConfig::default(),
            DegradedThresholds::default(),
        ));
        let node_id = cluster.register("worker-a", "host1", vec!["api".into()], vec![]);
        let transports = Arc::new(TransportRegistry::new());
        let (tx, mut frames) = mpsc::channel::<ServerFrame>(32);
        transports.attach(node_id.clone(), tx);
        let db = Database::in_memory().unwrap();
        // Satisfy the sessions -> nodes foreign key
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO nodes (id, identity, hostname) VALUES (?1, 'worker-a', 'host1')",
                [node_id.to_string()],
            )?;
            Ok(())
        })
        .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            cluster.clone(),
            transports,
            db,
            DispatchConfig::default(),
        ));

        let seen_commands: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let dispatcher = dispatcher.clone();
            let cluster = cluster.clone();
            let seen = seen_commands.clone();
            tokio::spawn(async move {
                while let Some(frame) = frames.recv().await {
                    let ServerFrame::Command { command_id, spec } = frame else { continue };
                    seen.lock().push(spec.kind().to_string());
                    let result = if fail_kinds.contains(&spec.kind()) {
                        CommandResult::failure("worker refused", 2)
                    } else {
                        match &spec {
                            CommandSpec::Handover { session_id } => {
                                let _ = cluster.update_status(session_id, SessionStatus::Idle);
                                CommandResult::success(json!({}), 2)
                            }
                            CommandSpec::CreateSession { .. } => {
                                CommandResult::success(json!({"session_id": "sess_new"}), 5)
                            }
                            _ => CommandResult::success(json!({}), 2),
                        }
                    };
                    dispatcher.complete(&command_id, result);
                }
            });
        }

        let costs = Arc::new(FixedCostProvider::new());
        let (events_tx, policy_events) = mpsc::channel(32);
        let engine = Arc::new(PolicyEngine::new(
            cluster.clone(),
            dispatcher,
            Database::in_memory().unwrap(),
            costs.clone(),
            config,
            events_tx,
            CancellationToken::new(),
        ));
        Fixture { engine, cluster, node_id, costs, policy_events, seen_commands }
    }

    fn add_session(f: &Fixture, sid: &str, mutate: impl FnOnce(&mut TrackedSession)) {
        let mut session = TrackedSession::new(
            SessionId::from_raw(sid),
            f.node_id.clone(),
            "api",
            None,
        );
        mutate(&mut session);
        f.cluster.add_session(session).unwrap();
    }

    fn stale_idle(session: &mut TrackedSession) {
        session.status = SessionStatus::Idle;
        session.last_activity = Utc::now() - chrono::Duration::seconds(600);
    }

    #[tokio::test]
    async fn resume_on_idle_prompts_stale_sessions() {
        let f = fixture(PolicyConfig::default(), &[]);
        add_session(&f, "sess_1", stale_idle);
        // A fresh idle session stays untouched
        add_session(&f, "sess_2", |s| s.status = SessionStatus::Idle);

        f.engine.evaluate_once().await;
        assert_eq!(*f.seen_commands.lock(), vec!["prompt_session"]);
    }

    #[tokio::test]
    async fn running_sessions_not_resumed() {
        let f = fixture(PolicyConfig::default(), &[]);
        add_session(&f, "sess_1", |s| {
            s.last_activity = Utc::now() - chrono::Duration::seconds(600);
        });
        f.engine.evaluate_once().await;
        assert!(f.seen_commands.lock().is_empty());
    }

    #[tokio::test]
    async fn unreachable_sessions_skipped() {
        let f = fixture(PolicyConfig::default(), &[]);
        add_session(&f, "sess_1", stale_idle);
        f.cluster.mark_offline(&f.node_id).unwrap();
        f.cluster.register("worker-a", "host1", vec!["api".into()], vec![]);

        f.engine.evaluate_once().await;
        assert!(f.seen_commands.lock().is_empty());
    }

    #[tokio::test]
    async fn suppression_after_retry_ceiling_emits_once() {
        let config = PolicyConfig { max_retries: 2, ..Default::default() };
        let mut f = fixture(config, &["prompt_session"]);
        add_session(&f, "sess_1", stale_idle);

        for _ in 0..4 {
            f.engine.evaluate_once().await;
        }
        // Two attempts, then suppression; no further dispatches
        assert_eq!(*f.seen_commands.lock(), vec!["prompt_session", "prompt_session"]);

        let event = f.policy_events.recv().await.unwrap();
        assert_eq!(event.kind, "resume_on_idle.manual_required");
        assert!(f.policy_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn kill_on_cost_uses_provider_figure() {
        let config = PolicyConfig {
            kill_on_cost: marshal_core::config::KillOnCostConfig {
                enabled: true,
                cost_threshold_usd: 50.0,
            },
            ..Default::default()
        };
        let f = fixture(config, &[]);
        add_session(&f, "sess_1", |_| {});
        f.costs.set("api", 75.0);

        f.engine.evaluate_once().await;
        assert_eq!(*f.seen_commands.lock(), vec!["kill_session"]);
        let session = f.cluster.get_session(&SessionId::from_raw("sess_1")).unwrap();
        assert_eq!(session.status, SessionStatus::Killed);
    }

    #[tokio::test]
    async fn kill_on_cost_respects_threshold() {
        let config = PolicyConfig {
            kill_on_cost: marshal_core::config::KillOnCostConfig {
                enabled: true,
                cost_threshold_usd: 50.0,
            },
            ..Default::default()
        };
        let f = fixture(config, &[]);
        add_session(&f, "sess_1", |s| s.cost_usd = 10.0);
        f.costs.set("api", 20.0);

        f.engine.evaluate_once().await;
        assert!(f.seen_commands.lock().is_empty());
    }

    #[tokio::test]
    async fn compaction_pressure_runs_handover() {
        let mut f = fixture(PolicyConfig::default(), &[]);
        add_session(&f, "sess_old", |s| s.compactions = 3);

        f.engine.evaluate_once().await;

        // The handover runs as its own task; its completion event is the
        // signal that the swap finished.
        let event = tokio::time::timeout(Duration::from_secs(5), f.policy_events.recv())
            .await
            .expect("handover did not finish")
            .unwrap();
        assert_eq!(event.kind, "policy.handover_complete");

        let old = f.cluster.get_session(&SessionId::from_raw("sess_old")).unwrap();
        assert_eq!(old.status, SessionStatus::Killed);
        let new = f.cluster.get_session(&SessionId::from_raw("sess_new")).unwrap();
        assert_eq!(new.status, SessionStatus::Running);
        assert_eq!(
            *f.seen_commands.lock(),
            vec!["handover", "kill_session", "create_session"]
        );
    }

    #[tokio::test]
    async fn handover_failure_emits_event() {
        let mut f = fixture(PolicyConfig::default(), &["handover"]);
        add_session(&f, "sess_old", |s| s.compactions = 3);

        f.engine.evaluate_once().await;
        let event = tokio::time::timeout(Duration::from_secs(5), f.policy_events.recv())
            .await
            .expect("no failure event")
            .unwrap();
        assert_eq!(event.kind, "policy.handover_failed");
        // The session is left alone, not half-migrated
        let old = f.cluster.get_session(&SessionId::from_raw("sess_old")).unwrap();
        assert_eq!(old.status, SessionStatus::Running);
    }
}
