//! Context-handover sequence: persist progress, wait for the session to
//! settle, kill it, and recreate it from the persisted state. Each step
//! waits for the previous step's terminal result, which is what makes the
//! kill/create pair causally ordered for the project.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use marshal_cluster::Cluster;
use marshal_core::command::{CommandResult, CommandSpec, CommandStatus};
use marshal_core::ids::SessionId;
use marshal_core::status::SessionStatus;
use marshal_dispatch::{DispatchError, Dispatcher};

#[derive(Clone, Debug)]
pub struct HandoverParams {
    pub session_id: SessionId,
    pub project: String,
    pub init_prompt: String,
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum HandoverError {
    #[error("handover cancelled before completion")]
    Cancelled,

    #[error("handover step {step} failed: {detail}")]
    StepFailed { step: &'static str, detail: String },

    #[error("session did not reach idle within {0:?}")]
    IdleTimeout(Duration),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

fn require_success(step: &'static str, result: &CommandResult) -> Result<(), HandoverError> {
    if result.status == CommandStatus::Success {
        return Ok(());
    }
    Err(HandoverError::StepFailed {
        step,
        detail: result
            .error
            .clone()
            .unwrap_or_else(|| result.status.to_string()),
    })
}

/// Run the full sequence for one session, returning the replacement
/// session's id. Cancellation aborts the in-flight step and issues no
/// further ones; worker-side effects of an already-sent command are left
/// to settle on their own.
#[instrument(skip_all, fields(session_id = %params.session_id, project = %params.project))]
pub async fn run_handover(
    cluster: &Cluster,
    dispatcher: &Dispatcher,
    actor: &str,
    params: &HandoverParams,
    cancel: &CancellationToken,
) -> Result<SessionId, HandoverError> {
    if cancel.is_cancelled() {
        return Err(HandoverError::Cancelled);
    }

    // 1. Persist progress and commit it worker-side.
    let handed = dispatcher
        .dispatch(
            actor,
            &params.project,
            CommandSpec::Handover { session_id: params.session_id.clone() },
            None,
            Some(cancel),
        )
        .await?;
    require_success("handover", &handed.result)?;

    // 2. Wait for the session to settle before killing it.
    let deadline = Instant::now() + params.max_wait;
    loop {
        if cancel.is_cancelled() {
            return Err(HandoverError::Cancelled);
        }
        match cluster.get_session(&params.session_id) {
            Ok(session) if session.status == SessionStatus::Idle => break,
            Ok(_) => {}
            Err(err) => {
                return Err(HandoverError::StepFailed {
                    step: "await_idle",
                    detail: err.to_string(),
                })
            }
        }
        if Instant::now() >= deadline {
            return Err(HandoverError::IdleTimeout(params.max_wait));
        }
        tokio::time::sleep(params.poll_interval).await;
    }

    if cancel.is_cancelled() {
        return Err(HandoverError::Cancelled);
    }

    // 3. Kill the old session (dispatch marks it terminal in the tracker).
    let killed = dispatcher
        .dispatch(
            actor,
            &params.project,
            CommandSpec::KillSession { session_id: params.session_id.clone() },
            None,
            Some(cancel),
        )
        .await?;
    require_success("kill_session", &killed.result)?;

    if cancel.is_cancelled() {
        return Err(HandoverError::Cancelled);
    }

    // 4. Recreate from the persisted progress.
    let model = cluster
        .get_session(&params.session_id)
        .ok()
        .and_then(|s| s.model);
    let created = dispatcher
        .dispatch(
            actor,
            &params.project,
            CommandSpec::CreateSession { prompt: params.init_prompt.clone(), model },
            None,
            Some(cancel),
        )
        .await?;
    require_success("create_session", &created.result)?;

    let new_id = created
        .result
        .output
        .as_ref()
        .and_then(|o| o.get("session_id"))
        .and_then(|v| v.as_str())
        .map(SessionId::from_raw)
        .ok_or(HandoverError::StepFailed {
            step: "create_session",
            detail: "no session_id in output".into(),
        })?;

    tracing::info!(old = %params.session_id, new = %new_id, "handover complete");
    Ok(new_id)
}
