//! Operator-facing command submission: one POST endpoint taking the
//! command envelope and returning the dispatch outcome. Chat-bot and CLI
//! adapters are plain consumers of this surface.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use marshal_core::command::{CommandSpec, CommandStatus};
use marshal_core::ids::CommandId;
use marshal_dispatch::DispatchError;

use crate::server::AppState;

/// `{type, target:{project}, args}` as submitted by operator channels.
#[derive(Debug, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub command_type: String,
    pub target: CommandTarget,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandTarget {
    pub project: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub command_id: CommandId,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

fn error_response(status: StatusCode, code: &'static str, message: String) -> Response {
    (status, Json(ErrorBody { error: ErrorDetail { code, message } })).into_response()
}

fn dispatch_error_response(err: DispatchError) -> Response {
    let (status, code) = match &err {
        DispatchError::Validation(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGS"),
        DispatchError::NoNodeForProject(_) => (StatusCode::NOT_FOUND, "NO_NODE_FOR_PROJECT"),
        DispatchError::NoTransport(_) | DispatchError::TransportClosed(_) => {
            (StatusCode::BAD_GATEWAY, "TRANSPORT")
        }
        DispatchError::DuplicateInFlight { .. } => (StatusCode::CONFLICT, "DUPLICATE_IN_FLIGHT"),
        DispatchError::Cancelled(_) => (StatusCode::BAD_GATEWAY, "CANCELLED"),
        DispatchError::Cluster(_) | DispatchError::Store(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    };
    error_response(status, code, err.to_string())
}

pub(crate) async fn rpc_handler(
    State(state): State<AppState>,
    Json(envelope): Json<CommandEnvelope>,
) -> Response {
    state.metrics.increment("rpc.commands", 1);
    let spec = match CommandSpec::from_envelope(&envelope.command_type, &envelope.args) {
        Ok(spec) => spec,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, "INVALID_ARGS", err.to_string())
        }
    };

    match state
        .dispatcher
        .dispatch(
            "operator",
            &envelope.target.project,
            spec,
            envelope.idempotency_key,
            None,
        )
        .await
    {
        Ok(dispatched) => Json(CommandResponse {
            command_id: dispatched.command_id,
            status: dispatched.result.status,
            output: dispatched.result.output,
            error: dispatched.result.error,
        })
        .into_response(),
        Err(err) => dispatch_error_response(err),
    }
}
