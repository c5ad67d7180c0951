//! Command model: the tagged union of everything the supervisor can ask a
//! worker to do, with boundary validation so malformed arguments never enter
//! the dispatch pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CommandId, SessionId};

/// A fully-typed command ready for dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandSpec {
    CreateSession {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    PromptSession {
        session_id: SessionId,
        message: String,
    },
    SessionStatus {
        session_id: SessionId,
    },
    KillSession {
        session_id: SessionId,
    },
    RestartSession {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        init_prompt: Option<String>,
    },
    /// Instruct the worker to persist session progress and commit it,
    /// ahead of a kill/create handover.
    Handover {
        session_id: SessionId,
    },
    EnvCheck,
    EnvProvision {
        manifest: String,
    },
    AgentMdSync,
}

/// Rejected before any network call; never retried automatically.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown command type: {0}")]
    UnknownType(String),
    #[error("missing required argument: {0}")]
    MissingArg(&'static str),
    #[error("argument {0} must not be empty")]
    EmptyArg(&'static str),
}

impl CommandSpec {
    /// Wire name for this command type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateSession { .. } => "create_session",
            Self::PromptSession { .. } => "prompt_session",
            Self::SessionStatus { .. } => "session_status",
            Self::KillSession { .. } => "kill_session",
            Self::RestartSession { .. } => "restart_session",
            Self::Handover { .. } => "handover",
            Self::EnvCheck => "env_check",
            Self::EnvProvision { .. } => "env_provision",
            Self::AgentMdSync => "agentmd_sync",
        }
    }

    /// The session this command addresses, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::PromptSession { session_id, .. }
            | Self::SessionStatus { session_id }
            | Self::KillSession { session_id }
            | Self::RestartSession { session_id, .. }
            | Self::Handover { session_id } => Some(session_id),
            _ => None,
        }
    }

    /// Check required-argument shape. Typed construction already rules out
    /// missing fields; this catches empty strings smuggled through.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::CreateSession { prompt, .. } if prompt.is_empty() => {
                Err(ValidationError::EmptyArg("prompt"))
            }
            Self::PromptSession { session_id, message } => {
                if session_id.as_str().is_empty() {
                    Err(ValidationError::EmptyArg("session_id"))
                } else if message.is_empty() {
                    Err(ValidationError::EmptyArg("message"))
                } else {
                    Ok(())
                }
            }
            Self::SessionStatus { session_id }
            | Self::KillSession { session_id }
            | Self::RestartSession { session_id, .. }
            | Self::Handover { session_id }
                if session_id.as_str().is_empty() =>
            {
                Err(ValidationError::EmptyArg("session_id"))
            }
            Self::EnvProvision { manifest } if manifest.is_empty() => {
                Err(ValidationError::EmptyArg("manifest"))
            }
            _ => Ok(()),
        }
    }

    /// Parse an operator envelope `{type, args}` into a typed command.
    pub fn from_envelope(command_type: &str, args: &Value) -> Result<Self, ValidationError> {
        let spec = match command_type {
            "create_session" => Self::CreateSession {
                prompt: require_str(args, "prompt")?,
                model: optional_str(args, "model"),
            },
            "prompt_session" => Self::PromptSession {
                session_id: require_session(args)?,
                message: require_str(args, "message")?,
            },
            "session_status" => Self::SessionStatus {
                session_id: require_session(args)?,
            },
            "kill_session" => Self::KillSession {
                session_id: require_session(args)?,
            },
            "restart_session" => Self::RestartSession {
                session_id: require_session(args)?,
                init_prompt: optional_str(args, "init_prompt"),
            },
            "handover" => Self::Handover {
                session_id: require_session(args)?,
            },
            "env_check" => Self::EnvCheck,
            "env_provision" => Self::EnvProvision {
                manifest: require_str(args, "manifest")?,
            },
            "agentmd_sync" => Self::AgentMdSync,
            other => return Err(ValidationError::UnknownType(other.to_string())),
        };
        spec.validate()?;
        Ok(spec)
    }
}

fn require_str(args: &Value, key: &'static str) -> Result<String, ValidationError> {
    match args.get(key).and_then(|v| v.as_str()) {
        Some("") => Err(ValidationError::EmptyArg(key)),
        Some(s) => Ok(s.to_string()),
        None => Err(ValidationError::MissingArg(key)),
    }
}

fn optional_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn require_session(args: &Value) -> Result<SessionId, ValidationError> {
    require_str(args, "session_id").map(SessionId::from_raw)
}

/// Terminal-or-pending state of a dispatched command. Transitions exactly
/// once from `Pending` to one of the terminal states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Success,
    Failure,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

/// Correlated worker response (or locally synthesized timeout/failure).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(output: Value, duration_ms: u64) -> Self {
        Self {
            status: CommandStatus::Success,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: CommandStatus::Failure,
            output: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self {
            status: CommandStatus::Timeout,
            output: None,
            error: Some("dispatch timeout".into()),
            duration_ms,
        }
    }
}

/// A command together with its assigned identifier and resolved outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: CommandId,
    pub kind: String,
    pub project: String,
    pub result: CommandResult,
}
