use serde::{Deserialize, Serialize};

/// Node liveness. `online` requires a live transport and fresh heartbeats;
/// `degraded` means heartbeats continue but resources crossed thresholds;
/// `offline` is the only state that cascades to owned sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
}

impl NodeStatus {
    /// Online and degraded nodes both have a live transport.
    pub fn is_connected(&self) -> bool {
        !matches!(self, Self::Offline)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "degraded" => Ok(Self::Degraded),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// Lifecycle of one tracked session. `unreachable` is derived from the
/// owning node going offline and is never reported by workers; `killed`
/// is terminal and makes all further mutations no-ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Idle,
    Error,
    Unreachable,
    Killed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Killed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Unreachable => "unreachable",
            Self::Killed => "killed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "idle" => Ok(Self::Idle),
            "error" => Ok(Self::Error),
            "unreachable" => Ok(Self::Unreachable),
            "killed" => Ok(Self::Killed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_status_roundtrip() {
        for s in ["online", "degraded", "offline"] {
            let parsed: NodeStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("booting".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn session_status_roundtrip() {
        for s in ["running", "idle", "error", "unreachable", "killed"] {
            let parsed: SessionStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn only_killed_is_terminal() {
        assert!(SessionStatus::Killed.is_terminal());
        assert!(!SessionStatus::Unreachable.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }

    #[test]
    fn connected_states() {
        assert!(NodeStatus::Online.is_connected());
        assert!(NodeStatus::Degraded.is_connected());
        assert!(!NodeStatus::Offline.is_connected());
    }
}
