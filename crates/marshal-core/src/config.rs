//! Layered configuration: compiled defaults, deep-merged JSON file,
//! `MARSHAL_*` environment overrides (highest priority).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::resources::DegradedThresholds;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid {key} override: {value}")]
    BadOverride { key: &'static str, value: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9440, max_send_queue: 256 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        Self { db_path: home.join(".marshal/marshal.db") }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// Missed-heartbeat count before a node is declared offline.
    pub timeout_count: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_secs: 15, timeout_count: 3 }
    }
}

impl HeartbeatConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs * self.timeout_count as u64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub timeout_secs: u64,
    pub idempotency_ttl_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { timeout_secs: 60, idempotency_ttl_secs: 3600 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeOnIdleConfig {
    pub enabled: bool,
    pub idle_threshold_secs: u64,
    pub continuation_message: String,
}

impl Default for ResumeOnIdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_threshold_secs: 300,
            continuation_message: "Continue with the current task.".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartOnCompactionConfig {
    pub enabled: bool,
    pub token_threshold: u64,
    pub compaction_threshold: u32,
    pub handover_max_wait_secs: u64,
    pub init_prompt: String,
}

impl Default for RestartOnCompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_threshold: 150_000,
            compaction_threshold: 3,
            handover_max_wait_secs: 120,
            init_prompt: "Read PROGRESS.md and continue the task recorded there.".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KillOnCostConfig {
    pub enabled: bool,
    pub cost_threshold_usd: f64,
}

impl Default for KillOnCostConfig {
    fn default() -> Self {
        Self { enabled: false, cost_threshold_usd: 50.0 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub check_interval_secs: u64,
    pub max_retries: u32,
    pub retry_reset_seconds: u64,
    pub resume_on_idle: ResumeOnIdleConfig,
    pub restart_on_compaction: RestartOnCompactionConfig,
    pub kill_on_cost: KillOnCostConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            max_retries: 3,
            retry_reset_seconds: 1800,
            resume_on_idle: ResumeOnIdleConfig::default(),
            restart_on_compaction: RestartOnCompactionConfig::default(),
            kill_on_cost: KillOnCostConfig::default(),
        }
    }
}

/// Declarative predicate-to-sink mapping, immutable after load except
/// through explicit reconfiguration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    pub name: String,
    pub predicate: String,
    pub sink: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarshalConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub heartbeat: HeartbeatConfig,
    pub degraded: DegradedThresholds,
    pub dispatch: DispatchConfig,
    pub policies: PolicyConfig,
    pub routes: Vec<RouteRuleConfig>,
}

impl MarshalConfig {
    /// Load from an optional JSON file, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_owned(),
                    source,
                })?;
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: p.to_owned(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("MARSHAL_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::BadOverride { key: "MARSHAL_PORT", value: port })?;
        }
        if let Ok(db) = std::env::var("MARSHAL_DB_PATH") {
            self.store.db_path = PathBuf::from(db);
        }
        if let Ok(interval) = std::env::var("MARSHAL_CHECK_INTERVAL_SECS") {
            self.policies.check_interval_secs = interval.parse().map_err(|_| {
                ConfigError::BadOverride { key: "MARSHAL_CHECK_INTERVAL_SECS", value: interval }
            })?;
        }
        Ok(())
    }
}
