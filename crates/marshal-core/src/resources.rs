use serde::{Deserialize, Serialize};

/// Point-in-time resource reading reported by a worker with each heartbeat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    #[serde(default)]
    pub cpu_pct: f64,
    #[serde(default)]
    pub ram_pct: f64,
    #[serde(default)]
    pub disk_pct: f64,
}

/// Thresholds above which a node is considered degraded.
/// Degraded is advisory only; it never cascades to session status.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DegradedThresholds {
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub disk_pct: f64,
}

impl Default for DegradedThresholds {
    fn default() -> Self {
        Self {
            cpu_pct: 90.0,
            ram_pct: 90.0,
            disk_pct: 95.0,
        }
    }
}

impl DegradedThresholds {
    pub fn exceeded_by(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.cpu_pct > self.cpu_pct
            || snapshot.ram_pct > self.ram_pct
            || snapshot.disk_pct > self.disk_pct
    }
}
