//! Automated remediation: a periodic evaluator that turns tracker state
//! into dispatched commands, bounded by per-target retry ceilings and
//! cooldown windows so transient conditions cannot cause restart storms.

mod cost;
mod engine;
mod handover;
mod retry;

pub use cost::{CostProvider, FixedCostProvider};
pub use engine::PolicyEngine;
pub use handover::{run_handover, HandoverError, HandoverParams};
pub use retry::{Permit, RetryLedger};
