//! Durable store for the supervisor: SQLite-backed system of record for
//! nodes, sessions, events, costs, command idempotency, and the audit log.
//! Schema versioning is handled by checksum-verified ordered migrations
//! applied once at open, before any other component touches the database.

pub mod audit;
pub mod costs;
pub mod database;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod migrations;
pub mod nodes;
pub mod row_helpers;
pub mod sessions;

pub use audit::{AuditEntry, AuditRepo};
pub use costs::CostRepo;
pub use database::Database;
pub use error::StoreError;
pub use events::EventRepo;
pub use idempotency::{Claim, IdempotencyRepo};
pub use nodes::{NodeRepo, NodeRow};
pub use sessions::{SessionRepo, SessionRow};
