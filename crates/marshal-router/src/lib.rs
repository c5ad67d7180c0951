//! Rule-based event routing: small boolean predicates over event kind and
//! fields, mapped to named sinks. Evaluation is pure; delivery runs as a
//! separate task so a slow sink never blocks event ingestion.

mod delivery;
mod predicate;
mod router;

pub use delivery::{spawn_delivery, LogDelivery, RouteMatch, SinkDelivery};
pub use predicate::{Predicate, PredicateError};
pub use router::{RouteRule, Router};
