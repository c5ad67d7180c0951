//! At-most-once command dispatch: validate, claim the idempotency key,
//! resolve the target node, send over its live transport, and correlate
//! the response by command id.

mod dispatcher;
mod error;
mod transport;

pub use dispatcher::{policy_idempotency_key, session_row, Dispatched, Dispatcher};
pub use error::DispatchError;
pub use transport::TransportRegistry;
