//! The supervisor's network surface: the worker WebSocket endpoint, the
//! operator command endpoint, and the event pipeline that persists and
//! routes everything flowing through them.

pub mod rpc;
pub mod server;
pub mod worker;

pub use server::{build_router, start, AppState, ServerHandle};
