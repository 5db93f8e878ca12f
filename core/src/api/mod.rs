//! API Module
//!
//! Operator-facing HTTP API: health, worker and session introspection, and
//! task enqueueing.

pub mod handlers;
pub mod routes;
pub mod types;

pub use handlers::ApiState;
pub use routes::create_router;
