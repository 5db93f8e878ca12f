//! Proof Coordination
//!
//! Worker registry, proof sessions and the manager that ties them together.

pub mod error;
pub mod manager;
pub mod registry;
pub mod selection;
pub mod session;

pub use error::CoordinatorError;
pub use manager::{Manager, ManagerConfig, WorkerInfo};
pub use registry::{WorkerRegistry, WorkerSnapshot};
pub use selection::select_winner;
pub use session::{FailedSession, SessionInfo, SessionStore, WorkerOutcome};
