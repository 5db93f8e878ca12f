//! Zelana Proof Coordinator
//!
//! Hands block-trace proving tasks to remote prover workers, collects their
//! proofs, and records verified results.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Proof Coordinator                         │
//! │                                                               │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │ Worker TCP   │   │   Manager    │   │   Debug API      │   │
//! │  │ (zephyr)     │◀─▶│ (sessions)   │◀──│   (axum)         │   │
//! │  └──────┬───────┘   └──────┬───────┘   └──────────────────┘   │
//! │         │                  │                                  │
//! │         ▼                  ▼                                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │  Registry    │   │  Task Store  │   │   Verifier       │   │
//! │  │ (dashmap)    │   │  (RocksDB)   │   │   (HTTP / mock)  │   │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘   │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod coordinator;
pub mod server;
pub mod store;
pub mod verifier;
