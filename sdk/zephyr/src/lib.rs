//! Zephyr: the wire protocol spoken between the coordinator and prover workers.
//!
//! Every frame is a JSON object `{"type": ..., "payload": ...}` inside a 4-byte
//! big-endian length prefix. A worker opens a TCP connection, sends exactly one
//! `Register` frame carrying a signed [`AuthEnvelope`], and from then on receives
//! `BlockTrace` tasks and answers with `Proof` frames.

#[cfg(feature = "async")]
pub mod client;
pub mod codec;
pub mod identity;
pub mod message;

#[cfg(feature = "async")]
pub use client::WorkerClient;
pub use codec::{DEFAULT_MAX_FRAME_BYTES, FrameCodec};
pub use identity::{AuthEnvelope, WorkerIdentity};
pub use message::{BlockTrace, Frame, ProofMsg, ProofStatus, SubmitAck, TaskMsg};

use thiserror::Error;
use zelana_signature::SignatureError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected {expected} frame, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error("bad signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("connection closed")]
    Closed,

    #[error("rejected by coordinator: {0}")]
    Rejected(String),
}
