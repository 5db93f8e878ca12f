use crate::identity::AuthEnvelope;
use serde::{Deserialize, Serialize};

/// One block's execution trace. The trace body is opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTrace {
    pub number: u64,
    pub hash: String,
    pub trace: serde_json::Value,
}

/// A proving task pushed to a worker. `id` doubles as the session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMsg {
    pub id: u64,
    pub traces: Vec<BlockTrace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofStatus {
    Ok,
    ProofError,
}

/// A worker's answer for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofMsg {
    pub id: u64,
    pub status: ProofStatus,
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub proof: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProofMsg {
    pub fn ok(id: u64, proof: Vec<u8>) -> Self {
        Self {
            id,
            status: ProofStatus::Ok,
            proof: Some(proof),
            error: None,
        }
    }

    pub fn failed(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            status: ProofStatus::ProofError,
            proof: None,
            error: Some(error.into()),
        }
    }
}

/// Coordinator's reply to a `Proof` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub id: u64,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Frame {
    Register(AuthEnvelope),
    BlockTrace(TaskMsg),
    Proof(ProofMsg),
    SubmitAck(SubmitAck),
    Ping(u64),
    Pong(u64),
    Error(String),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register(_) => "Register",
            Frame::BlockTrace(_) => "BlockTrace",
            Frame::Proof(_) => "Proof",
            Frame::SubmitAck(_) => "SubmitAck",
            Frame::Ping(_) => "Ping",
            Frame::Pong(_) => "Pong",
            Frame::Error(_) => "Error",
        }
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| hex::decode(s.strip_prefix("0x").unwrap_or(&s)))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
