use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An Ed25519 worker public key.
///
/// Text form is lowercase hex, which is also how it travels on the wire and
/// how it keys the coordinator's worker registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey(pub [u8; 32]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PubkeyError {
    #[error("invalid hex in public key: {0}")]
    InvalidHex(String),

    #[error("public key must be {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("public key is not a valid ed25519 point")]
    InvalidPoint,

    #[error("public key is a small-order point")]
    WeakKey,
}

impl Pubkey {
    pub const LEN: usize = 32;

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses the key as an ed25519 verifying key. Small-order keys are
    /// refused since any signature can be made to verify under them.
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, PubkeyError> {
        let vk = VerifyingKey::from_bytes(&self.0).map_err(|_| PubkeyError::InvalidPoint)?;
        if vk.is_weak() {
            return Err(PubkeyError::WeakKey);
        }
        Ok(vk)
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<VerifyingKey> for Pubkey {
    fn from(vk: VerifyingKey) -> Self {
        Self(vk.to_bytes())
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self)
    }
}

impl FromStr for Pubkey {
    type Err = PubkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| PubkeyError::InvalidHex(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PubkeyError::InvalidLength {
                expected: Self::LEN,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
