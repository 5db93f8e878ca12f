use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use zelana_pubkey::{Pubkey, PubkeyError};

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 64]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid hex in signature: {0}")]
    InvalidHex(String),

    #[error("signature must be {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error(transparent)]
    Pubkey(#[from] PubkeyError),

    #[error("signature does not verify")]
    Mismatch,
}

impl Signature {
    pub const LEN: usize = 64;

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidLength {
                expected: Self::LEN,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Checks this signature over `msg` against `signer`.
    ///
    /// Strict verification: small-order `R` components and non-canonical
    /// encodings are refused.
    pub fn verify(&self, signer: &Pubkey, msg: &[u8]) -> Result<(), SignatureError> {
        let vk = signer.to_verifying_key()?;
        let sig = ed25519_dalek::Signature::from_bytes(&self.0);
        vk.verify_strict(msg, &sig)
            .map_err(|_| SignatureError::Mismatch)
    }
}

impl From<ed25519_dalek::Signature> for Signature {
    fn from(sig: ed25519_dalek::Signature) -> Self {
        Self(sig.to_bytes())
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(&s))
            .map_err(|e| serde::de::Error::custom(SignatureError::InvalidHex(e.to_string())))?;
        Signature::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}
