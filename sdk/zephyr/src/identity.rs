use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zelana_keypair::Keypair;
use zelana_pubkey::Pubkey;
use zelana_signature::Signature;

/// Who a worker claims to be. Field order is part of the hash.
///
/// `timestamp` (unix seconds) and `nonce` make every envelope unique, so the
/// coordinator can refuse stale or replayed registrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub name: String,
    pub public_key: Pubkey,
    pub version: String,
    pub timestamp: i64,
    #[serde(default)]
    pub nonce: u64,
}

impl WorkerIdentity {
    pub fn new(name: impl Into<String>, public_key: Pubkey, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public_key,
            version: version.into(),
            timestamp: chrono::Utc::now().timestamp(),
            nonce: rand::random(),
        }
    }

    /// SHA-256 of the compact JSON encoding.
    pub fn hash(&self) -> Result<[u8; 32], ProtocolError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(Sha256::digest(&bytes).into())
    }
}

/// A [`WorkerIdentity`] plus the worker's signature over its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEnvelope {
    pub identity: WorkerIdentity,
    pub signature: Signature,
}

impl AuthEnvelope {
    pub fn sign(identity: WorkerIdentity, keypair: &Keypair) -> Result<Self, ProtocolError> {
        let hash = identity.hash()?;
        Ok(Self {
            signature: keypair.sign(&hash),
            identity,
        })
    }

    /// Checks the signature against the key the identity declares.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let hash = self.identity.hash()?;
        self.signature.verify(&self.identity.public_key, &hash)?;
        Ok(())
    }

    pub fn pubkey(&self) -> Pubkey {
        self.identity.public_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(kp: &Keypair) -> AuthEnvelope {
        let identity = WorkerIdentity::new("prover-1", kp.pubkey(), "v0.1.0");
        AuthEnvelope::sign(identity, kp).unwrap()
    }

    #[test]
    fn test_signed_envelope_verifies() {
        let kp = Keypair::new_random();
        assert!(envelope(&kp).verify().is_ok());
    }

    #[test]
    fn test_tampered_identity_fails() {
        let kp = Keypair::new_random();
        let mut env = envelope(&kp);
        env.identity.name = "someone-else".into();
        assert!(matches!(env.verify(), Err(ProtocolError::Signature(_))));
    }

    #[test]
    fn test_small_order_key_forgery_fails() {
        let mut weak = [0u8; 32];
        weak[0] = 1;
        let mut forged = [0u8; 64];
        forged[0] = 1;
        let env = AuthEnvelope {
            identity: WorkerIdentity::new("nobody-owns-this-key", Pubkey(weak), "v0.1.0"),
            signature: Signature(forged),
        };
        assert!(matches!(env.verify(), Err(ProtocolError::Signature(_))));
    }

    #[test]
    fn test_envelopes_are_unique() {
        let kp = Keypair::from_seed(&[4u8; 32]);
        assert_ne!(envelope(&kp).signature, envelope(&kp).signature);
    }

    #[test]
    fn test_mismatched_pubkey_fails() {
        let kp = Keypair::new_random();
        let other = Keypair::new_random();
        let mut env = envelope(&kp);
        env.identity.public_key = other.pubkey();
        assert!(env.verify().is_err());
    }

    #[test]
    fn test_hash_is_stable_across_json_round_trip() {
        let kp = Keypair::from_seed(&[4u8; 32]);
        let env = envelope(&kp);
        let json = serde_json::to_string(&env).unwrap();
        let back: AuthEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.identity.hash().unwrap(), env.identity.hash().unwrap());
        assert!(back.verify().is_ok());
    }
}
