use anyhow::{Context, Result, bail};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zelana_pubkey::Pubkey;
use zelana_signature::Signature;

/// A worker's signing keypair.
/// NEVER expose this struct's internals.
pub struct Keypair {
    signing_key: SigningKey,
}

/// On-disk form of a keypair file.
#[derive(Serialize, Deserialize)]
struct KeypairFile {
    public_key: Pubkey,
    secret_key: String,
}

impl Keypair {
    /// Generates a fresh random keypair.
    pub fn new_random() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstructs a keypair from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey::from(self.signing_key.verifying_key())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg).into()
    }

    /// Reads a keypair file written by [`Keypair::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading keypair file {}", path.display()))?;
        let file: KeypairFile = serde_json::from_str(&raw).context("parsing keypair file")?;

        let secret = hex::decode(&file.secret_key).context("secret key is not hex")?;
        let seed: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("secret key must be 32 bytes, got {}", secret.len()))?;

        let keypair = Self::from_seed(&seed);
        if keypair.pubkey() != file.public_key {
            bail!("public key in {} does not match its secret key", path.display());
        }
        Ok(keypair)
    }

    /// Writes the keypair as JSON. Creates parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let file = KeypairFile {
            public_key: self.pubkey(),
            secret_key: hex::encode(self.signing_key.to_bytes()),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
