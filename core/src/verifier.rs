//! Verifier Client
//!
//! Narrow client to the out-of-process proof verification engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zelana_config::VerifierConfig;

use crate::store::TaskId;

/// Checks a submitted proof. `Err` means the verifier could not answer.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(&self, task_id: TaskId, proof: &[u8]) -> Result<bool>;
}

/// Accepts every proof without contacting anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockVerifier;

#[async_trait]
impl ProofVerifier for MockVerifier {
    async fn verify(&self, task_id: TaskId, _proof: &[u8]) -> Result<bool> {
        debug!(task_id, "mock verifier accepting proof");
        Ok(true)
    }
}

#[derive(Serialize)]
struct VerifyRequest {
    task_id: TaskId,
    proof: String,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
}

/// Verifier engine reached over HTTP: `POST {endpoint}/verify`.
pub struct HttpVerifier {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpVerifier {
    pub fn new(endpoint: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to create HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ProofVerifier for HttpVerifier {
    async fn verify(&self, task_id: TaskId, proof: &[u8]) -> Result<bool> {
        let url = format!("{}/verify", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&VerifyRequest {
                task_id,
                proof: hex::encode(proof),
            })
            .send()
            .await
            .with_context(|| format!("verifier request to {url} failed"))?;

        if !response.status().is_success() {
            bail!("verifier returned HTTP {}", response.status());
        }

        let body: VerifyResponse = response
            .json()
            .await
            .context("verifier returned a malformed response")?;
        Ok(body.valid)
    }
}

/// Builds the verifier described by `[verifier]`.
pub fn verifier_from_config(config: &VerifierConfig) -> Result<Arc<dyn ProofVerifier>> {
    if config.mock_mode {
        info!("Verifier: mock mode");
        return Ok(Arc::new(MockVerifier));
    }
    let endpoint = config
        .endpoint
        .as_deref()
        .context("verifier.endpoint is required when mock_mode = false")?;
    info!("Verifier: {}", endpoint);
    let verifier = HttpVerifier::new(endpoint, config.timeout_secs.map(Duration::from_secs))?;
    Ok(Arc::new(verifier))
}
