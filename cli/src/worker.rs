//! Mock prover worker.
//!
//! Registers with the coordinator and answers every task with a
//! deterministic stand-in proof, or a proving error at a configured rate.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use zelana_keypair::Keypair;
use zephyr::{BlockTrace, ProofMsg, TaskMsg, WorkerClient};

pub struct WorkerArgs {
    pub coordinator: String,
    pub keypair: Keypair,
    pub name: String,
    pub fail_rate: f64,
    pub delay_ms: u64,
}

pub async fn run(args: WorkerArgs) -> Result<()> {
    let mut client = WorkerClient::connect(
        &args.coordinator,
        &args.keypair,
        &args.name,
        env!("CARGO_PKG_VERSION"),
    )
    .await
    .with_context(|| format!("Failed to connect to {}", args.coordinator))?;

    info!(
        coordinator = %args.coordinator,
        worker = %args.name,
        pubkey = %client.pubkey(),
        "mock prover registered"
    );

    while let Some(task) = client.next_task().await? {
        info!(task_id = task.id, blocks = task.traces.len(), "task received");
        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;

        let proof = prove(&task, args.fail_rate)?;
        let accepted = client.submit_proof(proof).await?;
        if accepted {
            info!(task_id = task.id, "proof accepted");
        } else {
            warn!(task_id = task.id, "proof not accepted");
        }
    }

    info!("coordinator closed the connection");
    Ok(())
}

fn prove(task: &TaskMsg, fail_rate: f64) -> Result<ProofMsg> {
    if fail_rate > 0.0 && rand::thread_rng().gen_bool(fail_rate.min(1.0)) {
        return Ok(ProofMsg::failed(task.id, "mock prover: injected failure"));
    }
    Ok(ProofMsg::ok(task.id, mock_proof(&task.traces)?.to_vec()))
}

/// SHA-256 over the JSON-encoded traces.
pub fn mock_proof(traces: &[BlockTrace]) -> Result<[u8; 32]> {
    let bytes = serde_json::to_vec(traces)?;
    Ok(Sha256::digest(&bytes).into())
}
