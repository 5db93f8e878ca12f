//! Debug API queries.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use zephyr::BlockTrace;

async fn print_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .context("Coordinator returned a non-JSON body")?;
    if !status.is_success() {
        bail!(
            "HTTP {}: {}",
            status,
            body.get("error").and_then(Value::as_str).unwrap_or("unknown error")
        );
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn workers(api: &str) -> Result<()> {
    let url = format!("{}/debug/workers", api.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("GET {url} failed"))?;
    print_response(response).await
}

pub async fn session(api: &str, id: u64) -> Result<()> {
    let url = format!("{}/debug/sessions/{id}", api.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("GET {url} failed"))?;
    print_response(response).await
}

pub async fn task(api: &str, id: u64) -> Result<()> {
    let url = format!("{}/debug/tasks/{id}", api.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("GET {url} failed"))?;
    print_response(response).await
}

pub async fn enqueue(api: &str, file: &Path) -> Result<()> {
    let traces = read_traces(file)?;
    let url = format!("{}/debug/tasks", api.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({ "traces": traces }))
        .send()
        .await
        .with_context(|| format!("POST {url} failed"))?;
    print_response(response).await
}

fn read_traces(file: &Path) -> Result<Vec<BlockTrace>> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let traces: Vec<BlockTrace> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of block traces", file.display()))?;
    if traces.is_empty() {
        bail!("{} contains no block traces", file.display());
    }
    Ok(traces)
}
