mod query;
mod worker;

use std::fs;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use zelana_config::CoordinatorConfig;
use zelana_keypair::Keypair;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "zelana")]
#[command(about = "Zelana proof coordinator tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new worker keypair
    Keygen {
        /// Output file (default: ~/.zelana/worker.json)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run a mock prover worker against a coordinator
    Worker {
        /// Coordinator worker address
        #[arg(long, env = "ZL_COORDINATOR", default_value = "127.0.0.1:8390")]
        coordinator: String,

        /// Worker key file
        #[arg(long, env = "ZL_WORKER_KEY")]
        key: Option<PathBuf>,

        /// Worker name reported at registration
        #[arg(long, env = "ZL_WORKER_NAME", default_value = "mock-prover")]
        name: String,

        /// Probability of answering a task with a proving error
        #[arg(long, default_value = "0.0")]
        fail_rate: f64,

        /// Simulated proving time in milliseconds
        #[arg(long, default_value = "500")]
        delay_ms: u64,
    },

    /// List workers known to the coordinator
    Workers {
        #[arg(long, env = "ZL_API", default_value = "http://127.0.0.1:8391")]
        api: String,
    },

    /// Show one proof session
    Session {
        #[arg(long, env = "ZL_API", default_value = "http://127.0.0.1:8391")]
        api: String,

        /// Task / session id
        id: u64,
    },

    /// Enqueue a task from a JSON file of block traces
    Enqueue {
        #[arg(long, env = "ZL_API", default_value = "http://127.0.0.1:8391")]
        api: String,

        /// JSON array of `{number, hash, trace}` objects
        #[arg(long)]
        file: PathBuf,
    },

    /// Show one task and its proof
    Task {
        #[arg(long, env = "ZL_API", default_value = "http://127.0.0.1:8391")]
        api: String,

        id: u64,
    },

    /// Print a sample coordinator configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Keygen { out } => keygen(out),
        Command::Worker {
            coordinator,
            key,
            name,
            fail_rate,
            delay_ms,
        } => {
            let keypair = Keypair::load(&key_path(key)?)?;
            worker::run(worker::WorkerArgs {
                coordinator,
                keypair,
                name,
                fail_rate,
                delay_ms,
            })
            .await
        }
        Command::Workers { api } => query::workers(&api).await,
        Command::Session { api, id } => query::session(&api, id).await,
        Command::Enqueue { api, file } => query::enqueue(&api, &file).await,
        Command::Task { api, id } => query::task(&api, id).await,
        Command::Config => {
            print!("{}", CoordinatorConfig::generate_sample());
            Ok(())
        }
    }
}

fn key_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    match dirs::home_dir() {
        Some(home) => Ok(home.join(".zelana").join("worker.json")),
        None => bail!("Could not determine home directory; pass --key"),
    }
}

fn keygen(out: Option<PathBuf>) -> Result<()> {
    let key_path = key_path(out)?;
    if key_path.exists() {
        bail!(
            "File {} already exists. Remove it first or use a different filename.",
            key_path.display()
        );
    }

    println!("🔐 Generating new worker keypair...");
    let keypair = Keypair::new_random();
    keypair.save(&key_path)?;

    #[cfg(unix)]
    {
        // Owner read/write only
        let mut perms = fs::metadata(&key_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&key_path, perms)?;
    }

    println!("✅ Keypair written to {}", key_path.display());
    println!("   Public key: {}", keypair.pubkey());
    Ok(())
}
