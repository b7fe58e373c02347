mod config;
mod fsm;
mod handler;
#[cfg(test)]
mod mock;
mod mqtt;
mod publisher;
mod runner;
mod scheduler;
mod state;
mod topics;

use std::env;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mqtt::MqttTransport;
use scheduler::Scheduler;
use state::EnvironmentStore;

/// Inbound messages buffered between two scheduler cycles.
const INBOUND_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    let names = cfg.environment_names();
    info!(environments = ?names, "corehub starting");

    // ── Scheduler ───────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let transport = MqttTransport::new(tx);
    let store = EnvironmentStore::new(&names);

    Scheduler::new(transport, rx, store, &cfg).run().await;
    Ok(())
}
