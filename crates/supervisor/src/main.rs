mod api;
mod command;
mod config;
mod duration;
mod poller;
mod reconcile;
mod resolve;
mod schedule;
mod state;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::ApiClient;
use command::CommandDispatcher;
use reconcile::Thresholds;
use state::SupervisorState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "supervisor.toml".to_string());
    let cfg = config::load(&config_path)?;
    let thresholds = Thresholds::from_config(&cfg);

    info!(
        backend = %cfg.backend.base_url,
        pending_timeout_sec = cfg.thresholds.pending_timeout_sec,
        "zone supervisor starting"
    );

    // ── Backend client ──────────────────────────────────────────────
    let client = ApiClient::new(
        &cfg.backend.base_url,
        cfg.read_timeout(),
        cfg.command_timeout(),
    );

    // ── Shared state ────────────────────────────────────────────────
    let shared: state::SharedState = Arc::new(RwLock::new(SupervisorState::new()));
    {
        let mut st = shared.write().await;
        st.record_system("supervisor started".to_string());
    }

    // Best-effort initial schedule load; the watcher retries on its own
    // cadence if the backend is not up yet.
    match client.fetch_schedule().await {
        Ok(zones) => {
            info!(zones = zones.len(), "initial schedule loaded");
            shared.write().await.zones = zones;
        }
        Err(e) => warn!("initial schedule fetch failed: {e:#}"),
    }

    // ── Periodic tasks ──────────────────────────────────────────────
    tokio::spawn(poller::run_status_poll(
        client.clone(),
        shared.clone(),
        thresholds,
        cfg.status_poll(),
    ));
    tokio::spawn(poller::run_schedule_watcher(
        client.clone(),
        shared.clone(),
        thresholds,
        cfg.schedule_check(),
        cfg.schedule_refresh(),
    ));
    tokio::spawn(poller::run_pump_aggregate(shared.clone(), cfg.pump_poll()));
    tokio::spawn(poller::run_sweep(
        shared.clone(),
        thresholds,
        cfg.sweep_interval(),
    ));

    // ── Operator surface ────────────────────────────────────────────
    let dispatcher = CommandDispatcher::new(client, shared.clone());
    let app = web::AppState {
        shared,
        dispatcher,
        pending_timeout: cfg.pending_timeout(),
    };
    web::serve(app, cfg.web.port).await;

    Ok(())
}
