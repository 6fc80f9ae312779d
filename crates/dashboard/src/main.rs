mod api;
mod backend;
mod config;
mod error;
mod live;
mod poller;
mod schedule;
mod state;
mod tracker;
mod web;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use backend::HttpBackend;
use state::{Dashboard, DashboardSettings, EventKind};

/// Pause between live stream reconnect attempts.
const STREAM_RECONNECT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "dashboard.toml".to_string());
    let cfg = config::load(&config_path)?;
    if cfg.plants.is_empty() {
        warn!("no plants configured; only the schedule will be served");
    }

    // ── Backend client ──────────────────────────────────────────────
    let backend = Arc::new(HttpBackend::new(&cfg.backend)?);
    info!(base_url = %cfg.backend.base_url, dialect = ?backend.dialect(), "backend client ready");

    // ── Trackers + polling ──────────────────────────────────────────
    let dashboard = Arc::new(Dashboard::start(
        Arc::clone(&backend),
        &cfg.plants,
        DashboardSettings {
            request_timeout: cfg.request_timeout(),
            poll_interval: cfg.poll_interval(),
            thresholds: cfg.thresholds(),
        },
    ));
    dashboard
        .events()
        .push(EventKind::System, "dashboard started".to_string())
        .await;

    // Forecast is fetched once; later fetches happen on request.
    if let Err(e) = dashboard.refresh_schedules().await {
        warn!("starting without a schedule: {e}");
    }

    // ── Live stream (soil dialect only) ─────────────────────────────
    let stream_task = cfg.backend.live_stream.then(|| {
        tokio::spawn(live::run(
            Arc::clone(&backend),
            dashboard.trackers(),
            STREAM_RECONNECT,
        ))
    });

    // ── Web API ─────────────────────────────────────────────────────
    let served = web::serve(Arc::clone(&dashboard), cfg.web.port).await;

    if let Some(task) = stream_task {
        task.abort();
    }
    dashboard.shutdown().await;
    served
}
