use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;
use weighin_core::IdentityCache;
use weighin_hw::{Scenario, SimulatedScale, SimulatedScaleConfig};
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod session;
mod store;

use config::{BusKind, Config, ScaleSource};
use dbus_interface::{ScalesService, BUS_NAME, OBJECT_PATH};
use session::SessionConfig;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        threshold = config.similarity_threshold,
        dim = config.embedding_dim,
        "weighind starting"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(config.retention_days));
    if let Err(e) = store.purge_measurements_before(cutoff).await {
        tracing::warn!(error = %e, "retention purge failed; continuing");
    }

    let cache = Arc::new(IdentityCache::with_dimension(config.embedding_dim));
    let loaded = cache.load(&store).await.context("loading identities")?;
    tracing::info!(identities = loaded, "identity cache loaded");

    // Keep the simulated scale alive for the daemon's lifetime.
    let (mut simulated, scale_rx) = match &config.scale {
        ScaleSource::Simulated => {
            let (mut scale, rx) = SimulatedScale::new(SimulatedScaleConfig::default());
            scale.connect().await?;
            (Some(scale), rx)
        }
        ScaleSource::Scenario(path) => {
            let scenario = Scenario::load(path)?;
            tracing::info!(path = %path.display(), steps = scenario.steps.len(), "replaying scenario");
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move { scenario.play(tx).await });
            (None, rx)
        }
    };

    let session = session::spawn_session(
        SessionConfig {
            similarity_threshold: config.similarity_threshold,
            stability: config.stability,
        },
        store,
        cache,
        scale_rx,
    );
    let notifications = session.subscribe();

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, ScalesService::new(session))?
        .build()
        .await
        .context("registering on D-Bus")?;

    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?;
    tokio::spawn(forward_notifications(notifications, emitter));

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "weighind ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("weighind shutting down");

    if let Some(scale) = simulated.as_mut() {
        if let Err(e) = scale.disconnect().await {
            tracing::debug!(error = %e, "scale disconnect on shutdown");
        }
    }

    Ok(())
}

async fn forward_notifications(
    mut rx: broadcast::Receiver<weighin_core::Notification>,
    emitter: SignalEmitter<'static>,
) {
    loop {
        match rx.recv().await {
            Ok(n) => {
                if let Err(e) = ScalesService::status_changed(&emitter, &n.to_json()).await {
                    tracing::warn!(error = %e, "failed to emit StatusChanged");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notification forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
