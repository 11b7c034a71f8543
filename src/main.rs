use std::sync::Arc;

use tracing::info;

use deskbook::clock::SystemClock;
use deskbook::config::Config;
use deskbook::engine::Engine;
use deskbook::notify::NotifyHub;
use deskbook::service::ReservationService;
use deskbook::settings::SharedSettings;
use deskbook::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    deskbook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("deskbook.wal");
    let engine = Arc::new(Engine::new(wal_path.clone(), config.store_timeout)?);

    let service = Arc::new(ReservationService::new(
        engine.clone(),
        Arc::new(SharedSettings::new(config.settings.clone())),
        Arc::new(SystemClock),
        Arc::new(NotifyHub::new()),
        config.idempotency_ttl_ms(),
    ));

    info!("deskbook started");
    info!("  wal: {}", wal_path.display());
    info!("  resources: {}", engine.resource_count());
    info!("  sweep interval: {:?}", config.sweep_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let tasks = [
        tokio::spawn(sweeper::run_sweeper(service.clone(), config.sweep_interval)),
        tokio::spawn(sweeper::run_idempotency_cleanup(
            service.clone(),
            config.idempotency_cleanup_interval,
        )),
        tokio::spawn(sweeper::run_compactor(
            engine.clone(),
            config.compact_threshold,
            config.sweep_interval,
        )),
    ];

    shutdown_signal().await?;
    info!("shutdown signal received");
    for task in tasks {
        task.abort();
    }
    // Commits run on their own tasks; let the ones already started land.
    let _quiet = engine.quiesce().await;

    info!("deskbook stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = ctrl_c => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    Ok(())
}
