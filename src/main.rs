use std::sync::Arc;

use tracing::info;

use loadout::config::Config;
use loadout::org::OrgManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cfg = Config::from_env();
    loadout::observability::init(cfg.metrics_port)?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let orgs = Arc::new(OrgManager::new(cfg.data_dir.clone(), cfg.compact_threshold));
    for org in &cfg.orgs {
        let engine = orgs.get_or_create(org)?;
        info!("  {org}: {} catalog items", engine.store.catalog_items().len());
    }

    info!("loadout started");
    info!("  data_dir: {}", cfg.data_dir.display());
    info!("  compact_threshold: {}", cfg.compact_threshold);
    info!(
        "  metrics: {}",
        cfg.metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    info!("shutdown signal received");

    // Leave a compact log behind so the next start replays quickly
    for name in orgs.org_names() {
        let engine = orgs.get_or_create(&name)?;
        if let Err(e) = engine.compact_wal().await {
            tracing::warn!("final compaction of {name} failed: {e}");
        }
    }

    info!("loadout stopped");
    Ok(())
}
