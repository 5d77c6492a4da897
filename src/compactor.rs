use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL if at least `threshold` commits were written since the last
/// compaction. Returns whether it compacted.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.appends_since_compact().await?;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} commits");
    Ok(true)
}

/// Background task that keeps one organization's WAL short. Exits once the
/// engine's WAL writer has shut down.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        match compact_if_needed(&engine, threshold).await {
            Ok(true) => {}
            Ok(false) => debug!("compaction not needed"),
            Err(e) if !engine.wal_writer_running() => {
                warn!("compactor stopping: {e}");
                break;
            }
            Err(e) => warn!("compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("loadout_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), Arc::new(SystemClock))
            .unwrap();

        for i in 0..3 {
            engine.register_truck(&format!("TRK{i}")).await.unwrap();
        }
        assert!(!compact_if_needed(&engine, 10).await.unwrap());
        assert_eq!(engine.appends_since_compact().await.unwrap(), 3);

        let event = engine
            .create_event("E1", Span::new(DAY, 2 * DAY), None)
            .await
            .unwrap();
        assert!(compact_if_needed(&engine, 4).await.unwrap());
        assert_eq!(engine.appends_since_compact().await.unwrap(), 0);

        drop(engine);
        let reopened =
            Engine::new(path, Arc::new(NotifyHub::new()), Arc::new(SystemClock)).unwrap();
        assert_eq!(reopened.event(&event).unwrap().name, "E1");
    }
}
