use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

struct Org {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
}

/// One engine per organization dataset, opened on first use. Each has its
/// own WAL file, notification hub and compactor task.
pub struct OrgManager {
    orgs: DashMap<String, Org>,
    data_dir: PathBuf,
    compact_threshold: u64,
    clock: Arc<dyn Clock>,
}

impl OrgManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self::with_clock(data_dir, compact_threshold, Arc::new(SystemClock))
    }

    pub fn with_clock(data_dir: PathBuf, compact_threshold: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            orgs: DashMap::new(),
            data_dir,
            compact_threshold,
            clock,
        }
    }

    /// Get or lazily open the engine for `org`, replaying its WAL.
    pub fn get_or_create(&self, org: &str) -> io::Result<Arc<Engine>> {
        let key = org_key(org)?;
        if let Some(found) = self.orgs.get(&key) {
            return Ok(found.engine.clone());
        }
        if self.orgs.len() >= MAX_ORGS {
            return Err(io::Error::other("too many organizations"));
        }

        // The entry guard is held while the WAL replays so an org opens once
        let engine = match self.orgs.entry(key) {
            Entry::Occupied(found) => return Ok(found.get().engine.clone()),
            Entry::Vacant(slot) => {
                let opened = self.open(slot.key())?;
                let engine = opened.engine.clone();
                slot.insert(opened);
                engine
            }
        };
        metrics::gauge!(crate::observability::ORGS_ACTIVE).set(self.orgs.len() as f64);
        Ok(engine)
    }

    fn open(&self, key: &str) -> io::Result<Org> {
        let hub = Arc::new(NotifyHub::new());
        let wal_path = self.data_dir.join(format!("{key}.wal"));
        let engine = Arc::new(Engine::new(wal_path, hub.clone(), self.clock.clone())?);

        let compacting = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compacting, threshold).await;
        });
        info!("organization {key} opened");
        Ok(Org { engine, hub })
    }

    /// Notification hub of an opened organization.
    pub fn notify_hub(&self, org: &str) -> Option<Arc<NotifyHub>> {
        let key = org_key(org).ok()?;
        self.orgs.get(&key).map(|o| o.hub.clone())
    }

    /// Normalized names of every opened organization, sorted.
    pub fn org_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.orgs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Normalized organization name, also the stem of its WAL file. Only
/// alphanumerics, `_` and `-` survive, which keeps the file inside `data_dir`.
fn org_key(org: &str) -> io::Result<String> {
    if org.len() > MAX_ORG_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "organization name too long",
        ));
    }
    let key: String = org
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if key.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty organization name",
        ));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("loadout_test_org").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn org_isolation() {
        let dir = test_data_dir("isolation");
        let orgs = OrgManager::new(dir, 1000);

        let acme = orgs.get_or_create("acme").unwrap();
        let other = orgs.get_or_create("stagecraft").unwrap();

        let truck = acme.register_truck("TRK1").await.unwrap();
        assert!(acme.truck(&truck).is_some());
        assert!(other.truck(&truck).is_none());

        let err = other
            .create_event("E1", Span::new(DAY, 2 * DAY), Some(truck))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::engine::EngineError::TruckNotFound(_)));
    }

    #[tokio::test]
    async fn org_lazy_creation() {
        let dir = test_data_dir("lazy");
        let orgs = OrgManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _engine = orgs.get_or_create("acme").unwrap();
        assert!(dir.join("acme.wal").exists());
        assert_eq!(orgs.org_names(), vec!["acme".to_string()]);
        assert!(orgs.notify_hub("acme").is_some());
        assert!(orgs.notify_hub("nobody").is_none());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let dir = test_data_dir("same_engine");
        let orgs = OrgManager::new(dir, 1000);

        let first = orgs.get_or_create("acme").unwrap();
        let second = orgs.get_or_create("acme").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn org_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let orgs = OrgManager::new(dir.clone(), 1000);

        let sneaky = orgs.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        // Names that normalize alike share one engine and one WAL
        let plain = orgs.get_or_create("evil").unwrap();
        assert!(Arc::ptr_eq(&sneaky, &plain));
        assert_eq!(orgs.org_names(), vec!["evil".to_string()]);

        assert!(orgs.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn org_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let orgs = OrgManager::new(dir, 1000);

        let err = orgs
            .get_or_create(&"x".repeat(MAX_ORG_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("organization name too long"));
    }

    #[tokio::test]
    async fn reopening_replays_wal() {
        let dir = test_data_dir("reopen");
        let truck = {
            let orgs = OrgManager::new(dir.clone(), 1000);
            let engine = orgs.get_or_create("acme").unwrap();
            engine.register_truck("TRK1").await.unwrap()
        };

        let orgs = OrgManager::new(dir, 1000);
        let engine = orgs.get_or_create("acme").unwrap();
        assert_eq!(engine.truck(&truck).unwrap().name, "TRK1");
    }
}
