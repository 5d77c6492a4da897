mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod reservations;
mod selector;
mod store;
mod tasks;
mod workflow;

pub use availability::{
    check_availability, check_availability_batch, eligible_assets, AvailabilityResult, Severity,
    LOW_MARGIN_BUFFER,
};
pub use error::EngineError;
pub use lifecycle::{transition_for, ScanTransition};
pub use selector::{compare_candidates, select_best};
pub use store::{InMemoryStore, RecordStore};
pub use tasks::TaskOutcome;
pub use workflow::{Finalization, ScanOutcome};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::{Dispatcher, NotificationIntent};
use crate::wal::{Commit, Wal};

// ── Group-commit WAL writer ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        done: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Change>,
        done: oneshot::Sender<io::Result<()>>,
    },
    Progress {
        reply: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Commit, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while one is being written are taken
/// together and made durable with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut carried: Option<WalCommand> = None;
    loop {
        let cmd = match carried.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { commit, done } => {
                let mut batch = vec![(commit, done)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { commit, done } => batch.push((commit, done)),
                        other => {
                            carried = Some(other);
                            break;
                        }
                    }
                }
                write_batch(&mut wal, batch);
            }
            WalCommand::Compact { snapshot, done } => {
                let _ = done.send(wal.compact(&snapshot));
            }
            WalCommand::Progress { reply } => {
                let _ = reply.send(wal.appends_since_compact());
            }
        }
    }
}

fn write_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    // A failed batch is rolled back whole, so no caller sees an error for a
    // commit that would still replay.
    let result = wal.append_batch(batch.iter().map(|(commit, _)| commit.as_slice()));

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL write of {} commits failed: {e}", batch.len());
    }
    for (_, done) in batch {
        let _ = done.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

/// Allocation and workflow engine for one organization's dataset.
///
/// Every mutation stages a `Commit`, verifies it, writes it to the WAL and only
/// then applies it to the store. Reads go straight to the store.
pub struct Engine {
    pub store: Arc<dyn RecordStore>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub(super) clock: Arc<dyn Clock>,
    /// Per-aggregate locks keyed by `event:<id>`, `sku:<sku>` or `truck:<id>`.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Commits hold it shared from WAL append to store apply; compaction takes
    /// it exclusively so its snapshot matches the log it replaces.
    compaction_gate: RwLock<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        Self::with_store(Arc::new(InMemoryStore::new()), wal_path, dispatcher, clock)
    }

    /// Replay the WAL at `wal_path` into `store` and start the writer task.
    pub fn with_store(
        store: Arc<dyn RecordStore>,
        wal_path: PathBuf,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let (wal, commits) = Wal::open_recovered(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        for change in commits.iter().flatten() {
            store.apply(change);
        }
        if !commits.is_empty() {
            tracing::debug!("replayed {} commits from {}", commits.len(), wal_path.display());
        }

        Ok(Self {
            store,
            wal_tx,
            dispatcher,
            clock,
            locks: DashMap::new(),
            compaction_gate: RwLock::new(()),
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Hand `cmd` to the writer task and wait for its answer on `rx`.
    async fn ask_writer<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    async fn wal_append(&self, commit: &[Change]) -> Result<(), EngineError> {
        let (done, rx) = oneshot::channel();
        let commit = commit.to_vec();
        self.ask_writer(WalCommand::Append { commit, done }, rx)
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Verify + WAL-append + apply. Either every change lands or none does.
    pub(super) async fn commit(&self, changes: &[Change]) -> Result<(), EngineError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.verify(changes)?;
        let _gate = self.compaction_gate.read().await;
        self.wal_append(changes).await?;
        for change in changes {
            self.store.apply(change);
        }
        Ok(())
    }

    fn verify(&self, changes: &[Change]) -> Result<(), EngineError> {
        let mut existing: HashMap<Ulid, Vec<Reservation>> = HashMap::new();
        for change in changes {
            if let Change::ReservationUpserted(r) = change {
                existing
                    .entry(r.asset_id)
                    .or_insert_with(|| self.store.reservations_for_asset(&r.asset_id));
            }
        }
        conflict::check_no_double_booking(changes, &existing)
    }

    /// Acquire aggregate locks in sorted order so overlapping key sets cannot deadlock.
    pub(super) async fn lock_keys(&self, mut keys: Vec<String>) -> Vec<OwnedMutexGuard<()>> {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self.locks.entry(key).or_default().clone();
            guards.push(mutex.lock_owned().await);
        }
        guards
    }

    /// Lock an event together with its truck and every SKU it touches.
    /// Retries when the key set grew while waiting for the locks.
    pub(super) async fn lock_event_scope(
        &self,
        event_id: &Ulid,
    ) -> Result<Vec<OwnedMutexGuard<()>>, EngineError> {
        loop {
            let keys = self.event_scope_keys(event_id)?;
            let guards = self.lock_keys(keys.clone()).await;
            let current = self.event_scope_keys(event_id)?;
            if current.iter().all(|k| keys.contains(k)) {
                return Ok(guards);
            }
            drop(guards);
        }
    }

    fn event_scope_keys(&self, event_id: &Ulid) -> Result<Vec<String>, EngineError> {
        let event = self
            .store
            .event(event_id)
            .ok_or(EngineError::NotFound(*event_id))?;
        let mut keys = vec![event_key(&event.id)];
        if let Some(truck_id) = event.truck_id {
            keys.push(truck_key(&truck_id));
        }
        for line in self.store.lines_by_event(&event.id) {
            keys.push(sku_key(&line.sku));
        }
        for r in self.store.reservations_by_event(&event.id) {
            if let Some(asset) = self.store.asset(&r.asset_id) {
                keys.push(sku_key(&asset.sku));
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Every asset of `sku` with all of their reservations, across events.
    pub(super) fn pool_for(&self, sku: &str) -> reservations::Pool {
        let assets = self.store.assets_by_sku(sku);
        let reservations = assets
            .iter()
            .flat_map(|a| self.store.reservations_for_asset(&a.id))
            .collect();
        reservations::Pool::new(assets, reservations)
    }

    /// Hand intents to the dispatcher. Failures are logged, never returned.
    pub(super) fn deliver(&self, intents: &[NotificationIntent]) {
        for intent in intents {
            if let Err(e) = self.dispatcher.dispatch(intent) {
                warn!(
                    "notification {} for task {} not delivered: {e}",
                    intent.kind.label(),
                    intent.task_id
                );
                metrics::counter!(
                    crate::observability::NOTIFICATIONS_FAILED_TOTAL,
                    "kind" => intent.kind.label()
                )
                .increment(1);
            }
        }
    }

    /// False once the WAL writer task is gone. Every later commit will fail.
    pub fn wal_writer_running(&self) -> bool {
        !self.wal_tx.is_closed()
    }

    /// Number of commits written since the last compaction.
    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.ask_writer(WalCommand::Progress { reply }, rx).await
    }

    /// Rewrite the WAL as a single snapshot commit of the current store.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let snapshot = self.store.snapshot();
        let changes = snapshot.len();
        let (done, rx) = oneshot::channel();
        self.ask_writer(WalCommand::Compact { snapshot, done }, rx)
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!("WAL compacted to {changes} changes");
        Ok(())
    }
}

pub(super) fn event_key(id: &Ulid) -> String {
    format!("event:{id}")
}

pub(super) fn sku_key(sku: &str) -> String {
    format!("sku:{sku}")
}

pub(super) fn truck_key(id: &Ulid) -> String {
    format!("truck:{id}")
}
