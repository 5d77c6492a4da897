use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability::{
    self, RESERVATIONS_CREATED_TOTAL, RESERVATIONS_RELEASED_TOTAL, SCAN_LISTS_COMPLETED_TOTAL,
    TASKS_COMPLETED_TOTAL,
};

use super::conflict::check_truck_free;
use super::lifecycle::{plan_event_cancellation, plan_scan_transition};
use super::reservations::plan_adjust;
use super::tasks::{self, TaskOutcome};
use super::{event_key, Engine, EngineError};

/// Records created when a validated quote is turned into operational work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalization {
    pub chain: TaskChain,
    pub tasks: Vec<Task>,
    pub scan_lists: Vec<ScanList>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub scan_list: ScanList,
    /// Completion of the linked task, if it could be completed.
    pub task: Option<TaskOutcome>,
}

fn invalid_transition<S: std::fmt::Debug>(id: Ulid, from: S) -> EngineError {
    EngineError::InvalidTransition {
        id,
        from: format!("{from:?}"),
    }
}

fn task_title(direction: ScanDirection) -> &'static str {
    match direction {
        ScanDirection::StockToTruck => "Load truck",
        ScanDirection::TruckToEvent => "Deliver to event",
        ScanDirection::EventToTruck => "Reload truck",
        ScanDirection::TruckToStock => "Return to stock",
    }
}

impl Engine {
    // ── Quote lifecycle ──────────────────────────────────────────

    /// Fail if the event's truck does not exist or is already booked by another
    /// live event over an overlapping window.
    pub fn verify_truck_availability(&self, event_id: Ulid) -> Result<(), EngineError> {
        let event = self
            .store
            .event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let Some(truck_id) = event.truck_id else {
            return Ok(());
        };
        let truck = self
            .store
            .truck(&truck_id)
            .ok_or(EngineError::TruckNotFound(truck_id))?;
        check_truck_free(&event, &truck, &self.store.events_by_truck(&truck_id))
    }

    /// Check the truck, then bring every line of the event to its quantity.
    /// All lines succeed together or nothing is reserved.
    pub async fn validate_quote(&self, event_id: Ulid) -> Result<Vec<QuoteLine>, EngineError> {
        let result = self.validate_quote_inner(event_id).await;
        if let Err(ref e) = result {
            observability::record_failure("validate_quote", e);
            info!("quote for event {event_id} rejected: {e}");
        }
        result
    }

    async fn validate_quote_inner(&self, event_id: Ulid) -> Result<Vec<QuoteLine>, EngineError> {
        let _guards = self.lock_event_scope(&event_id).await?;
        let event = self
            .store
            .event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        if !matches!(event.status, EventStatus::Planned | EventStatus::Validated) {
            return Err(invalid_transition(event.id, event.status));
        }

        self.verify_truck_availability(event_id)?;

        let lines = self.store.lines_by_event(&event_id);
        let mut pools = HashMap::new();
        let mut changes = Vec::new();
        let mut updated = Vec::with_capacity(lines.len());
        let (mut reserved, mut released) = (0usize, 0usize);

        for line in &lines {
            if self.store.catalog_item(&line.sku).is_none() {
                return Err(EngineError::UnknownSku(line.sku.clone()));
            }
            let pool = pools
                .entry(line.sku.clone())
                .or_insert_with(|| self.pool_for(&line.sku));
            let plan = plan_adjust(line, line.quantity, &event, pool)?;
            pool.absorb(&plan.changes);
            reserved += plan.reserved.len();
            released += plan.released.len();
            changes.extend(plan.changes);

            let mut line = line.clone();
            line.assigned_assets = plan.assigned;
            updated.push(line);
        }

        if event.status == EventStatus::Planned {
            let mut validated = event.clone();
            validated.status = EventStatus::Validated;
            changes.push(Change::EventUpserted(validated));
        }

        self.commit(&changes)
            .await
            .map_err(EngineError::into_reservation_failure)?;
        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(reserved as u64);
        metrics::counter!(RESERVATIONS_RELEASED_TOTAL).increment(released as u64);
        info!(
            "event {} validated: {} lines, {reserved} assets reserved",
            event.name,
            updated.len()
        );
        Ok(updated)
    }

    /// Create the four scan-lists and the task chain that walks through them.
    pub async fn finalize_quote(
        &self,
        event_id: Ulid,
        actor: Ulid,
    ) -> Result<Finalization, EngineError> {
        let _guards = self.lock_keys(vec![event_key(&event_id)]).await;
        let event = self
            .store
            .event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        if !self.store.scan_lists_by_event(&event_id).is_empty() {
            return Err(EngineError::AlreadyFinalized(event_id));
        }
        if event.status != EventStatus::Validated {
            return Err(invalid_transition(event.id, event.status));
        }

        let specs: Vec<TaskSpec> = ScanDirection::ALL
            .iter()
            .map(|&d| {
                let spec = TaskSpec::new(task_title(d), TaskKind::for_direction(d));
                if d == ScanDirection::TruckToStock {
                    spec.notify_on_completion()
                } else {
                    spec
                }
            })
            .collect();
        let (chain, tasks) = tasks::build_chain(event_id, &specs, actor)?;

        let scan_lists: Vec<ScanList> = ScanDirection::ALL
            .iter()
            .zip(&tasks)
            .map(|(&direction, task)| ScanList {
                id: Ulid::new(),
                event_id,
                direction,
                status: ScanListStatus::Pending,
                task_id: Some(task.id),
                completed_at: None,
            })
            .collect();

        let mut changes = vec![Change::ChainCreated(chain.clone())];
        changes.extend(tasks.iter().cloned().map(Change::TaskUpserted));
        changes.extend(scan_lists.iter().cloned().map(Change::ScanListUpserted));
        self.commit(&changes).await?;

        info!("event {} finalized by {actor}", event.name);
        Ok(Finalization {
            chain,
            tasks,
            scan_lists,
        })
    }

    // ── Scan-driven transitions ──────────────────────────────────

    /// Mark a scan-list done, move the event's reservations and assets along,
    /// and complete the linked task. Completing a finished list is a no-op.
    pub async fn complete_scan_list(
        &self,
        scan_list_id: Ulid,
        actor: Ulid,
    ) -> Result<ScanOutcome, EngineError> {
        let event_id = self
            .store
            .scan_list(&scan_list_id)
            .ok_or(EngineError::NotFound(scan_list_id))?
            .event_id;
        let _guards = self.lock_event_scope(&event_id).await?;
        let list = self
            .store
            .scan_list(&scan_list_id)
            .ok_or(EngineError::NotFound(scan_list_id))?;
        self.complete_scan_list_locked(list, actor).await
    }

    /// Body of `complete_scan_list`. The caller holds the event scope locks.
    async fn complete_scan_list_locked(
        &self,
        list: ScanList,
        actor: Ulid,
    ) -> Result<ScanOutcome, EngineError> {
        let event_id = list.event_id;
        if list.status == ScanListStatus::Completed {
            return Ok(ScanOutcome {
                scan_list: list,
                task: None,
            });
        }
        let event = self
            .store
            .event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        if matches!(event.status, EventStatus::Cancelled | EventStatus::Completed) {
            return Err(invalid_transition(event.id, event.status));
        }

        let now = self.now();
        let task_outcome = match list.task_id {
            Some(task_id) => self.complete_linked_task(task_id, now, actor)?,
            None => None,
        };

        let mut changes = self.plan_direction(list.direction, &event);
        let mut done = list.clone();
        done.status = ScanListStatus::Completed;
        done.completed_at = Some(now);
        changes.push(Change::ScanListUpserted(done.clone()));
        if let Some(ref outcome) = task_outcome {
            changes.push(Change::TaskUpserted(outcome.task.clone()));
            if let Some(ref next) = outcome.unblocked {
                changes.push(Change::TaskUpserted(next.clone()));
            }
        }

        if let Err(e) = self.commit(&changes).await {
            observability::record_failure("complete_scan_list", &e);
            return Err(e);
        }
        metrics::counter!(SCAN_LISTS_COMPLETED_TOTAL, "direction" => list.direction.label())
            .increment(1);
        info!(
            "scan list {} ({}) completed for event {}",
            list.id,
            list.direction.label(),
            event.name
        );
        if let Some(ref outcome) = task_outcome {
            metrics::counter!(TASKS_COMPLETED_TOTAL).increment(1);
            self.deliver(&outcome.intents);
        }

        Ok(ScanOutcome {
            scan_list: done,
            task: task_outcome,
        })
    }

    /// Resolve the task a scan-list drives. A missing or already finished task is
    /// skipped; a Blocked one means an earlier movement has not happened yet.
    fn complete_linked_task(
        &self,
        task_id: Ulid,
        now: Ms,
        actor: Ulid,
    ) -> Result<Option<TaskOutcome>, EngineError> {
        let Some(task) = self.store.task(&task_id) else {
            warn!("scan list refers to missing task {task_id}");
            return Ok(None);
        };
        match task.status {
            TaskStatus::Completed | TaskStatus::Cancelled => {
                debug!("task {task_id} already {:?}, not completing again", task.status);
                Ok(None)
            }
            _ => {
                let next = self.successor(&task);
                tasks::complete(&task, next.as_ref(), now, actor).map(Some)
            }
        }
    }

    /// Confirm the event's Pending reservations once the truck is loaded.
    /// When the event has a stock-to-truck scan-list, that list and its task
    /// are completed in the same commit.
    pub async fn freeze_after_loading(
        &self,
        event_id: Ulid,
        actor: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let _guards = self.lock_event_scope(&event_id).await?;
        let load = self
            .store
            .scan_lists_by_event(&event_id)
            .into_iter()
            .find(|l| l.direction == ScanDirection::StockToTruck);
        match load {
            Some(list) => {
                self.complete_scan_list_locked(list, actor).await?;
            }
            None => self.freeze_unlisted(event_id).await?,
        }
        Ok(self
            .store
            .reservations_by_event(&event_id)
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Confirmed)
            .collect())
    }

    /// Return every asset of the scan-list's event to stock, complete the
    /// event, the list and its task. Lists of any other direction and lists
    /// already completed are left alone; returns whether anything was applied.
    pub async fn release_after_return(
        &self,
        scan_list_id: Ulid,
        actor: Ulid,
    ) -> Result<bool, EngineError> {
        let event_id = self
            .store
            .scan_list(&scan_list_id)
            .ok_or(EngineError::NotFound(scan_list_id))?
            .event_id;
        let _guards = self.lock_event_scope(&event_id).await?;
        let list = self
            .store
            .scan_list(&scan_list_id)
            .ok_or(EngineError::NotFound(scan_list_id))?;
        if list.direction != ScanDirection::TruckToStock
            || list.status == ScanListStatus::Completed
        {
            return Ok(false);
        }
        self.complete_scan_list_locked(list, actor).await?;
        Ok(true)
    }

    /// Freeze an event that was never finalized into scan-lists. The caller
    /// holds the event scope locks.
    async fn freeze_unlisted(&self, event_id: Ulid) -> Result<(), EngineError> {
        let direction = ScanDirection::StockToTruck;
        let event = self
            .store
            .event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        if matches!(event.status, EventStatus::Cancelled | EventStatus::Completed) {
            return Err(invalid_transition(event.id, event.status));
        }
        let changes = self.plan_direction(direction, &event);
        self.commit(&changes).await.inspect_err(|e| {
            observability::record_failure(direction.label(), e);
        })?;
        info!("event {}: {} applied", event.name, direction.label());
        Ok(())
    }

    fn plan_direction(&self, direction: ScanDirection, event: &Event) -> Vec<Change> {
        let (reservations, assets, others) = self.event_holdings(event);
        plan_scan_transition(direction, event, &reservations, &assets, &others)
    }

    /// The event's reservations, the assets they hold, and those assets'
    /// reservations for other events.
    fn event_holdings(&self, event: &Event) -> (Vec<Reservation>, Vec<Asset>, Vec<Reservation>) {
        let reservations = self.store.reservations_by_event(&event.id);
        let asset_ids: HashSet<Ulid> = reservations.iter().map(|r| r.asset_id).collect();
        let mut assets: Vec<Asset> = asset_ids
            .iter()
            .filter_map(|id| self.store.asset(id))
            .collect();
        assets.sort_by_key(|a| a.id);
        let others = asset_ids
            .iter()
            .flat_map(|id| self.store.reservations_for_asset(id))
            .filter(|r| r.event_id != event.id)
            .collect();
        (reservations, assets, others)
    }

    /// Cancel an event: open reservations become Cancelled, merely reserved
    /// assets return to stock and unfinished tasks are cancelled.
    pub async fn cancel_event(&self, event_id: Ulid) -> Result<(), EngineError> {
        let _guards = self.lock_event_scope(&event_id).await?;
        let event = self
            .store
            .event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        match event.status {
            EventStatus::Cancelled => return Ok(()),
            EventStatus::Completed => return Err(invalid_transition(event.id, event.status)),
            _ => {}
        }

        let (reservations, assets, others) = self.event_holdings(&event);
        let mut changes = plan_event_cancellation(&event, &reservations, &assets, &others);
        for chain in self.store.chains_by_event(&event_id) {
            for task in self.store.tasks_in_chain(&chain.id) {
                if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) {
                    continue;
                }
                changes.push(Change::TaskUpserted(tasks::cancel(&task, "event cancelled")?));
            }
        }
        self.commit(&changes).await?;
        info!("event {} cancelled", event.name);
        Ok(())
    }

    // ── Task chain ───────────────────────────────────────────────

    pub async fn build_task_chain(
        &self,
        event_id: Ulid,
        specs: &[TaskSpec],
        actor: Ulid,
    ) -> Result<(TaskChain, Vec<Task>), EngineError> {
        let _guards = self.lock_keys(vec![event_key(&event_id)]).await;
        let event = self
            .store
            .event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        if matches!(event.status, EventStatus::Cancelled | EventStatus::Completed) {
            return Err(invalid_transition(event.id, event.status));
        }
        let (chain, tasks) = tasks::build_chain(event_id, specs, actor)?;
        let mut changes = vec![Change::ChainCreated(chain.clone())];
        changes.extend(tasks.iter().cloned().map(Change::TaskUpserted));
        self.commit(&changes).await?;
        debug!("chain {} built with {} tasks", chain.id, tasks.len());
        Ok((chain, tasks))
    }

    pub async fn start_task(&self, task_id: Ulid) -> Result<Task, EngineError> {
        let (task, _guards) = self.lock_task(task_id).await?;
        let started = tasks::start(&task)?;
        self.commit(&[Change::TaskUpserted(started.clone())]).await?;
        Ok(started)
    }

    /// Complete a task, unblock its successor and deliver the resulting
    /// notifications. Delivery failures do not undo the completion.
    pub async fn complete_task(&self, task_id: Ulid, actor: Ulid) -> Result<TaskOutcome, EngineError> {
        let (task, _guards) = self.lock_task(task_id).await?;
        let next = self.successor(&task);
        let outcome = tasks::complete(&task, next.as_ref(), self.now(), actor)?;

        let mut changes = vec![Change::TaskUpserted(outcome.task.clone())];
        if let Some(ref ready) = outcome.unblocked {
            changes.push(Change::TaskUpserted(ready.clone()));
        }
        self.commit(&changes).await?;

        metrics::counter!(TASKS_COMPLETED_TOTAL).increment(1);
        match outcome.unblocked {
            Some(ref ready) => info!("task {} completed, {} unblocked", task.title, ready.title),
            None => info!("task {} completed", task.title),
        }
        self.deliver(&outcome.intents);
        Ok(outcome)
    }

    /// Cancel a task. Its successor stays Blocked.
    pub async fn cancel_task(&self, task_id: Ulid, reason: &str) -> Result<Task, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancel reason too long"));
        }
        let (task, _guards) = self.lock_task(task_id).await?;
        let cancelled = tasks::cancel(&task, reason)?;
        self.commit(&[Change::TaskUpserted(cancelled.clone())]).await?;
        info!("task {} cancelled: {reason}", task.title);
        Ok(cancelled)
    }

    async fn lock_task(
        &self,
        task_id: Ulid,
    ) -> Result<(Task, Vec<tokio::sync::OwnedMutexGuard<()>>), EngineError> {
        let event_id = self
            .store
            .task(&task_id)
            .ok_or(EngineError::NotFound(task_id))?
            .event_id;
        let guards = self.lock_keys(vec![event_key(&event_id)]).await;
        let task = self
            .store
            .task(&task_id)
            .ok_or(EngineError::NotFound(task_id))?;
        Ok((task, guards))
    }

    fn successor(&self, task: &Task) -> Option<Task> {
        let link = task.chain?;
        let chain = self.store.chain(&link.chain_id)?;
        let next_id = chain.next_of(link.position)?;
        self.store.task(&next_id)
    }
}
