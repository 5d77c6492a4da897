use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;
use crate::observability::AVAILABILITY_CHECKS_TOTAL;

use super::availability::{check_availability, check_availability_batch, AvailabilityResult};
use super::{Engine, EngineError};

impl Engine {
    pub fn asset(&self, id: &Ulid) -> Option<Asset> {
        self.store.asset(id)
    }

    pub fn event(&self, id: &Ulid) -> Option<Event> {
        self.store.event(id)
    }

    pub fn truck(&self, id: &Ulid) -> Option<Truck> {
        self.store.truck(id)
    }

    pub fn catalog_item(&self, sku: &str) -> Option<CatalogItem> {
        self.store.catalog_item(sku)
    }

    pub fn quote_line(&self, id: &Ulid) -> Option<QuoteLine> {
        self.store.quote_line(id)
    }

    pub fn lines_for_event(&self, event_id: &Ulid) -> Vec<QuoteLine> {
        self.store.lines_by_event(event_id)
    }

    pub fn reservations_for_event(&self, event_id: &Ulid) -> Vec<Reservation> {
        self.store.reservations_by_event(event_id)
    }

    pub fn scan_list(&self, id: &Ulid) -> Option<ScanList> {
        self.store.scan_list(id)
    }

    pub fn scan_lists_for_event(&self, event_id: &Ulid) -> Vec<ScanList> {
        self.store.scan_lists_by_event(event_id)
    }

    pub fn task(&self, id: &Ulid) -> Option<Task> {
        self.store.task(id)
    }

    /// A chain with its tasks in execution order.
    pub fn task_chain(&self, chain_id: &Ulid) -> Option<(TaskChain, Vec<Task>)> {
        let chain = self.store.chain(chain_id)?;
        let tasks = self.store.tasks_in_chain(chain_id);
        Some((chain, tasks))
    }

    pub fn chains_for_event(&self, event_id: &Ulid) -> Vec<TaskChain> {
        self.store.chains_by_event(event_id)
    }

    /// How many units of `sku` the event could still get. Shortage is reported
    /// in the result, never as an error.
    pub fn check_availability_for_event(
        &self,
        event_id: &Ulid,
        sku: &str,
        requested: u32,
    ) -> Result<AvailabilityResult, EngineError> {
        let event = self
            .store
            .event(event_id)
            .ok_or(EngineError::NotFound(*event_id))?;
        let item = self
            .store
            .catalog_item(sku)
            .ok_or_else(|| EngineError::UnknownSku(sku.to_string()))?;
        let pool = self.pool_for(sku);
        let result = check_availability(&item, &event, requested, &pool.assets, &pool.reservations);
        metrics::counter!(AVAILABILITY_CHECKS_TOTAL, "severity" => result.severity().label())
            .increment(1);
        Ok(result)
    }

    /// Availability per SKU. Unknown SKUs are absent from the result.
    pub fn check_availability_batch_for_event(
        &self,
        event_id: &Ulid,
        requested: &HashMap<String, u32>,
    ) -> Result<HashMap<String, AvailabilityResult>, EngineError> {
        let event = self
            .store
            .event(event_id)
            .ok_or(EngineError::NotFound(*event_id))?;
        let mut catalog = Vec::new();
        let mut assets = Vec::new();
        let mut reservations = Vec::new();
        for sku in requested.keys() {
            let Some(item) = self.store.catalog_item(sku) else {
                continue;
            };
            let pool = self.pool_for(sku);
            catalog.push(item);
            assets.extend(pool.assets);
            reservations.extend(pool.reservations);
        }
        let results = check_availability_batch(&catalog, &event, requested, &assets, &reservations);
        for result in results.values() {
            metrics::counter!(AVAILABILITY_CHECKS_TOTAL, "severity" => result.severity().label())
                .increment(1);
        }
        Ok(results)
    }
}
