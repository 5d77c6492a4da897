use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, RESERVATIONS_CREATED_TOTAL, RESERVATIONS_RELEASED_TOTAL};

use super::conflict::validate_span;
use super::reservations::{plan_adjust, plan_release, AllocationPlan};
use super::{event_key, sku_key, Engine, EngineError};

fn require_allocatable(event: &Event) -> Result<(), EngineError> {
    match event.status {
        EventStatus::Planned | EventStatus::Validated => Ok(()),
        other => Err(EngineError::InvalidTransition {
            id: event.id,
            from: format!("{other:?}"),
        }),
    }
}

fn allocation_failed(operation: &'static str, err: EngineError) -> EngineError {
    let err = err.into_reservation_failure();
    observability::record_failure(operation, &err);
    err
}

impl Engine {
    // ── Catalogue and inventory ──────────────────────────────────

    pub async fn register_catalog_item(&self, item: CatalogItem) -> Result<(), EngineError> {
        if item.sku.is_empty() {
            return Err(EngineError::InvalidInput("sku must not be empty"));
        }
        if item.sku.len() > MAX_SKU_LEN {
            return Err(EngineError::LimitExceeded("sku too long"));
        }
        if item.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("catalog item name too long"));
        }
        let _guards = self.lock_keys(vec![sku_key(&item.sku)]).await;
        self.commit(&[Change::CatalogItemUpserted(item)]).await
    }

    /// Take one physical unit of `sku` into stock.
    pub async fn register_asset(
        &self,
        sku: &str,
        serial_number: Option<String>,
        value: Cents,
    ) -> Result<Ulid, EngineError> {
        if value < 0 {
            return Err(EngineError::InvalidInput("asset value must not be negative"));
        }
        if let Some(ref s) = serial_number
            && s.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("serial number too long"));
            }
        let _guards = self.lock_keys(vec![sku_key(sku)]).await;
        if self.store.catalog_item(sku).is_none() {
            return Err(EngineError::UnknownSku(sku.to_string()));
        }
        let asset = Asset {
            id: Ulid::new(),
            sku: sku.to_string(),
            serial_number,
            status: AssetStatus::Available,
            current_location_id: None,
            needs_maintenance: false,
            value,
        };
        let id = asset.id;
        self.commit(&[Change::AssetUpserted(asset)]).await?;
        Ok(id)
    }

    pub async fn register_truck(&self, name: &str) -> Result<Ulid, EngineError> {
        if name.is_empty() {
            return Err(EngineError::InvalidInput("truck name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("truck name too long"));
        }
        let truck = Truck {
            id: Ulid::new(),
            name: name.to_string(),
        };
        let id = truck.id;
        self.commit(&[Change::TruckUpserted(truck)]).await?;
        Ok(id)
    }

    /// Record an operator-observed condition. Only the manual states and a
    /// return to Available are accepted; a returned asset still booked by an
    /// open reservation comes back as Reserved.
    pub async fn set_asset_condition(
        &self,
        asset_id: Ulid,
        status: AssetStatus,
        needs_maintenance: bool,
    ) -> Result<Asset, EngineError> {
        if !status.is_manual_condition() && status != AssetStatus::Available {
            return Err(EngineError::InvalidInput(
                "condition must be Damaged, Maintenance, Lost or Available",
            ));
        }
        let sku = self
            .store
            .asset(&asset_id)
            .ok_or(EngineError::AssetNotFound(asset_id))?
            .sku;
        let _guards = self.lock_keys(vec![sku_key(&sku)]).await;
        let mut asset = self
            .store
            .asset(&asset_id)
            .ok_or(EngineError::AssetNotFound(asset_id))?;

        asset.needs_maintenance = needs_maintenance;
        asset.status = status;
        if status == AssetStatus::Available
            && self
                .store
                .reservations_for_asset(&asset_id)
                .iter()
                .any(|r| r.is_open())
        {
            asset.status = AssetStatus::Reserved;
        }
        self.commit(&[Change::AssetUpserted(asset.clone())]).await?;
        info!("asset {asset_id} condition set to {:?}", asset.status);
        Ok(asset)
    }

    // ── Events and quote lines ───────────────────────────────────

    pub async fn create_event(
        &self,
        name: &str,
        span: Span,
        truck_id: Option<Ulid>,
    ) -> Result<Ulid, EngineError> {
        validate_span(&span)?;
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("event name too long"));
        }
        if let Some(tid) = truck_id
            && self.store.truck(&tid).is_none() {
                return Err(EngineError::TruckNotFound(tid));
            }
        let event = Event {
            id: Ulid::new(),
            name: name.to_string(),
            span,
            truck_id,
            status: EventStatus::Planned,
        };
        let id = event.id;
        self.commit(&[Change::EventUpserted(event)]).await?;
        Ok(id)
    }

    /// Request `quantity` units of `sku` for an event. Nothing is reserved yet.
    pub async fn add_quote_line(
        &self,
        event_id: Ulid,
        sku: &str,
        quantity: u32,
    ) -> Result<Ulid, EngineError> {
        if quantity == 0 {
            return Err(EngineError::InvalidInput("quantity must be positive"));
        }
        if quantity > MAX_QUANTITY_PER_LINE {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        if self.store.catalog_item(sku).is_none() {
            return Err(EngineError::UnknownSku(sku.to_string()));
        }
        let _guards = self.lock_keys(vec![event_key(&event_id)]).await;
        let event = self
            .store
            .event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        require_allocatable(&event)?;

        let line = QuoteLine {
            id: Ulid::new(),
            event_id,
            sku: sku.to_string(),
            quantity,
            assigned_assets: Vec::new(),
        };
        let id = line.id;
        self.commit(&[Change::QuoteLineUpserted(line)]).await?;
        Ok(id)
    }

    /// Drop a line together with every reservation it holds.
    pub async fn remove_quote_line(&self, line_id: Ulid) -> Result<(), EngineError> {
        let (line, event, _guards) = self.lock_line(line_id).await?;
        require_allocatable(&event)?;
        let pool = self.pool_for(&line.sku);
        let mut changes = plan_release(&line.assigned_assets, &event, &pool);
        changes.push(Change::QuoteLineRemoved { id: line.id });
        self.commit(&changes)
            .await
            .map_err(|e| allocation_failed("remove_quote_line", e))?;
        metrics::counter!(RESERVATIONS_RELEASED_TOTAL).increment(line.assigned_assets.len() as u64);
        info!(
            "quote line {line_id} removed, {} assets released",
            line.assigned_assets.len()
        );
        Ok(())
    }

    // ── Reservation manager ──────────────────────────────────────

    /// Reserve assets for a line up to its quantity and return the assigned list.
    pub async fn reserve_assets(&self, line_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let plan = self.reallocate_line(line_id, None, "reserve_assets").await?;
        Ok(plan.assigned)
    }

    /// Move a line to `new_quantity`. Growing reserves additional assets at the
    /// tail; shrinking releases the most recently added ones.
    pub async fn adjust_reservations(
        &self,
        line_id: Ulid,
        new_quantity: u32,
    ) -> Result<Vec<Ulid>, EngineError> {
        if new_quantity > MAX_QUANTITY_PER_LINE {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        let plan = self
            .reallocate_line(line_id, Some(new_quantity), "adjust_reservations")
            .await?;
        Ok(plan.assigned)
    }

    /// Delete every reservation the line holds for its event. Releasing an
    /// already released line is a no-op.
    pub async fn release_reservations(&self, line_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let (line, event, _guards) = self.lock_line(line_id).await?;
        require_allocatable(&event)?;
        let pool = self.pool_for(&line.sku);
        let mut changes = plan_release(&line.assigned_assets, &event, &pool);
        if changes.is_empty() && line.assigned_assets.is_empty() {
            return Ok(Vec::new());
        }
        let released = line.assigned_assets.clone();
        let mut cleared = line;
        cleared.assigned_assets.clear();
        changes.push(Change::QuoteLineUpserted(cleared));

        self.commit(&changes)
            .await
            .map_err(|e| allocation_failed("release_reservations", e))?;
        metrics::counter!(RESERVATIONS_RELEASED_TOTAL).increment(released.len() as u64);
        info!("line {line_id}: released {} assets", released.len());
        Ok(released)
    }

    /// Release only the most recently assigned asset and decrement the line's quantity.
    pub async fn release_one_asset(&self, line_id: Ulid) -> Result<Option<Ulid>, EngineError> {
        let (line, event, _guards) = self.lock_line(line_id).await?;
        require_allocatable(&event)?;
        let Some(&last) = line.assigned_assets.last() else {
            return Ok(None);
        };
        let pool = self.pool_for(&line.sku);
        let mut changes = plan_release(&[last], &event, &pool);
        let mut shrunk = line;
        shrunk.assigned_assets.pop();
        shrunk.quantity = shrunk.quantity.saturating_sub(1);
        changes.push(Change::QuoteLineUpserted(shrunk));

        self.commit(&changes)
            .await
            .map_err(|e| allocation_failed("release_one_asset", e))?;
        metrics::counter!(RESERVATIONS_RELEASED_TOTAL).increment(1);
        debug!("line {line_id}: released asset {last}");
        Ok(Some(last))
    }

    // ── Internals ────────────────────────────────────────────────

    /// Lock a line's event and SKU, then re-read both under the lock.
    async fn lock_line(
        &self,
        line_id: Ulid,
    ) -> Result<(QuoteLine, Event, Vec<tokio::sync::OwnedMutexGuard<()>>), EngineError> {
        let line = self
            .store
            .quote_line(&line_id)
            .ok_or(EngineError::NotFound(line_id))?;
        let guards = self
            .lock_keys(vec![event_key(&line.event_id), sku_key(&line.sku)])
            .await;
        let line = self
            .store
            .quote_line(&line_id)
            .ok_or(EngineError::NotFound(line_id))?;
        let event = self
            .store
            .event(&line.event_id)
            .ok_or(EngineError::NotFound(line.event_id))?;
        Ok((line, event, guards))
    }

    async fn reallocate_line(
        &self,
        line_id: Ulid,
        target: Option<u32>,
        operation: &'static str,
    ) -> Result<AllocationPlan, EngineError> {
        let result = async {
            let (line, event, _guards) = self.lock_line(line_id).await?;
            require_allocatable(&event)?;
            if self.store.catalog_item(&line.sku).is_none() {
                return Err(EngineError::UnknownSku(line.sku.clone()));
            }
            let pool = self.pool_for(&line.sku);
            let plan = plan_adjust(&line, target.unwrap_or(line.quantity), &event, &pool)?;
            self.commit(&plan.changes)
                .await
                .map_err(EngineError::into_reservation_failure)?;
            Ok(plan)
        }
        .await;

        match result {
            Ok(plan) => {
                metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(plan.reserved.len() as u64);
                metrics::counter!(RESERVATIONS_RELEASED_TOTAL).increment(plan.released.len() as u64);
                if !plan.changes.is_empty() {
                    info!(
                        "line {line_id}: {} reserved, {} released, {} assigned",
                        plan.reserved.len(),
                        plan.released.len(),
                        plan.assigned.len()
                    );
                }
                Ok(plan)
            }
            Err(e) => {
                observability::record_failure(operation, &e);
                debug!("{operation} failed for line {line_id}: {e}");
                Err(e)
            }
        }
    }
}
