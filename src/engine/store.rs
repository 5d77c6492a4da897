use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Typed repository over every entity the engine reads or writes.
///
/// All mutation goes through `apply`, so a store is always in a state that a
/// sequence of `Change` records can reproduce.
pub trait RecordStore: Send + Sync {
    fn apply(&self, change: &Change);

    fn catalog_item(&self, sku: &str) -> Option<CatalogItem>;
    fn catalog_items(&self) -> Vec<CatalogItem>;

    fn asset(&self, id: &Ulid) -> Option<Asset>;
    fn assets_by_sku(&self, sku: &str) -> Vec<Asset>;

    fn truck(&self, id: &Ulid) -> Option<Truck>;

    fn event(&self, id: &Ulid) -> Option<Event>;
    fn events_by_truck(&self, truck_id: &Ulid) -> Vec<Event>;

    fn quote_line(&self, id: &Ulid) -> Option<QuoteLine>;
    fn lines_by_event(&self, event_id: &Ulid) -> Vec<QuoteLine>;

    fn reservations_by_event(&self, event_id: &Ulid) -> Vec<Reservation>;
    fn reservations_for_asset(&self, asset_id: &Ulid) -> Vec<Reservation>;

    fn scan_list(&self, id: &Ulid) -> Option<ScanList>;
    fn scan_lists_by_event(&self, event_id: &Ulid) -> Vec<ScanList>;

    fn task(&self, id: &Ulid) -> Option<Task>;
    fn chain(&self, id: &Ulid) -> Option<TaskChain>;
    fn chains_by_event(&self, event_id: &Ulid) -> Vec<TaskChain>;
    /// Tasks of a chain in execution order.
    fn tasks_in_chain(&self, chain_id: &Ulid) -> Vec<Task>;

    /// Changes that rebuild the current state from empty, in dependency order.
    fn snapshot(&self) -> Vec<Change>;
}

pub struct InMemoryStore {
    catalog: DashMap<String, CatalogItem>,
    assets: DashMap<Ulid, Asset>,
    trucks: DashMap<Ulid, Truck>,
    events: DashMap<Ulid, Event>,
    lines: DashMap<Ulid, QuoteLine>,
    reservations: DashMap<Ulid, Reservation>,
    scan_lists: DashMap<Ulid, ScanList>,
    tasks: DashMap<Ulid, Task>,
    chains: DashMap<Ulid, TaskChain>,
    /// Asset id → reservation ids.
    reservations_by_asset: DashMap<Ulid, Vec<Ulid>>,
    /// Event id → reservation ids.
    reservations_by_event: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            catalog: DashMap::new(),
            assets: DashMap::new(),
            trucks: DashMap::new(),
            events: DashMap::new(),
            lines: DashMap::new(),
            reservations: DashMap::new(),
            scan_lists: DashMap::new(),
            tasks: DashMap::new(),
            chains: DashMap::new(),
            reservations_by_asset: DashMap::new(),
            reservations_by_event: DashMap::new(),
        }
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    fn index_reservation(&self, r: &Reservation) {
        let mut by_asset = self.reservations_by_asset.entry(r.asset_id).or_default();
        if !by_asset.contains(&r.id) {
            by_asset.push(r.id);
        }
        drop(by_asset);
        let mut by_event = self.reservations_by_event.entry(r.event_id).or_default();
        if !by_event.contains(&r.id) {
            by_event.push(r.id);
        }
    }

    fn unindex_reservation(&self, r: &Reservation) {
        if let Some(mut ids) = self.reservations_by_asset.get_mut(&r.asset_id) {
            ids.retain(|id| id != &r.id);
        }
        if let Some(mut ids) = self.reservations_by_event.get_mut(&r.event_id) {
            ids.retain(|id| id != &r.id);
        }
    }

    fn reservations_by_ids(&self, ids: Option<Vec<Ulid>>) -> Vec<Reservation> {
        ids.unwrap_or_default()
            .iter()
            .filter_map(|id| self.reservations.get(id).map(|r| r.value().clone()))
            .collect()
    }
}

fn sorted_by_id<T: Clone>(map: &DashMap<Ulid, T>) -> Vec<T> {
    let mut entries: Vec<(Ulid, T)> = map.iter().map(|e| (*e.key(), e.value().clone())).collect();
    entries.sort_by_key(|(id, _)| *id);
    entries.into_iter().map(|(_, v)| v).collect()
}

impl RecordStore for InMemoryStore {
    fn apply(&self, change: &Change) {
        match change {
            Change::CatalogItemUpserted(item) => {
                self.catalog.insert(item.sku.clone(), item.clone());
            }
            Change::AssetUpserted(asset) => {
                self.assets.insert(asset.id, asset.clone());
            }
            Change::TruckUpserted(truck) => {
                self.trucks.insert(truck.id, truck.clone());
            }
            Change::EventUpserted(event) => {
                self.events.insert(event.id, event.clone());
            }
            Change::QuoteLineUpserted(line) => {
                self.lines.insert(line.id, line.clone());
            }
            Change::QuoteLineRemoved { id } => {
                self.lines.remove(id);
            }
            Change::ReservationUpserted(r) => {
                if let Some(old) = self.reservations.insert(r.id, r.clone())
                    && (old.asset_id != r.asset_id || old.event_id != r.event_id) {
                        self.unindex_reservation(&old);
                    }
                self.index_reservation(r);
            }
            Change::ReservationDeleted { id } => {
                if let Some((_, old)) = self.reservations.remove(id) {
                    self.unindex_reservation(&old);
                }
            }
            Change::ScanListUpserted(list) => {
                self.scan_lists.insert(list.id, list.clone());
            }
            Change::TaskUpserted(task) => {
                self.tasks.insert(task.id, task.clone());
            }
            Change::ChainCreated(chain) => {
                self.chains.insert(chain.id, chain.clone());
            }
        }
    }

    fn catalog_item(&self, sku: &str) -> Option<CatalogItem> {
        self.catalog.get(sku).map(|e| e.value().clone())
    }

    fn catalog_items(&self) -> Vec<CatalogItem> {
        let mut items: Vec<CatalogItem> = self.catalog.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| a.sku.cmp(&b.sku));
        items
    }

    fn asset(&self, id: &Ulid) -> Option<Asset> {
        self.assets.get(id).map(|e| e.value().clone())
    }

    /// Ordered by asset id so selection ties are stable.
    fn assets_by_sku(&self, sku: &str) -> Vec<Asset> {
        let mut assets: Vec<Asset> = self
            .assets
            .iter()
            .filter(|e| e.value().sku == sku)
            .map(|e| e.value().clone())
            .collect();
        assets.sort_by_key(|a| a.id);
        assets
    }

    fn truck(&self, id: &Ulid) -> Option<Truck> {
        self.trucks.get(id).map(|e| e.value().clone())
    }

    fn event(&self, id: &Ulid) -> Option<Event> {
        self.events.get(id).map(|e| e.value().clone())
    }

    fn events_by_truck(&self, truck_id: &Ulid) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.value().truck_id.as_ref() == Some(truck_id))
            .map(|e| e.value().clone())
            .collect()
    }

    fn quote_line(&self, id: &Ulid) -> Option<QuoteLine> {
        self.lines.get(id).map(|e| e.value().clone())
    }

    fn lines_by_event(&self, event_id: &Ulid) -> Vec<QuoteLine> {
        let mut lines: Vec<QuoteLine> = self
            .lines
            .iter()
            .filter(|e| &e.value().event_id == event_id)
            .map(|e| e.value().clone())
            .collect();
        lines.sort_by_key(|l| l.id);
        lines
    }

    fn reservations_by_event(&self, event_id: &Ulid) -> Vec<Reservation> {
        let ids = self.reservations_by_event.get(event_id).map(|e| e.value().clone());
        self.reservations_by_ids(ids)
    }

    fn reservations_for_asset(&self, asset_id: &Ulid) -> Vec<Reservation> {
        let ids = self.reservations_by_asset.get(asset_id).map(|e| e.value().clone());
        self.reservations_by_ids(ids)
    }

    fn scan_list(&self, id: &Ulid) -> Option<ScanList> {
        self.scan_lists.get(id).map(|e| e.value().clone())
    }

    fn scan_lists_by_event(&self, event_id: &Ulid) -> Vec<ScanList> {
        let mut lists: Vec<ScanList> = self
            .scan_lists
            .iter()
            .filter(|e| &e.value().event_id == event_id)
            .map(|e| e.value().clone())
            .collect();
        lists.sort_by_key(|l| l.id);
        lists
    }

    fn task(&self, id: &Ulid) -> Option<Task> {
        self.tasks.get(id).map(|e| e.value().clone())
    }

    fn chain(&self, id: &Ulid) -> Option<TaskChain> {
        self.chains.get(id).map(|e| e.value().clone())
    }

    fn chains_by_event(&self, event_id: &Ulid) -> Vec<TaskChain> {
        let mut chains: Vec<TaskChain> = self
            .chains
            .iter()
            .filter(|e| &e.value().event_id == event_id)
            .map(|e| e.value().clone())
            .collect();
        chains.sort_by_key(|c| c.id);
        chains
    }

    fn tasks_in_chain(&self, chain_id: &Ulid) -> Vec<Task> {
        let Some(chain) = self.chain(chain_id) else {
            return Vec::new();
        };
        chain.task_ids.iter().filter_map(|id| self.task(id)).collect()
    }

    fn snapshot(&self) -> Vec<Change> {
        let mut changes = Vec::new();
        changes.extend(self.catalog_items().into_iter().map(Change::CatalogItemUpserted));
        changes.extend(sorted_by_id(&self.assets).into_iter().map(Change::AssetUpserted));
        changes.extend(sorted_by_id(&self.trucks).into_iter().map(Change::TruckUpserted));
        changes.extend(sorted_by_id(&self.events).into_iter().map(Change::EventUpserted));
        changes.extend(sorted_by_id(&self.lines).into_iter().map(Change::QuoteLineUpserted));
        changes.extend(
            sorted_by_id(&self.reservations)
                .into_iter()
                .map(Change::ReservationUpserted),
        );
        changes.extend(sorted_by_id(&self.tasks).into_iter().map(Change::TaskUpserted));
        changes.extend(sorted_by_id(&self.chains).into_iter().map(Change::ChainCreated));
        changes.extend(sorted_by_id(&self.scan_lists).into_iter().map(Change::ScanListUpserted));
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(asset_id: Ulid, event_id: Ulid) -> Reservation {
        Reservation {
            id: Ulid::new(),
            asset_id,
            event_id,
            span: Span::new(0, DAY),
            status: ReservationStatus::Pending,
        }
    }

    #[test]
    fn reservation_indexes_follow_upserts_and_deletes() {
        let store = InMemoryStore::new();
        let asset = Ulid::new();
        let event = Ulid::new();
        let r = reservation(asset, event);

        store.apply(&Change::ReservationUpserted(r.clone()));
        assert_eq!(store.reservations_for_asset(&asset), vec![r.clone()]);
        assert_eq!(store.reservations_by_event(&event), vec![r.clone()]);

        let mut confirmed = r.clone();
        confirmed.status = ReservationStatus::Confirmed;
        store.apply(&Change::ReservationUpserted(confirmed.clone()));
        assert_eq!(store.reservations_for_asset(&asset), vec![confirmed]);
        assert_eq!(store.reservation_count(), 1);

        store.apply(&Change::ReservationDeleted { id: r.id });
        assert!(store.reservations_for_asset(&asset).is_empty());
        assert!(store.reservations_by_event(&event).is_empty());
    }

    #[test]
    fn delete_unknown_reservation_is_noop() {
        let store = InMemoryStore::new();
        store.apply(&Change::ReservationDeleted { id: Ulid::new() });
        assert_eq!(store.reservation_count(), 0);
    }

    #[test]
    fn assets_by_sku_filters_and_orders() {
        let store = InMemoryStore::new();
        for sku in ["X", "Y", "X"] {
            store.apply(&Change::AssetUpserted(Asset {
                id: Ulid::new(),
                sku: sku.into(),
                serial_number: None,
                status: AssetStatus::Available,
                current_location_id: None,
                needs_maintenance: false,
                value: 0,
            }));
        }
        let xs = store.assets_by_sku("X");
        assert_eq!(xs.len(), 2);
        assert!(xs[0].id < xs[1].id);
    }

    #[test]
    fn snapshot_rebuilds_state() {
        let store = InMemoryStore::new();
        let truck = Truck { id: Ulid::new(), name: "TRK1".into() };
        let event = Event {
            id: Ulid::new(),
            name: "E1".into(),
            span: Span::new(0, DAY),
            truck_id: Some(truck.id),
            status: EventStatus::Planned,
        };
        store.apply(&Change::TruckUpserted(truck.clone()));
        store.apply(&Change::EventUpserted(event.clone()));
        store.apply(&Change::ReservationUpserted(reservation(Ulid::new(), event.id)));

        let copy = InMemoryStore::new();
        for change in store.snapshot() {
            copy.apply(&change);
        }
        assert_eq!(copy.truck(&truck.id), Some(truck.clone()));
        assert_eq!(copy.events_by_truck(&truck.id), vec![event.clone()]);
        assert_eq!(copy.reservations_by_event(&event.id).len(), 1);
    }
}
