use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use crate::model::*;

/// Requests this close to the available count are flagged as low margin.
pub const LOW_MARGIN_BUFFER: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityResult {
    pub sku: String,
    pub requested_quantity: u32,
    pub available_quantity: u32,
    pub total_quantity: u32,
    pub reserved_quantity: u32,
    /// Active reservations from other events overlapping the window on this SKU's assets.
    pub conflicts: Vec<Reservation>,
    pub can_fulfill: bool,
}

impl AvailabilityResult {
    pub fn severity(&self) -> Severity {
        if !self.can_fulfill {
            Severity::Critical
        } else if self.available_quantity < self.requested_quantity + LOW_MARGIN_BUFFER {
            Severity::Warning
        } else {
            Severity::Ok
        }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

// ── Availability Algorithm ────────────────────────────────────────

/// How many units of `item` are free for `event`'s window.
///
/// Reservations belonging to `event` itself never count against it. The
/// conflict list is subtracted from the partitioned free count a second
/// time; callers rely on this conservative figure.
pub fn check_availability(
    item: &CatalogItem,
    event: &Event,
    requested: u32,
    all_assets: &[Asset],
    all_reservations: &[Reservation],
) -> AvailabilityResult {
    let item_assets: Vec<&Asset> = all_assets.iter().filter(|a| a.sku == item.sku).collect();
    let asset_ids: HashSet<Ulid> = item_assets.iter().map(|a| a.id).collect();

    let conflicts: Vec<Reservation> = all_reservations
        .iter()
        .filter(|r| asset_ids.contains(&r.asset_id) && r.conflicts_with(event.id, &event.span))
        .cloned()
        .collect();

    let busy: HashSet<Ulid> = conflicts.iter().map(|r| r.asset_id).collect();
    let total = item_assets.len() as u32;
    let reserved = busy.len() as u32;
    let free_by_partition = total - reserved;

    let available = free_by_partition.saturating_sub(conflicts.len() as u32);

    AvailabilityResult {
        sku: item.sku.clone(),
        requested_quantity: requested,
        available_quantity: available,
        total_quantity: total,
        reserved_quantity: reserved,
        conflicts,
        can_fulfill: requested <= available,
    }
}

/// `check_availability` per SKU. SKUs missing from `catalog` are skipped.
pub fn check_availability_batch(
    catalog: &[CatalogItem],
    event: &Event,
    requested: &HashMap<String, u32>,
    all_assets: &[Asset],
    all_reservations: &[Reservation],
) -> HashMap<String, AvailabilityResult> {
    catalog
        .iter()
        .filter_map(|item| {
            requested.get(&item.sku).map(|&qty| {
                (
                    item.sku.clone(),
                    check_availability(item, event, qty, all_assets, all_reservations),
                )
            })
        })
        .collect()
}

/// Assets of `sku` with no conflicting reservation for `event` that `event` does not already hold.
pub fn eligible_assets<'a>(
    sku: &str,
    event: &Event,
    all_assets: &'a [Asset],
    all_reservations: &[Reservation],
) -> Vec<&'a Asset> {
    let blocked: HashSet<Ulid> = all_reservations
        .iter()
        .filter(|r| {
            r.conflicts_with(event.id, &event.span) || (r.event_id == event.id && r.is_active())
        })
        .map(|r| r.asset_id)
        .collect();

    all_assets
        .iter()
        .filter(|a| a.sku == sku && !blocked.contains(&a.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(sku: &str) -> CatalogItem {
        CatalogItem {
            sku: sku.into(),
            name: format!("{sku} item"),
            category: "lighting".into(),
            unit_weight_kg: 4.5,
            unit_volume_m3: 0.02,
            unit_price: 1_500,
        }
    }

    fn asset(sku: &str, value: Cents) -> Asset {
        Asset {
            id: Ulid::new(),
            sku: sku.into(),
            serial_number: None,
            status: AssetStatus::Available,
            current_location_id: None,
            needs_maintenance: false,
            value,
        }
    }

    fn event(start_day: i64, end_day: i64) -> Event {
        Event {
            id: Ulid::new(),
            name: "gig".into(),
            span: Span::new(start_day * DAY, end_day * DAY),
            truck_id: None,
            status: EventStatus::Planned,
        }
    }

    fn reservation(asset: &Asset, event: &Event, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            asset_id: asset.id,
            event_id: event.id,
            span: event.span,
            status,
        }
    }

    #[test]
    fn all_free_with_low_margin() {
        let x = item("X");
        let assets: Vec<Asset> = (0..5).map(|_| asset("X", 100)).collect();
        let e = event(1, 3);

        let result = check_availability(&x, &e, 5, &assets, &[]);
        assert!(result.can_fulfill);
        assert_eq!(result.available_quantity, 5);
        assert_eq!(result.total_quantity, 5);
        assert_eq!(result.reserved_quantity, 0);
        assert_eq!(result.severity(), Severity::Warning);
    }

    #[test]
    fn comfortable_margin_is_ok() {
        let x = item("X");
        let assets: Vec<Asset> = (0..10).map(|_| asset("X", 100)).collect();
        let result = check_availability(&x, &event(1, 3), 4, &assets, &[]);
        assert_eq!(result.severity(), Severity::Ok);
    }

    #[test]
    fn overlapping_event_is_critical() {
        let x = item("X");
        let assets: Vec<Asset> = (0..3).map(|_| asset("X", 100)).collect();
        let e1 = event(10, 12);
        let e2 = event(11, 13);
        let reservations = vec![
            reservation(&assets[0], &e1, ReservationStatus::Pending),
            reservation(&assets[1], &e1, ReservationStatus::Confirmed),
        ];

        let result = check_availability(&x, &e2, 2, &assets, &reservations);
        assert!(result.has_conflicts());
        assert!(result.available_quantity <= 1);
        assert_eq!(result.reserved_quantity, 2);
        assert!(!result.can_fulfill);
        assert_eq!(result.severity(), Severity::Critical);
    }

    #[test]
    fn conflicts_are_subtracted_twice() {
        let x = item("X");
        let assets: Vec<Asset> = (0..6).map(|_| asset("X", 100)).collect();
        let e1 = event(1, 5);
        let e2 = event(2, 4);
        let reservations = vec![reservation(&assets[0], &e1, ReservationStatus::Pending)];

        let result = check_availability(&x, &e2, 1, &assets, &reservations);
        // 5 free by partition, minus 1 conflict
        assert_eq!(result.available_quantity, 4);
    }

    #[test]
    fn adjacent_window_is_not_a_conflict() {
        let x = item("X");
        let assets = vec![asset("X", 100)];
        let e1 = event(1, 5);
        let e2 = event(5, 8);
        let reservations = vec![reservation(&assets[0], &e1, ReservationStatus::Confirmed)];

        let result = check_availability(&x, &e2, 1, &assets, &reservations);
        assert!(!result.has_conflicts());
        assert_eq!(result.available_quantity, 1);
        assert!(result.can_fulfill);
    }

    #[test]
    fn own_and_cancelled_reservations_ignored() {
        let x = item("X");
        let assets: Vec<Asset> = (0..2).map(|_| asset("X", 100)).collect();
        let e1 = event(1, 5);
        let e2 = event(2, 4);
        let reservations = vec![
            reservation(&assets[0], &e2, ReservationStatus::Pending),
            reservation(&assets[1], &e1, ReservationStatus::Cancelled),
        ];

        let result = check_availability(&x, &e2, 2, &assets, &reservations);
        assert_eq!(result.available_quantity, 2);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn other_skus_do_not_count() {
        let x = item("X");
        let assets = vec![asset("X", 100), asset("Y", 100), asset("Y", 100)];
        let result = check_availability(&x, &event(1, 2), 1, &assets, &[]);
        assert_eq!(result.total_quantity, 1);
    }

    #[test]
    fn never_goes_negative() {
        let x = item("X");
        let assets = vec![asset("X", 100)];
        let e1 = event(1, 3);
        let e0 = event(0, 2);
        let e2 = event(2, 4);
        // Same asset booked by two other events (a pre-existing inconsistency)
        let reservations = vec![
            reservation(&assets[0], &e1, ReservationStatus::Pending),
            reservation(&assets[0], &e0, ReservationStatus::Pending),
        ];
        let result = check_availability(&x, &e2, 1, &assets, &reservations);
        assert_eq!(result.available_quantity, 0);
        assert_eq!(result.conflicts.len(), 2);
    }

    #[test]
    fn batch_checks_each_requested_sku() {
        let catalog = vec![item("X"), item("Y"), item("Z")];
        let assets = vec![asset("X", 1), asset("X", 1), asset("Y", 1)];
        let requested = HashMap::from([("X".to_string(), 2), ("Y".to_string(), 3)]);

        let results = check_availability_batch(&catalog, &event(1, 2), &requested, &assets, &[]);
        assert_eq!(results.len(), 2);
        assert!(results["X"].can_fulfill);
        assert!(!results["Y"].can_fulfill);
        assert!(!results.contains_key("Z"));
    }

    #[test]
    fn eligibility_excludes_conflicts_and_own_holdings() {
        let assets: Vec<Asset> = (0..4).map(|_| asset("X", 100)).collect();
        let e1 = event(1, 5);
        let e2 = event(3, 6);
        let reservations = vec![
            reservation(&assets[0], &e1, ReservationStatus::Confirmed),
            reservation(&assets[1], &e2, ReservationStatus::Pending),
            reservation(&assets[2], &e1, ReservationStatus::Cancelled),
        ];

        let eligible = eligible_assets("X", &e2, &assets, &reservations);
        let ids: Vec<Ulid> = eligible.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![assets[2].id, assets[3].id]);
    }
}
