use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

/// What completing a scan-list in one direction does to the event's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTransition {
    /// Reservations in `from` move to `to`. `from == None` matches every open reservation.
    pub reservation_from: Option<ReservationStatus>,
    pub reservation_to: Option<ReservationStatus>,
    pub asset_status: AssetStatus,
    pub event_status: Option<EventStatus>,
}

pub fn transition_for(direction: ScanDirection) -> ScanTransition {
    match direction {
        ScanDirection::StockToTruck => ScanTransition {
            reservation_from: Some(ReservationStatus::Pending),
            reservation_to: Some(ReservationStatus::Confirmed),
            asset_status: AssetStatus::InTransitToEvent,
            event_status: Some(EventStatus::InProgress),
        },
        ScanDirection::TruckToEvent => ScanTransition {
            reservation_from: Some(ReservationStatus::Confirmed),
            reservation_to: Some(ReservationStatus::Delivered),
            asset_status: AssetStatus::InUse,
            event_status: None,
        },
        ScanDirection::EventToTruck => ScanTransition {
            reservation_from: Some(ReservationStatus::Delivered),
            reservation_to: Some(ReservationStatus::Loaded),
            asset_status: AssetStatus::InTransitToStock,
            event_status: None,
        },
        ScanDirection::TruckToStock => ScanTransition {
            reservation_from: None,
            reservation_to: Some(ReservationStatus::Returned),
            asset_status: AssetStatus::Available,
            event_status: Some(EventStatus::Completed),
        },
    }
}

/// Stage the reservation, asset and event updates for `direction`.
///
/// `assets` must contain every asset referenced by `reservations`;
/// `other_reservations` are the same assets' reservations for other events.
pub fn plan_scan_transition(
    direction: ScanDirection,
    event: &Event,
    reservations: &[Reservation],
    assets: &[Asset],
    other_reservations: &[Reservation],
) -> Vec<Change> {
    let t = transition_for(direction);
    let mut changes = Vec::new();

    let open: Vec<&Reservation> = reservations
        .iter()
        .filter(|r| r.event_id == event.id && r.is_open())
        .collect();

    for r in &open {
        let matches = t.reservation_from.is_none_or(|from| r.status == from);
        if let (true, Some(to)) = (matches, t.reservation_to)
            && r.status != to
        {
            let mut moved = (*r).clone();
            moved.status = to;
            changes.push(Change::ReservationUpserted(moved));
        }
    }

    let touched: HashSet<Ulid> = open.iter().map(|r| r.asset_id).collect();
    for asset in assets.iter().filter(|a| touched.contains(&a.id)) {
        if asset.status.is_manual_condition() {
            continue;
        }
        let mut next = t.asset_status;
        if next == AssetStatus::Available
            && other_reservations
                .iter()
                .any(|r| r.asset_id == asset.id && r.event_id != event.id && r.is_open())
        {
            next = AssetStatus::Reserved;
        }
        if asset.status != next {
            let mut moved = asset.clone();
            moved.status = next;
            changes.push(Change::AssetUpserted(moved));
        }
    }

    if let Some(status) = t.event_status
        && event.status != status
    {
        let mut moved = event.clone();
        moved.status = status;
        changes.push(Change::EventUpserted(moved));
    }

    changes
}

/// Stage cancellation of every open reservation held by `event`.
pub fn plan_event_cancellation(
    event: &Event,
    reservations: &[Reservation],
    assets: &[Asset],
    other_reservations: &[Reservation],
) -> Vec<Change> {
    let mut changes = Vec::new();
    let mut touched = HashSet::new();
    for r in reservations.iter().filter(|r| r.event_id == event.id && r.is_open()) {
        let mut cancelled = r.clone();
        cancelled.status = ReservationStatus::Cancelled;
        changes.push(Change::ReservationUpserted(cancelled));
        touched.insert(r.asset_id);
    }
    for asset in assets.iter().filter(|a| touched.contains(&a.id)) {
        if asset.status != AssetStatus::Reserved {
            continue;
        }
        let still_held = other_reservations
            .iter()
            .any(|r| r.asset_id == asset.id && r.event_id != event.id && r.is_open());
        if !still_held {
            let mut freed = asset.clone();
            freed.status = AssetStatus::Available;
            changes.push(Change::AssetUpserted(freed));
        }
    }
    let mut cancelled = event.clone();
    cancelled.status = EventStatus::Cancelled;
    changes.push(Change::EventUpserted(cancelled));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(status: AssetStatus) -> Asset {
        Asset {
            id: Ulid::new(),
            sku: "X".into(),
            serial_number: None,
            status,
            current_location_id: None,
            needs_maintenance: false,
            value: 100,
        }
    }

    fn event() -> Event {
        Event {
            id: Ulid::new(),
            name: "E1".into(),
            span: Span::new(DAY, 3 * DAY),
            truck_id: None,
            status: EventStatus::Validated,
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

    fn statuses(changes: &[Change]) -> (Vec<ReservationStatus>, Vec<AssetStatus>, Vec<EventStatus>) {
        let mut r = Vec::new();
        let mut a = Vec::new();
        let mut e = Vec::new();
        for c in changes {
            match c {
                Change::ReservationUpserted(x) => r.push(x.status),
                Change::AssetUpserted(x) => a.push(x.status),
                Change::EventUpserted(x) => e.push(x.status),
                _ => {}
            }
        }
        (r, a, e)
    }

    #[test]
    fn loading_freezes_pending_reservations() {
        let e = event();
        let assets = vec![asset(AssetStatus::Reserved), asset(AssetStatus::Reserved)];
        let rs: Vec<Reservation> = assets
            .iter()
            .map(|a| reservation(a, &e, ReservationStatus::Pending))
            .collect();

        let changes = plan_scan_transition(ScanDirection::StockToTruck, &e, &rs, &assets, &[]);
        let (r, a, ev) = statuses(&changes);
        assert_eq!(r, vec![ReservationStatus::Confirmed; 2]);
        assert_eq!(a, vec![AssetStatus::InTransitToEvent; 2]);
        assert_eq!(ev, vec![EventStatus::InProgress]);
    }

    #[test]
    fn delivery_and_reload_move_assets() {
        let e = event();
        let assets = vec![asset(AssetStatus::InTransitToEvent)];
        let rs = vec![reservation(&assets[0], &e, ReservationStatus::Confirmed)];

        let delivered = plan_scan_transition(ScanDirection::TruckToEvent, &e, &rs, &assets, &[]);
        let (r, a, ev) = statuses(&delivered);
        assert_eq!(r, vec![ReservationStatus::Delivered]);
        assert_eq!(a, vec![AssetStatus::InUse]);
        assert!(ev.is_empty());

        let assets = vec![asset(AssetStatus::InUse)];
        let rs = vec![reservation(&assets[0], &e, ReservationStatus::Delivered)];
        let reloaded = plan_scan_transition(ScanDirection::EventToTruck, &e, &rs, &assets, &[]);
        let (r, a, _) = statuses(&reloaded);
        assert_eq!(r, vec![ReservationStatus::Loaded]);
        assert_eq!(a, vec![AssetStatus::InTransitToStock]);
    }

    #[test]
    fn return_releases_everything_and_completes_event() {
        let e = event();
        let assets = vec![asset(AssetStatus::InTransitToStock), asset(AssetStatus::InTransitToStock)];
        let rs = vec![
            reservation(&assets[0], &e, ReservationStatus::Loaded),
            reservation(&assets[1], &e, ReservationStatus::Confirmed),
        ];

        let changes = plan_scan_transition(ScanDirection::TruckToStock, &e, &rs, &assets, &[]);
        let (r, a, ev) = statuses(&changes);
        assert_eq!(r, vec![ReservationStatus::Returned; 2]);
        assert_eq!(a, vec![AssetStatus::Available; 2]);
        assert_eq!(ev, vec![EventStatus::Completed]);
    }

    #[test]
    fn returned_asset_booked_later_stays_reserved() {
        let e = event();
        let later = Event {
            id: Ulid::new(),
            span: Span::new(10 * DAY, 12 * DAY),
            ..event()
        };
        let assets = vec![asset(AssetStatus::InTransitToStock)];
        let rs = vec![reservation(&assets[0], &e, ReservationStatus::Loaded)];
        let others = vec![reservation(&assets[0], &later, ReservationStatus::Pending)];

        let changes = plan_scan_transition(ScanDirection::TruckToStock, &e, &rs, &assets, &others);
        let (_, a, _) = statuses(&changes);
        assert_eq!(a, vec![AssetStatus::Reserved]);
    }

    #[test]
    fn manual_conditions_survive_scans() {
        let e = event();
        let assets = vec![asset(AssetStatus::Damaged)];
        let rs = vec![reservation(&assets[0], &e, ReservationStatus::Pending)];
        let changes = plan_scan_transition(ScanDirection::StockToTruck, &e, &rs, &assets, &[]);
        let (r, a, _) = statuses(&changes);
        assert_eq!(r.len(), 1);
        assert!(a.is_empty());
    }

    #[test]
    fn cancelled_reservations_are_untouched() {
        let e = event();
        let assets = vec![asset(AssetStatus::Available)];
        let rs = vec![reservation(&assets[0], &e, ReservationStatus::Cancelled)];
        let changes = plan_scan_transition(ScanDirection::TruckToStock, &e, &rs, &assets, &[]);
        let (r, a, ev) = statuses(&changes);
        assert!(r.is_empty());
        assert!(a.is_empty());
        assert_eq!(ev, vec![EventStatus::Completed]);
    }

    #[test]
    fn cancellation_frees_reserved_assets() {
        let e = event();
        let assets = vec![asset(AssetStatus::Reserved), asset(AssetStatus::Damaged)];
        let rs: Vec<Reservation> = assets
            .iter()
            .map(|a| reservation(a, &e, ReservationStatus::Pending))
            .collect();
        let changes = plan_event_cancellation(&e, &rs, &assets, &[]);
        let (r, a, ev) = statuses(&changes);
        assert_eq!(r, vec![ReservationStatus::Cancelled; 2]);
        assert_eq!(a, vec![AssetStatus::Available]);
        assert_eq!(ev, vec![EventStatus::Cancelled]);
    }
}
