use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if !span.is_valid() {
        return Err(EngineError::InvalidInput("window start must be before end"));
    }
    Ok(())
}

/// Fails with `TruckUnavailable` if another live event holds `truck` over an overlapping window.
pub(crate) fn check_truck_free(
    event: &Event,
    truck: &Truck,
    truck_events: &[Event],
) -> Result<(), EngineError> {
    let clash = truck_events.iter().find(|other| {
        other.id != event.id
            && other.status != EventStatus::Cancelled
            && other.truck_id == Some(truck.id)
            && other.span.overlaps(&event.span)
    });
    match clash {
        Some(other) => Err(EngineError::TruckUnavailable {
            truck_name: truck.name.clone(),
            conflicting_event: other.name.clone(),
        }),
        None => Ok(()),
    }
}

/// Verify that applying `staged` keeps every asset free of cross-event overlapping
/// active reservations. `existing` maps asset id to that asset's stored reservations.
pub(crate) fn check_no_double_booking(
    staged: &[Change],
    existing: &HashMap<Ulid, Vec<Reservation>>,
) -> Result<(), EngineError> {
    let mut deleted: Vec<Ulid> = Vec::new();
    let mut upserts: Vec<&Reservation> = Vec::new();
    for change in staged {
        match change {
            Change::ReservationUpserted(r) => upserts.push(r),
            Change::ReservationDeleted { id } => deleted.push(*id),
            _ => {}
        }
    }

    for (i, r) in upserts.iter().enumerate() {
        if !r.is_active() {
            continue;
        }
        let stored = existing.get(&r.asset_id).into_iter().flatten().filter(|other| {
            other.id != r.id
                && !deleted.contains(&other.id)
                && !upserts.iter().any(|u| u.id == other.id)
        });
        for other in stored {
            if other.conflicts_with(r.event_id, &r.span) {
                return Err(EngineError::ConflictDetected {
                    asset_id: r.asset_id,
                    event_id: other.event_id,
                });
            }
        }
        for other in &upserts[i + 1..] {
            if other.asset_id == r.asset_id && other.conflicts_with(r.event_id, &r.span) {
                return Err(EngineError::ConflictDetected {
                    asset_id: r.asset_id,
                    event_id: other.event_id,
                });
            }
        }
    }
    Ok(())
}
