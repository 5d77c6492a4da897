use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::availability::eligible_assets;
use super::selector::select_best;
use super::EngineError;

/// Staged result of an allocation step. Nothing is persisted until the
/// engine commits `changes` as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationPlan {
    pub assigned: Vec<Ulid>,
    pub reserved: Vec<Ulid>,
    pub released: Vec<Ulid>,
    pub changes: Vec<Change>,
}

/// Working copy of one SKU's assets and their reservations across all events.
#[derive(Debug, Clone, Default)]
pub struct Pool {
    pub assets: Vec<Asset>,
    pub reservations: Vec<Reservation>,
}

impl Pool {
    pub fn new(assets: Vec<Asset>, reservations: Vec<Reservation>) -> Self {
        Self {
            assets,
            reservations,
        }
    }

    /// Fold staged changes in so later planning on the same pool sees them.
    pub fn absorb(&mut self, changes: &[Change]) {
        for change in changes {
            match change {
                Change::AssetUpserted(asset) => {
                    if let Some(slot) = self.assets.iter_mut().find(|a| a.id == asset.id) {
                        *slot = asset.clone();
                    }
                }
                Change::ReservationUpserted(r) => {
                    match self.reservations.iter_mut().find(|x| x.id == r.id) {
                        Some(slot) => *slot = r.clone(),
                        None => self.reservations.push(r.clone()),
                    }
                }
                Change::ReservationDeleted { id } => self.reservations.retain(|r| r.id != *id),
                _ => {}
            }
        }
    }

    fn asset(&self, id: &Ulid) -> Option<&Asset> {
        self.assets.iter().find(|a| a.id == *id)
    }
}

/// Pick `count` fresh assets for `event` and stage one Pending reservation per asset.
pub fn plan_reserve(
    sku: &str,
    count: usize,
    event: &Event,
    exclude: &[Ulid],
    pool: &Pool,
) -> Result<(Vec<Ulid>, Vec<Change>), EngineError> {
    if count == 0 {
        return Ok((Vec::new(), Vec::new()));
    }
    let candidates: Vec<&Asset> = eligible_assets(sku, event, &pool.assets, &pool.reservations)
        .into_iter()
        .filter(|a| !exclude.contains(&a.id))
        .collect();
    if candidates.len() < count {
        return Err(EngineError::InsufficientStock {
            available: candidates.len() as u32,
            requested: count as u32,
        });
    }

    let chosen = select_best(&candidates, count);
    let mut changes = Vec::with_capacity(chosen.len() * 2);
    let mut ids = Vec::with_capacity(chosen.len());
    for asset in chosen {
        changes.push(Change::ReservationUpserted(Reservation {
            id: Ulid::new(),
            asset_id: asset.id,
            event_id: event.id,
            span: event.span,
            status: ReservationStatus::Pending,
        }));
        if asset.status == AssetStatus::Available {
            let mut reserved = asset.clone();
            reserved.status = AssetStatus::Reserved;
            changes.push(Change::AssetUpserted(reserved));
        }
        ids.push(asset.id);
    }
    Ok((ids, changes))
}

/// Stage deletion of `event`'s reservations on `asset_ids`, returning
/// merely-Reserved assets to Available once nothing else holds them.
pub fn plan_release(asset_ids: &[Ulid], event: &Event, pool: &Pool) -> Vec<Change> {
    let targets: HashSet<Ulid> = asset_ids.iter().copied().collect();
    let doomed: Vec<&Reservation> = pool
        .reservations
        .iter()
        .filter(|r| r.event_id == event.id && targets.contains(&r.asset_id))
        .collect();

    let mut changes: Vec<Change> = doomed
        .iter()
        .map(|r| Change::ReservationDeleted { id: r.id })
        .collect();

    for asset_id in asset_ids {
        let Some(asset) = pool.asset(asset_id) else {
            continue;
        };
        if asset.status != AssetStatus::Reserved {
            continue;
        }
        let still_held = pool
            .reservations
            .iter()
            .any(|r| r.asset_id == *asset_id && r.event_id != event.id && r.is_open());
        if !still_held {
            let mut freed = asset.clone();
            freed.status = AssetStatus::Available;
            changes.push(Change::AssetUpserted(freed));
        }
    }
    changes
}

/// Bring `line` to `new_quantity` assets. Growth appends to the tail; shrinking drops from the tail.
pub fn plan_adjust(
    line: &QuoteLine,
    new_quantity: u32,
    event: &Event,
    pool: &Pool,
) -> Result<AllocationPlan, EngineError> {
    let current = line.assigned_assets.len();
    let target = new_quantity as usize;
    let mut updated = line.clone();
    updated.quantity = new_quantity;

    let mut plan = AllocationPlan {
        assigned: line.assigned_assets.clone(),
        ..AllocationPlan::default()
    };

    if target > current {
        let (added, changes) =
            plan_reserve(&line.sku, target - current, event, &line.assigned_assets, pool)?;
        plan.assigned.extend_from_slice(&added);
        plan.reserved = added;
        plan.changes = changes;
    } else if target < current {
        let trailing = line.assigned_assets[target..].to_vec();
        plan.changes = plan_release(&trailing, event, pool);
        plan.assigned.truncate(target);
        plan.released = trailing;
    }

    if updated.assigned_assets != plan.assigned || updated.quantity != line.quantity {
        updated.assigned_assets = plan.assigned.clone();
        plan.changes.push(Change::QuoteLineUpserted(updated));
    }
    Ok(plan)
}
