use std::cmp::Ordering;

use crate::model::*;

/// Ranking used to pick assets: Available first, then units not flagged for
/// maintenance, then the cheapest.
pub fn compare_candidates(a: &Asset, b: &Asset) -> Ordering {
    let unavailable = |x: &Asset| x.status != AssetStatus::Available;
    unavailable(a)
        .cmp(&unavailable(b))
        .then(a.needs_maintenance.cmp(&b.needs_maintenance))
        .then(a.value.cmp(&b.value))
}

/// The best `quantity` candidates in ranked order. Ties keep input order.
pub fn select_best<'a>(candidates: &[&'a Asset], quantity: usize) -> Vec<&'a Asset> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| compare_candidates(a, b));
    ranked.truncate(quantity);
    ranked
}
