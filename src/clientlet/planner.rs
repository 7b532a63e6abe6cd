//! Pure planner (§4.5 steps 3-6), grounded on
//! `original_source/client_lite.py`'s `URI`, `generate_priority_list`,
//! `pseudo_copy`, `scan_overserved`/`pseudo_drop_overserved` and
//! `pseudo_rebalance`.
//!
//! No I/O here: callers build a [`Uri`] list from a source's inventory and
//! the servlet's claimant counts, run [`pseudo_copy`] then
//! [`pseudo_rebalance`] against a [`PlannerState`], and turn the resulting
//! `owned`/`drops` sets into claim/unclaim/transfer calls.

use std::collections::BTreeSet;

/// One file as seen by the planner: how many copies already exist
/// cluster-wide (`have`) against how many are wanted (`need`), plus its
/// size. `ratio` is `have / need`, computed once at construction — like the
/// original, later bookkeeping increments to `have` do not retroactively
/// change `ratio` within the same planning pass.
#[derive(Debug, Clone)]
pub struct Uri {
    pub source_context: String,
    pub path: String,
    pub size: u64,
    pub have: u32,
    pub need: u32,
    ratio: f64,
}

impl Uri {
    pub fn new(source_context: impl Into<String>, path: impl Into<String>, size: u64, have: u32, need: u32) -> Self {
        let ratio = if need == 0 { f64::INFINITY } else { have as f64 / need as f64 };
        Self { source_context: source_context.into(), path: path.into(), size, have, need, ratio }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    fn key(&self) -> (String, String) {
        (self.source_context.clone(), self.path.clone())
    }
}

/// Mutable working state threaded through a single crawl's planning pass.
pub struct PlannerState {
    pub list: Vec<Uri>,
    pub owned: BTreeSet<(String, String)>,
    pub probable_free: i64,
}

impl PlannerState {
    pub fn new(mut list: Vec<Uri>, owned: BTreeSet<(String, String)>, probable_free: i64) -> Self {
        // Two stable sorts in sequence, matching `sorted(key=size)` then
        // `sorted(key=ratio)`: the final order is ratio-ascending, with
        // same-ratio files tie-broken by size-ascending (preserved from
        // the first pass).
        list.sort_by(|a, b| a.size.cmp(&b.size));
        list.sort_by(|a, b| a.ratio().partial_cmp(&b.ratio()).unwrap());
        Self { list, owned, probable_free }
    }

    fn is_owned(&self, uri: &Uri) -> bool {
        self.owned.contains(&uri.key())
    }
}

/// Step 5: walk the (ratio-ascending) priority list once, adding every URI
/// that fits in `probable_free` to the plan, skipping (not breaking on) the
/// ones that don't — a later, smaller-sized same-ratio-group member can
/// still fit after an earlier member didn't (§8 scenario 6). Already-owned
/// files are left alone: their size is already accounted for in the
/// `probable_free` the caller computed from current on-disk state.
pub fn pseudo_copy(state: &mut PlannerState) {
    for uri in state.list.iter_mut() {
        if state.probable_free <= 0 {
            break;
        }
        let key = (uri.source_context.clone(), uri.path.clone());
        if state.owned.contains(&key) {
            continue;
        }
        if uri.size as i64 <= state.probable_free {
            state.probable_free -= uri.size as i64;
            state.owned.insert(key);
            uri.have += 1;
        }
    }
}

/// Step 6a/b helper: scanning from the highest-ratio end of the list,
/// collect owned files whose ratio strictly exceeds `ratio_target` until
/// `size_target` bytes have been found or an underserved (`ratio <
/// ratio_target`) file is reached — the list is ratio-sorted, so nothing
/// further back can be more served than that. Returns `None` if the target
/// could not be met at all.
fn scan_overserved(state: &PlannerState, size_target: i64, ratio_target: f64) -> Option<(Vec<(String, String)>, i64)> {
    let mut found: i64 = 0;
    let mut candidates = Vec::new();
    for uri in state.list.iter().rev() {
        if uri.ratio() < ratio_target {
            break;
        }
        if uri.ratio() > ratio_target && state.is_owned(uri) {
            candidates.push(uri.key());
            found += uri.size as i64;
            if found >= size_target {
                return Some((candidates, found));
            }
        }
    }
    if found >= size_target && !candidates.is_empty() {
        Some((candidates, found))
    } else {
        None
    }
}

/// Drops whatever [`scan_overserved`] finds, recording each path under its
/// source in `drops` for the caller to `unclaim`. Returns bytes reclaimed,
/// or 0 if nothing qualified.
fn drop_overserved(state: &mut PlannerState, size_target: i64, ratio_target: f64, drops: &mut Vec<(String, String)>) -> i64 {
    let Some((candidates, reclaimed)) = scan_overserved(state, size_target, ratio_target) else {
        return 0;
    };
    for key in &candidates {
        state.owned.remove(key);
        if let Some(uri) = state.list.iter_mut().find(|u| (u.source_context.clone(), u.path.clone()) == *key) {
            uri.have = uri.have.saturating_sub(1);
        }
    }
    drops.extend(candidates);
    state.probable_free += reclaimed;
    reclaimed
}

/// Step 6: when over-allocated (`probable_free < 0`), repeatedly reclaim
/// space from the most-overserved files at ratio target `1.0` until either
/// `probable_free` is non-negative or a reclaim pass finds nothing more —
/// spec.md's literal "repeatedly call drop_overserved", a deliberate
/// divergence from `client_lite.py`'s single call in this branch (recorded
/// in DESIGN.md). Then walks the list again, skipping owned files and
/// files already served past double the top ratio, dropping overserved
/// neighbors to make room for anything that doesn't yet fit.
pub fn pseudo_rebalance(state: &mut PlannerState) -> Vec<(String, String)> {
    let mut drops = Vec::new();

    if state.probable_free < 0 {
        loop {
            let needed = -state.probable_free;
            let reclaimed = drop_overserved(state, needed, 1.0, &mut drops);
            if reclaimed == 0 || state.probable_free >= 0 {
                break;
            }
        }
        if state.probable_free < 0 {
            return drops;
        }
    }

    let Some(top_ratio) = state.list.last().map(Uri::ratio) else { return drops };

    for i in 0..state.list.len() {
        let (ratio, size, owned) = {
            let uri = &state.list[i];
            (uri.ratio(), uri.size, state.is_owned(uri))
        };
        if ratio > 1.0 && ratio + 2.0 > top_ratio {
            break;
        }
        if owned {
            continue;
        }
        if size as i64 > state.probable_free {
            let space_needed = size as i64 - state.probable_free;
            let ratio_target = if ratio < 1.0 { 1.0 } else { ratio + 2.0 };
            let reclaimed = drop_overserved(state, space_needed, ratio_target, &mut drops);
            if reclaimed == 0 {
                break;
            }
        }
        if size as i64 <= state.probable_free {
            let key = (state.list[i].source_context.clone(), state.list[i].path.clone());
            state.owned.insert(key);
            state.list[i].have += 1;
            state.probable_free -= size as i64;
        }
    }

    drops
}
