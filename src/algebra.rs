// Interval Algebra - merge, trim and split of validity rows
//
// Pure functions over sets of (value, validity) rows. No I/O, no clock.
// A row set for one track is kept as a non-overlapping partition; every
// function here preserves that.

use serde::{Deserialize, Serialize};

use crate::attributes::ActiveState;
use crate::error::Result;
use crate::interval::{Bound, Instant, Interval};

// ============================================================================
// EFFECT ROW
// ============================================================================

/// One value valid for one business-time span
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectRow<T> {
    pub value: T,
    pub validity: Interval,
}

impl<T> EffectRow<T> {
    pub fn new(value: T, validity: Interval) -> Self {
        EffectRow { value, validity }
    }
}

fn sort_rows<T>(rows: &mut [EffectRow<T>]) {
    rows.sort_by(|a, b| a.validity.from().cmp(&b.validity.from()));
}

// ============================================================================
// MERGE
// ============================================================================

/// Write `incoming` over `existing`.
///
/// The incoming value wins wherever it overlaps; the rest of each existing
/// row is kept verbatim, clipped at the overlap. Existing rows fully covered
/// by `incoming` disappear. The output is sorted by `from`.
pub fn merge<T: Clone>(existing: &[EffectRow<T>], incoming: EffectRow<T>) -> Vec<EffectRow<T>> {
    let mut merged: Vec<EffectRow<T>> = existing
        .iter()
        .flat_map(|row| {
            row.validity
                .difference(&incoming.validity)
                .into_iter()
                .map(move |part| EffectRow::new(row.value.clone(), part))
        })
        .collect();

    merged.push(incoming);
    sort_rows(&mut merged);
    merged
}

// ============================================================================
// TRIM
// ============================================================================

/// Clip `rows` to `[new_from, new_to)`, dropping rows that fall outside
pub fn trim_to_bounds<T: Clone>(
    rows: &[EffectRow<T>],
    new_from: Bound,
    new_to: Bound,
) -> Result<Vec<EffectRow<T>>> {
    let bounds = Interval::new(new_from, new_to)?;
    Ok(clip(rows, &bounds))
}

/// Same as [`trim_to_bounds`] for an already validated interval
pub fn clip<T: Clone>(rows: &[EffectRow<T>], bounds: &Interval) -> Vec<EffectRow<T>> {
    let mut clipped: Vec<EffectRow<T>> = rows
        .iter()
        .filter_map(|row| {
            row.validity
                .intersect(bounds)
                .map(|part| EffectRow::new(row.value.clone(), part))
        })
        .collect();
    sort_rows(&mut clipped);
    clipped
}

// ============================================================================
// SHRINK
// ============================================================================

/// `Inactive` rows for every span covered by the old bounds but not the new
/// ones. Empty when the bounds only grow or stay put.
pub fn inactivate_shrunk_span(
    old_from: Bound,
    old_to: Bound,
    new_from: Bound,
    new_to: Bound,
) -> Result<Vec<EffectRow<ActiveState>>> {
    let old = Interval::new(old_from, old_to)?;
    let new = Interval::new(new_from, new_to)?;

    Ok(old
        .difference(&new)
        .into_iter()
        .map(|part| EffectRow::new(ActiveState::Inactive, part))
        .collect())
}

// ============================================================================
// CONSOLIDATION
// ============================================================================

/// Sort and join touching rows that carry equal values
pub fn consolidate<T: PartialEq>(mut rows: Vec<EffectRow<T>>) -> Vec<EffectRow<T>> {
    sort_rows(&mut rows);

    let mut joined: Vec<EffectRow<T>> = Vec::with_capacity(rows.len());
    for row in rows {
        match joined.last_mut() {
            Some(last) if last.value == row.value && last.validity.meets(&row.validity) => {
                // from < to holds: last.from < last.to == row.from < row.to
                if let Ok(span) = Interval::new(last.validity.from(), row.validity.to()) {
                    last.validity = span;
                }
            }
            _ => joined.push(row),
        }
    }
    joined
}

// ============================================================================
// LOOKUPS
// ============================================================================

/// The row in force at business time `at`
pub fn row_at<T>(rows: &[EffectRow<T>], at: Instant) -> Option<&EffectRow<T>> {
    rows.iter().find(|row| row.validity.contains(at))
}

/// Smallest interval covering every row, `None` for an empty set
pub fn span<T>(rows: &[EffectRow<T>]) -> Option<Interval> {
    let from = rows.iter().map(|r| r.validity.from()).min()?;
    let to = rows.iter().map(|r| r.validity.to()).max()?;
    Interval::new(from, to).ok()
}

/// Parts of `interval` that no row covers
pub fn uncovered<T>(rows: &[EffectRow<T>], interval: Interval) -> Vec<Interval> {
    rows.iter().fold(vec![interval], |gaps, row| {
        gaps.into_iter()
            .flat_map(|gap| gap.difference(&row.validity))
            .collect()
    })
}

// ============================================================================
// TESTS
// ============================================================================
