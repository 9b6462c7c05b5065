//! Rank assignment for reordering items inside one scope (cards of a list, lists of a board).
//!
//! Ranks are sparse sort keys. A move re-ranks only the moved item when an integer
//! fits strictly between its new neighbours; otherwise the scope is renumbered
//! `0..n` and only the items whose rank changed are reported.

/// Integer rank strictly between `before` and `after`, if one exists.
pub fn between(before: Option<i64>, after: Option<i64>) -> Option<i64> {
    match (before, after) {
        (None, None) => Some(0),
        (Some(before), None) => before.checked_add(1),
        (None, Some(after)) => after.checked_sub(1),
        (Some(before), Some(after)) => {
            let gap = after.checked_sub(before)?;
            if gap > 1 {
                Some(before + gap / 2)
            } else {
                None
            }
        }
    }
}

/// Re-rank plan for `ranks` (already in the new display sequence) after the item at
/// `moved_at` was moved there. Returns `(index, new_rank)` pairs; empty when the
/// sequence is already ordered.
pub fn plan(ranks: &[i64], moved_at: usize) -> Vec<(usize, i64)> {
    if moved_at >= ranks.len() {
        return Vec::new();
    }

    let before = moved_at.checked_sub(1).map(|idx| ranks[idx]);
    let after = ranks.get(moved_at + 1).copied();
    let current = ranks[moved_at];

    let already_ordered =
        before.map_or(true, |b| b < current) && after.map_or(true, |a| current < a);
    if already_ordered {
        return Vec::new();
    }

    if let Some(rank) = between(before, after) {
        return vec![(moved_at, rank)];
    }

    ranks
        .iter()
        .enumerate()
        .filter(|(idx, rank)| **rank != *idx as i64)
        .map(|(idx, _)| (idx, idx as i64))
        .collect()
}

/// Moves the element at `from` to `to`, shifting the elements in between.
pub fn move_item<T>(items: &mut Vec<T>, from: usize, to: usize) {
    if from >= items.len() || to >= items.len() || from == to {
        return;
    }
    let item = items.remove(from);
    items.insert(to, item);
}
