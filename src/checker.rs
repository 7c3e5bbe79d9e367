//! Read-only integrity diagnostics.
//!
//! The four predicates are evaluated over the rows of one scope, tombstoned
//! rows included since they still occupy interval space. Corruption is
//! reported as counts, never as an error; repairing is left to
//! [`crate::rebuild::TreeRebuilder`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::node::{IdHasher, NodeId, NodeRecord, Scope};
use crate::persist::BoundsStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeErrors {
    pub oddness: usize,
    pub duplicates: usize,
    pub wrong_parent: usize,
    pub missing_parent: usize,
}
impl TreeErrors {
    pub fn of(rows: &[NodeRecord]) -> Self {
        Self {
            oddness: count_oddness(rows),
            duplicates: count_duplicates(rows),
            wrong_parent: count_wrong_parent(rows),
            missing_parent: count_missing_parent(rows),
        }
    }
    pub fn total(&self) -> usize {
        self.oddness + self.duplicates + self.wrong_parent + self.missing_parent
    }
    pub fn is_broken(&self) -> bool {
        self.total() > 0
    }
}
impl fmt::Display for TreeErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "oddness: {}, duplicates: {}, wrong_parent: {}, missing_parent: {}",
            self.oddness, self.duplicates, self.wrong_parent, self.missing_parent
        )
    }
}

pub struct ConsistencyChecker<'s, S: BoundsStore> {
    store: &'s S,
}
impl<'s, S: BoundsStore> ConsistencyChecker<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }
    pub fn count_errors(&self, scope: &Scope) -> Result<TreeErrors> {
        let rows = self.store.load_ordered(scope, None)?;
        let errors = TreeErrors::of(&rows);
        if errors.is_broken() {
            warn!(%scope, rows = rows.len(), %errors, "tree is broken");
        } else {
            info!(%scope, rows = rows.len(), "tree is consistent");
        }
        Ok(errors)
    }
    pub fn is_broken(&self, scope: &Scope) -> Result<bool> {
        Ok(self.count_errors(scope)?.is_broken())
    }
}

/// Rows whose bounds are inverted or enclose an odd number of slots.
pub fn count_oddness(rows: &[NodeRecord]) -> usize {
    rows.iter()
        .filter(|r| {
            let b = r.bounds;
            b.left >= b.right || (b.right - b.left).rem_euclid(2) == 0
        })
        .count()
}

/// Pairs of distinct rows sharing a bound value in any combination. A pair
/// sharing more than one value is counted once.
pub fn count_duplicates(rows: &[NodeRecord]) -> usize {
    let mut holders: HashMap<i64, Vec<NodeId>, IdHasher> = HashMap::default();
    for row in rows {
        holders.entry(row.bounds.left).or_default().push(row.id);
        if row.bounds.right != row.bounds.left {
            holders.entry(row.bounds.right).or_default().push(row.id);
        }
    }
    let mut pairs: HashSet<(NodeId, NodeId), IdHasher> = HashSet::default();
    for ids in holders.values().filter(|ids| ids.len() > 1) {
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                if a != b {
                    pairs.insert((*a.min(b), *a.max(b)));
                }
            }
        }
    }
    pairs.len()
}

/// Rows not enclosed by their recorded parent, or enclosed by some other row
/// that itself sits inside that parent (so the parent is not the nearest
/// enclosing node).
pub fn count_wrong_parent(rows: &[NodeRecord]) -> usize {
    let by_id: HashMap<NodeId, &NodeRecord, IdHasher> = rows.iter().map(|r| (r.id, r)).collect();
    let mut sorted: Vec<&NodeRecord> = rows.iter().collect();
    sorted.sort_by_key(|r| (r.bounds.left, r.id));
    rows.iter()
        .filter(|child| {
            let Some(parent) = child.parent_id.and_then(|p| by_id.get(&p)) else {
                return false;
            };
            let (c, p) = (child.bounds, parent.bounds);
            if !(p.left < c.left && c.left < p.right) {
                return true;
            }
            // candidates start strictly between the parent's and the child's left bound
            let first = sorted.partition_point(|m| m.bounds.left <= p.left);
            sorted[first..]
                .iter()
                .take_while(|m| m.bounds.left < c.left)
                .any(|m| m.id != parent.id && m.id != child.id && c.left < m.bounds.right)
        })
        .count()
}

/// Rows referencing a parent that does not exist in the scope.
pub fn count_missing_parent(rows: &[NodeRecord]) -> usize {
    let ids: HashSet<NodeId, IdHasher> = rows.iter().map(|r| r.id).collect();
    rows.iter()
        .filter(|r| r.parent_id.is_some_and(|p| !ids.contains(&p)))
        .count()
}
