//! Recomputing bounds from parent/child structure.
//!
//! Both entry points collect nodes into buckets keyed by their intended
//! parent, then number them depth first with a single running counter.
//! `fix_tree` takes the stored parent pointers as the truth; `rebuild_tree`
//! takes a caller supplied forest. Buckets that are never reached from the
//! root (dangling or cyclic parent references) are attached to the root, one
//! bucket per pass, until none are left.

use std::collections::{BTreeMap, HashMap};

use chrono::{SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{NestsetError, Result};
use crate::interval::{BoundPatch, gap_delta};
use crate::node::{Bounds, IdHasher, NodeId, NodeRecord, Scope};
use crate::persist::BoundsStore;

// ------------- ForestItem -------------
/// One node of a declarative forest: a reference to a stored node when `id`
/// is set, a brand-new node otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForestItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ForestItem>,
}
impl ForestItem {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn existing(id: NodeId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }
    pub fn labelled(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            ..Self::default()
        }
    }
    pub fn with_children(mut self, children: Vec<ForestItem>) -> Self {
        self.children = children;
        self
    }
}

pub fn parse_forest(json: &str) -> Result<Vec<ForestItem>> {
    Ok(serde_json::from_str(json)?)
}

// ------------- Slots -------------
// Fresh nodes have no id until they are inserted, so buckets are keyed by slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SlotKey {
    Stored(NodeId),
    Fresh(usize),
}

#[derive(Debug)]
struct Slot {
    key: SlotKey,
    parent: Option<SlotKey>,
    bounds: Bounds,
    deleted_at: Option<chrono::DateTime<Utc>>,
    label: Option<String>,
    // what the store held before, None for fresh nodes
    stored: Option<NodeRecord>,
}
impl Slot {
    fn stored(record: NodeRecord) -> Self {
        Self {
            key: SlotKey::Stored(record.id),
            parent: record.parent_id.map(SlotKey::Stored),
            bounds: record.bounds,
            deleted_at: record.deleted_at,
            label: record.label.clone(),
            stored: Some(record),
        }
    }
}

type Buckets = BTreeMap<Option<SlotKey>, Vec<usize>>;

struct Layout {
    slots: Vec<Slot>,
    buckets: Buckets,
    fresh: usize,
}
impl Layout {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            buckets: Buckets::new(),
            fresh: 0,
        }
    }
    fn push(&mut self, slot: Slot, parent: Option<SlotKey>) -> usize {
        let index = self.slots.len();
        self.slots.push(slot);
        self.buckets.entry(parent).or_default().push(index);
        index
    }
    fn push_fresh(&mut self, label: Option<String>, parent: Option<SlotKey>) -> usize {
        let key = SlotKey::Fresh(self.fresh);
        self.fresh += 1;
        self.push(
            Slot {
                key,
                parent,
                bounds: Bounds::new(0, 0),
                deleted_at: None,
                label,
                stored: None,
            },
            parent,
        )
    }

    // Numbers the bucket of `parent` and everything below it, starting at
    // `cut`, and returns the next free slot. A bucket is taken out before it
    // is walked, so cyclic references cannot bring it back.
    fn reorder(&mut self, parent: Option<SlotKey>, mut cut: i64) -> i64 {
        let Some(bucket) = self.buckets.remove(&parent) else {
            return cut;
        };
        for index in bucket {
            let left = cut;
            let key = self.slots[index].key;
            cut = self.reorder(Some(key), cut + 1);
            let slot = &mut self.slots[index];
            slot.bounds = Bounds::new(left, cut);
            slot.parent = parent;
            cut += 1;
        }
        cut
    }

    // Numbers everything below `root` (the whole scope when None), then
    // adopts orphaned buckets into the root bucket until all are placed.
    fn number(&mut self, root: Option<&NodeRecord>) -> Result<i64> {
        let parent = root.map(|r| SlotKey::Stored(r.id));
        let mut cut = self.reorder(parent, root.map_or(1, |r| r.bounds.left + 1));
        let mut passes = self.buckets.len();
        while let Some((orphaned, bucket)) = self.buckets.pop_first() {
            if passes == 0 {
                return Err(NestsetError::Invariant(
                    "orphan buckets did not drain".to_string(),
                ));
            }
            passes -= 1;
            debug!(?orphaned, nodes = bucket.len(), "adopting orphaned nodes");
            self.buckets.insert(parent, bucket);
            cut = self.reorder(parent, cut);
        }
        Ok(cut)
    }
}

// ------------- TreeRebuilder -------------
pub struct TreeRebuilder<'s, S: BoundsStore> {
    store: &'s S,
}
impl<'s, S: BoundsStore> TreeRebuilder<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// Recomputes bounds from the stored parent pointers of the scope, or of
    /// the descendants of `root`. Returns the number of rows changed.
    pub fn fix_tree(&self, scope: &Scope, root: Option<&NodeRecord>) -> Result<usize> {
        let mut layout = Layout::new();
        for record in self.store.load_ordered(scope, root.map(|r| r.bounds))? {
            let parent = record.parent_id.map(SlotKey::Stored);
            layout.push(Slot::stored(record), parent);
        }
        let changed = self.apply(scope, layout, root, 0)?;
        info!(%scope, changed, "tree fixed");
        Ok(changed)
    }

    /// Rebuilds the scope, or the descendants of `root`, from `forest`.
    ///
    /// Stored nodes missing from the forest stay where their parent pointer
    /// puts them unless `delete` is set, in which case they are removed, or
    /// tombstoned when the store keeps tombstones. Every id in the forest has
    /// to exist below `root` and may appear only once; this is checked before
    /// anything is written.
    pub fn rebuild_tree(
        &self,
        scope: &Scope,
        forest: &[ForestItem],
        delete: bool,
        root: Option<&NodeRecord>,
    ) -> Result<usize> {
        let loaded = self.store.load_ordered(scope, root.map(|r| r.bounds))?;
        let order: Vec<NodeId> = loaded.iter().map(|r| r.id).collect();
        let mut existing: HashMap<NodeId, NodeRecord, IdHasher> =
            loaded.into_iter().map(|r| (r.id, r)).collect();

        let mut layout = Layout::new();
        let parent = root.map(|r| SlotKey::Stored(r.id));
        collect(&mut layout, &mut existing, forest, parent)?;

        let mut removed = 0;
        let absent: Vec<NodeId> = order.into_iter().filter(|id| existing.contains_key(id)).collect();
        if delete && !self.store.soft_deletes() {
            removed = self.store.delete_range(scope, &absent)?;
        } else {
            let now = Utc::now().trunc_subsecs(6);
            for id in absent {
                let Some(record) = existing.remove(&id) else {
                    continue;
                };
                let parent = record.parent_id.map(SlotKey::Stored);
                let index = layout.push(Slot::stored(record), parent);
                let slot = &mut layout.slots[index];
                if delete && slot.deleted_at.is_none() {
                    slot.deleted_at = Some(now);
                }
            }
        }
        let changed = self.apply(scope, layout, root, removed)?;
        info!(%scope, changed, removed, "tree rebuilt");
        Ok(changed)
    }

    // numbers the layout and writes whatever differs from the store
    fn apply(
        &self,
        scope: &Scope,
        mut layout: Layout,
        root: Option<&NodeRecord>,
        removed: usize,
    ) -> Result<usize> {
        let cut = layout.number(root)?;
        let mut changed = removed;

        if let Some(root) = root {
            let grown = cut - root.bounds.right;
            if grown != 0 {
                let gap = gap_delta(root.bounds.right + 1, grown);
                changed += self.store.bulk_update(scope, &BoundPatch::Gap(gap))?;
                // rows of the subtree may have been caught by the gap as well
                for slot in layout.slots.iter_mut() {
                    if let Some(stored) = slot.stored.as_mut() {
                        stored.bounds = gap.apply(stored.bounds);
                    }
                }
                let mut resized = root.clone();
                resized.bounds = Bounds::new(root.bounds.left, cut);
                self.store.save(scope, &resized)?;
                changed += 1;
                debug!(root = root.id, grown, "subtree root resized");
            }
        }

        // parents come before their children in left bound order, so fresh
        // parents have their ids by the time their children are written
        let mut order: Vec<usize> = (0..layout.slots.len()).collect();
        order.sort_by_key(|&i| layout.slots[i].bounds.left);
        let mut assigned: HashMap<usize, NodeId, IdHasher> = HashMap::default();
        for index in order {
            let slot = &layout.slots[index];
            let parent_id = match slot.parent {
                None => None,
                Some(SlotKey::Stored(id)) => Some(id),
                Some(SlotKey::Fresh(n)) => Some(*assigned.get(&n).ok_or_else(|| {
                    NestsetError::Invariant(format!("fresh parent {n} placed after its child"))
                })?),
            };
            match (slot.key, &slot.stored) {
                (SlotKey::Fresh(n), _) => {
                    let id = self
                        .store
                        .insert(scope, parent_id, slot.bounds, slot.label.as_deref())?;
                    assigned.insert(n, id);
                    changed += 1;
                }
                (SlotKey::Stored(id), Some(stored)) => {
                    let record = NodeRecord {
                        id,
                        parent_id,
                        bounds: slot.bounds,
                        deleted_at: slot.deleted_at,
                        label: slot.label.clone(),
                    };
                    if &record != stored {
                        self.store.save(scope, &record)?;
                        changed += 1;
                    }
                }
                (SlotKey::Stored(id), None) => {
                    return Err(NestsetError::Invariant(format!("#{id} lost its stored state")));
                }
            }
        }
        Ok(changed)
    }
}

// Walks the forest depth first, resolving references and bucketing every
// item under its intended parent in input order.
fn collect(
    layout: &mut Layout,
    existing: &mut HashMap<NodeId, NodeRecord, IdHasher>,
    items: &[ForestItem],
    parent: Option<SlotKey>,
) -> Result<()> {
    for item in items {
        let index = match item.id {
            None => layout.push_fresh(item.label.clone(), parent),
            Some(id) => {
                let record = existing.remove(&id).ok_or(NestsetError::UnknownNode(id))?;
                let index = layout.push(Slot::stored(record), parent);
                if item.label.is_some() {
                    layout.slots[index].label = item.label.clone();
                }
                index
            }
        };
        let key = layout.slots[index].key;
        collect(layout, existing, &item.children, Some(key))?;
    }
    Ok(())
}
