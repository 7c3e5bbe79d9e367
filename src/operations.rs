//! Structural operations on single nodes.
//!
//! Every positional operation follows the same steps: check preconditions,
//! refresh the bounds involved from the store, compute a target position,
//! let [`crate::interval`] work out the patch, apply it as one bulk update
//! and finally persist the node itself. Nothing is written before all
//! preconditions have passed. Operations on the same scope must not run
//! concurrently; wrap each one in a transaction (see
//! [`crate::persist::Persistor::atomically`]).

use chrono::{SubsecRound, Utc};
use tracing::{debug, info};

use crate::checker::{ConsistencyChecker, TreeErrors};
use crate::error::{NestsetError, Result};
use crate::interval::{BoundPatch, gap_delta, insert_at, move_node};
use crate::node::{Bounds, LEAF_HEIGHT, NestedNode, Node, NodeRecord, Scope};
use crate::persist::BoundsStore;
use crate::rebuild::{ForestItem, TreeRebuilder};

pub struct Tree<'s, S: BoundsStore> {
    store: &'s S,
}

impl<'s, S: BoundsStore> Tree<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }
    pub fn store(&self) -> &'s S {
        self.store
    }

    // ------------- Refresh & persist -------------
    /// Reloads the bounds of an existing node. Parent and label stay as they
    /// are in memory since those may be about to change.
    pub fn refresh<N: NestedNode>(&self, node: &mut N) -> Result<()> {
        if let Some(record) = self.stored(node)? {
            node.set_bounds(Some(record.bounds));
        }
        Ok(())
    }
    // anchors and parents are not changed by the caller, so their stored
    // parent pointer is taken along with the bounds
    fn reload<A: NestedNode>(&self, anchor: &mut A) -> Result<()> {
        if let Some(record) = self.stored(anchor)? {
            anchor.set_bounds(Some(record.bounds));
            anchor.set_parent_id(record.parent_id);
        }
        Ok(())
    }
    fn stored<N: NestedNode>(&self, node: &N) -> Result<Option<NodeRecord>> {
        let Some(id) = node.id() else {
            return Ok(None);
        };
        let record = self.store.get(node.scope(), id)?.ok_or_else(|| {
            NestsetError::NodeMissing(format!("#{id} is not stored in scope {}", node.scope()))
        })?;
        Ok(Some(record))
    }

    fn save_node<N: NestedNode>(&self, node: &mut N) -> Result<()> {
        let bounds = node
            .bounds()
            .ok_or_else(|| NestsetError::Invariant("saving a node without bounds".into()))?;
        match node.id() {
            Some(id) => self.store.save(
                node.scope(),
                &NodeRecord {
                    id,
                    parent_id: node.parent_id(),
                    bounds,
                    deleted_at: node.deleted_at(),
                    label: node.label().map(str::to_string),
                },
            ),
            None => {
                let id = self
                    .store
                    .insert(node.scope(), node.parent_id(), bounds, node.label())?;
                node.set_id(Some(id));
                Ok(())
            }
        }
    }

    // ------------- Preconditions -------------
    fn assert_same_scope<N: NestedNode, A: NestedNode>(&self, node: &N, anchor: &A) -> Result<()> {
        if !node.same_scope(anchor) {
            return Err(NestsetError::ScopeMismatch {
                left: node.scope().to_string(),
                right: anchor.scope().to_string(),
            });
        }
        Ok(())
    }
    fn assert_node_exists<A: NestedNode>(&self, anchor: &A) -> Result<()> {
        match (anchor.id(), anchor.bounds()) {
            (Some(_), Some(_)) => Ok(()),
            (Some(id), None) => Err(NestsetError::NodeMissing(format!("#{id} has no bounds"))),
            (None, _) => Err(NestsetError::NodeMissing("anchor is not stored".into())),
        }
    }
    fn assert_not_descendant<N: NestedNode, A: NestedNode>(&self, node: &N, anchor: &A) -> Result<()> {
        let same = node.id().is_some() && node.id() == anchor.id();
        if same || anchor.is_descendant_of(node) {
            return Err(NestsetError::Descendant(format!(
                "cannot position {node} relative to {anchor}",
                node = describe(node),
                anchor = describe(anchor)
            )));
        }
        Ok(())
    }
    // all checks and refreshes a positional operation needs, before any write
    fn prepare<N: NestedNode, A: NestedNode>(&self, node: &mut N, anchor: &mut A) -> Result<()> {
        self.assert_same_scope(node, anchor)?;
        self.assert_node_exists(anchor)?;
        self.reload(anchor)?;
        self.refresh(node)?;
        self.assert_not_descendant(node, anchor)
    }

    // ------------- Positioning -------------
    /// Puts the node at `position`, either by opening a gap for a new node or
    /// by moving the subtree of an existing one. Returns false when an
    /// existing node was already there.
    fn insert_at<N: NestedNode>(&self, node: &mut N, position: i64) -> Result<bool> {
        let scope = node.scope().clone();
        match node.id() {
            None => {
                self.store
                    .bulk_update(&scope, &gap_delta(position, LEAF_HEIGHT).into())?;
                node.set_bounds(Some(insert_at(LEAF_HEIGHT, position)));
                debug!(position, "gap opened for new node");
                Ok(true)
            }
            Some(id) => {
                let current = self
                    .store
                    .get(&scope, id)?
                    .ok_or_else(|| NestsetError::NodeMissing(format!("#{id} vanished")))?;
                let Some(plan) = move_node(current.bounds, position)? else {
                    node.set_bounds(Some(current.bounds));
                    return Ok(false);
                };
                let moved = self.store.bulk_update(&scope, &BoundPatch::Move(plan))?;
                debug!(id, from = %current.bounds, to = %plan.destination(), moved, "subtree moved");
                self.refresh(node)?;
                Ok(true)
            }
        }
    }

    /// Detaches the node and appends it as the last root of its scope.
    pub fn make_root<N: NestedNode>(&self, node: &mut N) -> Result<bool> {
        let cut = self.store.max_right_bound(node.scope())? + 1;
        let moved = if node.exists() {
            self.insert_at(node, cut)?
        } else {
            // nothing sits beyond the last root, so no gap is needed
            node.set_bounds(Some(insert_at(LEAF_HEIGHT, cut)));
            true
        };
        node.set_parent_id(None);
        self.save_node(node)?;
        Ok(moved)
    }
    pub fn insert_root<N: NestedNode>(&self, node: &mut N) -> Result<bool> {
        self.make_root(node)
    }

    pub fn append_or_prepend<N: NestedNode, P: NestedNode>(
        &self,
        node: &mut N,
        parent: &mut P,
        prepend: bool,
    ) -> Result<bool> {
        self.prepare(node, parent)?;
        let bounds = refreshed_bounds(parent)?;
        let cut = if prepend { bounds.left + 1 } else { bounds.right };
        let moved = self.insert_at(node, cut)?;
        node.set_parent_id(parent.id());
        self.save_node(node)?;
        self.reload(parent)?;
        Ok(moved)
    }
    pub fn append_to<N: NestedNode, P: NestedNode>(&self, node: &mut N, parent: &mut P) -> Result<bool> {
        self.append_or_prepend(node, parent, false)
    }
    pub fn prepend_to<N: NestedNode, P: NestedNode>(&self, node: &mut N, parent: &mut P) -> Result<bool> {
        self.append_or_prepend(node, parent, true)
    }

    pub fn before_or_after<N: NestedNode, A: NestedNode>(
        &self,
        node: &mut N,
        anchor: &mut A,
        after: bool,
    ) -> Result<bool> {
        self.prepare(node, anchor)?;
        let parent = anchor.parent_id();
        let bounds = refreshed_bounds(anchor)?;
        let position = if after { bounds.right + 1 } else { bounds.left };
        let moved = self.insert_at(node, position)?;
        node.set_parent_id(parent);
        self.save_node(node)?;
        self.reload(anchor)?;
        Ok(moved)
    }
    pub fn insert_before<N: NestedNode, A: NestedNode>(&self, node: &mut N, anchor: &mut A) -> Result<bool> {
        self.before_or_after(node, anchor, false)
    }
    pub fn insert_after<N: NestedNode, A: NestedNode>(&self, node: &mut N, anchor: &mut A) -> Result<bool> {
        self.before_or_after(node, anchor, true)
    }

    /// Moves the node before its `amount`-th previous sibling.
    pub fn move_up<N: NestedNode>(&self, node: &mut N, amount: usize) -> Result<bool> {
        let Some(mut sibling) = self.nth_sibling(node, amount, true)? else {
            return Ok(false);
        };
        self.insert_before(node, &mut sibling)
    }
    /// Moves the node after its `amount`-th next sibling.
    pub fn move_down<N: NestedNode>(&self, node: &mut N, amount: usize) -> Result<bool> {
        let Some(mut sibling) = self.nth_sibling(node, amount, false)? else {
            return Ok(false);
        };
        self.insert_after(node, &mut sibling)
    }
    fn nth_sibling<N: NestedNode>(&self, node: &mut N, amount: usize, previous: bool) -> Result<Option<Node>> {
        let Some(skip) = amount.checked_sub(1) else {
            return Ok(None);
        };
        self.assert_node_exists(node)?;
        self.refresh(node)?;
        let siblings = if previous {
            let mut before = self.prev_siblings(node)?;
            before.reverse();
            before
        } else {
            self.next_siblings(node)?
        };
        Ok(siblings
            .into_iter()
            .nth(skip)
            .map(|record| Node::from_record(record, node.scope().clone())))
    }

    // ------------- Deletion -------------
    /// Deletes the node with its whole subtree and returns the number of rows
    /// removed or tombstoned. A hard delete closes the gap and leaves the node
    /// as a fresh, unstored root; a soft delete only tombstones the rows.
    pub fn delete<N: NestedNode>(&self, node: &mut N, hard: bool) -> Result<usize> {
        self.assert_node_exists(node)?;
        self.refresh(node)?;
        let scope = node.scope().clone();
        let bounds = refreshed_bounds(node)?;
        let subtree = self.store.load_ordered(&scope, Some(bounds))?;
        let mut ids: Vec<_> = subtree.iter().map(|r| r.id).collect();
        ids.extend(node.id());
        if hard {
            let deleted = self.store.delete_range(&scope, &ids)?;
            let closed = self
                .store
                .bulk_update(&scope, &gap_delta(bounds.right + 1, -bounds.height()).into())?;
            info!(node = %bounds, deleted, closed, "subtree removed");
            node.set_id(None);
            node.set_parent_id(None);
            node.set_bounds(None);
            node.set_deleted_at(None);
            Ok(deleted)
        } else {
            let at = Utc::now().trunc_subsecs(6);
            let tombstoned = self.store.tombstone(&scope, &ids, at)?;
            if node.deleted_at().is_none() {
                node.set_deleted_at(Some(at));
            }
            info!(node = %bounds, tombstoned, "subtree tombstoned");
            Ok(tombstoned)
        }
    }
    /// Reverses a soft delete: the node and every descendant tombstoned at
    /// or after the node itself come back.
    pub fn restore<N: NestedNode>(&self, node: &mut N) -> Result<usize> {
        self.assert_node_exists(node)?;
        self.refresh(node)?;
        let Some(since) = node.deleted_at() else {
            return Ok(0);
        };
        let scope = node.scope().clone();
        let bounds = refreshed_bounds(node)?;
        let mut ids: Vec<_> = self
            .store
            .load_ordered(&scope, Some(bounds))?
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.extend(node.id());
        let restored = self.store.untombstone(&scope, &ids, since)?;
        node.set_deleted_at(None);
        info!(node = %bounds, restored, "subtree restored");
        Ok(restored)
    }

    // ------------- Queries -------------
    pub fn descendants<N: NestedNode>(&self, node: &N) -> Result<Vec<NodeRecord>> {
        self.store.descendants(node.scope(), refreshed_bounds(node)?)
    }
    pub fn ancestors<N: NestedNode>(&self, node: &N) -> Result<Vec<NodeRecord>> {
        self.store.ancestors(node.scope(), refreshed_bounds(node)?)
    }
    /// Siblings in left bound order, the node itself excluded.
    pub fn siblings<N: NestedNode>(&self, node: &N) -> Result<Vec<NodeRecord>> {
        let mut siblings = self.store.children(node.scope(), node.parent_id())?;
        siblings.retain(|s| Some(s.id) != node.id());
        Ok(siblings)
    }
    pub fn prev_siblings<N: NestedNode>(&self, node: &N) -> Result<Vec<NodeRecord>> {
        let bounds = refreshed_bounds(node)?;
        let mut siblings = self.siblings(node)?;
        siblings.retain(|s| s.bounds.left < bounds.left);
        Ok(siblings)
    }
    pub fn next_siblings<N: NestedNode>(&self, node: &N) -> Result<Vec<NodeRecord>> {
        let bounds = refreshed_bounds(node)?;
        let mut siblings = self.siblings(node)?;
        siblings.retain(|s| s.bounds.left > bounds.left);
        Ok(siblings)
    }
    pub fn with_depth(&self, scope: &Scope) -> Result<Vec<(NodeRecord, i64)>> {
        self.store.with_depth(scope)
    }

    // ------------- Integrity -------------
    pub fn count_errors(&self, scope: &Scope) -> Result<TreeErrors> {
        ConsistencyChecker::new(self.store).count_errors(scope)
    }
    pub fn is_broken(&self, scope: &Scope) -> Result<bool> {
        Ok(self.count_errors(scope)?.is_broken())
    }
    /// Recomputes every bound of the scope from parent pointers and returns
    /// the number of rows changed.
    pub fn fix_tree(&self, scope: &Scope) -> Result<usize> {
        TreeRebuilder::new(self.store).fix_tree(scope, None)
    }
    /// Like [`Tree::fix_tree`] but only below `root`. The root grows or
    /// shrinks to fit and the rest of the scope is shifted accordingly.
    pub fn fix_subtree<R: NestedNode>(&self, root: &mut R) -> Result<usize> {
        let record = self.root_record(root)?;
        let changed = TreeRebuilder::new(self.store).fix_tree(root.scope(), Some(&record))?;
        self.refresh(root)?;
        Ok(changed)
    }
    /// Replaces the structure of the scope with `forest`. Returns the number
    /// of rows created, moved or removed.
    pub fn rebuild_tree(&self, scope: &Scope, forest: &[ForestItem], delete: bool) -> Result<usize> {
        TreeRebuilder::new(self.store).rebuild_tree(scope, forest, delete, None)
    }
    /// Like [`Tree::rebuild_tree`] but only for the descendants of `root`.
    pub fn rebuild_subtree<R: NestedNode>(
        &self,
        root: &mut R,
        forest: &[ForestItem],
        delete: bool,
    ) -> Result<usize> {
        let record = self.root_record(root)?;
        let changed =
            TreeRebuilder::new(self.store).rebuild_tree(root.scope(), forest, delete, Some(&record))?;
        self.refresh(root)?;
        Ok(changed)
    }
    fn root_record<R: NestedNode>(&self, root: &mut R) -> Result<NodeRecord> {
        self.assert_node_exists(root)?;
        let id = root
            .id()
            .ok_or_else(|| NestsetError::NodeMissing("root is not stored".into()))?;
        let record = self.store.get(root.scope(), id)?.ok_or_else(|| {
            NestsetError::NodeMissing(format!("#{id} is not stored in scope {}", root.scope()))
        })?;
        root.set_bounds(Some(record.bounds));
        Ok(record)
    }
}

fn refreshed_bounds<N: NestedNode>(node: &N) -> Result<Bounds> {
    node.bounds()
        .ok_or_else(|| NestsetError::NodeMissing(format!("{} has no bounds", describe(node))))
}

fn describe<N: NestedNode>(node: &N) -> String {
    match (node.id(), node.bounds()) {
        (Some(id), Some(bounds)) => format!("#{id} {bounds}"),
        (Some(id), None) => format!("#{id}"),
        (None, _) => "new node".to_string(),
    }
}
