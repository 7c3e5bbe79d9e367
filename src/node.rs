// used for fast hashing of node ids
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;

// scope values are whatever SQLite can store in a column
use rusqlite::types::Value;

// used for tombstones
use chrono::{DateTime, Utc};

// used to print out readable forms of bounds and scopes
use std::fmt;

// ------------- Identity -------------
pub type NodeId = i64;

pub type IdHasher = BuildHasherDefault<SeaHasher>;

/// Slot count of a single node without descendants.
pub const LEAF_HEIGHT: i64 = 2;

// ------------- Bounds -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bounds {
    pub left: i64,
    pub right: i64,
}
impl Bounds {
    pub fn new(left: i64, right: i64) -> Self {
        Self { left, right }
    }
    /// Number of integer slots taken by the node and its descendants.
    pub fn height(&self) -> i64 {
        self.right - self.left + 1
    }
    pub fn is_leaf(&self) -> bool {
        self.right - self.left == 1
    }
    /// Strict containment of another node's left bound, which is what
    /// makes that node a descendant.
    pub fn encloses(&self, other: &Bounds) -> bool {
        self.left < other.left && other.left < self.right
    }
}
impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}]", self.left, self.right)
    }
}

// ------------- Scope -------------
// The values are positional and line up with the scope columns of the table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Scope {
    values: Vec<Value>,
}
impl Scope {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
    pub fn unscoped() -> Self {
        Self::default()
    }
    pub fn values(&self) -> &[Value] {
        &self.values
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
impl From<i64> for Scope {
    fn from(value: i64) -> Self {
        Self::new(vec![Value::Integer(value)])
    }
}
impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Self::new(vec![Value::Text(value.to_string())])
    }
}
impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|v| match v {
                Value::Null => "null".to_string(),
                Value::Integer(i) => i.to_string(),
                Value::Real(r) => r.to_string(),
                Value::Text(t) => format!("'{t}'"),
                Value::Blob(b) => format!("<{} bytes>", b.len()),
            })
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

// ------------- NodeRecord -------------
// A persisted row as seen by the store, always read within one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub bounds: Bounds,
    pub deleted_at: Option<DateTime<Utc>>,
    pub label: Option<String>,
}
impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{} {}", self.id, self.bounds)?;
        if let Some(label) = &self.label {
            write!(f, " {label}")?;
        }
        Ok(())
    }
}

// ------------- NestedNode -------------
/// Capability every entity with tree behavior has to provide.
///
/// A node without an id has never been persisted; a node with an id but
/// without bounds is considered broken and cannot serve as an anchor.
pub trait NestedNode {
    fn id(&self) -> Option<NodeId>;
    fn set_id(&mut self, id: Option<NodeId>);
    fn bounds(&self) -> Option<Bounds>;
    fn set_bounds(&mut self, bounds: Option<Bounds>);
    fn parent_id(&self) -> Option<NodeId>;
    fn set_parent_id(&mut self, parent_id: Option<NodeId>);
    fn scope(&self) -> &Scope;
    fn deleted_at(&self) -> Option<DateTime<Utc>>;
    fn set_deleted_at(&mut self, deleted_at: Option<DateTime<Utc>>);
    // None leaves the stored label alone
    fn label(&self) -> Option<&str> {
        None
    }

    fn exists(&self) -> bool {
        self.id().is_some()
    }
    fn height(&self) -> i64 {
        match (self.exists(), self.bounds()) {
            (true, Some(bounds)) => bounds.height(),
            _ => LEAF_HEIGHT,
        }
    }
    fn is_root(&self) -> bool {
        self.parent_id().is_none()
    }
    fn is_leaf(&self) -> bool {
        self.bounds().is_none_or(|b| b.is_leaf())
    }
    fn same_scope<O: NestedNode + ?Sized>(&self, other: &O) -> bool {
        self.scope() == other.scope()
    }
    fn is_descendant_of<O: NestedNode + ?Sized>(&self, other: &O) -> bool {
        match (self.bounds(), other.bounds()) {
            (Some(mine), Some(theirs)) => self.same_scope(other) && theirs.encloses(&mine),
            _ => false,
        }
    }
    fn is_ancestor_of<O: NestedNode + ?Sized>(&self, other: &O) -> bool {
        match (self.bounds(), other.bounds()) {
            (Some(mine), Some(theirs)) => self.same_scope(other) && mine.encloses(&theirs),
            _ => false,
        }
    }
    fn is_child_of<O: NestedNode + ?Sized>(&self, other: &O) -> bool {
        other.id().is_some() && self.parent_id() == other.id() && self.same_scope(other)
    }
    fn is_sibling_of<O: NestedNode + ?Sized>(&self, other: &O) -> bool {
        self.parent_id() == other.parent_id() && self.same_scope(other)
    }
}

// ------------- Node -------------
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    id: Option<NodeId>,
    parent_id: Option<NodeId>,
    bounds: Option<Bounds>,
    scope: Scope,
    deleted_at: Option<DateTime<Utc>>,
    label: Option<String>,
}
impl Node {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }
    pub fn labelled(scope: Scope, label: &str) -> Self {
        Self {
            scope,
            label: Some(label.to_string()),
            ..Self::default()
        }
    }
    pub fn from_record(record: NodeRecord, scope: Scope) -> Self {
        Self {
            id: Some(record.id),
            parent_id: record.parent_id,
            bounds: Some(record.bounds),
            scope,
            deleted_at: record.deleted_at,
            label: record.label,
        }
    }
    pub fn set_label(&mut self, label: Option<String>) {
        self.label = label;
    }
    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }
}
impl NestedNode for Node {
    fn id(&self) -> Option<NodeId> {
        self.id
    }
    fn set_id(&mut self, id: Option<NodeId>) {
        self.id = id;
    }
    fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }
    fn set_bounds(&mut self, bounds: Option<Bounds>) {
        self.bounds = bounds;
    }
    fn parent_id(&self) -> Option<NodeId> {
        self.parent_id
    }
    fn set_parent_id(&mut self, parent_id: Option<NodeId>) {
        self.parent_id = parent_id;
    }
    fn scope(&self) -> &Scope {
        &self.scope
    }
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
    fn set_deleted_at(&mut self, deleted_at: Option<DateTime<Utc>>) {
        self.deleted_at = deleted_at;
    }
    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.id, self.bounds) {
            (Some(id), Some(bounds)) => write!(f, "#{id} {bounds}"),
            (Some(id), None) => write!(f, "#{id} [unbounded]"),
            (None, _) => write!(f, "<new>"),
        }
    }
}
