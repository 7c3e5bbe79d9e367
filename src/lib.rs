//! Nestset – hierarchical data in a flat table using the nested set encoding.
//!
//! Every node stores a `(left, right)` bound pair such that the descendants
//! of a node are exactly the nodes whose left bound lies strictly between the
//! node's own bounds. Ancestor, descendant and sibling questions become range
//! comparisons, at the price of keeping the bounds consistent on every
//! structural change.
//!
//! ## Modules
//! * [`node`] – Identities, bounds, scopes and the [`node::NestedNode`]
//!   capability that entities with tree behavior implement.
//! * [`interval`] – Pure bound arithmetic: inserting at a position, moving a
//!   subtree, opening and closing gaps.
//! * [`persist`] – The [`persist::BoundsStore`] seam and its SQLite
//!   implementation [`persist::Persistor`].
//! * [`operations`] – [`operations::Tree`], the structural operations on
//!   single nodes (root, append, prepend, before, after, up, down, delete).
//! * [`checker`] – Read-only integrity diagnostics.
//! * [`rebuild`] – Recomputing bounds from parent pointers or from a
//!   declarative forest.
//! * [`config`] – Table layout and settings.
//!
//! ## Scopes
//! A table may hold many independent trees, separated by the values of its
//! scope columns. Every query and update is confined to one scope, so
//! mutations of different scopes never interact. Mutations of the same scope
//! have to be serialized by the caller.
//!
//! ## Quick Start
//! ```
//! use rusqlite::Connection;
//! use nestset::{config::TableConfig, node::{Node, Scope, NestedNode}, operations::Tree, persist::Persistor};
//! let conn = Connection::open_in_memory().unwrap();
//! let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
//! let tree = Tree::new(&persistor);
//! let mut root = Node::labelled(Scope::unscoped(), "root");
//! tree.insert_root(&mut root).unwrap();
//! let mut child = Node::labelled(Scope::unscoped(), "child");
//! tree.append_to(&mut child, &mut root).unwrap();
//! assert_eq!(root.bounds().map(|b| (b.left, b.right)), Some((1, 4)));
//! assert!(!tree.is_broken(&Scope::unscoped()).unwrap());
//! ```

pub mod checker;
pub mod config;
pub mod error;
pub mod interval;
pub mod node;
pub mod operations;
pub mod persist;
pub mod rebuild;

pub use error::{NestsetError, Result};
