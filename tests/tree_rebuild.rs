use rusqlite::Connection;

use nestset::NestsetError;
use nestset::config::TableConfig;
use nestset::node::{Bounds, NestedNode, Node, NodeId, NodeRecord, Scope};
use nestset::operations::Tree;
use nestset::persist::{BoundsStore, Persistor};
use nestset::rebuild::{ForestItem, parse_forest};

fn stored(persistor: &Persistor, id: NodeId) -> NodeRecord {
    persistor
        .get(&Scope::unscoped(), id)
        .expect("query")
        .expect("row")
}

fn bounds_of(persistor: &Persistor, id: NodeId) -> (i64, i64) {
    let b = stored(persistor, id).bounds;
    (b.left, b.right)
}

// root [1,6] with a [2,3] and b [4,5], returned as ids
fn two_children(tree: &Tree<Persistor>) -> (NodeId, NodeId, NodeId) {
    let scope = Scope::unscoped();
    let mut root = Node::labelled(scope.clone(), "root");
    tree.insert_root(&mut root).unwrap();
    let mut a = Node::labelled(scope.clone(), "a");
    tree.append_to(&mut a, &mut root).unwrap();
    let mut b = Node::labelled(scope, "b");
    tree.append_to(&mut b, &mut root).unwrap();
    (root.id().unwrap(), a.id().unwrap(), b.id().unwrap())
}

#[test]
fn rebuilding_an_empty_scope_from_json() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    let forest = parse_forest(r#"[{"label": "root", "children": [{"label": "x"}, {}]}]"#).unwrap();

    assert_eq!(tree.rebuild_tree(&Scope::unscoped(), &forest, false).unwrap(), 3);
    let rows = persistor.load_ordered(&Scope::unscoped(), None).unwrap();
    let bounds: Vec<(i64, i64)> = rows.iter().map(|r| (r.bounds.left, r.bounds.right)).collect();
    assert_eq!(bounds, vec![(1, 6), (2, 3), (4, 5)]);
    assert_eq!(rows[0].parent_id, None);
    assert_eq!(rows[0].label.as_deref(), Some("root"));
    assert_eq!(rows[1].parent_id, Some(rows[0].id));
    assert_eq!(rows[2].parent_id, Some(rows[0].id));
    assert_eq!(rows[2].label, None);
}

#[test]
fn rebuild_with_same_forest_is_idempotent() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    let (root, a, b) = two_children(&tree);
    let forest = vec![ForestItem::existing(root).with_children(vec![
        ForestItem::existing(b),
        ForestItem::existing(a),
    ])];

    assert_eq!(tree.rebuild_tree(&Scope::unscoped(), &forest, false).unwrap(), 2);
    assert_eq!(bounds_of(&persistor, b), (2, 3));
    assert_eq!(bounds_of(&persistor, a), (4, 5));
    assert_eq!(tree.rebuild_tree(&Scope::unscoped(), &forest, false).unwrap(), 0);
    // labels come along untouched
    assert_eq!(stored(&persistor, a).label.as_deref(), Some("a"));
}

#[test]
fn unknown_ids_are_rejected_before_writing() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    let (root, a, _) = two_children(&tree);
    let before = persistor.load_ordered(&Scope::unscoped(), None).unwrap();

    let forest = vec![ForestItem::existing(root).with_children(vec![
        ForestItem::labelled("new"),
        ForestItem::existing(999),
    ])];
    let err = tree.rebuild_tree(&Scope::unscoped(), &forest, true).unwrap_err();
    assert!(matches!(err, NestsetError::UnknownNode(999)));
    assert!(err.is_structural());

    // the same node twice is just as unknown the second time
    let forest = vec![ForestItem::existing(a), ForestItem::existing(a)];
    let err = tree.rebuild_tree(&Scope::unscoped(), &forest, false).unwrap_err();
    assert!(matches!(err, NestsetError::UnknownNode(id) if id == a));

    assert_eq!(persistor.load_ordered(&Scope::unscoped(), None).unwrap(), before);
}

#[test]
fn rebuild_removes_absent_nodes() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    let (root, a, b) = two_children(&tree);
    let forest = vec![ForestItem::existing(root).with_children(vec![ForestItem::existing(b)])];

    assert_eq!(tree.rebuild_tree(&Scope::unscoped(), &forest, true).unwrap(), 3);
    assert!(persistor.get(&Scope::unscoped(), a).unwrap().is_none());
    assert_eq!(bounds_of(&persistor, root), (1, 4));
    assert_eq!(bounds_of(&persistor, b), (2, 3));
    assert!(!tree.is_broken(&Scope::unscoped()).unwrap());
}

#[test]
fn rebuild_tombstones_absent_nodes_when_soft_deleting() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default().with_soft_delete(true)).unwrap();
    let tree = Tree::new(&persistor);
    let (root, a, b) = two_children(&tree);
    let forest = vec![ForestItem::existing(root).with_children(vec![ForestItem::existing(b)])];

    assert_eq!(tree.rebuild_tree(&Scope::unscoped(), &forest, true).unwrap(), 2);
    let tombstoned = stored(&persistor, a);
    assert!(tombstoned.deleted_at.is_some());
    assert_eq!(tombstoned.parent_id, Some(root));
    assert_eq!(bounds_of(&persistor, b), (2, 3));
    assert_eq!(bounds_of(&persistor, a), (4, 5));
    assert_eq!(bounds_of(&persistor, root), (1, 6));
    let root_node = Node::from_record(stored(&persistor, root), Scope::unscoped());
    let live: Vec<NodeId> = tree.descendants(&root_node).unwrap().iter().map(|r| r.id).collect();
    assert_eq!(live, vec![b]);
}

#[test]
fn absent_nodes_stay_under_their_parent() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    let (root, a, b) = two_children(&tree);

    let forest = vec![ForestItem::existing(b)];
    assert_eq!(tree.rebuild_tree(&Scope::unscoped(), &forest, false).unwrap(), 3);
    assert_eq!(bounds_of(&persistor, b), (1, 2));
    assert_eq!(stored(&persistor, b).parent_id, None);
    assert_eq!(bounds_of(&persistor, root), (3, 6));
    assert_eq!(bounds_of(&persistor, a), (4, 5));
    assert!(!tree.is_broken(&Scope::unscoped()).unwrap());
}

#[test]
fn subtree_rebuild_grows_the_root() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    let scope = Scope::unscoped();
    let mut root = Node::labelled(scope.clone(), "root");
    tree.insert_root(&mut root).unwrap();
    let mut other = Node::labelled(scope.clone(), "other");
    tree.insert_root(&mut other).unwrap();
    let mut a = Node::new(scope.clone());
    tree.append_to(&mut a, &mut root).unwrap();
    let mut b = Node::new(scope.clone());
    tree.append_to(&mut b, &mut root).unwrap();
    assert_eq!(bounds_of(&persistor, other.id().unwrap()), (7, 8));

    let forest = vec![
        ForestItem::existing(b.id().unwrap()),
        ForestItem::existing(a.id().unwrap()),
        ForestItem::labelled("new"),
    ];
    assert_eq!(tree.rebuild_subtree(&mut root, &forest, false).unwrap(), 5);
    assert_eq!(root.bounds(), Some(Bounds::new(1, 8)));
    assert_eq!(bounds_of(&persistor, b.id().unwrap()), (2, 3));
    assert_eq!(bounds_of(&persistor, a.id().unwrap()), (4, 5));
    assert_eq!(bounds_of(&persistor, other.id().unwrap()), (9, 10));
    let children = persistor.children(&scope, root.id()).unwrap();
    assert_eq!(children.len(), 3);
    assert_eq!(children[2].label.as_deref(), Some("new"));
    assert_eq!(children[2].bounds, Bounds::new(6, 7));
    assert!(!tree.is_broken(&scope).unwrap());
}

#[test]
fn fix_tree_leaves_a_healthy_tree_alone() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    two_children(&tree);
    assert_eq!(tree.fix_tree(&Scope::unscoped()).unwrap(), 0);
}

#[test]
fn fix_tree_follows_parent_pointers() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let scope = Scope::unscoped();
    let root = persistor.insert(&scope, None, Bounds::new(1, 6), None).unwrap();
    let a = persistor.insert(&scope, Some(root), Bounds::new(2, 5), None).unwrap();
    let a1 = persistor.insert(&scope, Some(root), Bounds::new(3, 4), None).unwrap();
    let tree = Tree::new(&persistor);
    assert!(tree.is_broken(&scope).unwrap());

    assert_eq!(tree.fix_tree(&scope).unwrap(), 2);
    assert_eq!(bounds_of(&persistor, a), (2, 3));
    assert_eq!(bounds_of(&persistor, a1), (4, 5));
    assert_eq!(bounds_of(&persistor, root), (1, 6));
    assert!(!tree.is_broken(&scope).unwrap());
}

#[test]
fn fix_tree_adopts_orphans_as_roots() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let scope = Scope::unscoped();
    persistor.insert(&scope, None, Bounds::new(1, 2), None).unwrap();
    let orphan = persistor.insert(&scope, Some(999), Bounds::new(3, 4), None).unwrap();
    let tree = Tree::new(&persistor);
    assert_eq!(tree.count_errors(&scope).unwrap().missing_parent, 1);

    assert_eq!(tree.fix_tree(&scope).unwrap(), 1);
    assert_eq!(stored(&persistor, orphan).parent_id, None);
    assert_eq!(bounds_of(&persistor, orphan), (3, 4));
    assert!(!tree.is_broken(&scope).unwrap());
}

#[test]
fn fix_tree_breaks_parent_cycles() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let scope = Scope::unscoped();
    let a = persistor.insert(&scope, None, Bounds::new(1, 2), None).unwrap();
    let b = persistor.insert(&scope, None, Bounds::new(3, 4), None).unwrap();
    for (id, parent, left, right) in [(a, b, 1, 2), (b, a, 3, 4)] {
        let record = NodeRecord {
            id,
            parent_id: Some(parent),
            bounds: Bounds::new(left, right),
            deleted_at: None,
            label: None,
        };
        persistor.save(&scope, &record).unwrap();
    }
    let tree = Tree::new(&persistor);

    assert_eq!(tree.fix_tree(&scope).unwrap(), 2);
    // the bucket of the smaller id is attached first
    assert_eq!(stored(&persistor, b).parent_id, None);
    assert_eq!(bounds_of(&persistor, b), (1, 4));
    assert_eq!(stored(&persistor, a).parent_id, Some(b));
    assert_eq!(bounds_of(&persistor, a), (2, 3));
    assert!(!tree.is_broken(&scope).unwrap());
}

#[test]
fn fix_subtree_keeps_the_rest_of_the_scope() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    let (root, a, b) = two_children(&tree);
    let mut other = Node::new(Scope::unscoped());
    tree.insert_root(&mut other).unwrap();

    let mut moved = stored(&persistor, b);
    moved.parent_id = Some(a);
    persistor.save(&Scope::unscoped(), &moved).unwrap();
    assert_eq!(tree.count_errors(&Scope::unscoped()).unwrap().wrong_parent, 1);

    let mut root_node = Node::from_record(stored(&persistor, root), Scope::unscoped());
    assert_eq!(tree.fix_subtree(&mut root_node).unwrap(), 2);
    assert_eq!(bounds_of(&persistor, a), (2, 5));
    assert_eq!(bounds_of(&persistor, b), (3, 4));
    assert_eq!(bounds_of(&persistor, root), (1, 6));
    assert_eq!(bounds_of(&persistor, other.id().unwrap()), (7, 8));
    assert!(!tree.is_broken(&Scope::unscoped()).unwrap());
}

#[test]
fn forest_json_skips_empty_fields() {
    let forest = vec![ForestItem::labelled("x").with_children(vec![ForestItem::existing(3)])];
    let json = serde_json::to_string(&forest).unwrap();
    assert_eq!(json, r#"[{"label":"x","children":[{"id":3}]}]"#);
    assert_eq!(parse_forest(&json).unwrap(), forest);
    assert!(matches!(parse_forest("[{"), Err(NestsetError::Parse(_))));
}

#[test]
fn subtree_rebuild_shrinks_the_root() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    let scope = Scope::unscoped();
    let mut root = Node::labelled(scope.clone(), "root");
    tree.insert_root(&mut root).unwrap();
    let mut a = Node::new(scope.clone());
    tree.append_to(&mut a, &mut root).unwrap();
    let mut a1 = Node::new(scope.clone());
    tree.append_to(&mut a1, &mut a).unwrap();
    let mut b = Node::new(scope.clone());
    tree.append_to(&mut b, &mut root).unwrap();
    let mut other = Node::new(scope.clone());
    tree.insert_root(&mut other).unwrap();
    assert_eq!(bounds_of(&persistor, root.id().unwrap()), (1, 8));
    assert_eq!(bounds_of(&persistor, other.id().unwrap()), (9, 10));

    // a and a1 are removed, the gap they leave closes after the root
    let forest = vec![ForestItem::existing(b.id().unwrap())];
    assert_eq!(tree.rebuild_subtree(&mut root, &forest, true).unwrap(), 5);
    assert_eq!(root.bounds(), Some(Bounds::new(1, 4)));
    assert_eq!(bounds_of(&persistor, root.id().unwrap()), (1, 4));
    assert_eq!(bounds_of(&persistor, b.id().unwrap()), (2, 3));
    assert_eq!(bounds_of(&persistor, other.id().unwrap()), (5, 6));
    assert!(persistor.get(&scope, a1.id().unwrap()).unwrap().is_none());
    assert!(!tree.is_broken(&scope).unwrap());
}

#[test]
fn fix_subtree_shrinks_an_oversized_root() {
    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let scope = Scope::unscoped();
    let root = persistor.insert(&scope, None, Bounds::new(1, 10), None).unwrap();
    let a = persistor.insert(&scope, Some(root), Bounds::new(2, 3), None).unwrap();
    let b = persistor.insert(&scope, Some(root), Bounds::new(4, 5), None).unwrap();
    let other = persistor.insert(&scope, None, Bounds::new(11, 12), None).unwrap();
    let tree = Tree::new(&persistor);

    let mut root_node = Node::from_record(stored(&persistor, root), scope.clone());
    assert_eq!(tree.fix_subtree(&mut root_node).unwrap(), 2);
    assert_eq!(root_node.bounds(), Some(Bounds::new(1, 6)));
    assert_eq!(bounds_of(&persistor, a), (2, 3));
    assert_eq!(bounds_of(&persistor, b), (4, 5));
    assert_eq!(bounds_of(&persistor, other), (7, 8));
    assert!(!tree.is_broken(&scope).unwrap());
}
