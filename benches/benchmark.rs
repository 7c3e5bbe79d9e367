use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use rusqlite::Connection;

use nestset::config::TableConfig;
use nestset::interval::{gap_delta, move_node};
use nestset::node::{Bounds, Node, Scope};
use nestset::operations::Tree;
use nestset::persist::Persistor;

// a root with `width` children, each holding `width` leaves
fn grow(tree: &Tree<Persistor>, width: usize) {
    let scope = Scope::unscoped();
    let mut root = Node::new(scope.clone());
    tree.insert_root(&mut root).unwrap();
    for _ in 0..width {
        let mut child = Node::new(scope.clone());
        tree.append_to(&mut child, &mut root).unwrap();
        for _ in 0..width {
            let mut leaf = Node::new(scope.clone());
            tree.append_to(&mut leaf, &mut child).unwrap();
        }
    }
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let plan = move_node(Bounds::new(40, 61), 2).unwrap().unwrap();
    c.bench_function("move plan apply", |b| {
        b.iter(|| plan.apply(black_box(Bounds::new(10, 11))))
    });
    let gap = gap_delta(50, 2);
    c.bench_function("gap apply", |b| b.iter(|| gap.apply(black_box(Bounds::new(10, 60)))));

    for width in [5, 20] {
        c.bench_function(&format!("append {} nodes", width * width + width + 1), |b| {
            b.iter(|| {
                let conn = Connection::open_in_memory().unwrap();
                let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
                grow(&Tree::new(&persistor), width);
            })
        });
    }

    let conn = Connection::open_in_memory().unwrap();
    let persistor = Persistor::new(&conn, TableConfig::default()).unwrap();
    let tree = Tree::new(&persistor);
    grow(&tree, 30);
    println!("{}", tree.count_errors(&Scope::unscoped()).unwrap());
    c.bench_function("fix_tree 931 nodes", |b| {
        b.iter(|| tree.fix_tree(&Scope::unscoped()).unwrap())
    });
    c.bench_function("count_errors 931 nodes", |b| {
        b.iter(|| tree.count_errors(&Scope::unscoped()).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
