use block_forest::prelude::*;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

const REFINEMENT_LEVELS: [u8; 3] = [2, 3, 4];

fn set_up_forest(level: u8) -> Forest {
    let conn = BlockConnectivity::new(
        12,
        vec![[0, 1, 2, 3, 4, 5, 6, 7], [1, 8, 3, 9, 5, 10, 7, 11]],
    );
    let topology = BlockTopology::from_connectivity(&conn);
    let mut forest = Forest::new(Runtime::serial(), topology);
    forest.create_trees(&[level, level.saturating_sub(2)]);
    forest
}

fn balance_two_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("balance_two_blocks");
    for level in REFINEMENT_LEVELS.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(level), level, |b, &level| {
            b.iter_with_setup(
                || set_up_forest(level),
                |mut forest| {
                    forest.balance(false);
                    forest.local_leaf_count()
                },
            );
        });
    }
    group.finish();
}

fn create_nodes_after_balance(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_nodes_after_balance");
    for level in REFINEMENT_LEVELS.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(level), level, |b, &level| {
            b.iter_with_setup(
                || {
                    let mut forest = set_up_forest(level);
                    forest.balance(false);
                    forest
                },
                |mut forest| {
                    forest.create_nodes(2);
                    forest.global_node_count()
                },
            );
        });
    }
    group.finish();
}

criterion_group!(benches, balance_two_blocks, create_nodes_after_balance);
criterion_main!(benches);
