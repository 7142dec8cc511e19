//! End-to-end step throughput on a synthetic power-law-ish graph.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use stampede::plan::{make_graph, PlannerConfig, WalkerCount};
use stampede::solver::{Solver, SolverOptions};
use stampede::topo::{MachineInfo, ThreadConfig, Threads};
use stampede::Edge;

fn skewed_graph(v_num: u32, e_num: u64, seed: u64) -> Vec<Edge> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..e_num)
        .map(|e| {
            let src = if e < v_num as u64 {
                e as u32
            } else {
                // Square a uniform draw to skew sources toward low ids.
                let r: f64 = rng.random();
                ((r * r * v_num as f64) as u32).min(v_num - 1)
            };
            let mut dst = rng.random_range(0..v_num);
            while dst == src {
                dst = rng.random_range(0..v_num);
            }
            Edge::new(src, dst)
        })
        .collect()
}

fn bench_walks(c: &mut Criterion) {
    let machine = MachineInfo::detect();
    let cfg = ThreadConfig::new(machine.cores.max(2) / 2 * 2, 1, &machine).unwrap();
    let threads = Threads::new(cfg.clone()).unwrap();
    let cache = tempfile::tempdir().unwrap();
    let planner = PlannerConfig {
        cache_dir: cache.path().to_path_buf(),
        ..PlannerConfig::small()
    };

    let v_num = 1u32 << 14;
    let e_num = 1u64 << 18;
    let walk_len = 16usize;
    let walker_num = 1u64 << 16;

    let mut group = c.benchmark_group("walks");
    group.sample_size(10);
    group.throughput(Throughput::Elements(walker_num * (walk_len as u64 - 1)));

    let graph = make_graph(
        skewed_graph(v_num, e_num, 1),
        false,
        WalkerCount::Total(walker_num),
        walk_len,
        1 << 32,
        false,
        &cfg,
        &threads,
        &planner,
    )
    .unwrap();
    group.bench_with_input(BenchmarkId::new("uniform", walker_num), &graph, |b, graph| {
        b.iter(|| {
            let mut solver = Solver::new(
                graph,
                &threads,
                SolverOptions {
                    walker_num,
                    walk_len,
                    mem_quota: 1 << 32,
                    node2vec: None,
                    seed: 7,
                },
            )
            .unwrap();
            solver.run_to_vec().unwrap()
        });
    });

    let n2v_graph = make_graph(
        skewed_graph(v_num, e_num, 2),
        true,
        WalkerCount::Total(walker_num),
        walk_len,
        1 << 32,
        true,
        &cfg,
        &threads,
        &planner,
    )
    .unwrap();
    group.bench_with_input(
        BenchmarkId::new("node2vec", walker_num),
        &n2v_graph,
        |b, graph| {
            b.iter(|| {
                let mut solver = Solver::new(
                    graph,
                    &threads,
                    SolverOptions {
                        walker_num,
                        walk_len,
                        mem_quota: 1 << 32,
                        node2vec: Some((0.5, 2.0)),
                        seed: 7,
                    },
                )
                .unwrap();
                solver.run_to_vec().unwrap()
            });
        },
    );
    group.finish();
}

criterion_group!(benches, bench_walks);
criterion_main!(benches);
