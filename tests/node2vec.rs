//! node2vec correctness: the empirical 2-step conditional transition matrix
//! must match the (p, q)-biased formula, and the neighborhood machinery
//! (Bloom filter + binary search) must be exact where it matters.

use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use stampede::plan::{make_graph, PlannerConfig, WalkerCount};
use stampede::solver::{Solver, SolverOptions};
use stampede::topo::{MachineInfo, ThreadConfig, Threads};
use stampede::{Edge, Error, Graph};

fn machine() -> MachineInfo {
    MachineInfo { cores: 8, sockets: 1, l2_cache: 1 << 20, total_ram: 1 << 34 }
}

fn setup(thread_num: usize) -> (ThreadConfig, Threads) {
    let cfg = ThreadConfig::new(thread_num, 1, &machine()).unwrap();
    let threads = Threads::new(cfg.clone()).unwrap();
    (cfg, threads)
}

/// Dense random undirected graph: distinct unordered pairs, no self-loops,
/// every vertex touched. Returned as one edge per pair; the loader doubles
/// them.
fn gen_undirected(v_num: u32, pair_num: usize, seed: u64) -> Vec<Edge> {
    assert!(pair_num <= (v_num * (v_num - 1) / 2) as usize);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut seen = HashSet::new();
    let mut edges = Vec::with_capacity(pair_num);
    for v in 0..v_num {
        let mut u = rng.random_range(0..v_num);
        while u == v {
            u = rng.random_range(0..v_num);
        }
        if seen.insert((v.min(u), v.max(u))) {
            edges.push(Edge::new(v, u));
        }
    }
    while edges.len() < pair_num {
        let a = rng.random_range(0..v_num);
        let b = rng.random_range(0..v_num);
        if a != b && seen.insert((a.min(b), a.max(b))) {
            edges.push(Edge::new(a, b));
        }
    }
    edges
}

struct WalkRun {
    graph: Graph,
    walks: Vec<u32>,
    walk_len: usize,
}

#[allow(clippy::too_many_arguments)]
fn run_node2vec(
    edges: Vec<Edge>,
    walker_num: u64,
    walk_len: usize,
    thread_num: usize,
    p: f32,
    q: f32,
    cache_dir: &std::path::Path,
    seed: u64,
) -> WalkRun {
    let (cfg, threads) = setup(thread_num);
    let planner =
        PlannerConfig { cache_dir: cache_dir.to_path_buf(), ..PlannerConfig::small() };
    let graph = make_graph(
        edges,
        true,
        WalkerCount::Total(walker_num),
        walk_len,
        1 << 30,
        true,
        &cfg,
        &threads,
        &planner,
    )
    .unwrap();
    let walks = {
        let mut solver = Solver::new(
            &graph,
            &threads,
            SolverOptions {
                walker_num,
                walk_len,
                mem_quota: 1 << 30,
                node2vec: Some((p, q)),
                seed,
            },
        )
        .unwrap();
        solver.run_to_vec().unwrap()
    };
    WalkRun { graph, walks, walk_len }
}

fn adjacency_sets(graph: &Graph) -> Vec<HashSet<u32>> {
    let mut adj = vec![HashSet::new(); graph.v_num as usize];
    for e in graph.edge_multiset(0) {
        adj[e.src as usize].insert(e.dst);
    }
    adj
}

/// The node2vec conditional next-step distribution for `(prev, curr)`.
fn expected_row(adj: &[HashSet<u32>], prev: u32, curr: u32, p: f64, q: f64, v: usize) -> Vec<f64> {
    let mut row = vec![0.0f64; v];
    for &next in &adj[curr as usize] {
        row[next as usize] = if next == prev {
            1.0 / p
        } else if adj[prev as usize].contains(&next) {
            1.0
        } else {
            1.0 / q
        };
    }
    let sum: f64 = row.iter().sum();
    if sum > 0.0 {
        for x in row.iter_mut() {
            *x /= sum;
        }
    }
    row
}

/// Small dense undirected graph: the empirical `(prev, curr) -> next`
/// distribution must match the (p, q) formula.
#[test]
fn two_step_conditional_matrix_matches_formula() {
    let dir = tempfile::tempdir().unwrap();
    let (p, q) = (0.5f32, 2.0f32);
    let v_num = 9u32;
    let edges = gen_undirected(v_num, 32, 41);
    assert!(edges.len() * 2 <= 800);
    let walker_num = 30 * (edges.len() as u64 * 2);
    let run = run_node2vec(edges, walker_num.max(8000), 24, 4, p, q, dir.path(), 6);

    let v = v_num as usize;
    let adj = adjacency_sets(&run.graph);

    // Count (prev, curr) -> next transitions; the first step is uniform
    // and therefore excluded from the conditional matrix.
    let mut counts = vec![vec![0.0f64; v]; v * v];
    for row in run.walks.chunks_exact(run.walk_len) {
        for window in row.windows(3) {
            let (prev, curr, next) = (window[0], window[1], window[2]);
            counts[prev as usize * v + curr as usize][next as usize] += 1.0;
        }
    }

    let mut total_sq_l2 = 0.0f64;
    for prev in 0..v_num {
        for curr in 0..v_num {
            let empirical = &mut counts[prev as usize * v + curr as usize];
            let samples: f64 = empirical.iter().sum();
            if !adj[prev as usize].contains(&curr) {
                // Walks can only arrive at curr through an edge.
                assert_eq!(samples, 0.0, "impossible pair ({prev}, {curr}) was visited");
                continue;
            }
            assert!(samples > 0.0, "edge ({prev}, {curr}) never walked");
            for x in empirical.iter_mut() {
                *x /= samples;
            }
            let expected = expected_row(&adj, prev, curr, p as f64, q as f64, v);
            for next in 0..v {
                // Support agreement: never step to a non-neighbor.
                assert_eq!(
                    expected[next] == 0.0,
                    empirical[next] == 0.0,
                    "support mismatch at ({prev}, {curr}) -> {next}"
                );
                let diff = empirical[next] - expected[next];
                total_sq_l2 += diff * diff;
            }
        }
    }
    assert!(total_sq_l2 < 10.0, "squared L2 over all rows: {total_sq_l2}");
}

/// Every consecutive pair of a node2vec walk is an edge of the undirected
/// closure.
#[test]
fn node2vec_paths_are_legal() {
    let dir = tempfile::tempdir().unwrap();
    let edges = gen_undirected(12, 30, 17);
    let run = run_node2vec(edges, 2_000, 12, 2, 0.25, 4.0, dir.path(), 14);
    let adj = adjacency_sets(&run.graph);
    for row in run.walks.chunks_exact(run.walk_len) {
        for pair in row.windows(2) {
            assert!(
                adj[pair[0] as usize].contains(&pair[1]),
                "step {} -> {} is not an edge",
                pair[0],
                pair[1]
            );
        }
    }
}

/// p = q = 1 degenerates to the uniform walk's transition distribution.
#[test]
fn unit_p_q_matches_uniform_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let edges = gen_undirected(8, 20, 29);
    let run = run_node2vec(edges, 20_000, 16, 2, 1.0, 1.0, dir.path(), 21);

    let v = run.graph.v_num as usize;
    let adj = adjacency_sets(&run.graph);
    let mut counts = vec![vec![0.0f64; v]; v];
    for row in run.walks.chunks_exact(run.walk_len) {
        for pair in row.windows(2) {
            counts[pair[0] as usize][pair[1] as usize] += 1.0;
        }
    }
    for curr in 0..v {
        let samples: f64 = counts[curr].iter().sum();
        assert!(samples > 0.0);
        let degree = adj[curr].len() as f64;
        for &next in &adj[curr] {
            let rate = counts[curr][next as usize] / samples;
            let expected = 1.0 / degree;
            assert!(
                (rate - expected).abs() < 0.05,
                "({curr} -> {next}): rate {rate:.4}, expected {expected:.4}"
            );
        }
    }
}

/// Self-loops break the acceptance test's premise and must be rejected
/// when the neighborhood query is prepared.
#[test]
fn self_loop_is_rejected_for_node2vec() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, threads) = setup(1);
    let planner =
        PlannerConfig { cache_dir: dir.path().to_path_buf(), ..PlannerConfig::small() };
    let mut edges = gen_undirected(6, 10, 3);
    edges.push(Edge::new(2, 2));
    let result = make_graph(
        edges,
        true,
        WalkerCount::Total(100),
        8,
        1 << 30,
        true,
        &cfg,
        &threads,
        &planner,
    );
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

/// Spec scenario: 1e5 random pairs inserted into a 2^20-item filter; the
/// false-positive rate on fresh pairs stays below 1%.
#[test]
fn bloom_false_positive_rate_at_scale() {
    use stampede::bloom::BloomFilter;
    use stampede::mem::MemoryPool;

    let pool = MemoryPool::new(ThreadConfig::new(1, 1, &machine()).unwrap());
    let bf = BloomFilter::new(&pool, 1 << 20).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let space = 1u32 << 26;

    let mut inserted = HashSet::with_capacity(100_000);
    while inserted.len() < 100_000 {
        let (u, v) = (rng.random_range(0..space), rng.random_range(0..space));
        if u != v && inserted.insert((u.min(v), u.max(v))) {
            bf.insert(u, v);
        }
    }
    for &(u, v) in inserted.iter().take(10_000) {
        assert!(bf.contains(u, v), "inserted pair ({u}, {v}) missing");
    }

    let mut fresh = 0u32;
    let mut hits = 0u32;
    while fresh < 100_000 {
        let (u, v) = (rng.random_range(0..space), rng.random_range(0..space));
        if u == v || inserted.contains(&(u.min(v), u.max(v))) {
            continue;
        }
        fresh += 1;
        if bf.contains(u, v) {
            hits += 1;
        }
    }
    let rate = hits as f64 / fresh as f64;
    assert!(rate < 0.01, "false-positive rate {rate}");
}

/// has_neighbor agrees with the adjacency sets on every pair of a small
/// graph.
#[test]
fn neighborhood_query_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let edges = gen_undirected(10, 20, 53);
    let run = run_node2vec(edges, 1_000, 4, 1, 1.0, 1.0, dir.path(), 31);
    let adj = adjacency_sets(&run.graph);
    for u in 0..run.graph.v_num {
        for v in 0..run.graph.v_num {
            assert_eq!(
                run.graph.has_neighbor(u, v, 0),
                adj[u as usize].contains(&v),
                "({u}, {v})"
            );
        }
    }
}
