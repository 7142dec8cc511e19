//! Per-phase wall-time aggregation. Observability only; nothing here feeds
//! back into scheduling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Shuffle,
    Walk,
    Update,
    Transpose,
}

const PHASES: [Phase; 5] =
    [Phase::Init, Phase::Shuffle, Phase::Walk, Phase::Update, Phase::Transpose];

const fn phase_index(phase: Phase) -> usize {
    match phase {
        Phase::Init => 0,
        Phase::Shuffle => 1,
        Phase::Walk => 2,
        Phase::Update => 3,
        Phase::Transpose => 4,
    }
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Init => "init",
        Phase::Shuffle => "shuffle",
        Phase::Walk => "walk",
        Phase::Update => "update",
        Phase::Transpose => "transpose",
    }
}

#[derive(Default)]
pub struct Profiler {
    phase_ns: [AtomicU64; 5],
    steps: AtomicU64,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, phase: Phase, elapsed: Duration) {
        self.phase_ns[phase_index(phase)]
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn count_step(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn phase_seconds(&self, phase: Phase) -> f64 {
        self.phase_ns[phase_index(phase)].load(Ordering::Relaxed) as f64 * 1e-9
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Log per-phase share and amortized ns per walk step.
    ///
    /// `walk_steps` is walker-steps completed; `threads` converts wall time
    /// into per-thread cost.
    pub fn report(&self, walk_steps: u64, threads: usize) {
        if walk_steps == 0 {
            return;
        }
        let total_ns: u64 =
            self.phase_ns.iter().map(|p| p.load(Ordering::Relaxed)).sum();
        for phase in PHASES {
            let ns = self.phase_ns[phase_index(phase)].load(Ordering::Relaxed);
            info!(
                phase = phase_name(phase),
                ns_per_step = format_args!("{:.2}", ns as f64 * threads as f64 / walk_steps as f64),
                percent = format_args!("{:.1}", ns as f64 / total_ns.max(1) as f64 * 100.0),
                "phase timing"
            );
        }
    }
}
