//! Stress tests for the lock engine.
//!
//! Threads lock random subsets of shared counters in random order, which
//! produces both cross-lock cycles and plain contention. Every task adds one
//! to each counter it touched, so after a run the counter total must equal
//! the touches of committed tasks exactly.

use crate::fixtures::Counter;
use crate::scenarios::serialize_millis;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uitx_core::action::from_fn;
use uitx_core::{CoreError, CoreResult, StatsSnapshot, TransactionRegistry};

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of shared counters.
    pub actors: usize,
    /// Tasks submitted by each thread.
    pub tasks_per_thread: usize,
    /// Most counters a single task touches.
    pub max_touches: usize,
    /// Seed for the per-thread generators.
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            actors: 8,
            tasks_per_thread: 100,
            max_touches: 3,
            seed: 0x5eed,
        }
    }
}

/// Result of a stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressResult {
    /// Tasks that committed.
    pub committed: usize,
    /// Tasks that failed, normally by exhausting their retries.
    pub failed: usize,
    /// Counter increments applied by committed tasks.
    pub touches_committed: usize,
    /// Sum of every counter after the run.
    pub counter_total: i64,
    /// Total duration.
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Committed and failed tasks per second.
    pub tasks_per_second: f64,
    /// Engine statistics after the run.
    pub stats: StatsSnapshot,
}

impl StressResult {
    /// Returns true if the counters reflect exactly the committed tasks.
    pub fn is_consistent(&self) -> bool {
        i64::try_from(self.touches_committed).is_ok_and(|touches| touches == self.counter_total)
    }
}

/// Runs a contention stress test on `registry`.
pub fn run_stress(registry: &TransactionRegistry, config: &StressConfig) -> CoreResult<StressResult> {
    let counters = Arc::new(Counter::create_many(registry, config.actors.max(1))?);
    let committed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let touches_committed = Arc::new(AtomicUsize::new(0));
    let max_touches = config.max_touches.clamp(1, counters.len());

    let start = Instant::now();
    let mut handles = Vec::with_capacity(config.threads);
    for t in 0..config.threads {
        let registry = registry.clone();
        let counters = Arc::clone(&counters);
        let committed = Arc::clone(&committed);
        let failed = Arc::clone(&failed);
        let touches_committed = Arc::clone(&touches_committed);
        let tasks = config.tasks_per_thread;
        let seed = config.seed.wrapping_add(t as u64);

        let handle = thread::Builder::new()
            .name(format!("stress-{t}"))
            .spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..tasks {
                    let touches = rng.gen_range(1..=max_touches);
                    let picked: Vec<Counter> = counters
                        .choose_multiple(&mut rng, touches)
                        .cloned()
                        .collect();

                    let result = registry.submit(&mut from_fn("stress", |cx| {
                        for counter in &picked {
                            cx.lock_for_assembly(counter.actor())?;
                        }
                        for counter in &picked {
                            counter.add(cx, 1)?;
                        }
                        Ok(true)
                    }));

                    match result {
                        Ok(_) => {
                            committed.fetch_add(1, Ordering::Relaxed);
                            touches_committed.fetch_add(picked.len(), Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .map_err(|err| CoreError::task(format!("failed to spawn stress thread: {err}")))?;
        handles.push(handle);
    }

    for handle in handles {
        handle
            .join()
            .map_err(|_| CoreError::task("stress thread panicked"))?;
    }

    let duration = start.elapsed();
    let committed = committed.load(Ordering::Relaxed);
    let failed = failed.load(Ordering::Relaxed);
    let tasks_per_second = if duration.as_secs_f64() > 0.0 {
        (committed + failed) as f64 / duration.as_secs_f64()
    } else {
        0.0
    };

    Ok(StressResult {
        committed,
        failed,
        touches_committed: touches_committed.load(Ordering::Relaxed),
        counter_total: counters.iter().map(Counter::value).sum(),
        duration,
        tasks_per_second,
        stats: registry.stats().snapshot(),
    })
}
