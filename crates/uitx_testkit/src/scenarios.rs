//! Reproducible multi-thread scenarios.
//!
//! The cross-lock scenario builds the smallest possible lock cycle: two
//! threads each take one actor's assembly lock, meet at a barrier, then try
//! to take the other's. Exactly one of them must be chosen as victim, retry,
//! and commit after the other.

use crate::fixtures::Counter;
use serde::Serialize;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use uitx_core::action::from_fn;
use uitx_core::{Config, CoreError, CoreResult, StatsSnapshot, TransactionRegistry};

/// How one thread of the cross-lock scenario ended.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadReport {
    /// Thread name.
    pub name: String,
    /// Number of times the task body ran.
    pub attempts: u32,
    /// Whether the task committed.
    pub committed: bool,
    /// The error, if the task failed.
    pub error: Option<String>,
}

/// Outcome of [`run_cross_lock`].
#[derive(Debug, Clone, Serialize)]
pub struct CrossLockReport {
    /// One report per thread, in spawn order.
    pub threads: Vec<ThreadReport>,
    /// Final value of each counter.
    pub values: [i64; 2],
    /// Wall time of the scenario.
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Engine statistics after both threads finished.
    pub stats: StatsSnapshot,
}

impl CrossLockReport {
    /// Returns the threads that had to run more than once.
    pub fn victims(&self) -> impl Iterator<Item = &ThreadReport> {
        self.threads.iter().filter(|thread| thread.attempts > 1)
    }

    /// Returns true if both tasks committed.
    pub fn all_committed(&self) -> bool {
        self.threads.iter().all(|thread| thread.committed)
    }
}

pub(crate) fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_micros() as f64 / 1000.0)
}

/// Runs the two-thread cross-lock scenario on a fresh registry.
///
/// The barrier is only used on the first attempt, so a retrying victim
/// does not wait for a partner that already committed.
pub fn run_cross_lock(config: Config) -> CoreResult<CrossLockReport> {
    let registry = TransactionRegistry::new(config);
    let counters = Counter::create_many(&registry, 2)?;
    let (x, y) = match counters.as_slice() {
        [x, y] => (x.clone(), y.clone()),
        _ => return Err(CoreError::protocol_violation("expected two counters")),
    };
    let barrier = Arc::new(Barrier::new(2));
    let started = Instant::now();

    let plans = [("t1", x.clone(), y.clone()), ("t2", y.clone(), x.clone())];
    let mut handles = Vec::with_capacity(plans.len());
    for (name, first, second) in plans {
        let registry = registry.clone();
        let barrier = Arc::clone(&barrier);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut attempts = 0;
                let result = registry.submit(&mut from_fn(name, |cx| {
                    attempts += 1;
                    cx.lock_for_assembly(first.actor())?;
                    if attempts == 1 {
                        barrier.wait();
                    }
                    cx.lock_for_assembly(second.actor())?;
                    first.add(cx, 1)?;
                    second.add(cx, 1)?;
                    Ok(true)
                }));
                debug!(thread = name, attempts, ok = result.is_ok(), "cross-lock thread finished");
                ThreadReport {
                    name: name.to_owned(),
                    attempts,
                    committed: matches!(result, Ok(outcome) if outcome.is_committed()),
                    error: result.err().map(|err| err.to_string()),
                }
            })
            .map_err(|err| CoreError::task(format!("failed to spawn {name}: {err}")))?;
        handles.push(handle);
    }

    let mut threads = Vec::with_capacity(handles.len());
    for handle in handles {
        let report = handle
            .join()
            .map_err(|_| CoreError::task("cross-lock thread panicked"))?;
        threads.push(report);
    }

    Ok(CrossLockReport {
        threads,
        values: [x.value(), y.value()],
        duration: started.elapsed(),
        stats: registry.stats().snapshot(),
    })
}
