//! Engine statistics.
//!
//! Counters are shared by every session driven through one
//! [`TransactionRegistry`](crate::TransactionRegistry) and can be read while
//! tasks are in flight.
//!
//! ```rust,ignore
//! let registry = TransactionRegistry::new(Config::default());
//! // ... submit tasks
//! let stats = registry.stats().snapshot();
//! println!("retries: {}", stats.retries);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine statistics.
///
/// All counters are monotonically increasing.
#[derive(Debug, Default)]
pub struct EngineStats {
    // Task counters
    /// Outer tasks submitted.
    tasks_submitted: AtomicU64,
    /// Sessions that reached commit.
    sessions_committed: AtomicU64,
    /// Sessions rolled back because a task declined.
    sessions_rolled_back: AtomicU64,
    /// Task restarts after a collision.
    retries: AtomicU64,
    /// Tasks that exhausted their retry budget.
    exhausted: AtomicU64,

    // Lock counters
    /// Collisions caused by a detected lock cycle.
    crosslock_collisions: AtomicU64,
    /// Collisions caused by an expired bounded wait.
    timeouts: AtomicU64,
    /// Runs of the cross-lock check.
    deadlock_checks: AtomicU64,
    /// Contexts selected as deadlock victims.
    victims_selected: AtomicU64,

    // Collaboration counters
    /// Directives applied during commit.
    directives_committed: AtomicU64,
    /// Notifications broadcast within sessions.
    notifications_broadcast: AtomicU64,
}

impl EngineStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.sessions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.sessions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_crosslock(&self) {
        self.crosslock_collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deadlock_check(&self) {
        self.deadlock_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_victims(&self, count: usize) {
        self.victims_selected
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_directives_committed(&self, count: usize) {
        self.directives_committed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_broadcast(&self) {
        self.notifications_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    // === Getters ===

    /// Returns the number of outer tasks submitted.
    pub fn tasks_submitted(&self) -> u64 {
        self.tasks_submitted.load(Ordering::Relaxed)
    }

    /// Returns the number of sessions that committed.
    pub fn sessions_committed(&self) -> u64 {
        self.sessions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of sessions rolled back by a declining task.
    pub fn sessions_rolled_back(&self) -> u64 {
        self.sessions_rolled_back.load(Ordering::Relaxed)
    }

    /// Returns the number of task restarts.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Returns the number of tasks that exhausted their retry budget.
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Returns the number of cross-lock collisions.
    pub fn crosslock_collisions(&self) -> u64 {
        self.crosslock_collisions.load(Ordering::Relaxed)
    }

    /// Returns the number of bounded waits that expired.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Returns the number of cross-lock checks performed.
    pub fn deadlock_checks(&self) -> u64 {
        self.deadlock_checks.load(Ordering::Relaxed)
    }

    /// Returns the number of victims selected by the cross-lock check.
    pub fn victims_selected(&self) -> u64 {
        self.victims_selected.load(Ordering::Relaxed)
    }

    /// Returns the number of directives applied.
    pub fn directives_committed(&self) -> u64 {
        self.directives_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of notifications broadcast.
    pub fn notifications_broadcast(&self) -> u64 {
        self.notifications_broadcast.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tasks_submitted: self.tasks_submitted(),
            sessions_committed: self.sessions_committed(),
            sessions_rolled_back: self.sessions_rolled_back(),
            retries: self.retries(),
            exhausted: self.exhausted(),
            crosslock_collisions: self.crosslock_collisions(),
            timeouts: self.timeouts(),
            deadlock_checks: self.deadlock_checks(),
            victims_selected: self.victims_selected(),
            directives_committed: self.directives_committed(),
            notifications_broadcast: self.notifications_broadcast(),
        }
    }
}

/// A point-in-time snapshot of engine statistics.
///
/// Unlike `EngineStats`, this is a plain struct that can be serialized,
/// compared, or passed across threads without atomics.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct StatsSnapshot {
    /// Outer tasks submitted.
    pub tasks_submitted: u64,
    /// Sessions that committed.
    pub sessions_committed: u64,
    /// Sessions rolled back by a declining task.
    pub sessions_rolled_back: u64,
    /// Task restarts after a collision.
    pub retries: u64,
    /// Tasks that exhausted their retry budget.
    pub exhausted: u64,
    /// Collisions caused by a detected lock cycle.
    pub crosslock_collisions: u64,
    /// Bounded waits that expired.
    pub timeouts: u64,
    /// Cross-lock checks performed.
    pub deadlock_checks: u64,
    /// Victims selected by the cross-lock check.
    pub victims_selected: u64,
    /// Directives applied during commit.
    pub directives_committed: u64,
    /// Notifications broadcast within sessions.
    pub notifications_broadcast: u64,
}
