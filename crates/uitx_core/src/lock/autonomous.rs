//! Root locks holding the real synchronization state.
//!
//! An [`AutonomousLock`] combines an exclusive assembly lock with a
//! read/write commit lock. Ownership is recorded per [`ContextId`] instead of
//! per OS thread, so re-entry and permission queries are explicit.

use crate::error::{CoreError, CoreResult};
use crate::types::{ContextId, LockId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// How an acquisition behaves when the lock is held elsewhere.
#[derive(Debug, Clone, Copy)]
pub enum RequestMode<'a> {
    /// Return [`Acquisition::Busy`] without waiting.
    Immediate,
    /// Wait within the given bounds.
    Wait(Waiter<'a>),
}

/// Bounds and cancellation token of a blocking acquisition.
#[derive(Debug, Clone, Copy)]
pub struct Waiter<'a> {
    /// Total time to wait before giving up.
    pub timeout: Duration,
    /// Interval at which the cancellation token is re-checked.
    pub slice: Duration,
    /// Set by the cross-lock check when this waiter was chosen as a victim.
    pub interrupted: &'a AtomicBool,
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The lock was granted (or was already held).
    Success,
    /// The lock is held elsewhere and the request was immediate.
    Busy,
    /// The wait was cancelled by the cross-lock check.
    Interrupted,
    /// The bounded wait expired.
    Timeout,
}

#[derive(Debug, Default)]
struct LockCell {
    assembly: Option<ContextId>,
    writer: Option<ContextId>,
    readers: HashSet<ContextId>,
}

/// A root of the lock forest.
pub struct AutonomousLock {
    id: LockId,
    description: String,
    cell: Mutex<LockCell>,
    released: Condvar,
}

impl AutonomousLock {
    /// Creates a new, unheld lock.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: LockId::next(),
            description: description.into(),
            cell: Mutex::new(LockCell::default()),
            released: Condvar::new(),
        }
    }

    /// Returns the lock's identity.
    #[must_use]
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Returns the description given at creation.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns true if `owner` holds the commit-read or commit-write lock.
    #[must_use]
    pub fn has_read_permission(&self, owner: ContextId) -> bool {
        let cell = self.cell.lock();
        cell.writer == Some(owner) || cell.readers.contains(&owner)
    }

    /// Returns true if `owner` holds the assembly lock.
    #[must_use]
    pub fn has_assembly_permission(&self, owner: ContextId) -> bool {
        self.cell.lock().assembly == Some(owner)
    }

    /// Returns true if `owner` holds the commit-write lock.
    #[must_use]
    pub fn has_write_permission(&self, owner: ContextId) -> bool {
        self.cell.lock().writer == Some(owner)
    }

    /// Acquires the commit-read lock.
    pub(crate) fn read_lock(&self, owner: ContextId, mode: RequestMode<'_>) -> Acquisition {
        self.acquire(mode, "read", |cell| {
            if cell.readers.contains(&owner) {
                return true;
            }
            match cell.writer {
                Some(writer) if writer != owner => false,
                _ => {
                    cell.readers.insert(owner);
                    true
                }
            }
        })
    }

    /// Releases every commit-read hold of `owner`.
    pub(crate) fn clear_read_locks(&self, owner: ContextId) {
        let removed = self.cell.lock().readers.remove(&owner);
        if removed {
            trace!(lock = %self, owner = %owner, "cleared read lock");
            self.released.notify_all();
        }
    }

    /// Acquires the assembly lock.
    ///
    /// A duplicate attempt by the current holder is reported and succeeds.
    pub(crate) fn assembly_lock(&self, owner: ContextId, mode: RequestMode<'_>) -> Acquisition {
        if self.has_assembly_permission(owner) {
            warn!(lock = %self, owner = %owner, "duplicate assembly-lock attempt");
            return Acquisition::Success;
        }
        self.acquire(mode, "assembly", |cell| {
            if cell.assembly.is_none() {
                cell.assembly = Some(owner);
                true
            } else {
                false
            }
        })
    }

    /// Upgrades an assembly holder to the commit-write lock.
    ///
    /// Any commit-read hold of `owner` is released first. Fails without
    /// waiting if `owner` does not hold the assembly lock.
    pub(crate) fn commit_lock(
        &self,
        owner: ContextId,
        mode: RequestMode<'_>,
    ) -> CoreResult<Acquisition> {
        {
            let cell = self.cell.lock();
            if cell.assembly != Some(owner) {
                return Err(CoreError::protocol_violation(format!(
                    "cannot acquire the commit lock on {self} without first holding the assembly lock"
                )));
            }
            if cell.writer == Some(owner) {
                drop(cell);
                warn!(lock = %self, owner = %owner, "duplicate write-lock attempt");
                return Ok(Acquisition::Success);
            }
        }
        self.clear_read_locks(owner);
        Ok(self.acquire(mode, "commit", |cell| {
            if cell.writer.is_none() && cell.readers.is_empty() {
                cell.writer = Some(owner);
                true
            } else {
                false
            }
        }))
    }

    /// Releases the assembly lock, residual reads and the commit-write lock, in that order.
    pub(crate) fn commit_unlock(&self, owner: ContextId) {
        let mut cell = self.cell.lock();
        if cell.writer != Some(owner) {
            drop(cell);
            warn!(lock = %self, owner = %owner, "duplicate write-unlock attempt");
            return;
        }
        cell.assembly = None;
        cell.readers.remove(&owner);
        cell.writer = None;
        drop(cell);
        trace!(lock = %self, owner = %owner, "commit unlock");
        self.released.notify_all();
    }

    /// Releases everything `owner` holds, outside the normal protocol.
    pub(crate) fn emergency_release(&self, owner: ContextId) {
        let mut cell = self.cell.lock();
        cell.readers.remove(&owner);
        if cell.assembly == Some(owner) {
            cell.assembly = None;
        }
        if cell.writer == Some(owner) {
            cell.writer = None;
        }
        drop(cell);
        trace!(lock = %self, owner = %owner, "emergency release");
        self.released.notify_all();
    }

    /// Wakes every waiter so it re-checks its cancellation token.
    pub(crate) fn wake_waiters(&self) {
        self.released.notify_all();
    }

    /// Blocks until neither the assembly nor the commit-write lock is held, or `timeout` expires.
    ///
    /// Returns true if the lock was seen free.
    pub(crate) fn wait_until_free(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell.lock();
        while cell.assembly.is_some() || cell.writer.is_some() {
            if self.released.wait_until(&mut cell, deadline).timed_out() {
                return cell.assembly.is_none() && cell.writer.is_none();
            }
        }
        true
    }

    fn acquire(
        &self,
        mode: RequestMode<'_>,
        kind: &'static str,
        mut grant: impl FnMut(&mut LockCell) -> bool,
    ) -> Acquisition {
        let mut cell = self.cell.lock();
        if grant(&mut cell) {
            trace!(lock = %self, kind, "acquired");
            return Acquisition::Success;
        }
        let waiter = match mode {
            RequestMode::Immediate => return Acquisition::Busy,
            RequestMode::Wait(waiter) => waiter,
        };

        let deadline = Instant::now() + waiter.timeout;
        loop {
            if waiter.interrupted.load(Ordering::Acquire) {
                trace!(lock = %self, kind, "wait interrupted");
                return Acquisition::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                trace!(lock = %self, kind, "wait timed out");
                return Acquisition::Timeout;
            }
            let slice = waiter.slice.min(deadline - now);
            self.released.wait_for(&mut cell, slice);
            if grant(&mut cell) {
                trace!(lock = %self, kind, "acquired after wait");
                return Acquisition::Success;
            }
        }
    }
}

impl fmt::Display for AutonomousLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.description)
    }
}

impl fmt::Debug for AutonomousLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutonomousLock")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn waiter(flag: &AtomicBool, millis: u64) -> RequestMode<'_> {
        RequestMode::Wait(Waiter {
            timeout: Duration::from_millis(millis),
            slice: Duration::from_millis(1),
            interrupted: flag,
        })
    }

    // === Assembly ===

    #[test]
    fn assembly_is_exclusive() {
        let lock = AutonomousLock::new("root");
        let (a, b) = (ContextId::next(), ContextId::next());

        assert_eq!(lock.assembly_lock(a, RequestMode::Immediate), Acquisition::Success);
        assert_eq!(lock.assembly_lock(b, RequestMode::Immediate), Acquisition::Busy);
        assert!(lock.has_assembly_permission(a));
        assert!(!lock.has_assembly_permission(b));
    }

    #[test]
    fn duplicate_assembly_succeeds() {
        let lock = AutonomousLock::new("root");
        let a = ContextId::next();

        assert_eq!(lock.assembly_lock(a, RequestMode::Immediate), Acquisition::Success);
        assert_eq!(lock.assembly_lock(a, RequestMode::Immediate), Acquisition::Success);
        lock.emergency_release(a);
        assert!(!lock.has_assembly_permission(a));
    }

    #[test]
    fn wait_times_out() {
        let lock = AutonomousLock::new("root");
        let (a, b) = (ContextId::next(), ContextId::next());
        let flag = AtomicBool::new(false);

        lock.assembly_lock(a, RequestMode::Immediate);
        assert_eq!(lock.assembly_lock(b, waiter(&flag, 10)), Acquisition::Timeout);
    }

    #[test]
    fn interrupted_wait_returns_promptly() {
        let lock = AutonomousLock::new("root");
        let (a, b) = (ContextId::next(), ContextId::next());
        let flag = AtomicBool::new(true);

        lock.assembly_lock(a, RequestMode::Immediate);
        assert_eq!(lock.assembly_lock(b, waiter(&flag, 5_000)), Acquisition::Interrupted);
    }

    #[test]
    fn waiter_acquires_after_release() {
        let lock = Arc::new(AutonomousLock::new("root"));
        let (a, b) = (ContextId::next(), ContextId::next());
        lock.assembly_lock(a, RequestMode::Immediate);

        let releaser = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                lock.emergency_release(a);
            })
        };

        let flag = AtomicBool::new(false);
        assert_eq!(lock.assembly_lock(b, waiter(&flag, 5_000)), Acquisition::Success);
        releaser.join().unwrap();
        assert!(lock.has_assembly_permission(b));
    }

    #[test]
    fn wait_until_free_returns_once_released() {
        let lock = Arc::new(AutonomousLock::new("root"));
        let a = ContextId::next();
        assert!(lock.wait_until_free(Duration::ZERO));

        lock.assembly_lock(a, RequestMode::Immediate);
        assert!(!lock.wait_until_free(Duration::from_millis(5)));

        let releaser = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                lock.emergency_release(a);
            })
        };
        assert!(lock.wait_until_free(Duration::from_secs(5)));
        releaser.join().unwrap();
    }

    // === Commit ===

    #[test]
    fn commit_requires_assembly() {
        let lock = AutonomousLock::new("root");
        let a = ContextId::next();

        let result = lock.commit_lock(a, RequestMode::Immediate);
        assert!(matches!(result, Err(CoreError::ProtocolViolation { .. })));
    }

    #[test]
    fn commit_clears_own_reads() {
        let lock = AutonomousLock::new("root");
        let a = ContextId::next();

        assert_eq!(lock.read_lock(a, RequestMode::Immediate), Acquisition::Success);
        lock.assembly_lock(a, RequestMode::Immediate);
        assert_eq!(
            lock.commit_lock(a, RequestMode::Immediate).unwrap(),
            Acquisition::Success
        );
        assert!(lock.has_write_permission(a));
        assert!(lock.has_read_permission(a));
    }

    #[test]
    fn foreign_reader_blocks_writer() {
        let lock = AutonomousLock::new("root");
        let (a, b) = (ContextId::next(), ContextId::next());

        lock.read_lock(b, RequestMode::Immediate);
        lock.assembly_lock(a, RequestMode::Immediate);
        assert_eq!(
            lock.commit_lock(a, RequestMode::Immediate).unwrap(),
            Acquisition::Busy
        );

        lock.clear_read_locks(b);
        assert_eq!(
            lock.commit_lock(a, RequestMode::Immediate).unwrap(),
            Acquisition::Success
        );
    }

    #[test]
    fn writer_blocks_foreign_reader() {
        let lock = AutonomousLock::new("root");
        let (a, b) = (ContextId::next(), ContextId::next());

        lock.assembly_lock(a, RequestMode::Immediate);
        lock.commit_lock(a, RequestMode::Immediate).unwrap();
        assert_eq!(lock.read_lock(b, RequestMode::Immediate), Acquisition::Busy);
        assert_eq!(lock.read_lock(a, RequestMode::Immediate), Acquisition::Success);
    }

    #[test]
    fn commit_unlock_releases_everything() {
        let lock = AutonomousLock::new("root");
        let (a, b) = (ContextId::next(), ContextId::next());

        lock.assembly_lock(a, RequestMode::Immediate);
        lock.commit_lock(a, RequestMode::Immediate).unwrap();
        lock.commit_unlock(a);

        assert!(!lock.has_assembly_permission(a));
        assert!(!lock.has_write_permission(a));
        assert!(!lock.has_read_permission(a));
        assert_eq!(lock.assembly_lock(b, RequestMode::Immediate), Acquisition::Success);
    }

    #[test]
    fn commit_unlock_without_write_is_ignored() {
        let lock = AutonomousLock::new("root");
        let a = ContextId::next();

        lock.assembly_lock(a, RequestMode::Immediate);
        lock.commit_unlock(a);
        assert!(lock.has_assembly_permission(a));
    }
}
