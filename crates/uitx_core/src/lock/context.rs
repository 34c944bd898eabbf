//! Per-thread lock transaction contexts.
//!
//! Every context records the root locks it holds and the lock it is about to
//! wait for. That bookkeeping lives in one shared [`ContextTable`] guarded by
//! a single administrative mutex, so the cross-lock check sees a consistent
//! snapshot. The table mutex is never held while waiting on an actor lock.

use super::deadlock::{self, LockState, WaitEntry};
use super::{AutonomousLock, InstantiationStack, Lock};
use crate::action::TransactionKind;
use crate::error::{CollisionStatus, CoreError, CoreResult};
use crate::stats::EngineStats;
use crate::types::{ActorId, ContextId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

#[derive(Debug)]
struct ContextBook {
    thread: ThreadId,
    thread_name: Option<String>,
    full: Vec<Arc<AutonomousLock>>,
    read_only: Vec<Arc<AutonomousLock>>,
    awaited: Option<Arc<AutonomousLock>>,
    transaction_active: bool,
    interrupted: Arc<AtomicBool>,
}

impl ContextBook {
    fn wait_entry(&self, context: ContextId) -> WaitEntry {
        WaitEntry {
            context,
            transaction_active: self.transaction_active,
            awaiting: self.awaited.as_ref().map(|lock| lock.id()),
            holds: self
                .full
                .iter()
                .chain(self.read_only.iter())
                .map(|lock| lock.id())
                .collect(),
        }
    }
}

/// Shared registry of every live context.
#[derive(Debug, Default)]
pub(crate) struct ContextTable {
    books: Mutex<BTreeMap<ContextId, ContextBook>>,
}

impl ContextTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates the context for the calling thread.
    ///
    /// A thread may drive only one context at a time.
    pub(crate) fn attach(self: &Arc<Self>) -> CoreResult<LockTransactionContext> {
        let current = thread::current();
        let mut books = self.books.lock();
        if books.values().any(|book| book.thread == current.id()) {
            return Err(CoreError::NestedSubmission);
        }

        let id = ContextId::next();
        let interrupted = Arc::new(AtomicBool::new(false));
        books.insert(
            id,
            ContextBook {
                thread: current.id(),
                thread_name: current.name().map(str::to_owned),
                full: Vec::new(),
                read_only: Vec::new(),
                awaited: None,
                transaction_active: false,
                interrupted: Arc::clone(&interrupted),
            },
        );
        trace!(context = %id, thread = ?current.name(), "context attached");

        Ok(LockTransactionContext {
            id,
            table: Arc::clone(self),
            interrupted,
            failure: None,
            yielded: None,
            instantiation: InstantiationStack::new(),
            instantiated: HashSet::new(),
            layout_roots: HashMap::new(),
            adjusting: HashMap::new(),
        })
    }

    /// Returns the number of live contexts.
    pub(crate) fn len(&self) -> usize {
        self.books.lock().len()
    }

    /// Returns the cross-lock snapshot of every live context.
    pub(crate) fn snapshot(&self) -> Vec<WaitEntry> {
        self.books
            .lock()
            .iter()
            .map(|(id, book)| book.wait_entry(*id))
            .collect()
    }

    fn detach(&self, id: ContextId) {
        let book = self.books.lock().remove(&id);
        if let Some(book) = book {
            for lock in book.full.iter().chain(book.read_only.iter()) {
                lock.emergency_release(id);
            }
            trace!(context = %id, "context detached");
        }
    }
}

/// Lock bookkeeping of one thread's session.
///
/// Dropping the context releases anything it still holds.
pub struct LockTransactionContext {
    id: ContextId,
    table: Arc<ContextTable>,
    interrupted: Arc<AtomicBool>,
    failure: Option<CollisionStatus>,
    /// The lock this context gave up on when last chosen as a cross-lock victim.
    yielded: Option<Arc<AutonomousLock>>,
    pub(crate) instantiation: InstantiationStack,
    pub(crate) instantiated: HashSet<ActorId>,
    pub(crate) layout_roots: HashMap<TransactionKind, Arc<Lock>>,
    pub(crate) adjusting: HashMap<ActorId, Arc<Lock>>,
}

impl LockTransactionContext {
    /// Returns the context's identity.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Returns the collision recorded for the current attempt, if any.
    #[must_use]
    pub fn failure(&self) -> Option<CollisionStatus> {
        self.failure
    }

    /// Returns true if a transaction is active in this context.
    #[must_use]
    pub fn is_transaction_active(&self) -> bool {
        self.with_book(|book| book.transaction_active)
            .unwrap_or(false)
    }

    /// Returns true if the context fully holds `lock`.
    #[must_use]
    pub fn has_full_lock(&self, lock: &AutonomousLock) -> bool {
        self.with_book(|book| book.full.iter().any(|held| held.id() == lock.id()))
            .unwrap_or(false)
    }

    /// Returns the fully held locks in acquisition order.
    #[must_use]
    pub fn full_locks(&self) -> Vec<Arc<AutonomousLock>> {
        self.with_book(|book| book.full.clone()).unwrap_or_default()
    }

    /// Returns the locks held read-only.
    #[must_use]
    pub fn read_only_locks(&self) -> Vec<Arc<AutonomousLock>> {
        self.with_book(|book| book.read_only.clone())
            .unwrap_or_default()
    }

    /// Returns true if the context is registered as awaiting a lock.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.with_book(|book| book.awaited.is_some())
            .unwrap_or(false)
    }

    /// Resets the per-attempt state: cancellation token, recorded failure and awaited lock.
    pub(crate) fn begin_session(&mut self) {
        self.interrupted.store(false, Ordering::Release);
        self.failure = None;
        self.with_book_mut(|book| book.awaited = None);
    }

    /// Fails if this attempt already collided or was chosen as a victim.
    pub(crate) fn check_interrupted(&mut self) -> CoreResult<()> {
        if let Some(status) = self.failure {
            return Err(CoreError::collision(status));
        }
        if self.interrupted.load(Ordering::Acquire) {
            return Err(self.fail(CollisionStatus::CrossLock));
        }
        Ok(())
    }

    /// Records a collision for the current attempt and returns the retry signal.
    ///
    /// The first recorded status sticks until the next attempt begins.
    pub(crate) fn fail(&mut self, status: CollisionStatus) -> CoreError {
        let status = *self.failure.get_or_insert(status);
        CoreError::collision(status)
    }

    /// Records that this context lost a cross-lock collision while awaiting `lock`.
    pub(crate) fn yield_to(&mut self, lock: &Arc<AutonomousLock>) {
        self.yielded = Some(Arc::clone(lock));
    }

    pub(crate) fn take_yielded(&mut self) -> Option<Arc<AutonomousLock>> {
        self.yielded.take()
    }

    pub(crate) fn interrupted_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub(crate) fn set_transaction_active(&self, active: bool) {
        self.with_book_mut(|book| book.transaction_active = active);
    }

    pub(crate) fn add_full_lock(&self, lock: &Arc<AutonomousLock>) {
        self.with_book_mut(|book| {
            if !book.full.iter().any(|held| held.id() == lock.id()) {
                book.full.push(Arc::clone(lock));
            }
        });
    }

    pub(crate) fn add_read_only_lock(&self, lock: &Arc<AutonomousLock>) {
        self.with_book_mut(|book| {
            if !book.read_only.iter().any(|held| held.id() == lock.id()) {
                book.read_only.push(Arc::clone(lock));
            }
        });
    }

    /// Registers `lock` as awaited and runs the cross-lock check.
    ///
    /// Victims other than this context are interrupted and woken.
    pub(crate) fn set_awaited_lock(
        &self,
        lock: &Arc<AutonomousLock>,
        stats: &EngineStats,
    ) -> LockState {
        let mut books = self.table.books.lock();
        if let Some(book) = books.get_mut(&self.id) {
            book.awaited = Some(Arc::clone(lock));
        }

        let snapshot: Vec<WaitEntry> = books
            .iter()
            .map(|(id, book)| book.wait_entry(*id))
            .collect();
        let verdict = deadlock::check_cross_lock(&snapshot, self.id);
        stats.record_deadlock_check();

        if !verdict.victims.is_empty() {
            stats.record_victims(verdict.victims.len());
            for victim in verdict.others(self.id) {
                if let Some(book) = books.get(&victim) {
                    debug!(
                        victim = %victim,
                        thread = ?book.thread_name,
                        detected_by = %self.id,
                        "cross-lock victim interrupted"
                    );
                    book.interrupted.store(true, Ordering::Release);
                    if let Some(awaited) = &book.awaited {
                        awaited.wake_waiters();
                    }
                }
            }
            if verdict.state == LockState::Collision {
                debug!(victim = %self.id, awaiting = %lock, "cross-lock detected, caller is victim");
            }
        }
        verdict.state
    }

    pub(crate) fn clear_awaited_lock(&self) {
        self.with_book_mut(|book| book.awaited = None);
    }

    /// Commit-unlocks every full lock, clears read locks and deactivates the transaction.
    pub(crate) fn release_after_commit(&self) {
        let mut books = self.table.books.lock();
        if let Some(book) = books.get_mut(&self.id) {
            for lock in book.full.drain(..) {
                lock.commit_unlock(self.id);
            }
            for lock in book.read_only.drain(..) {
                lock.clear_read_locks(self.id);
            }
            book.transaction_active = false;
        }
    }

    /// Releases every lock outside the normal protocol and deactivates the transaction.
    pub(crate) fn emergency_release(&self) {
        let mut books = self.table.books.lock();
        if let Some(book) = books.get_mut(&self.id) {
            let full = std::mem::take(&mut book.full);
            let read_only = std::mem::take(&mut book.read_only);
            for lock in full.iter().chain(read_only.iter()) {
                lock.emergency_release(self.id);
            }
            book.awaited = None;
            book.transaction_active = false;
        }
    }

    /// Drops the session-scoped registration state.
    pub(crate) fn clear_session_state(&mut self) {
        self.layout_roots.clear();
        self.adjusting.clear();
        self.instantiated.clear();
    }

    fn with_book<R>(&self, f: impl FnOnce(&ContextBook) -> R) -> Option<R> {
        self.table.books.lock().get(&self.id).map(f)
    }

    fn with_book_mut<R>(&self, f: impl FnOnce(&mut ContextBook) -> R) -> Option<R> {
        self.table.books.lock().get_mut(&self.id).map(f)
    }
}

impl Drop for LockTransactionContext {
    fn drop(&mut self) {
        self.table.detach(self.id);
    }
}

impl fmt::Debug for LockTransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTransactionContext")
            .field("id", &self.id)
            .field("failure", &self.failure)
            .field("yielded", &self.yielded.as_ref().map(|lock| lock.id()))
            .finish_non_exhaustive()
    }
}
