//! The actor to lock registry and acquisition protocol.

use super::access::{AccessKind, FieldAccess, FieldAccessHook, Permission};
use super::autonomous::{Acquisition, AutonomousLock, RequestMode, Waiter};
use super::context::{ContextTable, LockTransactionContext};
use super::deadlock::LockState;
use super::Lock;
use crate::action::TransactionKind;
use crate::config::Config;
use crate::error::{CollisionStatus, CoreError, CoreResult};
use crate::stats::EngineStats;
use crate::types::{ActorId, ContextId, SynchronizationRole};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct AdminState {
    locks_by_actor: HashMap<ActorId, Arc<Lock>>,
    locks_by_layout_root: HashMap<ActorId, Arc<Lock>>,
}

/// Maps actors to locks and drives the assembly/commit acquisition protocol.
///
/// The actor map is guarded by its own administrative mutex, separate from
/// every actor lock, so registry bookkeeping never shows up in the
/// cross-lock graph.
pub struct LockRegistry {
    admin: Mutex<AdminState>,
    contexts: Arc<ContextTable>,
    wait_timeout: Duration,
    wait_slice: Duration,
    stats: Arc<EngineStats>,
}

impl LockRegistry {
    /// Creates an empty registry.
    pub fn new(config: &Config, stats: Arc<EngineStats>) -> Self {
        Self {
            admin: Mutex::new(AdminState::default()),
            contexts: Arc::new(ContextTable::new()),
            wait_timeout: config.lock_wait_timeout,
            wait_slice: config.wait_slice,
            stats,
        }
    }

    /// Creates the lock context for the calling thread.
    pub(crate) fn attach_context(&self) -> CoreResult<LockTransactionContext> {
        self.contexts.attach()
    }

    /// Returns the number of live contexts.
    #[must_use]
    pub fn active_contexts(&self) -> usize {
        self.contexts.len()
    }

    // === Actor map ===

    /// Returns the number of registered actors.
    #[must_use]
    pub fn actor_count(&self) -> usize {
        self.admin.lock().locks_by_actor.len()
    }

    /// Returns true if `actor` has a registered lock.
    #[must_use]
    pub fn is_registered(&self, actor: ActorId) -> bool {
        self.admin.lock().locks_by_actor.contains_key(&actor)
    }

    /// Returns the lock registered for `actor`.
    #[must_use]
    pub fn lock_of(&self, actor: ActorId) -> Option<Arc<Lock>> {
        self.admin.lock().locks_by_actor.get(&actor).cloned()
    }

    /// Returns the root lock guarding `actor`.
    #[must_use]
    pub fn resolve_actor(&self, actor: ActorId) -> Option<Arc<AutonomousLock>> {
        self.admin
            .lock()
            .locks_by_actor
            .get(&actor)
            .map(|lock| Arc::clone(lock.resolve()))
    }

    /// Removes `actor` from the map. Later access to it is logged and skipped.
    pub fn unregister_actor(&self, actor: ActorId) -> bool {
        self.admin.lock().locks_by_actor.remove(&actor).is_some()
    }

    /// Returns the permissions `context` holds on `actor`'s root lock.
    #[must_use]
    pub fn permission(&self, context: ContextId, actor: ActorId) -> Permission {
        match self.resolve_actor(actor) {
            Some(lock) => Permission {
                read: lock.has_read_permission(context),
                assembly: lock.has_assembly_permission(context),
                write: lock.has_write_permission(context),
            },
            None => Permission::default(),
        }
    }

    // === Session lifecycle ===

    /// Resets the context at the start of an attempt.
    pub fn begin_session(&self, cx: &mut LockTransactionContext) {
        cx.begin_session();
    }

    /// Marks a transaction active in the context.
    pub fn begin_transaction(&self, cx: &mut LockTransactionContext) -> CoreResult<()> {
        cx.check_interrupted()?;
        cx.set_transaction_active(true);
        Ok(())
    }

    // === Registration ===

    /// Opens an instantiation frame.
    pub fn begin_instantiation(
        &self,
        cx: &mut LockTransactionContext,
        role: SynchronizationRole,
        description: &str,
    ) -> CoreResult<()> {
        cx.instantiation.push(role, description)
    }

    /// Opens an instantiation frame on an existing actor's lock.
    pub fn begin_subordinate_instantiation(
        &self,
        cx: &mut LockTransactionContext,
        actor: ActorId,
    ) -> CoreResult<()> {
        let lock = self.lock_of(actor).ok_or_else(|| {
            CoreError::protocol_violation(format!(
                "cannot instantiate under {actor}: it has no registered lock"
            ))
        })?;
        cx.instantiation.push_lock(lock);
        Ok(())
    }

    /// Closes the innermost instantiation frame.
    pub fn end_instantiation(&self, cx: &mut LockTransactionContext) {
        cx.instantiation.pop();
    }

    /// Registers a new actor in the innermost frame.
    ///
    /// With `dependent` the actor gets a fresh dependent lock on the frame's
    /// lock; otherwise it shares the frame's lock.
    pub fn register_actor(
        &self,
        cx: &mut LockTransactionContext,
        dependent: bool,
        description: &str,
    ) -> CoreResult<ActorId> {
        if cx.instantiation.is_empty() {
            let role = if dependent {
                SynchronizationRole::Dependent
            } else {
                SynchronizationRole::Autonomous
            };
            return Err(CoreError::NoInstantiationFrame { role: role.name() });
        }
        cx.check_interrupted()?;
        if !cx.is_transaction_active() {
            return Err(CoreError::protocol_violation(
                "cannot register an actor with no transaction in progress; join a transaction first",
            ));
        }

        let lock = if dependent {
            cx.instantiation.attach_dependent(description)?
        } else {
            match cx.instantiation.peek() {
                Some(lock) => Arc::clone(lock),
                None => return Err(CoreError::NoInstantiationFrame { role: "autonomous" }),
            }
        };
        let actor = ActorId::next();
        trace!(actor = %actor, lock = %lock, "actor registered");
        self.admin.lock().locks_by_actor.insert(actor, lock);
        cx.instantiated.insert(actor);
        Ok(actor)
    }

    /// Binds `kind` to the lock of layout root `root`, creating the lock on first use.
    pub fn begin_layout(
        &self,
        cx: &mut LockTransactionContext,
        kind: TransactionKind,
        root: ActorId,
    ) -> CoreResult<()> {
        cx.check_interrupted()?;
        if cx.layout_roots.contains_key(&kind) {
            return Err(CoreError::protocol_violation(format!(
                "duplicate attempt to begin layout transaction {}",
                kind.name()
            )));
        }
        let lock = {
            let mut admin = self.admin.lock();
            Arc::clone(
                admin
                    .locks_by_layout_root
                    .entry(root)
                    .or_insert_with(|| Lock::autonomous(format!("layout root {root}"))),
            )
        };
        cx.layout_roots.insert(kind, lock);
        Ok(())
    }

    /// Registers a new actor depending on the layout root bound to `kind`.
    pub fn register_layout_actor(
        &self,
        cx: &mut LockTransactionContext,
        kind: TransactionKind,
        description: &str,
    ) -> CoreResult<ActorId> {
        cx.check_interrupted()?;
        let root = cx
            .layout_roots
            .get(&kind)
            .cloned()
            .ok_or(CoreError::MissingLayoutRoot {
                transaction: kind.name(),
            })?;

        let actor = ActorId::next();
        self.admin
            .lock()
            .locks_by_actor
            .insert(actor, Lock::dependent(root, description));
        cx.instantiated.insert(actor);
        Ok(actor)
    }

    /// Stages `actor` to depend on `new_owner`'s lock once the session commits.
    pub fn reassign_actor(
        &self,
        cx: &mut LockTransactionContext,
        actor: ActorId,
        new_owner: ActorId,
    ) -> CoreResult<()> {
        cx.check_interrupted()?;
        if !self.is_registered(actor) {
            warn!(actor = %actor, "reassignment of an actor with no registered lock");
            return Ok(());
        }
        let owner = self.lock_of(new_owner).ok_or_else(|| {
            CoreError::protocol_violation(format!(
                "cannot reassign {actor} to {new_owner}: it has no registered lock"
            ))
        })?;
        cx.adjusting
            .insert(actor, Lock::dependent(owner, format!("{actor} under {new_owner}")));
        Ok(())
    }

    // === Acquisition ===

    /// Acquires `actor`'s assembly lock for the context.
    ///
    /// A no-op if the context already fully holds the root lock. An
    /// unregistered actor is logged and skipped.
    pub fn lock_for_assembly(
        &self,
        cx: &mut LockTransactionContext,
        actor: ActorId,
    ) -> CoreResult<()> {
        cx.check_interrupted()?;
        let Some(lock) = self.resolve_actor(actor) else {
            warn!(actor = %actor, "assembly lock requested for an actor with no registered lock");
            return Ok(());
        };
        if cx.has_full_lock(&lock) {
            return Ok(());
        }

        let owner = cx.id();
        self.acquire(cx, &lock, |mode| Ok(lock.assembly_lock(owner, mode)))?;
        cx.add_full_lock(&lock);
        Ok(())
    }

    /// Upgrades every fully held lock to commit-write.
    pub fn commit_lock(&self, cx: &mut LockTransactionContext) -> CoreResult<()> {
        let owner = cx.id();
        for lock in cx.full_locks() {
            cx.check_interrupted()?;
            self.acquire(cx, &lock, |mode| lock.commit_lock(owner, mode))?;
        }
        Ok(())
    }

    /// Releases every lock of the context and merges staged reassignments.
    pub fn commit_unlock(&self, cx: &mut LockTransactionContext) {
        cx.release_after_commit();
        if !cx.adjusting.is_empty() {
            let mut admin = self.admin.lock();
            for (actor, lock) in cx.adjusting.drain() {
                trace!(actor = %actor, lock = %lock, "reassignment merged");
                admin.locks_by_actor.insert(actor, lock);
            }
        }
        cx.clear_session_state();
    }

    /// Releases everything the context holds, outside the normal protocol.
    ///
    /// Used when the context must unwind and retry.
    pub fn emergency_release_context(&self, cx: &mut LockTransactionContext) {
        cx.emergency_release();
        cx.clear_session_state();
    }

    /// Waits until the lock the context last yielded as a cross-lock victim is released.
    ///
    /// Called between attempts, with nothing held, so a victim cannot take
    /// its first lock again before the context it yielded to has finished.
    /// The wait is bounded by the lock wait timeout.
    pub fn await_yielded(&self, cx: &mut LockTransactionContext) {
        let Some(lock) = cx.take_yielded() else {
            return;
        };
        if lock.wait_until_free(self.wait_timeout) {
            trace!(lock = %lock, context = %cx.id(), "yielded lock released");
        } else {
            debug!(lock = %lock, context = %cx.id(), "yielded lock still held, retrying anyway");
        }
    }

    // === Field access ===

    /// Validates a read of `actor.field`, acquiring the commit-read lock if needed.
    pub fn validate_read(
        &self,
        cx: &mut LockTransactionContext,
        hook: &dyn FieldAccessHook,
        actor: ActorId,
        field: &str,
    ) -> CoreResult<()> {
        cx.check_interrupted()?;
        let instantiated = cx.instantiated.contains(&actor);
        let mut registered = true;
        if !instantiated {
            if !cx.is_transaction_active() {
                warn!(
                    actor = %actor,
                    field,
                    "read with no transaction active; join a read-only transaction when no writes are needed"
                );
            }
            match self.resolve_actor(actor) {
                None => registered = false,
                Some(lock) if lock.has_read_permission(cx.id()) => {}
                Some(lock) => {
                    let owner = cx.id();
                    self.acquire(cx, &lock, |mode| Ok(lock.read_lock(owner, mode)))?;
                    cx.add_read_only_lock(&lock);
                }
            }
        }

        hook.on_read(&FieldAccess {
            actor,
            field,
            kind: AccessKind::Read,
            registered,
            instantiated,
            permission: self.permission(cx.id(), actor),
        });
        Ok(())
    }

    /// Reports a write of `actor.field` without acquiring anything.
    pub fn validate_write(
        &self,
        cx: &mut LockTransactionContext,
        hook: &dyn FieldAccessHook,
        actor: ActorId,
        field: &str,
    ) -> CoreResult<()> {
        cx.check_interrupted()?;
        hook.on_write(&FieldAccess {
            actor,
            field,
            kind: AccessKind::Write,
            registered: self.is_registered(actor),
            instantiated: cx.instantiated.contains(&actor),
            permission: self.permission(cx.id(), actor),
        });
        Ok(())
    }

    /// Runs one deadlock-checked acquisition.
    ///
    /// Tries immediately; on contention registers the awaited lock and runs
    /// the cross-lock check, then waits within bounds unless the caller was
    /// chosen as a victim.
    fn acquire(
        &self,
        cx: &mut LockTransactionContext,
        lock: &Arc<AutonomousLock>,
        attempt: impl Fn(RequestMode<'_>) -> CoreResult<Acquisition>,
    ) -> CoreResult<()> {
        if attempt(RequestMode::Immediate)? == Acquisition::Success {
            return Ok(());
        }

        if cx.set_awaited_lock(lock, &self.stats) == LockState::Collision {
            cx.clear_awaited_lock();
            cx.yield_to(lock);
            self.stats.record_crosslock();
            return Err(cx.fail(CollisionStatus::CrossLock));
        }

        let interrupted = cx.interrupted_handle();
        let outcome = attempt(RequestMode::Wait(Waiter {
            timeout: self.wait_timeout,
            slice: self.wait_slice,
            interrupted: &interrupted,
        }));
        cx.clear_awaited_lock();

        match outcome? {
            Acquisition::Success => Ok(()),
            Acquisition::Interrupted => {
                cx.yield_to(lock);
                self.stats.record_crosslock();
                Err(cx.fail(CollisionStatus::CrossLock))
            }
            Acquisition::Timeout | Acquisition::Busy => {
                self.stats.record_timeout();
                Err(cx.fail(CollisionStatus::Timeout))
            }
        }
    }
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("actors", &self.actor_count())
            .field("contexts", &self.active_contexts())
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::GenericTransaction;
    use crate::lock::LoggingFieldAccessHook;
    use std::sync::mpsc;
    use std::thread;

    fn create_registry() -> LockRegistry {
        let config = Config::default()
            .lock_wait_timeout(Duration::from_millis(20))
            .wait_slice(Duration::from_millis(1));
        LockRegistry::new(&config, Arc::new(EngineStats::new()))
    }

    fn active_context(registry: &LockRegistry) -> LockTransactionContext {
        let mut cx = registry.attach_context().unwrap();
        registry.begin_session(&mut cx);
        registry.begin_transaction(&mut cx).unwrap();
        cx
    }

    fn register(
        registry: &LockRegistry,
        cx: &mut LockTransactionContext,
        role: SynchronizationRole,
    ) -> ActorId {
        registry.begin_instantiation(cx, role, "actor").unwrap();
        let actor = registry.register_actor(cx, false, "actor");
        registry.end_instantiation(cx);
        actor.unwrap()
    }

    // === Registration ===

    #[test]
    fn registration_requires_frame() {
        let registry = create_registry();
        let mut cx = active_context(&registry);
        let result = registry.register_actor(&mut cx, false, "orphan");
        assert!(matches!(result, Err(CoreError::NoInstantiationFrame { .. })));
    }

    #[test]
    fn registration_requires_active_transaction() {
        let registry = create_registry();
        let mut cx = registry.attach_context().unwrap();
        registry
            .begin_instantiation(&mut cx, SynchronizationRole::Autonomous, "root")
            .unwrap();
        let result = registry.register_actor(&mut cx, false, "actor");
        assert!(matches!(result, Err(CoreError::ProtocolViolation { .. })));
    }

    #[test]
    fn dependent_actor_shares_root() {
        let registry = create_registry();
        let mut cx = active_context(&registry);

        registry
            .begin_instantiation(&mut cx, SynchronizationRole::Autonomous, "window")
            .unwrap();
        let window = registry.register_actor(&mut cx, false, "window").unwrap();
        let handler = registry.register_actor(&mut cx, true, "handler").unwrap();
        registry.end_instantiation(&mut cx);

        let a = registry.resolve_actor(window).unwrap();
        let b = registry.resolve_actor(handler).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.lock_of(window).unwrap().is_autonomous());
        assert!(!registry.lock_of(handler).unwrap().is_autonomous());
    }

    #[test]
    fn subordinate_instantiation_reuses_actor_lock() {
        let registry = create_registry();
        let mut cx = active_context(&registry);
        let list = register(&registry, &mut cx, SynchronizationRole::Autonomous);

        registry.begin_subordinate_instantiation(&mut cx, list).unwrap();
        let cell = registry.register_actor(&mut cx, false, "cell").unwrap();
        registry.end_instantiation(&mut cx);

        assert!(Arc::ptr_eq(
            &registry.resolve_actor(list).unwrap(),
            &registry.resolve_actor(cell).unwrap()
        ));
    }

    #[test]
    fn unregistered_actor_is_skipped() {
        let registry = create_registry();
        let mut cx = active_context(&registry);
        let actor = register(&registry, &mut cx, SynchronizationRole::Autonomous);

        assert!(registry.unregister_actor(actor));
        assert!(registry.lock_for_assembly(&mut cx, actor).is_ok());
        assert!(cx.full_locks().is_empty());
    }

    // === Layout ===

    #[test]
    fn layout_actor_requires_root() {
        let registry = create_registry();
        let mut cx = active_context(&registry);
        let kind = TransactionKind::of::<GenericTransaction>();

        let result = registry.register_layout_actor(&mut cx, kind, "pane");
        assert!(matches!(result, Err(CoreError::MissingLayoutRoot { .. })));
    }

    #[test]
    fn layout_root_lock_is_shared() {
        let registry = create_registry();
        let mut cx = active_context(&registry);
        let kind = TransactionKind::of::<GenericTransaction>();
        let root = ActorId::next();

        registry.begin_layout(&mut cx, kind, root).unwrap();
        let a = registry.register_layout_actor(&mut cx, kind, "a").unwrap();
        let b = registry.register_layout_actor(&mut cx, kind, "b").unwrap();
        assert!(Arc::ptr_eq(
            &registry.resolve_actor(a).unwrap(),
            &registry.resolve_actor(b).unwrap()
        ));

        let duplicate = registry.begin_layout(&mut cx, kind, root);
        assert!(matches!(duplicate, Err(CoreError::ProtocolViolation { .. })));
    }

    #[test]
    fn reassignment_merges_at_commit_unlock() {
        let registry = create_registry();
        let mut cx = active_context(&registry);
        let old_owner = register(&registry, &mut cx, SynchronizationRole::Autonomous);
        let new_owner = register(&registry, &mut cx, SynchronizationRole::Autonomous);

        registry.begin_subordinate_instantiation(&mut cx, old_owner).unwrap();
        let child = registry.register_actor(&mut cx, true, "child").unwrap();
        registry.end_instantiation(&mut cx);

        registry.reassign_actor(&mut cx, child, new_owner).unwrap();
        let before = registry.resolve_actor(child).unwrap();
        assert!(Arc::ptr_eq(&before, &registry.resolve_actor(old_owner).unwrap()));

        registry.commit_unlock(&mut cx);
        let after = registry.resolve_actor(child).unwrap();
        assert!(Arc::ptr_eq(&after, &registry.resolve_actor(new_owner).unwrap()));
    }

    // === Acquisition ===

    #[test]
    fn repeated_assembly_lock_is_idempotent() {
        let registry = create_registry();
        let mut cx = active_context(&registry);
        let actor = register(&registry, &mut cx, SynchronizationRole::Autonomous);

        registry.lock_for_assembly(&mut cx, actor).unwrap();
        registry.lock_for_assembly(&mut cx, actor).unwrap();
        assert_eq!(cx.full_locks().len(), 1);
    }

    #[test]
    fn commit_cycle_grants_and_releases_write() {
        let registry = create_registry();
        let mut cx = active_context(&registry);
        let actor = register(&registry, &mut cx, SynchronizationRole::Autonomous);

        registry.lock_for_assembly(&mut cx, actor).unwrap();
        registry.commit_lock(&mut cx).unwrap();
        assert!(registry.permission(cx.id(), actor).write);

        registry.commit_unlock(&mut cx);
        assert_eq!(registry.permission(cx.id(), actor), Permission::default());
        assert!(!cx.is_transaction_active());
    }

    #[test]
    fn contended_lock_times_out() {
        let registry = Arc::new(create_registry());
        let (actor_tx, actor_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let holder = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut cx = active_context(&registry);
                let actor = register(&registry, &mut cx, SynchronizationRole::Autonomous);
                registry.lock_for_assembly(&mut cx, actor).unwrap();
                actor_tx.send(actor).unwrap();
                done_rx.recv().unwrap();
            })
        };

        let actor = actor_rx.recv().unwrap();
        let mut cx = active_context(&registry);
        let err = registry.lock_for_assembly(&mut cx, actor).unwrap_err();
        assert_eq!(err.collision_status(), Some(CollisionStatus::Timeout));
        assert!(!cx.is_waiting());

        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn cross_lock_victim_waits_for_the_lock_it_yielded() {
        let config = Config::default()
            .lock_wait_timeout(Duration::from_secs(2))
            .wait_slice(Duration::from_millis(1));
        let registry = Arc::new(LockRegistry::new(&config, Arc::new(EngineStats::new())));
        let mut setup = active_context(&registry);
        let x = register(&registry, &mut setup, SynchronizationRole::Autonomous);
        let y = register(&registry, &mut setup, SynchronizationRole::Autonomous);
        registry.commit_unlock(&mut setup);
        drop(setup);

        // the lower context id is chosen as victim of a two-lock cycle
        let mut cx = active_context(&registry);
        registry.lock_for_assembly(&mut cx, x).unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut cx = active_context(&registry);
                registry.lock_for_assembly(&mut cx, y)?;
                locked_tx.send(()).unwrap();
                registry.lock_for_assembly(&mut cx, x)?;
                registry.commit_lock(&mut cx)?;
                registry.commit_unlock(&mut cx);
                Ok::<(), CoreError>(())
            })
        };
        locked_rx.recv().unwrap();
        while !registry
            .contexts
            .snapshot()
            .iter()
            .any(|entry| entry.awaiting.is_some())
        {
            thread::yield_now();
        }

        let err = registry.lock_for_assembly(&mut cx, y).unwrap_err();
        assert_eq!(err.collision_status(), Some(CollisionStatus::CrossLock));

        registry.emergency_release_context(&mut cx);
        registry.await_yielded(&mut cx);
        let y_lock = registry.resolve_actor(y).unwrap();
        assert!(y_lock.wait_until_free(Duration::ZERO));
        holder.join().unwrap().unwrap();

        // the yield is consumed by the wait
        assert!(cx.take_yielded().is_none());
        registry.begin_session(&mut cx);
        registry.begin_transaction(&mut cx).unwrap();
        registry.lock_for_assembly(&mut cx, x).unwrap();
        registry.lock_for_assembly(&mut cx, y).unwrap();
    }

    #[test]
    fn read_validation_takes_read_lock() {
        let registry = create_registry();
        let hook = LoggingFieldAccessHook;
        let mut setup = active_context(&registry);
        let actor = register(&registry, &mut setup, SynchronizationRole::Autonomous);
        registry.commit_unlock(&mut setup);
        drop(setup);

        let mut cx = active_context(&registry);
        let reader = cx.id();
        registry.validate_read(&mut cx, &hook, actor, "value").unwrap();
        assert!(registry.permission(reader, actor).read);
        assert_eq!(cx.read_only_locks().len(), 1);

        drop(cx);
        assert!(!registry.permission(reader, actor).read);
    }
}
