//! Units of work and the context handle they run with.

use super::directive::Directive;
use super::session::Session;
use super::short_name;
use super::transaction::{GenericTransaction, Transaction, TransactionKind, TransactionPort};
use crate::error::{CollisionStatus, CoreError, CoreResult};
use crate::lock::Permission;
use crate::types::{ActorId, ContextId, Phase, SynchronizationRole, TaskKind};
use std::fmt;

/// How a submitted task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The session committed.
    Committed,
    /// The task declined; nothing was applied.
    RolledBack,
}

impl TaskOutcome {
    /// Returns true if the session committed.
    #[must_use]
    pub fn is_committed(self) -> bool {
        self == TaskOutcome::Committed
    }
}

/// A unit of work run inside a session.
///
/// `execute` may run several times: each lock collision discards the
/// attempt and runs the task again from the start. Anything the body does
/// outside the task context must therefore be repeatable.
pub trait Task {
    /// Runs the body. Returning `Ok(false)` declines to commit.
    fn execute(&mut self, cx: &mut TaskContext<'_>) -> CoreResult<bool>;

    /// The phase this task runs in.
    fn kind(&self) -> TaskKind {
        TaskKind::Processing
    }

    /// Overrides the configured retry budget.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// A short name for diagnostics.
    fn name(&self) -> &str {
        short_name(std::any::type_name::<Self>())
    }
}

/// A task built from a closure.
pub struct FnTask<F> {
    name: String,
    kind: TaskKind,
    max_retries: Option<u32>,
    body: F,
}

/// Creates a processing task from a closure.
pub fn from_fn<F>(name: impl Into<String>, body: F) -> FnTask<F>
where
    F: FnMut(&mut TaskContext<'_>) -> CoreResult<bool>,
{
    FnTask {
        name: name.into(),
        kind: TaskKind::Processing,
        max_retries: None,
        body,
    }
}

impl<F> FnTask<F> {
    /// Makes this a post-processing task.
    #[must_use]
    pub fn post_processing(mut self) -> Self {
        self.kind = TaskKind::PostProcessing;
        self
    }

    /// Sets the retry budget for this task.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

impl<F> Task for FnTask<F>
where
    F: FnMut(&mut TaskContext<'_>) -> CoreResult<bool>,
{
    fn execute(&mut self, cx: &mut TaskContext<'_>) -> CoreResult<bool> {
        (self.body)(cx)
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// The handle a task body uses to reach its session.
///
/// Every operation that may block on an actor lock can fail with the
/// internal retry signal; propagate it with `?`.
pub struct TaskContext<'a> {
    pub(super) session: &'a mut Session,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(session: &'a mut Session) -> Self {
        Self { session }
    }

    /// Returns the session's phase.
    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    /// Returns the identity of the lock context driving this session.
    pub fn context_id(&self) -> ContextId {
        self.session.context().id()
    }

    // === Transactions ===

    /// Joins transaction type `T`, starting the session if it is idle.
    pub fn join<T: Transaction + Default>(&mut self) -> CoreResult<()> {
        self.join_kind(TransactionKind::of::<T>())
    }

    /// Joins a transaction by kind.
    pub fn join_kind(&mut self, kind: TransactionKind) -> CoreResult<()> {
        self.session.join(kind).map(|_| ())
    }

    /// Joins `T` and runs `f` on it with its port.
    pub fn with_transaction<T, R>(
        &mut self,
        f: impl FnOnce(&mut T, &mut TransactionPort) -> R,
    ) -> CoreResult<R>
    where
        T: Transaction + Default,
    {
        self.session.with_transaction(f)
    }

    /// Adds a directive to the session's [`GenericTransaction`].
    pub fn add_directive(&mut self, directive: impl Directive + 'static) -> CoreResult<()> {
        self.with_transaction(|transaction: &mut GenericTransaction, port| {
            transaction.add(Box::new(directive), port);
        })
    }

    /// Lists pending directives on `actor` across joined transactions.
    pub fn directives_on(&self, actor: ActorId) -> Vec<&dyn Directive> {
        self.session.directives_on(actor)
    }

    /// Queues a subtask; it runs after the current task body, in submission order.
    ///
    /// Subtasks are drained first-in first-out on purpose, so work queued
    /// earlier is never overtaken by work it queued later.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::InvalidPhase`](crate::CoreError::InvalidPhase)
    /// during commit, or when the task's kind does not match the phase.
    pub fn submit(&mut self, task: impl Task + 'static) -> CoreResult<()> {
        self.session.defer(Box::new(task))
    }

    /// Fails the current attempt with `status` and returns the retry signal.
    ///
    /// The failure sticks: even if the body drops the returned error, the
    /// session restarts the task once the body returns.
    pub fn fail_current_task(&mut self, status: CollisionStatus) -> CoreError {
        let (_, cx) = self.session.split();
        cx.fail(status)
    }

    // === Locks ===

    /// Acquires `actor`'s assembly lock, joining the generic transaction if none is active.
    pub fn lock_for_assembly(&mut self, actor: ActorId) -> CoreResult<()> {
        self.ensure_transaction()?;
        let (shared, cx) = self.session.split();
        shared.locks.lock_for_assembly(cx, actor)
    }

    /// Returns the permissions this session holds on `actor`.
    pub fn permission(&self, actor: ActorId) -> Permission {
        self.session
            .shared()
            .locks
            .permission(self.session.context().id(), actor)
    }

    /// Returns true if this session holds `actor`'s assembly lock.
    pub fn has_assembly_permission(&self, actor: ActorId) -> bool {
        self.permission(actor).assembly
    }

    /// Reports a read of `actor.field`, taking the commit-read lock if needed.
    pub fn read_field(&mut self, actor: ActorId, field: &str) -> CoreResult<()> {
        let (shared, cx) = self.session.split();
        let hook = shared.field_hook();
        shared.locks.validate_read(cx, &*hook, actor, field)
    }

    /// Reports a write of `actor.field`.
    pub fn write_field(&mut self, actor: ActorId, field: &str) -> CoreResult<()> {
        let (shared, cx) = self.session.split();
        let hook = shared.field_hook();
        shared.locks.validate_write(cx, &*hook, actor, field)
    }

    // === Instantiation ===

    /// Runs `body` inside an instantiation frame for `role`.
    ///
    /// The frame is closed even when `body` fails.
    pub fn instantiate<R>(
        &mut self,
        role: SynchronizationRole,
        description: &str,
        body: impl FnOnce(&mut TaskContext<'_>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        {
            let (shared, cx) = self.session.split();
            shared.locks.begin_instantiation(cx, role, description)?;
        }
        let result = body(&mut *self);
        let (shared, cx) = self.session.split();
        shared.locks.end_instantiation(cx);
        result
    }

    /// Runs `body` inside a frame on `actor`'s existing lock.
    pub fn instantiate_subordinate<R>(
        &mut self,
        actor: ActorId,
        body: impl FnOnce(&mut TaskContext<'_>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        {
            let (shared, cx) = self.session.split();
            shared.locks.begin_subordinate_instantiation(cx, actor)?;
        }
        let result = body(&mut *self);
        let (shared, cx) = self.session.split();
        shared.locks.end_instantiation(cx);
        result
    }

    /// Creates an actor bound to the innermost frame's lock.
    pub fn create_actor(&mut self, description: &str) -> CoreResult<ActorId> {
        self.ensure_transaction()?;
        let (shared, cx) = self.session.split();
        shared.locks.register_actor(cx, false, description)
    }

    /// Creates an actor with a fresh dependent lock on the innermost frame's lock.
    pub fn create_dependent_actor(&mut self, description: &str) -> CoreResult<ActorId> {
        self.ensure_transaction()?;
        let (shared, cx) = self.session.split();
        shared.locks.register_actor(cx, true, description)
    }

    /// Creates one actor in its own frame.
    pub fn register(&mut self, role: SynchronizationRole, description: &str) -> CoreResult<ActorId> {
        self.instantiate(role, description, |cx| cx.create_actor(description))
    }

    // === Layout ===

    /// Joins `T` and binds it to the layout root `root`.
    pub fn begin_layout<T: Transaction + Default>(&mut self, root: ActorId) -> CoreResult<()> {
        self.begin_layout_kind(TransactionKind::of::<T>(), root)
    }

    /// Joins `kind` and binds it to the layout root `root`.
    pub fn begin_layout_kind(&mut self, kind: TransactionKind, root: ActorId) -> CoreResult<()> {
        self.join_kind(kind)?;
        let (shared, cx) = self.session.split();
        shared.locks.begin_layout(cx, kind, root)
    }

    /// Creates an actor depending on the layout root bound to `T`.
    pub fn register_layout_actor<T: Transaction + Default>(
        &mut self,
        description: &str,
    ) -> CoreResult<ActorId> {
        let (shared, cx) = self.session.split();
        shared
            .locks
            .register_layout_actor(cx, TransactionKind::of::<T>(), description)
    }

    /// Moves `actor` under `new_owner`'s lock once this session commits.
    pub fn reassign_actor(&mut self, actor: ActorId, new_owner: ActorId) -> CoreResult<()> {
        let (shared, cx) = self.session.split();
        shared.locks.reassign_actor(cx, actor, new_owner)
    }

    /// Actor registration needs an active transaction; joins the generic one if there is none.
    fn ensure_transaction(&mut self) -> CoreResult<()> {
        if !self.session.context().is_transaction_active() {
            self.join::<GenericTransaction>()?;
        }
        Ok(())
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("phase", &self.phase())
            .field("context", &self.context_id())
            .finish()
    }
}
