//! The process-wide facade: task submission and collaborator registries.

use super::notification::Notification;
use super::session::Session;
use super::task::{Task, TaskContext, TaskOutcome};
use super::transaction::{PendingTransaction, TransactionKind};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::lock::{FieldAccessHook, LockRegistry, LoggingFieldAccessHook};
use crate::stats::EngineStats;
use crate::types::{ActorId, Phase, TaskKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// Receives every directive and directed notification broadcast for one actor.
pub trait ActorContributor: Send + Sync {
    /// Called during assembly; may contribute directives and notifications.
    fn action_posted(&self, notification: &dyn Notification, pending: &mut PendingTransaction);
}

/// Observes transaction types joining sessions.
pub trait TransactionListener: Send + Sync {
    /// Called when `kind` is first joined in a session.
    ///
    /// Returning a kind joins that transaction type to the session as well.
    fn transaction_initiated(&self, kind: TransactionKind) -> Option<TransactionKind>;
}

/// Runs at the edges of every session.
pub trait PostProcessor: Send + Sync {
    /// Called when a session begins assembly.
    fn session_starting(&self) {}

    /// Called after the main commit released its locks.
    ///
    /// May submit post-processing tasks through `cx`; they run and commit
    /// before [`post_processing_committed`](PostProcessor::post_processing_committed).
    fn session_committed(&self, cx: &mut TaskContext<'_>) -> CoreResult<()> {
        let _ = cx;
        Ok(())
    }

    /// Called once post-processing work committed.
    fn post_processing_committed(&self) {}

    /// Called when a session rolls back.
    fn transaction_rolled_back(&self) {}
}

fn same_instance<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) locks: LockRegistry,
    pub(crate) stats: Arc<EngineStats>,
    contributors: RwLock<HashMap<ActorId, Vec<Arc<dyn ActorContributor>>>>,
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
    post_processors: RwLock<Vec<Arc<dyn PostProcessor>>>,
    field_hook: RwLock<Arc<dyn FieldAccessHook>>,
}

impl Shared {
    pub(crate) fn contributors_of(&self, actor: ActorId) -> Vec<Arc<dyn ActorContributor>> {
        self.contributors
            .read()
            .get(&actor)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn TransactionListener>> {
        self.listeners.read().clone()
    }

    pub(crate) fn post_processors(&self) -> Vec<Arc<dyn PostProcessor>> {
        self.post_processors.read().clone()
    }

    pub(crate) fn field_hook(&self) -> Arc<dyn FieldAccessHook> {
        Arc::clone(&self.field_hook.read())
    }
}

/// Entry point of the engine.
///
/// Cheap to clone; clones share every registry. Construct one per process
/// (or per test) and hand clones to every thread that submits tasks.
///
/// # Example
///
/// ```rust
/// use uitx_core::{action, Config, SynchronizationRole, TransactionRegistry};
/// use uitx_core::action::FnDirective;
///
/// let registry = TransactionRegistry::new(Config::default());
/// let outcome = registry
///     .submit(&mut action::from_fn("create", |cx| {
///         let actor = cx.register(SynchronizationRole::Autonomous, "label")?;
///         cx.add_directive(FnDirective::new(actor, "set text", |_| Ok(())))?;
///         Ok(true)
///     }))
///     .unwrap();
/// assert!(outcome.is_committed());
/// ```
#[derive(Clone)]
pub struct TransactionRegistry {
    inner: Arc<Shared>,
}

impl TransactionRegistry {
    /// Creates a registry with the given configuration.
    pub fn new(config: Config) -> Self {
        let stats = Arc::new(EngineStats::new());
        Self {
            inner: Arc::new(Shared {
                locks: LockRegistry::new(&config, Arc::clone(&stats)),
                config,
                stats,
                contributors: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                post_processors: RwLock::new(Vec::new()),
                field_hook: RwLock::new(Arc::new(LoggingFieldAccessHook)),
            }),
        }
    }

    /// Runs `task` on the calling thread until it commits or rolls back.
    ///
    /// Lock collisions restart the task from scratch; once the retry budget
    /// is spent the call fails with [`CoreError::ConcurrentAccess`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NestedSubmission`] if the calling thread already
    /// drives a session, and any fatal error raised while running the task.
    pub fn submit(&self, task: &mut dyn Task) -> CoreResult<TaskOutcome> {
        if task.kind() != TaskKind::Processing {
            return Err(CoreError::invalid_phase(
                "submit a post-processing task",
                Phase::Idle,
            ));
        }
        let context = self.inner.locks.attach_context()?;
        self.inner.stats.record_task_submitted();
        trace!(task = task.name(), context = %context.id(), "task submitted");

        let mut session = Session::new(Arc::clone(&self.inner), context);
        session.run(task)
    }

    // === Collaborators ===

    /// Registers a contributor for `actor`. Registering the same instance twice has no effect.
    pub fn add_contributor(&self, actor: ActorId, contributor: Arc<dyn ActorContributor>) {
        let mut contributors = self.inner.contributors.write();
        let list = contributors.entry(actor).or_default();
        if list.iter().any(|existing| same_instance(existing, &contributor)) {
            return;
        }
        list.push(contributor);
    }

    /// Removes one contributor of `actor`.
    pub fn remove_contributor(&self, actor: ActorId, contributor: &Arc<dyn ActorContributor>) -> bool {
        let mut contributors = self.inner.contributors.write();
        let Some(list) = contributors.get_mut(&actor) else {
            return false;
        };
        let before = list.len();
        list.retain(|existing| !same_instance(existing, contributor));
        let removed = list.len() != before;
        if list.is_empty() {
            contributors.remove(&actor);
        }
        removed
    }

    /// Removes every contributor of `actor`.
    pub fn remove_contributors(&self, actor: ActorId) {
        self.inner.contributors.write().remove(&actor);
    }

    /// Returns the number of contributors registered for `actor`.
    #[must_use]
    pub fn contributor_count(&self, actor: ActorId) -> usize {
        self.inner
            .contributors
            .read()
            .get(&actor)
            .map_or(0, Vec::len)
    }

    /// Registers a transaction listener.
    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        let mut listeners = self.inner.listeners.write();
        if listeners.iter().any(|existing| same_instance(existing, &listener)) {
            warn!("transaction listener registered twice");
            return;
        }
        listeners.push(listener);
    }

    /// Removes a transaction listener.
    pub fn remove_listener(&self, listener: &Arc<dyn TransactionListener>) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|existing| !same_instance(existing, listener));
        listeners.len() != before
    }

    /// Registers a post-processor.
    pub fn add_post_processor(&self, post_processor: Arc<dyn PostProcessor>) {
        let mut post_processors = self.inner.post_processors.write();
        if post_processors
            .iter()
            .any(|existing| same_instance(existing, &post_processor))
        {
            warn!("post-processor registered twice");
            return;
        }
        post_processors.push(post_processor);
    }

    /// Removes a post-processor.
    pub fn remove_post_processor(&self, post_processor: &Arc<dyn PostProcessor>) -> bool {
        let mut post_processors = self.inner.post_processors.write();
        let before = post_processors.len();
        post_processors.retain(|existing| !same_instance(existing, post_processor));
        post_processors.len() != before
    }

    /// Replaces the field-access hook.
    pub fn set_field_access_hook(&self, hook: Arc<dyn FieldAccessHook>) {
        *self.inner.field_hook.write() = hook;
    }

    // === Accessors ===

    /// Returns the engine counters.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.inner.stats
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the actor to lock registry.
    #[must_use]
    pub fn locks(&self) -> &LockRegistry {
        &self.inner.locks
    }
}

impl fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("config", &self.inner.config)
            .field("locks", &self.inner.locks)
            .finish_non_exhaustive()
    }
}
