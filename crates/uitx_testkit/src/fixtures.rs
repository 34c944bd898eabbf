//! Test fixtures and registry helpers.
//!
//! Provides counter actors whose state is only changed by committed
//! directives, plus collaborators that record what the engine asks of them.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uitx_core::action::{
    from_fn, ActorContributor, Directive, DirectiveNotification, Notification,
    PendingTransaction, PostProcessor, TaskContext,
};
use uitx_core::lock::{AccessKind, FieldAccess, FieldAccessHook, FieldAccessScope};
use uitx_core::{ActorId, Config, CoreError, CoreResult, SynchronizationRole, TransactionRegistry};

/// A configuration with short lock waits, for tests that expect collisions.
pub fn test_config() -> Config {
    Config::default()
        .lock_wait_timeout(Duration::from_millis(20))
        .wait_slice(Duration::from_millis(2))
}

/// A registry with the default configuration.
pub fn test_registry() -> TransactionRegistry {
    TransactionRegistry::new(Config::default())
}

/// Runs a test with a fresh registry.
///
/// # Example
///
/// ```rust
/// use uitx_testkit::with_registry;
///
/// with_registry(|registry| {
///     assert_eq!(registry.locks().actor_count(), 0);
/// });
/// ```
pub fn with_registry<F, R>(f: F) -> R
where
    F: FnOnce(&TransactionRegistry) -> R,
{
    let registry = test_registry();
    f(&registry)
}

// === Journal ===

/// An append-only, shareable list of events.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    /// Returns a copy of every entry, oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// A directive that appends its name to a journal when committed.
#[derive(Debug)]
pub struct RecordingDirective {
    actor: ActorId,
    name: String,
    journal: Journal,
}

impl RecordingDirective {
    /// Creates a directive on `actor` named `name`.
    pub fn new(actor: ActorId, name: impl Into<String>, journal: &Journal) -> Self {
        Self {
            actor,
            name: name.into(),
            journal: journal.clone(),
        }
    }
}

impl Directive for RecordingDirective {
    fn actor(&self) -> ActorId {
        self.actor
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn commit(self: Box<Self>, fields: &FieldAccessScope<'_>) -> CoreResult<()> {
        fields.write(self.actor, "journal");
        self.journal.record(self.name);
        Ok(())
    }
}

// === Counter actor ===

/// An actor holding one integer field.
///
/// The value is only changed by committed [`AddDirective`]s, so a test can
/// tell whether a session applied anything.
#[derive(Debug, Clone)]
pub struct Counter {
    actor: ActorId,
    value: Arc<AtomicI64>,
}

impl Counter {
    /// Registers a counter inside a running session.
    pub fn register(
        cx: &mut TaskContext<'_>,
        role: SynchronizationRole,
        description: &str,
    ) -> CoreResult<Self> {
        let actor = cx.register(role, description)?;
        Ok(Self::bind(actor))
    }

    /// Registers an autonomous counter in a session of its own.
    pub fn create(registry: &TransactionRegistry, description: &str) -> CoreResult<Self> {
        let mut created = None;
        registry.submit(&mut from_fn("create counter", |cx| {
            created = Some(Self::register(cx, SynchronizationRole::Autonomous, description)?);
            Ok(true)
        }))?;
        created.ok_or_else(|| CoreError::protocol_violation("counter registration did not run"))
    }

    /// Registers `count` autonomous counters in one session.
    pub fn create_many(registry: &TransactionRegistry, count: usize) -> CoreResult<Vec<Self>> {
        let mut created = Vec::new();
        registry.submit(&mut from_fn("create counters", |cx| {
            created.clear();
            for index in 0..count {
                let description = format!("counter {index}");
                created.push(Self::register(cx, SynchronizationRole::Autonomous, &description)?);
            }
            Ok(true)
        }))?;
        Ok(created)
    }

    fn bind(actor: ActorId) -> Self {
        Self {
            actor,
            value: Arc::new(AtomicI64::new(0)),
        }
    }

    /// The counter's actor.
    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// The committed value.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Proposes adding `delta` to the counter.
    pub fn add(&self, cx: &mut TaskContext<'_>, delta: i64) -> CoreResult<()> {
        cx.add_directive(AddDirective {
            actor: self.actor,
            value: Arc::clone(&self.value),
            delta,
        })
    }

    /// Reads the value under the actor's commit-read lock.
    pub fn read(&self, cx: &mut TaskContext<'_>) -> CoreResult<i64> {
        cx.read_field(self.actor, "value")?;
        Ok(self.value())
    }
}

/// Adds a delta to a [`Counter`] at commit.
#[derive(Debug)]
pub struct AddDirective {
    actor: ActorId,
    value: Arc<AtomicI64>,
    delta: i64,
}

impl Directive for AddDirective {
    fn actor(&self) -> ActorId {
        self.actor
    }

    fn name(&self) -> &str {
        "add"
    }

    fn commit(self: Box<Self>, fields: &FieldAccessScope<'_>) -> CoreResult<()> {
        fields.write(self.actor, "value");
        self.value.fetch_add(self.delta, Ordering::SeqCst);
        Ok(())
    }
}

// === Recording collaborators ===

/// Answers directives on its actor with `<name>+echo`, up to a nesting depth.
///
/// Echoes are [`RecordingDirective`]s writing to the commit journal. With
/// [`recording_proposals`](Self::recording_proposals), every echo is also
/// recorded at the moment it is contributed.
#[derive(Debug)]
pub struct EchoContributor {
    commits: Journal,
    proposals: Option<Journal>,
    depth: usize,
    contributed: AtomicUsize,
}

impl EchoContributor {
    /// Creates a contributor echoing up to `depth` generations deep.
    pub fn new(commits: &Journal, depth: usize) -> Self {
        Self {
            commits: commits.clone(),
            proposals: None,
            depth,
            contributed: AtomicUsize::new(0),
        }
    }

    /// Also records each echo's name when it is contributed.
    #[must_use]
    pub fn recording_proposals(mut self, proposals: &Journal) -> Self {
        self.proposals = Some(proposals.clone());
        self
    }

    /// Returns how many echoes were contributed, across attempts.
    pub fn contributed(&self) -> usize {
        self.contributed.load(Ordering::SeqCst)
    }
}

impl ActorContributor for EchoContributor {
    fn action_posted(&self, notification: &dyn Notification, pending: &mut PendingTransaction) {
        let Some(posted) = notification.downcast_ref::<DirectiveNotification>() else {
            return;
        };
        if posted.directive.matches("+echo").count() >= self.depth {
            return;
        }
        let name = format!("{}+echo", posted.directive);
        if let Some(proposals) = &self.proposals {
            proposals.record(name.clone());
        }
        self.contributed.fetch_add(1, Ordering::SeqCst);
        pending.contribute(RecordingDirective::new(posted.actor, name, &self.commits));
    }
}

/// Records every post-processor callback.
#[derive(Debug, Default)]
pub struct RecordingPostProcessor {
    journal: Journal,
}

impl RecordingPostProcessor {
    /// Creates a post-processor recording into `journal`.
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
        }
    }
}

impl PostProcessor for RecordingPostProcessor {
    fn session_starting(&self) {
        self.journal.record("starting");
    }

    fn session_committed(&self, _cx: &mut TaskContext<'_>) -> CoreResult<()> {
        self.journal.record("committed");
        Ok(())
    }

    fn post_processing_committed(&self) {
        self.journal.record("post-processing committed");
    }

    fn transaction_rolled_back(&self) {
        self.journal.record("rolled back");
    }
}

/// One access seen by a [`RecordingFieldHook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAccess {
    /// The actor owning the field.
    pub actor: ActorId,
    /// The field name.
    pub field: String,
    /// Read or write.
    pub kind: AccessKind,
    /// Whether the lock state allowed the access.
    pub permitted: bool,
}

/// A field-access hook that keeps every reported access.
#[derive(Debug, Default)]
pub struct RecordingFieldHook {
    accesses: Mutex<Vec<RecordedAccess>>,
}

impl RecordingFieldHook {
    /// Creates an empty hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every access, oldest first.
    pub fn accesses(&self) -> Vec<RecordedAccess> {
        self.accesses.lock().clone()
    }

    /// Returns the accesses the lock state did not allow.
    pub fn violations(&self) -> Vec<RecordedAccess> {
        self.accesses
            .lock()
            .iter()
            .filter(|access| !access.permitted)
            .cloned()
            .collect()
    }

    fn record(&self, access: &FieldAccess<'_>) {
        self.accesses.lock().push(RecordedAccess {
            actor: access.actor,
            field: access.field.to_owned(),
            kind: access.kind,
            permitted: access.is_permitted(),
        });
    }
}

impl FieldAccessHook for RecordingFieldHook {
    fn on_read(&self, access: &FieldAccess<'_>) {
        self.record(access);
    }

    fn on_write(&self, access: &FieldAccess<'_>) {
        self.record(access);
    }
}
