//! The per-submission session: phase machine, broadcast loop and retries.

use super::directive::Directive;
use super::notification::{Notification, NotificationKind};
use super::registry::Shared;
use super::task::{Task, TaskContext, TaskOutcome};
use super::transaction::{
    PendingBroadcast, PendingTransaction, Transaction, TransactionKind, TransactionPort,
};
use crate::error::{CoreError, CoreResult};
use crate::lock::{FieldAccessScope, LockTransactionContext};
use crate::types::{ActorId, Phase, TaskKind};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

struct Slot {
    kind: TransactionKind,
    transaction: Box<dyn Transaction>,
    port: TransactionPort,
}

struct Logged {
    source: TransactionKind,
    kind: NotificationKind,
    notification: Arc<dyn Notification>,
}

pub(crate) struct Session {
    shared: Arc<Shared>,
    context: LockTransactionContext,
    phase: Phase,
    slots: Vec<Slot>,
    /// Every notification broadcast this session, replayed to late interest.
    log: Vec<Logged>,
    subtasks: VecDeque<Box<dyn Task>>,
    budget: u32,
}

impl Session {
    pub(crate) fn new(shared: Arc<Shared>, context: LockTransactionContext) -> Self {
        let budget = shared.config.max_retries;
        Self {
            shared,
            context,
            phase: Phase::Idle,
            slots: Vec::new(),
            log: Vec::new(),
            subtasks: VecDeque::new(),
            budget,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn context(&self) -> &LockTransactionContext {
        &self.context
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn split(&mut self) -> (&Shared, &mut LockTransactionContext) {
        (&*self.shared, &mut self.context)
    }

    // === Retry loop ===

    /// Runs the outer task until it commits, declines, fails or exhausts its retries.
    pub(crate) fn run(&mut self, task: &mut dyn Task) -> CoreResult<TaskOutcome> {
        self.budget = task.max_retries().unwrap_or(self.shared.config.max_retries);
        let mut retries = 0;
        loop {
            match self.attempt(task) {
                Ok(outcome) => return Ok(outcome),
                Err(CoreError::Collision { status }) => {
                    self.abandon();
                    if retries >= self.budget {
                        self.shared.stats.record_exhausted();
                        warn!(task = task.name(), retries, %status, "retry budget exhausted");
                        return Err(CoreError::ConcurrentAccess { retries, status });
                    }
                    retries += 1;
                    self.shared.stats.record_retry();
                    debug!(task = task.name(), attempt = retries, %status, "retrying task");
                    self.shared.locks.await_yielded(&mut self.context);
                }
                Err(err) => {
                    self.fail();
                    return Err(err);
                }
            }
        }
    }

    fn attempt(&mut self, task: &mut dyn Task) -> CoreResult<TaskOutcome> {
        self.shared.locks.begin_session(&mut self.context);
        self.subtasks.clear();

        let proceed = self.execute(task)?;
        self.drain_subtasks()?;

        if self.phase != Phase::Assembly {
            // nothing was joined
            return Ok(if proceed {
                TaskOutcome::Committed
            } else {
                TaskOutcome::RolledBack
            });
        }
        if proceed {
            self.commit()?;
            Ok(TaskOutcome::Committed)
        } else {
            self.rollback();
            Ok(TaskOutcome::RolledBack)
        }
    }

    fn execute(&mut self, task: &mut dyn Task) -> CoreResult<bool> {
        let proceed = task.execute(&mut TaskContext::new(self))?;
        // a body that swallowed a collision still fails here
        self.context.check_interrupted()?;
        if proceed {
            self.broadcast_until_stable()?;
        }
        Ok(proceed)
    }

    fn drain_subtasks(&mut self) -> CoreResult<()> {
        while let Some(mut subtask) = self.subtasks.pop_front() {
            if !self.execute(&mut *subtask)? {
                debug!(task = subtask.name(), "subtask declined");
            }
        }
        Ok(())
    }

    pub(crate) fn defer(&mut self, task: Box<dyn Task>) -> CoreResult<()> {
        let expected = match self.phase {
            Phase::Commit => return Err(CoreError::invalid_phase("submit a task", self.phase)),
            Phase::PostProcessing => TaskKind::PostProcessing,
            Phase::Idle | Phase::Assembly => TaskKind::Processing,
        };
        if task.kind() != expected {
            let operation = match task.kind() {
                TaskKind::Processing => "submit a processing task",
                TaskKind::PostProcessing => "submit a post-processing task",
            };
            return Err(CoreError::invalid_phase(operation, self.phase));
        }
        self.subtasks.push_back(task);
        Ok(())
    }

    // === Joining ===

    /// Joins `kind`, starting the session if idle, and returns its slot.
    pub(crate) fn join(&mut self, kind: TransactionKind) -> CoreResult<usize> {
        match self.phase {
            Phase::Commit => return Err(CoreError::invalid_phase("join a transaction", self.phase)),
            Phase::Idle => self.begin(),
            Phase::Assembly | Phase::PostProcessing => {}
        }
        if let Some(index) = self.slots.iter().position(|slot| slot.kind == kind) {
            return Ok(index);
        }

        let mut transaction = kind.create();
        let mut port = TransactionPort::new(kind);
        transaction.joined(&mut port);
        self.shared.locks.begin_transaction(&mut self.context)?;

        for slot in &mut self.slots {
            slot.transaction.introduced(kind, &mut slot.port);
            transaction.introduced(slot.kind, &mut port);
        }
        self.slots.push(Slot {
            kind,
            transaction,
            port,
        });
        let index = self.slots.len() - 1;
        trace!(transaction = %kind, context = %self.context.id(), "transaction joined");

        for slot in 0..self.slots.len() {
            self.replay_interests(slot);
        }
        for listener in self.shared.listeners() {
            if let Some(follower) = listener.transaction_initiated(kind) {
                self.join(follower)?;
            }
        }
        Ok(index)
    }

    fn begin(&mut self) {
        for post_processor in self.shared.post_processors() {
            post_processor.session_starting();
        }
        self.phase = Phase::Assembly;
        trace!(context = %self.context.id(), "session started");
    }

    pub(crate) fn with_transaction<T, R>(
        &mut self,
        f: impl FnOnce(&mut T, &mut TransactionPort) -> R,
    ) -> CoreResult<R>
    where
        T: Transaction + Default,
    {
        let kind = TransactionKind::of::<T>();
        let index = self.join(kind)?;
        let slot = &mut self.slots[index];
        let transaction = (*slot.transaction)
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| {
                CoreError::protocol_violation(format!("joined transaction is not a {kind}"))
            })?;
        let result = f(transaction, &mut slot.port);
        self.replay_interests(index);
        Ok(result)
    }

    pub(crate) fn directives_on(&self, actor: ActorId) -> Vec<&dyn Directive> {
        self.slots
            .iter()
            .flat_map(|slot| slot.transaction.directives_on(actor))
            .collect()
    }

    // === Broadcast ===

    /// Broadcasts and iterates until no transaction has pending work.
    fn broadcast_until_stable(&mut self) -> CoreResult<()> {
        let limit = self.shared.config.max_broadcast_rounds;
        let mut rounds = 0usize;
        loop {
            let mut index = 0;
            while index < self.slots.len() {
                while self.has_more_iterations(index) {
                    self.broadcast(index)?;
                    self.iterate(index)?;
                    rounds += 1;
                    if rounds > limit {
                        return Err(runaway(limit));
                    }
                }
                self.broadcast(index)?;
                index += 1;
            }

            if self.is_settled() {
                return Ok(());
            }
            rounds += 1;
            if rounds > limit {
                return Err(runaway(limit));
            }
        }
    }

    fn is_settled(&mut self) -> bool {
        (0..self.slots.len())
            .all(|index| !self.slots[index].port.has_pending() && !self.has_more_iterations(index))
    }

    fn has_more_iterations(&mut self, index: usize) -> bool {
        self.slots[index]
            .transaction
            .as_iterative()
            .is_some_and(|iterative| iterative.has_more_iterations())
    }

    fn iterate(&mut self, index: usize) -> CoreResult<()> {
        let slot = &mut self.slots[index];
        if let Some(iterative) = slot.transaction.as_iterative() {
            iterative.iterate(&mut slot.port)?;
        }
        self.replay_interests(index);
        Ok(())
    }

    fn broadcast(&mut self, index: usize) -> CoreResult<()> {
        for PendingBroadcast {
            actor,
            notification,
        } in self.slots[index].port.take_pending()
        {
            self.context.check_interrupted()?;
            self.shared.stats.record_broadcast();
            match actor {
                Some(actor) => {
                    self.shared.locks.lock_for_assembly(&mut self.context, actor)?;
                    self.deliver(index, Some(actor), notification)?;
                }
                None => {
                    let target = notification.directed_at();
                    self.deliver(index, target, notification)?;
                }
            }
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        index: usize,
        target: Option<ActorId>,
        notification: Arc<dyn Notification>,
    ) -> CoreResult<()> {
        let source = self.slots[index].kind;
        let kind = NotificationKind::of_val(&*notification);
        self.log.push(Logged {
            source,
            kind,
            notification: Arc::clone(&notification),
        });
        self.fan_out(index, source, kind, &notification);
        if let Some(actor) = target {
            self.collect_contributions(index, actor, &notification)?;
        }
        Ok(())
    }

    /// Delivers to every other transaction that asked for it, once each.
    fn fan_out(
        &mut self,
        index: usize,
        source: TransactionKind,
        kind: NotificationKind,
        notification: &Arc<dyn Notification>,
    ) {
        for target in 0..self.slots.len() {
            if target == index {
                continue;
            }
            let slot = &mut self.slots[target];
            if slot.port.wants(source, kind) && slot.port.mark_delivered(notification) {
                slot.transaction
                    .notification_from_another_transaction(source, notification, &mut slot.port);
                self.replay_interests(target);
            }
        }
    }

    /// Delivers logged notifications matching interests registered since the last call.
    fn replay_interests(&mut self, index: usize) {
        let Self { slots, log, .. } = self;
        let slot = &mut slots[index];
        loop {
            let interests = slot.port.take_new_interests();
            if interests.is_empty() {
                return;
            }
            for interest in interests {
                for entry in log.iter() {
                    if entry.source != slot.kind
                        && interest.matches(entry.source, entry.kind)
                        && slot.port.mark_delivered(&entry.notification)
                    {
                        slot.transaction.notification_from_another_transaction(
                            entry.source,
                            &entry.notification,
                            &mut slot.port,
                        );
                    }
                }
            }
        }
    }

    /// Asks `actor`'s contributors for a response and folds it into the source transaction.
    fn collect_contributions(
        &mut self,
        index: usize,
        actor: ActorId,
        notification: &Arc<dyn Notification>,
    ) -> CoreResult<()> {
        let contributors = self.shared.contributors_of(actor);
        if contributors.is_empty() {
            return Ok(());
        }

        let mut pending = PendingTransaction::new();
        for contributor in &contributors {
            contributor.action_posted(&**notification, &mut pending);
        }
        let (directives, notifications) = pending.into_parts();
        for directive in &directives {
            self.shared
                .locks
                .lock_for_assembly(&mut self.context, directive.actor())?;
        }

        let slot = &mut self.slots[index];
        slot.transaction.post_direct_response(directives, &mut slot.port)?;
        slot.transaction
            .post_direct_notifications(notifications, &mut slot.port)?;
        self.replay_interests(index);
        Ok(())
    }

    // === Commit ===

    fn commit(&mut self) -> CoreResult<()> {
        self.phase = Phase::Commit;
        self.commit_transactions()?;
        self.post_process()
    }

    /// Takes commit-write locks, applies every joined transaction and releases.
    fn commit_transactions(&mut self) -> CoreResult<()> {
        let shared = Arc::clone(&self.shared);
        shared.locks.commit_lock(&mut self.context)?;

        let hook = shared.field_hook();
        let scope = FieldAccessScope::new(
            &shared.locks,
            self.context.id(),
            &self.context.instantiated,
            &*hook,
        );
        let mut committed = 0;
        for slot in &mut self.slots {
            if slot.transaction.is_empty() {
                continue;
            }
            committed += slot.transaction.commit(&scope)?;
        }
        shared.stats.record_directives_committed(committed);

        shared.locks.commit_unlock(&mut self.context);
        self.slots.clear();
        self.log.clear();
        Ok(())
    }

    /// Runs post-processors; a collision here retries only this stage.
    fn post_process(&mut self) -> CoreResult<()> {
        let mut retries = 0;
        loop {
            match self.post_process_attempt() {
                Ok(()) => break,
                Err(CoreError::Collision { status }) => {
                    self.shared.locks.emergency_release_context(&mut self.context);
                    self.slots.clear();
                    self.log.clear();
                    self.subtasks.clear();
                    if retries >= self.budget {
                        self.shared.stats.record_exhausted();
                        warn!(retries, %status, "post-processing retry budget exhausted");
                        return Err(CoreError::ConcurrentAccess { retries, status });
                    }
                    retries += 1;
                    self.shared.stats.record_retry();
                    debug!(attempt = retries, %status, "retrying post-processing");
                    self.shared.locks.await_yielded(&mut self.context);
                }
                Err(err) => return Err(err),
            }
        }

        for post_processor in self.shared.post_processors() {
            post_processor.post_processing_committed();
        }
        self.terminate();
        self.shared.stats.record_commit();
        debug!(context = %self.context.id(), "session committed");
        Ok(())
    }

    fn post_process_attempt(&mut self) -> CoreResult<()> {
        self.phase = Phase::PostProcessing;
        self.shared.locks.begin_session(&mut self.context);
        for post_processor in self.shared.post_processors() {
            post_processor.session_committed(&mut TaskContext::new(self))?;
        }
        self.context.check_interrupted()?;
        self.drain_subtasks()?;
        if !self.slots.is_empty() {
            self.commit_transactions()?;
        }
        Ok(())
    }

    // === Unwinding ===

    /// Discards the session after the task declined.
    fn rollback(&mut self) {
        for slot in &mut self.slots {
            slot.transaction.rolled_back();
        }
        self.shared.locks.emergency_release_context(&mut self.context);
        self.terminate();
        for post_processor in self.shared.post_processors() {
            post_processor.transaction_rolled_back();
        }
        self.shared.stats.record_rollback();
        debug!(context = %self.context.id(), "session rolled back");
    }

    /// Discards the attempt after a collision.
    fn abandon(&mut self) {
        self.shared.locks.emergency_release_context(&mut self.context);
        self.terminate();
    }

    /// Unwinds after a fatal error.
    fn fail(&mut self) {
        if self.phase == Phase::Assembly {
            self.rollback();
        } else {
            self.abandon();
        }
    }

    fn terminate(&mut self) {
        self.slots.clear();
        self.log.clear();
        self.subtasks.clear();
        self.context.instantiation.clear();
        self.context.clear_session_state();
        self.phase = Phase::Idle;
    }
}

fn runaway(limit: usize) -> CoreError {
    CoreError::protocol_violation(format!(
        "broadcast did not settle within {limit} rounds"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{
        from_fn, ActorContributor, DirectiveNotification, FnDirective, GenericTransaction,
        Iterative, PostProcessor, ReadOnlyTransaction, TransactionListener, TransactionRegistry,
    };
    use crate::config::Config;
    use crate::error::CollisionStatus;
    use crate::types::SynchronizationRole;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> TransactionRegistry {
        TransactionRegistry::new(Config::default())
    }

    type Journal = Arc<Mutex<Vec<String>>>;

    fn recording(
        actor: ActorId,
        name: &str,
        journal: &Journal,
    ) -> FnDirective<impl FnOnce(&FieldAccessScope<'_>) -> CoreResult<()>> {
        let journal = Arc::clone(journal);
        let entry = name.to_owned();
        FnDirective::new(actor, name, move |fields: &FieldAccessScope<'_>| {
            fields.write(actor, "value");
            journal.lock().push(entry);
            Ok(())
        })
    }

    /// Answers every directive on its actor with one follow-up, `depth` times.
    struct Echo {
        journal: Journal,
        remaining: AtomicUsize,
    }

    impl ActorContributor for Echo {
        fn action_posted(&self, notification: &dyn Notification, pending: &mut PendingTransaction) {
            let Some(posted) = notification.downcast_ref::<DirectiveNotification>() else {
                return;
            };
            let remaining = self.remaining.load(Ordering::SeqCst);
            if remaining == 0 {
                return;
            }
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            let name = format!("{}+echo", posted.directive);
            pending.contribute(recording(posted.actor, &name, &self.journal));
        }
    }

    // === Commit and rollback ===

    #[test]
    fn directive_commits_exactly_once() {
        let registry = registry();
        let journal: Journal = Arc::default();

        let outcome = registry
            .submit(&mut from_fn("commit", |cx| {
                let actor = cx.register(SynchronizationRole::Autonomous, "x")?;
                cx.add_directive(recording(actor, "d1", &journal))?;
                Ok(true)
            }))
            .unwrap();

        assert_eq!(outcome, TaskOutcome::Committed);
        assert_eq!(*journal.lock(), vec!["d1"]);
        assert_eq!(registry.stats().sessions_committed(), 1);
        assert_eq!(registry.stats().directives_committed(), 1);
        assert_eq!(registry.locks().active_contexts(), 0);
    }

    #[test]
    fn declined_task_applies_nothing() {
        struct Recorder(Mutex<Vec<&'static str>>);

        impl PostProcessor for Recorder {
            fn session_starting(&self) {
                self.0.lock().push("starting");
            }

            fn transaction_rolled_back(&self) {
                self.0.lock().push("rolled back");
            }
        }

        let registry = registry();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        registry.add_post_processor(recorder.clone());
        let journal: Journal = Arc::default();

        let outcome = registry
            .submit(&mut from_fn("decline", |cx| {
                let actor = cx.register(SynchronizationRole::Autonomous, "x")?;
                cx.add_directive(recording(actor, "never", &journal))?;
                Ok(false)
            }))
            .unwrap();

        assert_eq!(outcome, TaskOutcome::RolledBack);
        assert!(journal.lock().is_empty());
        assert_eq!(*recorder.0.lock(), vec!["starting", "rolled back"]);
        assert_eq!(registry.stats().sessions_rolled_back(), 1);
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let registry = registry();
        let mut runs = 0;
        let result = registry.submit(&mut from_fn("broken", |cx| {
            runs += 1;
            cx.join::<GenericTransaction>()?;
            Err(CoreError::task("broken body"))
        }));

        assert!(matches!(result, Err(CoreError::Task { .. })));
        assert_eq!(runs, 1);
        assert_eq!(registry.stats().retries(), 0);
    }

    #[test]
    fn swallowed_collision_still_retries() {
        let registry = TransactionRegistry::new(Config::default().max_retries(2));
        let mut runs = 0;
        let result = registry.submit(&mut from_fn("swallow", |cx| {
            runs += 1;
            let _ignored = cx.fail_current_task(CollisionStatus::Timeout);
            Ok(true)
        }));

        match result {
            Err(CoreError::ConcurrentAccess { retries, status }) => {
                assert_eq!(retries, 2);
                assert_eq!(status, CollisionStatus::Timeout);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(runs, 3);
        assert_eq!(registry.stats().exhausted(), 1);
    }

    // === Collaboration ===

    #[test]
    fn contributions_commit_in_contribution_order() {
        let registry = registry();
        let journal: Journal = Arc::default();
        let mut actor = None;

        registry
            .submit(&mut from_fn("setup", |cx| {
                actor = Some(cx.register(SynchronizationRole::Autonomous, "x")?);
                Ok(true)
            }))
            .unwrap();
        let actor = actor.unwrap();
        registry.add_contributor(
            actor,
            Arc::new(Echo {
                journal: Arc::clone(&journal),
                remaining: AtomicUsize::new(2),
            }),
        );

        registry
            .submit(&mut from_fn("collaborate", |cx| {
                cx.add_directive(recording(actor, "a", &journal))?;
                cx.add_directive(recording(actor, "b", &journal))?;
                Ok(true)
            }))
            .unwrap();

        assert_eq!(*journal.lock(), vec!["a", "b", "a+echo", "b+echo"]);
    }

    #[test]
    fn directives_on_spans_transactions() {
        let registry = registry();
        registry
            .submit(&mut from_fn("query", |cx| {
                let actor = cx.register(SynchronizationRole::Autonomous, "x")?;
                cx.add_directive(FnDirective::new(actor, "first", |_| Ok(())))?;
                cx.add_directive(FnDirective::new(actor, "second", |_| Ok(())))?;
                let names: Vec<String> = cx
                    .directives_on(actor)
                    .iter()
                    .map(|directive| directive.name().to_owned())
                    .collect();
                assert_eq!(names, vec!["second", "first"]);
                Ok(true)
            }))
            .unwrap();
    }

    #[derive(Debug)]
    struct Tick;

    impl Notification for Tick {}

    /// Records the notifications delivered from other transactions.
    #[derive(Default)]
    struct Observer {
        seen: Vec<String>,
    }

    impl Transaction for Observer {
        fn joined(&mut self, port: &mut TransactionPort) {
            port.request_notifications_by_type::<Tick>();
        }

        fn post_direct_response(
            &mut self,
            _directives: Vec<Box<dyn Directive>>,
            _port: &mut TransactionPort,
        ) -> CoreResult<()> {
            Ok(())
        }

        fn notification_from_another_transaction(
            &mut self,
            source: TransactionKind,
            notification: &Arc<dyn Notification>,
            _port: &mut TransactionPort,
        ) {
            let kind = NotificationKind::of_val(&**notification);
            self.seen.push(format!("{source}:{kind}"));
        }

        fn directives_on(&self, _actor: ActorId) -> Vec<&dyn Directive> {
            Vec::new()
        }

        fn commit(&mut self, _fields: &FieldAccessScope<'_>) -> CoreResult<usize> {
            Ok(0)
        }

        fn is_empty(&self) -> bool {
            true
        }
    }

    #[test]
    fn interest_receives_notification_once() {
        let registry = registry();
        registry
            .submit(&mut from_fn("fan out", |cx| {
                cx.join::<Observer>()?;
                let tick: Arc<dyn Notification> = Arc::new(Tick);
                cx.with_transaction(|_: &mut GenericTransaction, port| {
                    port.post_notification(Arc::clone(&tick));
                    port.post_notification(Arc::clone(&tick));
                    port.post_notification(Arc::new(Tick));
                })?;
                cx.session.broadcast_until_stable()?;
                let seen = cx.with_transaction(|observer: &mut Observer, _| observer.seen.clone())?;
                assert_eq!(seen, vec!["GenericTransaction:Tick"; 2]);
                Ok(true)
            }))
            .unwrap();
    }

    #[test]
    fn late_interest_replays_logged_notifications() {
        let registry = registry();
        registry
            .submit(&mut from_fn("replay", |cx| {
                cx.with_transaction(|_: &mut GenericTransaction, port| {
                    port.post_notification(Arc::new(Tick));
                })?;
                cx.session.broadcast_until_stable()?;

                cx.join::<Observer>()?;
                let seen = cx.with_transaction(|observer: &mut Observer, _| observer.seen.clone())?;
                assert_eq!(seen, vec!["GenericTransaction:Tick"]);
                Ok(true)
            }))
            .unwrap();
    }

    #[test]
    fn listener_joins_follower_transaction() {
        struct Follow;

        impl TransactionListener for Follow {
            fn transaction_initiated(&self, kind: TransactionKind) -> Option<TransactionKind> {
                (kind == TransactionKind::of::<GenericTransaction>())
                    .then(TransactionKind::of::<ReadOnlyTransaction>)
            }
        }

        let registry = registry();
        registry.add_listener(Arc::new(Follow));
        registry
            .submit(&mut from_fn("listen", |cx| {
                cx.join::<GenericTransaction>()?;
                let kinds: Vec<TransactionKind> =
                    cx.session.slots.iter().map(|slot| slot.kind).collect();
                assert_eq!(
                    kinds,
                    vec![
                        TransactionKind::of::<GenericTransaction>(),
                        TransactionKind::of::<ReadOnlyTransaction>()
                    ]
                );
                Ok(true)
            }))
            .unwrap();
    }

    // === Iteration ===

    /// Produces one directive on its first iteration and nothing afterwards.
    #[derive(Default)]
    struct Expanding {
        target: Option<ActorId>,
        iterations: usize,
        inner: GenericTransaction,
    }

    impl Iterative for Expanding {
        fn has_more_iterations(&self) -> bool {
            self.target.is_some() && self.iterations == 0
        }

        fn iterate(&mut self, port: &mut TransactionPort) -> CoreResult<()> {
            self.iterations += 1;
            if let Some(actor) = self.target {
                self.inner
                    .add(Box::new(FnDirective::new(actor, "expanded", |_| Ok(()))), port);
            }
            Ok(())
        }
    }

    impl Transaction for Expanding {
        fn post_direct_response(
            &mut self,
            directives: Vec<Box<dyn Directive>>,
            port: &mut TransactionPort,
        ) -> CoreResult<()> {
            self.inner.post_direct_response(directives, port)
        }

        fn directives_on(&self, actor: ActorId) -> Vec<&dyn Directive> {
            self.inner.directives_on(actor)
        }

        fn commit(&mut self, fields: &FieldAccessScope<'_>) -> CoreResult<usize> {
            self.inner.commit(fields)
        }

        fn is_empty(&self) -> bool {
            self.inner.is_empty()
        }

        fn as_iterative(&mut self) -> Option<&mut dyn Iterative> {
            Some(self)
        }
    }

    #[test]
    fn iterative_transaction_iterates_once() {
        let registry = registry();
        let mut iterations = 0;
        registry
            .submit(&mut from_fn("iterate", |cx| {
                let actor = cx.register(SynchronizationRole::Autonomous, "x")?;
                cx.with_transaction(|expanding: &mut Expanding, _| expanding.target = Some(actor))?;
                cx.session.broadcast_until_stable()?;
                iterations = cx.with_transaction(|expanding: &mut Expanding, _| expanding.iterations)?;
                Ok(true)
            }))
            .unwrap();

        assert_eq!(iterations, 1);
        assert_eq!(registry.stats().directives_committed(), 1);
    }

    #[test]
    fn runaway_broadcast_is_fatal() {
        struct Forever;

        impl ActorContributor for Forever {
            fn action_posted(&self, notification: &dyn Notification, pending: &mut PendingTransaction) {
                if let Some(posted) = notification.downcast_ref::<DirectiveNotification>() {
                    pending.contribute(FnDirective::new(posted.actor, "again", |_| Ok(())));
                }
            }
        }

        let registry = TransactionRegistry::new(Config::default().max_broadcast_rounds(50));
        let result = registry.submit(&mut from_fn("runaway", |cx| {
            let actor = cx.register(SynchronizationRole::Autonomous, "x")?;
            registry.add_contributor(actor, Arc::new(Forever));
            cx.add_directive(FnDirective::new(actor, "start", |_| Ok(())))?;
            Ok(true)
        }));

        assert!(matches!(result, Err(CoreError::ProtocolViolation { .. })));
        assert_eq!(registry.stats().sessions_rolled_back(), 1);
    }

    // === Subtasks and phases ===

    #[test]
    fn subtasks_run_in_submission_order() {
        let registry = registry();
        let order: Journal = Arc::default();

        registry
            .submit(&mut from_fn("outer", |cx| {
                for name in ["first", "second", "third"] {
                    let order = Arc::clone(&order);
                    cx.submit(from_fn(name, move |_| {
                        order.lock().push(name.to_owned());
                        Ok(true)
                    }))?;
                }
                order.lock().push("outer".to_owned());
                Ok(true)
            }))
            .unwrap();

        assert_eq!(*order.lock(), vec!["outer", "first", "second", "third"]);
    }

    #[test]
    fn post_processing_task_rejected_during_assembly() {
        let registry = registry();
        registry
            .submit(&mut from_fn("outer", |cx| {
                cx.join::<GenericTransaction>()?;
                let result = cx.submit(from_fn("late", |_| Ok(true)).post_processing());
                assert!(matches!(result, Err(CoreError::InvalidPhase { .. })));
                Ok(true)
            }))
            .unwrap();
    }

    #[test]
    fn post_processor_work_commits_after_main_commit() {
        struct Followup {
            actor: ActorId,
            journal: Journal,
        }

        impl PostProcessor for Followup {
            fn session_committed(&self, cx: &mut TaskContext<'_>) -> CoreResult<()> {
                let actor = self.actor;
                let journal = Arc::clone(&self.journal);
                cx.submit(
                    from_fn("repaint", move |cx| {
                        cx.add_directive(recording(actor, "post", &journal))?;
                        Ok(true)
                    })
                    .post_processing(),
                )
            }

            fn post_processing_committed(&self) {
                self.journal.lock().push("done".to_owned());
            }
        }

        let registry = registry();
        let journal: Journal = Arc::default();
        let mut actor = None;
        registry
            .submit(&mut from_fn("setup", |cx| {
                actor = Some(cx.register(SynchronizationRole::Autonomous, "x")?);
                Ok(true)
            }))
            .unwrap();
        let actor = actor.unwrap();

        registry.add_post_processor(Arc::new(Followup {
            actor,
            journal: Arc::clone(&journal),
        }));
        registry
            .submit(&mut from_fn("main", |cx| {
                cx.add_directive(recording(actor, "main", &journal))?;
                Ok(true)
            }))
            .unwrap();

        assert_eq!(*journal.lock(), vec!["main", "post", "done"]);
    }

    #[test]
    fn nested_outer_submission_is_rejected() {
        let registry = registry();
        let inner = registry.clone();
        registry
            .submit(&mut from_fn("outer", |_| {
                let result = inner.submit(&mut from_fn("inner", |_| Ok(true)));
                assert!(matches!(result, Err(CoreError::NestedSubmission)));
                Ok(true)
            }))
            .unwrap();
    }

    #[test]
    fn read_only_transaction_takes_and_releases_read_locks() {
        let registry = registry();
        let mut actor = None;
        registry
            .submit(&mut from_fn("setup", |cx| {
                actor = Some(cx.register(SynchronizationRole::Autonomous, "x")?);
                Ok(true)
            }))
            .unwrap();
        let actor = actor.unwrap();

        let mut reader = None;
        registry
            .submit(&mut from_fn("read", |cx| {
                cx.join::<ReadOnlyTransaction>()?;
                cx.read_field(actor, "value")?;
                assert!(cx.permission(actor).read);
                reader = Some(cx.context_id());
                Ok(true)
            }))
            .unwrap();

        let lock = registry.locks().resolve_actor(actor).unwrap();
        assert!(!lock.has_read_permission(reader.unwrap()));
        assert_eq!(registry.locks().active_contexts(), 0);
    }
}
