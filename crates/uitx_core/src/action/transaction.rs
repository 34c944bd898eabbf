//! Transactions and the port through which they talk to their session.

use super::directive::Directive;
use super::notification::{Notification, NotificationKind};
use super::{short_name, AsAny};
use crate::error::{CoreError, CoreResult};
use crate::lock::FieldAccessScope;
use crate::types::ActorId;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Type identity of a transaction, with a constructor for joining it.
#[derive(Clone, Copy)]
pub struct TransactionKind {
    id: TypeId,
    name: &'static str,
    create: fn() -> Box<dyn Transaction>,
}

fn create_default<T: Transaction + Default>() -> Box<dyn Transaction> {
    Box::new(T::default())
}

impl TransactionKind {
    /// Returns the kind of `T`.
    pub fn of<T: Transaction + Default>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            create: create_default::<T>,
        }
    }

    /// Returns the short type name.
    pub fn name(&self) -> &'static str {
        short_name(self.name)
    }

    pub(crate) fn create(&self) -> Box<dyn Transaction> {
        (self.create)()
    }
}

impl PartialEq for TransactionKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TransactionKind {}

impl Hash for TransactionKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionKind({})", self.name())
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One logical concern's share of a session: an ordered list of directives.
///
/// A transaction never calls the session directly. Everything it wants
/// broadcast goes through the [`TransactionPort`] handed to each callback.
pub trait Transaction: AsAny {
    /// Called once when the transaction joins a session.
    fn joined(&mut self, port: &mut TransactionPort) {
        let _ = port;
    }

    /// Called when another transaction type shares the session with this one.
    fn introduced(&mut self, other: TransactionKind, port: &mut TransactionPort) {
        let _ = (other, port);
    }

    /// Receives directives contributed in response to this transaction's broadcasts.
    ///
    /// Their actors are already locked for assembly.
    fn post_direct_response(
        &mut self,
        directives: Vec<Box<dyn Directive>>,
        port: &mut TransactionPort,
    ) -> CoreResult<()>;

    /// Receives notifications contributed in response to this transaction's broadcasts.
    fn post_direct_notifications(
        &mut self,
        notifications: Vec<Arc<dyn Notification>>,
        port: &mut TransactionPort,
    ) -> CoreResult<()> {
        for notification in notifications {
            port.post_notification(notification);
        }
        Ok(())
    }

    /// Receives a notification from another transaction this one registered interest in.
    fn notification_from_another_transaction(
        &mut self,
        source: TransactionKind,
        notification: &Arc<dyn Notification>,
        port: &mut TransactionPort,
    ) {
        let _ = (source, notification, port);
    }

    /// Returns the pending directives on `actor`, most recent first.
    fn directives_on(&self, actor: ActorId) -> Vec<&dyn Directive>;

    /// Applies every directive in insertion order and returns how many were applied.
    fn commit(&mut self, fields: &FieldAccessScope<'_>) -> CoreResult<usize>;

    /// Called when the session rolls back.
    fn rolled_back(&mut self) {}

    /// Returns true if there is nothing to commit.
    fn is_empty(&self) -> bool;

    /// Returns the iterative view of this transaction, if it iterates.
    fn as_iterative(&mut self) -> Option<&mut dyn Iterative> {
        None
    }
}

/// A transaction that produces directives in rounds until a fixed point.
pub trait Iterative {
    /// Returns true while another round is needed.
    fn has_more_iterations(&self) -> bool;

    /// Runs one round.
    fn iterate(&mut self, port: &mut TransactionPort) -> CoreResult<()>;
}

/// A request for notifications from other transactions in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Every notification of one type.
    ByType(NotificationKind),
    /// Every notification broadcast by one transaction type.
    BySource(TransactionKind),
    /// Notifications of one type broadcast by one transaction type.
    Specific(TransactionKind, NotificationKind),
}

impl Interest {
    /// Returns true if a notification of `kind` from `source` matches.
    pub fn matches(&self, source: TransactionKind, kind: NotificationKind) -> bool {
        match *self {
            Interest::ByType(wanted) => wanted == kind,
            Interest::BySource(wanted) => wanted == source,
            Interest::Specific(from, wanted) => from == source && wanted == kind,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingBroadcast {
    pub(crate) actor: Option<ActorId>,
    pub(crate) notification: Arc<dyn Notification>,
}

/// A transaction's handle on its session.
///
/// Posts are queued and broadcast by the session after the current callback
/// returns.
pub struct TransactionPort {
    kind: TransactionKind,
    pending: Vec<PendingBroadcast>,
    interests: HashSet<Interest>,
    new_interests: Vec<Interest>,
    /// Keyed by allocation address; holding the `Arc` keeps the address unique.
    delivered: HashMap<usize, Arc<dyn Notification>>,
}

impl TransactionPort {
    pub(crate) fn new(kind: TransactionKind) -> Self {
        Self {
            kind,
            pending: Vec::new(),
            interests: HashSet::new(),
            new_interests: Vec::new(),
            delivered: HashMap::new(),
        }
    }

    /// Returns the kind of the transaction owning this port.
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Queues `notification` for broadcast after locking `actor` for assembly.
    pub fn post_action(&mut self, actor: ActorId, notification: Arc<dyn Notification>) {
        self.pending.push(PendingBroadcast {
            actor: Some(actor),
            notification,
        });
    }

    /// Queues a directive's notification for broadcast.
    pub fn post_directive(&mut self, directive: &dyn Directive) {
        self.post_action(directive.actor(), directive.notification());
    }

    /// Queues a notification for broadcast without locking anything.
    pub fn post_notification(&mut self, notification: Arc<dyn Notification>) {
        self.pending.push(PendingBroadcast {
            actor: None,
            notification,
        });
    }

    /// Requests every notification of type `N`.
    pub fn request_notifications_by_type<N: Notification>(&mut self) {
        self.request(Interest::ByType(NotificationKind::of::<N>()));
    }

    /// Requests every notification broadcast by transactions of type `T`.
    pub fn request_notifications_from<T: Transaction + Default>(&mut self) {
        self.request(Interest::BySource(TransactionKind::of::<T>()));
    }

    /// Requests notifications of type `N` broadcast by transactions of type `T`.
    pub fn request_specific_notification<T: Transaction + Default, N: Notification>(&mut self) {
        self.request(Interest::Specific(
            TransactionKind::of::<T>(),
            NotificationKind::of::<N>(),
        ));
    }

    /// Registers an interest.
    ///
    /// Matching notifications already broadcast in this session are delivered
    /// as soon as the current callback returns.
    pub fn request(&mut self, interest: Interest) {
        if self.interests.insert(interest) {
            self.new_interests.push(interest);
        }
    }

    /// Returns true if broadcasts are queued.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingBroadcast> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn take_new_interests(&mut self) -> Vec<Interest> {
        std::mem::take(&mut self.new_interests)
    }

    pub(crate) fn wants(&self, source: TransactionKind, kind: NotificationKind) -> bool {
        self.interests.iter().any(|interest| interest.matches(source, kind))
    }

    /// Marks `notification` delivered; false if it already was.
    pub(crate) fn mark_delivered(&mut self, notification: &Arc<dyn Notification>) -> bool {
        let key = Arc::as_ptr(notification).cast::<()>() as usize;
        if self.delivered.contains_key(&key) {
            return false;
        }
        self.delivered.insert(key, Arc::clone(notification));
        true
    }
}

impl fmt::Debug for TransactionPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionPort")
            .field("kind", &self.kind)
            .field("pending", &self.pending.len())
            .field("interests", &self.interests)
            .finish_non_exhaustive()
    }
}

/// Buffer handed to contributors when a directive or directed notification is broadcast.
#[derive(Default)]
pub struct PendingTransaction {
    directives: Vec<Box<dyn Directive>>,
    notifications: Vec<Arc<dyn Notification>>,
}

impl PendingTransaction {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Contributes a directive to the broadcasting transaction.
    pub fn contribute(&mut self, directive: impl Directive + 'static) {
        self.directives.push(Box::new(directive));
    }

    /// Contributes a boxed directive.
    pub fn contribute_boxed(&mut self, directive: Box<dyn Directive>) {
        self.directives.push(directive);
    }

    /// Contributes a notification to the broadcasting transaction.
    pub fn contribute_notification(&mut self, notification: Arc<dyn Notification>) {
        self.notifications.push(notification);
    }

    /// Returns true if nothing was contributed.
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty() && self.notifications.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<Box<dyn Directive>>, Vec<Arc<dyn Notification>>) {
        (self.directives, self.notifications)
    }
}

impl fmt::Debug for PendingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("directives", &self.directives)
            .field("notifications", &self.notifications)
            .finish()
    }
}

/// An ordered list of directives, each broadcast for collaboration when added.
#[derive(Default)]
pub struct GenericTransaction {
    directives: Vec<Box<dyn Directive>>,
}

impl GenericTransaction {
    /// Appends a directive and posts it for broadcast.
    pub fn add(&mut self, directive: Box<dyn Directive>, port: &mut TransactionPort) {
        port.post_directive(&*directive);
        self.directives.push(directive);
    }

    /// Returns the number of pending directives.
    pub fn len(&self) -> usize {
        self.directives.len()
    }
}

impl Transaction for GenericTransaction {
    fn post_direct_response(
        &mut self,
        directives: Vec<Box<dyn Directive>>,
        port: &mut TransactionPort,
    ) -> CoreResult<()> {
        for directive in directives {
            self.add(directive, port);
        }
        Ok(())
    }

    fn directives_on(&self, actor: ActorId) -> Vec<&dyn Directive> {
        self.directives
            .iter()
            .rev()
            .filter(|directive| directive.actor() == actor)
            .map(|directive| &**directive)
            .collect()
    }

    fn commit(&mut self, fields: &FieldAccessScope<'_>) -> CoreResult<usize> {
        let directives = std::mem::take(&mut self.directives);
        let count = directives.len();
        for directive in directives {
            directive.commit(fields)?;
        }
        Ok(count)
    }

    fn rolled_back(&mut self) {
        self.directives.clear();
    }

    fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}

impl fmt::Debug for GenericTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericTransaction")
            .field("directives", &self.directives)
            .finish()
    }
}

/// A transaction that only reads.
///
/// Joining it opens a session, so commit-read locks taken by field reads are
/// released properly. It accepts no directives or notifications.
#[derive(Debug, Default)]
pub struct ReadOnlyTransaction;

impl Transaction for ReadOnlyTransaction {
    fn post_direct_response(
        &mut self,
        directives: Vec<Box<dyn Directive>>,
        _port: &mut TransactionPort,
    ) -> CoreResult<()> {
        if directives.is_empty() {
            return Ok(());
        }
        Err(CoreError::unsupported(
            "a read-only transaction does not accept directives",
        ))
    }

    fn post_direct_notifications(
        &mut self,
        notifications: Vec<Arc<dyn Notification>>,
        _port: &mut TransactionPort,
    ) -> CoreResult<()> {
        if notifications.is_empty() {
            return Ok(());
        }
        Err(CoreError::unsupported(
            "a read-only transaction does not accept notifications",
        ))
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
