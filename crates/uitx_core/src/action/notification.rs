//! Notifications broadcast during assembly.

use super::{short_name, AsAny};
use crate::types::ActorId;
use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A broadcastable fact describing a proposed change.
///
/// Notifications are shared as `Arc<dyn Notification>` and deduplicated by
/// identity: one instance reaches a given transaction at most once per
/// session, however many routes lead to it.
pub trait Notification: AsAny + fmt::Debug {
    /// The actor this notification is directed at, if any.
    ///
    /// Contributors of that actor are consulted when the notification is
    /// broadcast.
    fn directed_at(&self) -> Option<ActorId> {
        None
    }
}

impl dyn Notification {
    /// Returns the notification's type identity.
    pub fn kind(&self) -> NotificationKind {
        NotificationKind::of_val(self)
    }

    /// Returns true if the notification is a `T`.
    pub fn is<T: Notification>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcasts to the concrete notification type.
    pub fn downcast_ref<T: Notification>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Type identity of a notification, used to register interest.
#[derive(Clone, Copy)]
pub struct NotificationKind {
    id: TypeId,
    name: &'static str,
}

impl NotificationKind {
    /// Returns the kind of `N`.
    pub fn of<N: Notification>() -> Self {
        Self {
            id: TypeId::of::<N>(),
            name: std::any::type_name::<N>(),
        }
    }

    /// Returns the kind of a notification instance.
    pub fn of_val(notification: &dyn Notification) -> Self {
        Self {
            id: notification.as_any().type_id(),
            name: notification.type_name(),
        }
    }

    /// Returns the short type name.
    pub fn name(&self) -> &'static str {
        short_name(self.name)
    }
}

impl PartialEq for NotificationKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NotificationKind {}

impl Hash for NotificationKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NotificationKind({})", self.name())
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The notification a directive produces unless it supplies its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveNotification {
    /// The directive's actor.
    pub actor: ActorId,
    /// The directive's name.
    pub directive: String,
}

impl Notification for DirectiveNotification {
    fn directed_at(&self) -> Option<ActorId> {
        Some(self.actor)
    }
}
