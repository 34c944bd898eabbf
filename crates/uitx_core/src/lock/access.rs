//! Field-access validation.
//!
//! Actor-guarded state may be read with read or write permission and written
//! only during commit, with write permission. The engine does not intercept
//! field access itself; callers report accesses and an installed
//! [`FieldAccessHook`] decides what to do with them.

use super::LockRegistry;
use crate::types::{ActorId, ContextId};
use std::collections::HashSet;
use std::fmt;
use tracing::{trace, warn};

/// Whether a field is being read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// A read.
    Read,
    /// A write.
    Write,
}

/// The permissions a context holds on an actor's root lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permission {
    /// Commit-read or commit-write is held.
    pub read: bool,
    /// The assembly lock is held.
    pub assembly: bool,
    /// Commit-write is held.
    pub write: bool,
}

/// A reported field access.
#[derive(Debug, Clone, Copy)]
pub struct FieldAccess<'a> {
    /// The actor owning the field.
    pub actor: ActorId,
    /// The field name.
    pub field: &'a str,
    /// Read or write.
    pub kind: AccessKind,
    /// Whether the actor has a registered lock.
    pub registered: bool,
    /// Whether the actor was created by the accessing session.
    pub instantiated: bool,
    /// Permissions held by the accessing context.
    pub permission: Permission,
}

impl FieldAccess<'_> {
    /// Returns true if the access is allowed by the lock state.
    #[must_use]
    pub fn is_permitted(&self) -> bool {
        if self.instantiated {
            return true;
        }
        match self.kind {
            AccessKind::Read => self.permission.read,
            AccessKind::Write => self.permission.write,
        }
    }
}

/// Receives every reported field access.
pub trait FieldAccessHook: Send + Sync {
    /// Called after a read was validated (and its read lock acquired).
    fn on_read(&self, access: &FieldAccess<'_>) {
        let _ = access;
    }

    /// Called when a write is reported.
    fn on_write(&self, access: &FieldAccess<'_>) {
        let _ = access;
    }
}

/// The default hook: logs accesses the lock state does not permit.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFieldAccessHook;

impl FieldAccessHook for LoggingFieldAccessHook {
    fn on_read(&self, access: &FieldAccess<'_>) {
        if !access.registered {
            warn!(actor = %access.actor, field = access.field, "read of an actor with no registered lock");
        } else if !access.is_permitted() {
            warn!(actor = %access.actor, field = access.field, "read without permission from the actor lock");
        } else {
            trace!(actor = %access.actor, field = access.field, "read");
        }
    }

    fn on_write(&self, access: &FieldAccess<'_>) {
        if !access.registered {
            warn!(actor = %access.actor, field = access.field, "write to an actor with no registered lock");
        } else if !access.is_permitted() {
            warn!(actor = %access.actor, field = access.field, "write without permission from the actor lock");
        } else {
            trace!(actor = %access.actor, field = access.field, "write");
        }
    }
}

/// Reports field accesses made by directives during commit.
///
/// The scope never acquires locks: at commit every lock the session needs is
/// already held in write mode.
pub struct FieldAccessScope<'a> {
    registry: &'a LockRegistry,
    context: ContextId,
    instantiated: &'a HashSet<ActorId>,
    hook: &'a dyn FieldAccessHook,
}

impl<'a> FieldAccessScope<'a> {
    pub(crate) fn new(
        registry: &'a LockRegistry,
        context: ContextId,
        instantiated: &'a HashSet<ActorId>,
        hook: &'a dyn FieldAccessHook,
    ) -> Self {
        Self {
            registry,
            context,
            instantiated,
            hook,
        }
    }

    /// Returns the permissions the committing context holds on `actor`.
    #[must_use]
    pub fn permission(&self, actor: ActorId) -> Permission {
        self.registry.permission(self.context, actor)
    }

    /// Returns true if `actor`'s fields may be written now.
    #[must_use]
    pub fn can_write(&self, actor: ActorId) -> bool {
        self.instantiated.contains(&actor) || self.permission(actor).write
    }

    /// Reports a read of `actor.field`.
    pub fn read(&self, actor: ActorId, field: &str) {
        let access = self.access(actor, field, AccessKind::Read);
        self.hook.on_read(&access);
    }

    /// Reports a write of `actor.field`.
    pub fn write(&self, actor: ActorId, field: &str) {
        let access = self.access(actor, field, AccessKind::Write);
        self.hook.on_write(&access);
    }

    fn access<'f>(&self, actor: ActorId, field: &'f str, kind: AccessKind) -> FieldAccess<'f> {
        FieldAccess {
            actor,
            field,
            kind,
            registered: self.registry.is_registered(actor),
            instantiated: self.instantiated.contains(&actor),
            permission: self.permission(actor),
        }
    }
}

impl fmt::Debug for FieldAccessScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessScope")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(kind: AccessKind, permission: Permission) -> FieldAccess<'static> {
        FieldAccess {
            actor: ActorId::next(),
            field: "value",
            kind,
            registered: true,
            instantiated: false,
            permission,
        }
    }

    #[test]
    fn write_requires_write_permission() {
        let assembly_only = Permission {
            read: false,
            assembly: true,
            write: false,
        };
        assert!(!access(AccessKind::Write, assembly_only).is_permitted());
        assert!(!access(AccessKind::Read, assembly_only).is_permitted());

        let writing = Permission {
            read: true,
            assembly: true,
            write: true,
        };
        assert!(access(AccessKind::Write, writing).is_permitted());
    }

    #[test]
    fn instantiated_actors_are_exempt() {
        let mut fresh = access(AccessKind::Write, Permission::default());
        assert!(!fresh.is_permitted());
        fresh.instantiated = true;
        assert!(fresh.is_permitted());
    }
}
