//! Core type definitions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Allocates the next identifier. Identifiers are never reused.
            #[must_use]
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Returns the raw identifier value.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

sequential_id!(
    /// Identity of an actor: an entity owning exactly one lock for its lifetime.
    ActorId,
    NEXT_ACTOR_ID,
    "actor"
);

sequential_id!(
    /// Identity of a lock node in the lock-ownership forest.
    LockId,
    NEXT_LOCK_ID,
    "lock"
);

sequential_id!(
    /// Identity of a per-thread lock transaction context.
    ContextId,
    NEXT_CONTEXT_ID,
    "ctx"
);

/// Phases of a session, driven only by the outermost task on a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No transaction is in progress.
    Idle,
    /// Directives are being collected; actor assembly locks are being taken.
    Assembly,
    /// Directives are being applied under commit-write locks.
    Commit,
    /// Post-processors run after all locks of the main commit were released.
    PostProcessing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "IDLE",
            Phase::Assembly => "ASSEMBLY",
            Phase::Commit => "COMMIT",
            Phase::PostProcessing => "POST_PROCESSING",
        };
        f.write_str(name)
    }
}

/// The phase of a session during which a task is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskKind {
    /// Ordinary work, executed before commit.
    #[default]
    Processing,
    /// Work queued by post-processors after the main commit.
    PostProcessing,
}

/// How a newly instantiated actor obtains its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynchronizationRole {
    /// A new root lock.
    Autonomous,
    /// A dependent lock on the nearest enclosing root, or a new root if none exists.
    Dependent,
    /// Reuses the enclosing lock directly; requires an enclosing frame.
    Subordinate,
}

impl SynchronizationRole {
    /// Returns the role's name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            SynchronizationRole::Autonomous => "autonomous",
            SynchronizationRole::Dependent => "dependent",
            SynchronizationRole::Subordinate => "subordinate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = ActorId::next();
        let b = ActorId::next();
        assert!(a < b);
        assert_ne!(LockId::next(), LockId::next());
    }

    #[test]
    fn id_display() {
        let id = ContextId::next();
        assert_eq!(format!("{id}"), format!("ctx:{}", id.as_u64()));
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::PostProcessing.to_string(), "POST_PROCESSING");
        assert_eq!(Phase::Idle.to_string(), "IDLE");
    }
}
