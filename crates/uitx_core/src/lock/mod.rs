//! Actor locks and the machinery that acquires them.
//!
//! Every actor owns one [`Lock`]. Locks form a forest: an
//! [`AutonomousLock`] is a root holding real synchronization state, and a
//! [`DependentLock`] delegates to an owner, resolving to the first
//! autonomous ancestor.
//!
//! ## Acquisition protocol
//!
//! - Assembly lock first, taken when a directive for the actor is broadcast
//! - Commit-write lock next, for every assembly lock held, at commit
//! - Release in order: assembly, residual reads, write
//!
//! Whenever an acquisition would block, the caller registers the lock it
//! awaits and runs the cross-lock check (see [`deadlock`]). A detected cycle
//! either fails the caller immediately or interrupts the chosen victims.

mod access;
mod autonomous;
mod context;
pub mod deadlock;
mod instantiation;
mod registry;

pub use access::{
    AccessKind, FieldAccess, FieldAccessHook, FieldAccessScope, LoggingFieldAccessHook,
    Permission,
};
pub use autonomous::{Acquisition, AutonomousLock, RequestMode, Waiter};
pub use context::LockTransactionContext;
pub use deadlock::LockState;
pub use instantiation::InstantiationStack;
pub use registry::LockRegistry;

use crate::types::LockId;
use std::fmt;
use std::sync::Arc;

/// A node of the lock forest.
#[derive(Debug)]
pub enum Lock {
    /// A root owning real synchronization state.
    Autonomous(Arc<AutonomousLock>),
    /// A node delegating to its owner.
    Dependent(DependentLock),
}

impl Lock {
    /// Creates a new root lock.
    pub fn autonomous(description: impl Into<String>) -> Arc<Self> {
        Arc::new(Lock::Autonomous(Arc::new(AutonomousLock::new(description))))
    }

    /// Creates a lock delegating to `owner`.
    pub fn dependent(owner: Arc<Lock>, description: impl Into<String>) -> Arc<Self> {
        Arc::new(Lock::Dependent(DependentLock {
            id: LockId::next(),
            description: description.into(),
            owner,
        }))
    }

    /// Returns the identity of this node (not of its root).
    #[must_use]
    pub fn id(&self) -> LockId {
        match self {
            Lock::Autonomous(lock) => lock.id(),
            Lock::Dependent(lock) => lock.id,
        }
    }

    /// Returns the description given at creation.
    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Lock::Autonomous(lock) => lock.description(),
            Lock::Dependent(lock) => &lock.description,
        }
    }

    /// Walks the owner chain to the autonomous root.
    #[must_use]
    pub fn resolve(&self) -> &Arc<AutonomousLock> {
        let mut node = self;
        loop {
            match node {
                Lock::Autonomous(root) => return root,
                Lock::Dependent(dependent) => node = &dependent.owner,
            }
        }
    }

    /// Returns true if this node is a root.
    #[must_use]
    pub fn is_autonomous(&self) -> bool {
        matches!(self, Lock::Autonomous(_))
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lock::Autonomous(lock) => write!(f, "{lock}"),
            Lock::Dependent(lock) => write!(f, "{}({}) -> {}", lock.id, lock.description, lock.owner),
        }
    }
}

/// A lock delegating its identity to an owner.
#[derive(Debug)]
pub struct DependentLock {
    id: LockId,
    description: String,
    owner: Arc<Lock>,
}

impl DependentLock {
    /// Returns the direct owner of this lock.
    #[must_use]
    pub fn owner(&self) -> &Arc<Lock> {
        &self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn autonomous_resolves_to_itself() {
        let lock = Lock::autonomous("root");
        let root = lock.resolve();
        assert_eq!(root.id(), lock.id());
        assert!(lock.is_autonomous());
    }

    #[test]
    fn dependent_resolves_to_root() {
        let root = Lock::autonomous("root");
        let child = Lock::dependent(Arc::clone(&root), "child");
        let grandchild = Lock::dependent(Arc::clone(&child), "grandchild");

        assert!(Arc::ptr_eq(grandchild.resolve(), root.resolve()));
        assert_ne!(grandchild.id(), root.id());
        assert_eq!(grandchild.description(), "grandchild");
    }

    #[test]
    fn display_shows_chain() {
        let root = Lock::autonomous("root");
        let child = Lock::dependent(Arc::clone(&root), "child");
        let text = child.to_string();
        assert!(text.contains("child"));
        assert!(text.contains("root"));
    }

    proptest! {
        #[test]
        fn chain_of_any_depth_resolves_to_one_root(depth in 0usize..200) {
            let root = Lock::autonomous("root");
            let mut node = Arc::clone(&root);
            for level in 0..depth {
                node = Lock::dependent(node, format!("level-{level}"));
            }
            prop_assert!(Arc::ptr_eq(node.resolve(), root.resolve()));
        }
    }
}
