//! Instantiation frames.
//!
//! Actors are registered while a frame is open. The frame decides which lock
//! a new actor is bound to.

use super::Lock;
use crate::error::{CoreError, CoreResult};
use crate::types::SynchronizationRole;
use std::sync::Arc;

#[derive(Debug)]
struct Frame {
    lock: Arc<Lock>,
    /// Subordinate frames reuse the enclosing frame by bumping its depth.
    depth: usize,
}

/// Per-context stack of open instantiation frames.
#[derive(Debug, Default)]
pub struct InstantiationStack {
    frames: Vec<Frame>,
}

impl InstantiationStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no frame is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Returns the lock of the innermost frame.
    #[must_use]
    pub fn peek(&self) -> Option<&Arc<Lock>> {
        self.frames.last().map(|frame| &frame.lock)
    }

    /// Creates a dependent lock on the innermost frame's lock.
    pub fn attach_dependent(&self, description: impl Into<String>) -> CoreResult<Arc<Lock>> {
        let owner = self.peek().ok_or(CoreError::NoInstantiationFrame {
            role: SynchronizationRole::Dependent.name(),
        })?;
        Ok(Lock::dependent(Arc::clone(owner), description))
    }

    /// Opens a frame for an actor of the given role.
    ///
    /// Autonomous roles get a new root. Dependent roles depend on the
    /// innermost frame, or get a new root when there is none. Subordinate
    /// roles reuse the innermost frame and fail when there is none.
    pub fn push(&mut self, role: SynchronizationRole, description: &str) -> CoreResult<()> {
        match role {
            SynchronizationRole::Autonomous => self.push_lock(Lock::autonomous(description)),
            SynchronizationRole::Dependent => {
                let lock = match self.peek() {
                    Some(owner) => Lock::dependent(Arc::clone(owner), description),
                    None => Lock::autonomous(description),
                };
                self.push_lock(lock);
            }
            SynchronizationRole::Subordinate => {
                let frame = self.frames.last_mut().ok_or(CoreError::NoInstantiationFrame {
                    role: role.name(),
                })?;
                frame.depth += 1;
            }
        }
        Ok(())
    }

    /// Opens a frame on an existing lock.
    pub fn push_lock(&mut self, lock: Arc<Lock>) {
        self.frames.push(Frame { lock, depth: 0 });
    }

    /// Closes the innermost frame.
    pub fn pop(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            if frame.depth > 0 {
                frame.depth -= 1;
            } else {
                self.frames.pop();
            }
        }
    }

    /// Drops every open frame.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autonomous_frame_is_a_new_root() {
        let mut stack = InstantiationStack::new();
        stack.push(SynchronizationRole::Autonomous, "window").unwrap();
        stack.push(SynchronizationRole::Autonomous, "dialog").unwrap();

        let top = stack.peek().unwrap();
        assert!(top.is_autonomous());
        assert_eq!(top.description(), "dialog");
    }

    #[test]
    fn dependent_frame_depends_on_enclosing() {
        let mut stack = InstantiationStack::new();
        stack.push(SynchronizationRole::Autonomous, "window").unwrap();
        let root = Arc::clone(stack.peek().unwrap());

        stack.push(SynchronizationRole::Dependent, "button").unwrap();
        let top = stack.peek().unwrap();
        assert!(!top.is_autonomous());
        assert!(Arc::ptr_eq(top.resolve(), root.resolve()));
    }

    #[test]
    fn dependent_without_frame_is_a_root() {
        let mut stack = InstantiationStack::new();
        stack.push(SynchronizationRole::Dependent, "orphan").unwrap();
        assert!(stack.peek().unwrap().is_autonomous());
    }

    #[test]
    fn subordinate_requires_frame() {
        let mut stack = InstantiationStack::new();
        let result = stack.push(SynchronizationRole::Subordinate, "cell");
        assert!(matches!(result, Err(CoreError::NoInstantiationFrame { .. })));
    }

    #[test]
    fn subordinate_reuses_frame_until_popped() {
        let mut stack = InstantiationStack::new();
        stack.push(SynchronizationRole::Autonomous, "list").unwrap();
        let root = Arc::clone(stack.peek().unwrap());

        stack.push(SynchronizationRole::Subordinate, "cell").unwrap();
        assert!(Arc::ptr_eq(stack.peek().unwrap(), &root));

        stack.pop();
        assert!(Arc::ptr_eq(stack.peek().unwrap(), &root));
        stack.pop();
        assert!(stack.is_empty());
    }

    #[test]
    fn attach_dependent_uses_top() {
        let mut stack = InstantiationStack::new();
        assert!(stack.attach_dependent("handler").is_err());

        stack.push(SynchronizationRole::Autonomous, "panel").unwrap();
        let handler = stack.attach_dependent("handler").unwrap();
        assert!(Arc::ptr_eq(handler.resolve(), stack.peek().unwrap().resolve()));
    }
}
