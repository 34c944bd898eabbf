//! Transactions, sessions and tasks.
//!
//! A [`Task`] submitted to the [`TransactionRegistry`] runs inside a session
//! bound to the submitting thread. The task joins transactions and posts
//! directives to them; every posted directive is broadcast to the
//! contributors registered for its actor, who may answer with further
//! directives and notifications. Once broadcasting reaches a fixed point the
//! session takes commit-write locks and applies every directive.
//!
//! ## Phases
//!
//! ```text
//! IDLE -> ASSEMBLY -> COMMIT -> POST_PROCESSING -> IDLE
//! ```
//!
//! A lock collision anywhere before commit discards the whole attempt and
//! restarts the task from scratch, up to the retry budget.

mod directive;
mod notification;
mod registry;
mod session;
mod task;
mod transaction;

pub use directive::{Directive, FnDirective};
pub use notification::{DirectiveNotification, Notification, NotificationKind};
pub use registry::{ActorContributor, PostProcessor, TransactionListener, TransactionRegistry};
pub use task::{from_fn, FnTask, Task, TaskContext, TaskOutcome};
pub use transaction::{
    GenericTransaction, Interest, Iterative, PendingTransaction, ReadOnlyTransaction,
    Transaction, TransactionKind, TransactionPort,
};

use std::any::Any;

/// Upcast to [`Any`] for trait objects.
///
/// Call it on the trait object, not on a `Box` or `Arc` holding it: the
/// smart pointer implements the trait too.
pub trait AsAny: Any {
    /// Returns `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// Returns `self` as `&mut dyn Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Returns the concrete type's name.
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Strips the module path from a type name.
pub(crate) fn short_name(name: &'static str) -> &'static str {
    let base = name.split('<').next().unwrap_or(name);
    match base.rfind("::") {
        Some(index) => &name[index + 2..],
        None => name,
    }
}
