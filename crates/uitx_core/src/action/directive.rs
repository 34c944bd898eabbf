//! Directives: proposed mutations of one actor.

use super::notification::{DirectiveNotification, Notification};
use crate::error::CoreResult;
use crate::lock::FieldAccessScope;
use crate::types::ActorId;
use std::fmt;
use std::sync::Arc;

/// A proposed mutation bound to exactly one actor.
///
/// A directive is consumed by [`commit`](Directive::commit), so it is applied
/// at most once. Commit runs while the session holds the actor's commit-write
/// lock; field writes are reported through `fields`.
pub trait Directive {
    /// The actor this directive mutates.
    fn actor(&self) -> ActorId;

    /// A short name for diagnostics.
    fn name(&self) -> &str {
        "directive"
    }

    /// The notification broadcast when the directive is posted.
    fn notification(&self) -> Arc<dyn Notification> {
        Arc::new(DirectiveNotification {
            actor: self.actor(),
            directive: self.name().to_owned(),
        })
    }

    /// Applies the mutation.
    fn commit(self: Box<Self>, fields: &FieldAccessScope<'_>) -> CoreResult<()>;
}

impl fmt::Debug for dyn Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name(), self.actor())
    }
}

/// A directive built from a closure.
pub struct FnDirective<F> {
    actor: ActorId,
    name: String,
    apply: F,
}

impl<F> FnDirective<F>
where
    F: FnOnce(&FieldAccessScope<'_>) -> CoreResult<()>,
{
    /// Creates a directive that runs `apply` at commit.
    pub fn new(actor: ActorId, name: impl Into<String>, apply: F) -> Self {
        Self {
            actor,
            name: name.into(),
            apply,
        }
    }
}

impl<F> Directive for FnDirective<F>
where
    F: FnOnce(&FieldAccessScope<'_>) -> CoreResult<()>,
{
    fn actor(&self) -> ActorId {
        self.actor
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn commit(self: Box<Self>, fields: &FieldAccessScope<'_>) -> CoreResult<()> {
        (self.apply)(fields)
    }
}

impl<F> fmt::Debug for FnDirective<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDirective")
            .field("actor", &self.actor)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
