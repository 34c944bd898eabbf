//! # uitx core
//!
//! Transactional concurrency control for retained-mode UI state.
//!
//! UI state lives in *actors*. Every actor owns exactly one lock for its
//! lifetime, and every mutation of an actor is proposed as a *directive*
//! collected by a *transaction* inside a *session*. A session runs on the
//! thread that submitted it and commits atomically or not at all.
//!
//! This crate provides:
//!
//! - The lock forest: autonomous roots and dependent locks resolving to them
//! - Per-thread lock contexts with two-phase locking (assembly, then commit)
//! - A cross-lock detector that picks one victim per wait-for cycle
//! - Sessions with a collaboration fixed point and a post-processing phase
//! - Bounded retry of tasks that lost a lock collision
//!
//! ## Example
//!
//! ```rust
//! use uitx_core::action::{self, FnDirective};
//! use uitx_core::{Config, SynchronizationRole, TransactionRegistry};
//!
//! let registry = TransactionRegistry::new(Config::default());
//! let mut task = action::from_fn("create label", |cx| {
//!     let label = cx.register(SynchronizationRole::Autonomous, "label")?;
//!     cx.add_directive(FnDirective::new(label, "set text", |_| Ok(())))?;
//!     Ok(true)
//! });
//!
//! let outcome = registry.submit(&mut task).unwrap();
//! assert!(outcome.is_committed());
//! assert_eq!(registry.stats().directives_committed(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod action;
mod config;
mod error;
pub mod lock;
mod stats;
mod types;

pub use action::{
    ActorContributor, Directive, PostProcessor, Task, TaskContext, TaskOutcome, Transaction,
    TransactionKind, TransactionListener, TransactionRegistry,
};
pub use config::{Config, DEFAULT_MAX_RETRIES};
pub use error::{CollisionStatus, CoreError, CoreResult};
pub use lock::{FieldAccessHook, LockRegistry, Permission};
pub use stats::{EngineStats, StatsSnapshot};
pub use types::{ActorId, ContextId, LockId, Phase, SynchronizationRole, TaskKind};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
