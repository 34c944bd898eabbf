//! # uitx testkit
//!
//! Test utilities for uitx.
//!
//! This crate provides:
//! - Fixtures: counter actors, journals and recording collaborators
//! - Property-based test generators using proptest
//! - The two-thread cross-lock scenario
//! - Contention stress utilities
//!
//! ## Usage
//!
//! ```rust
//! use uitx_testkit::prelude::*;
//!
//! let registry = test_registry();
//! let counter = Counter::create(&registry, "clicks").unwrap();
//! registry
//!     .submit(&mut from_fn("click", |cx| counter.add(cx, 1).map(|()| true)))
//!     .unwrap();
//! assert_eq!(counter.value(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod scenarios;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scenarios::*;
    pub use crate::stress::*;
    pub use uitx_core::action::{from_fn, FnDirective, GenericTransaction};
    pub use uitx_core::{
        CollisionStatus, Config, CoreError, CoreResult, SynchronizationRole, TaskOutcome,
        TransactionRegistry,
    };
}

pub use fixtures::*;
pub use generators::*;
pub use scenarios::*;
pub use stress::*;
