//! Property-based test generators using proptest.
//!
//! Provides strategies for session shapes and lock forests.

use proptest::prelude::*;
use uitx_core::SynchronizationRole;

/// The shape of one collaborative session.
///
/// `echo_depths[a]` is how many generations of echoes the contributor on
/// actor `a` answers with; `directives` lists the actors the task body adds
/// directives to, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collaboration {
    /// Echo depth per actor.
    pub echo_depths: Vec<usize>,
    /// Target actor index of each directive added by the task body.
    pub directives: Vec<usize>,
}

impl Collaboration {
    /// Number of actors taking part.
    pub fn actors(&self) -> usize {
        self.echo_depths.len()
    }

    /// Number of directives the session commits.
    pub fn expected_directives(&self) -> usize {
        self.directives
            .iter()
            .map(|&actor| 1 + self.echo_depths[actor])
            .sum()
    }
}

/// Strategy for collaboration shapes: up to 4 actors, up to 8 root directives.
pub fn collaboration_strategy() -> impl Strategy<Value = Collaboration> {
    (1usize..=4).prop_flat_map(|actors| {
        (
            prop::collection::vec(0usize..=3, actors),
            prop::collection::vec(0..actors, 1..=8),
        )
            .prop_map(|(echo_depths, directives)| Collaboration {
                echo_depths,
                directives,
            })
    })
}

/// Strategy for roles that can open a frame without an enclosing one.
pub fn root_role_strategy() -> impl Strategy<Value = SynchronizationRole> {
    prop_oneof![
        Just(SynchronizationRole::Autonomous),
        Just(SynchronizationRole::Dependent),
    ]
}

/// Strategy for the roles of nested frames.
pub fn nested_roles_strategy() -> impl Strategy<Value = Vec<SynchronizationRole>> {
    prop::collection::vec(
        prop_oneof![
            2 => Just(SynchronizationRole::Dependent),
            1 => Just(SynchronizationRole::Subordinate),
        ],
        0..12,
    )
}
