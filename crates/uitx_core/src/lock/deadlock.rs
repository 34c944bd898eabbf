//! Cross-lock detection.
//!
//! Runs whenever a context is about to block on a busy lock. The check works
//! on a snapshot of every context:
//!
//! 1. A context is a *waiter* if its transaction is active and it awaits a lock.
//! 2. A waiter's *blocker* is another waiter holding (fully or read-only) the
//!    lock it awaits. Waiters without a blocker are pruned, repeatedly, until
//!    the set is stable.
//! 3. The remaining waiters form cycles. Waiters are walked in context order,
//!    following blockers until a node repeats. The first cycle node reached
//!    by the walk is that cycle's victim.
//!
//! Victim choice depends only on traversal order, never on transaction age,
//! size or priority.

use crate::types::{ContextId, LockId};
use std::collections::{BTreeMap, HashSet};

/// Result of a cross-lock check from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// The caller may wait.
    Ok,
    /// The caller was selected as a victim and must fail without waiting.
    Collision,
}

/// One context in a cross-lock snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEntry {
    /// The context.
    pub context: ContextId,
    /// Whether a transaction is active in the context.
    pub transaction_active: bool,
    /// The root lock the context is about to wait for.
    pub awaiting: Option<LockId>,
    /// Root locks the context holds, fully or read-only.
    pub holds: Vec<LockId>,
}

impl WaitEntry {
    fn is_waiter(&self) -> bool {
        self.transaction_active && self.awaiting.is_some()
    }
}

/// Outcome of [`check_cross_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossLockVerdict {
    /// What the caller must do.
    pub state: LockState,
    /// Every selected victim, in selection order (may include the caller).
    pub victims: Vec<ContextId>,
}

impl CrossLockVerdict {
    /// Returns the victims other than `caller`; these must be interrupted.
    pub fn others(&self, caller: ContextId) -> impl Iterator<Item = ContextId> + '_ {
        self.victims.iter().copied().filter(move |victim| *victim != caller)
    }
}

/// Runs the check for `caller` over a snapshot of all contexts.
#[must_use]
pub fn check_cross_lock(entries: &[WaitEntry], caller: ContextId) -> CrossLockVerdict {
    let victims = find_victims(entries);
    let state = if victims.contains(&caller) {
        LockState::Collision
    } else {
        LockState::Ok
    };
    CrossLockVerdict { state, victims }
}

/// Selects one victim per cycle in the wait-for graph of `entries`.
#[must_use]
pub fn find_victims(entries: &[WaitEntry]) -> Vec<ContextId> {
    let mut waiters: Vec<&WaitEntry> = entries.iter().filter(|entry| entry.is_waiter()).collect();
    if waiters.len() < 2 {
        return Vec::new();
    }
    waiters.sort_by_key(|entry| entry.context);

    let blockers = stable_blockers(&waiters);
    if blockers.len() < 2 {
        return Vec::new();
    }

    let mut victims = Vec::new();
    let mut visited = HashSet::new();
    for &start in blockers.keys() {
        if !visited.insert(start) {
            continue;
        }
        let mut walk = vec![start];
        let mut current = start;
        loop {
            let next = blockers[&current];
            if let Some(position) = walk.iter().position(|&node| node == next) {
                victims.push(waiters[walk[position]].context);
                break;
            }
            if !visited.insert(next) {
                // joined a walk that already produced its victim
                break;
            }
            walk.push(next);
            current = next;
        }
    }
    victims
}

/// Maps each surviving waiter index to its blocker index, after pruning.
fn stable_blockers(waiters: &[&WaitEntry]) -> BTreeMap<usize, usize> {
    let mut alive: Vec<usize> = (0..waiters.len()).collect();
    loop {
        let blockers: BTreeMap<usize, usize> = alive
            .iter()
            .filter_map(|&index| find_blocker(index, &alive, waiters).map(|blocker| (index, blocker)))
            .collect();
        if blockers.len() == alive.len() {
            return blockers;
        }
        alive = blockers.keys().copied().collect();
    }
}

fn find_blocker(index: usize, alive: &[usize], waiters: &[&WaitEntry]) -> Option<usize> {
    let awaited = waiters[index].awaiting?;
    alive
        .iter()
        .copied()
        .filter(|&other| other != index)
        .find(|&other| waiters[other].holds.contains(&awaited))
}
