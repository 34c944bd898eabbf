//! Benchmark utilities.

use rand::seq::SliceRandom;
use rand::Rng;
use uitx_core::lock::deadlock::WaitEntry;
use uitx_core::{ContextId, LockId};

/// Builds a snapshot in which `size` contexts wait on each other in one ring.
pub fn ring_snapshot(size: usize) -> Vec<WaitEntry> {
    let contexts: Vec<ContextId> = (0..size).map(|_| ContextId::next()).collect();
    let locks: Vec<LockId> = (0..size).map(|_| LockId::next()).collect();
    (0..size)
        .map(|index| WaitEntry {
            context: contexts[index],
            transaction_active: true,
            awaiting: Some(locks[(index + 1) % size]),
            holds: vec![locks[index]],
        })
        .collect()
}

/// Builds a snapshot of `size` contexts each holding one lock and waiting on a random one.
pub fn random_snapshot(size: usize) -> Vec<WaitEntry> {
    let mut rng = rand::thread_rng();
    let contexts: Vec<ContextId> = (0..size).map(|_| ContextId::next()).collect();
    let locks: Vec<LockId> = (0..size).map(|_| LockId::next()).collect();
    let mut entries: Vec<WaitEntry> = (0..size)
        .map(|index| WaitEntry {
            context: contexts[index],
            transaction_active: true,
            awaiting: rng.gen_bool(0.8).then(|| locks[rng.gen_range(0..size)]),
            holds: vec![locks[index]],
        })
        .collect();
    entries.shuffle(&mut rng);
    entries
}
