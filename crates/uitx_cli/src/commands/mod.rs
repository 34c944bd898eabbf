//! CLI command implementations.

pub mod deadlock;
pub mod stress;

use uitx_core::StatsSnapshot;

/// Prints engine counters as indented text.
pub(crate) fn print_stats(stats: &StatsSnapshot) {
    println!("Statistics:");
    println!("  Tasks submitted:       {}", stats.tasks_submitted);
    println!("  Sessions committed:    {}", stats.sessions_committed);
    println!("  Sessions rolled back:  {}", stats.sessions_rolled_back);
    println!("  Retries:               {}", stats.retries);
    println!("  Exhausted:             {}", stats.exhausted);
    println!("  Cross-lock collisions: {}", stats.crosslock_collisions);
    println!("  Timeouts:              {}", stats.timeouts);
    println!("  Deadlock checks:       {}", stats.deadlock_checks);
    println!("  Victims selected:      {}", stats.victims_selected);
    println!("  Directives committed:  {}", stats.directives_committed);
    println!("  Notifications:         {}", stats.notifications_broadcast);
}
