//! Deadlock command implementation.

use std::time::Duration;
use tracing::info;
use uitx_core::Config;
use uitx_testkit::{run_cross_lock, CrossLockReport};

/// Runs the deadlock command.
pub fn run(wait_ms: u64, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default().lock_wait_timeout(Duration::from_millis(wait_ms));
    info!("Running cross-lock scenario with a {wait_ms} ms lock wait");
    let report = run_cross_lock(config)?;
    info!(
        victims = report.victims().count(),
        crosslock_collisions = report.stats.crosslock_collisions,
        "Cross-lock scenario finished"
    );

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    if !report.all_committed() {
        return Err("not every scenario thread committed".into());
    }
    Ok(())
}

fn print_text_output(report: &CrossLockReport) {
    println!("=== Cross-lock scenario ===");
    println!();
    for thread in &report.threads {
        let status = match (&thread.error, thread.committed) {
            (Some(error), _) => format!("failed: {error}"),
            (None, true) => "committed".to_owned(),
            (None, false) => "rolled back".to_owned(),
        };
        println!("  {:<4} attempts: {:<3} {}", thread.name, thread.attempts, status);
    }
    println!();

    let victims: Vec<&str> = report.victims().map(|thread| thread.name.as_str()).collect();
    if victims.is_empty() {
        println!("Victim: none (no cycle formed)");
    } else {
        println!("Victim: {}", victims.join(", "));
    }
    println!("Values: x = {}, y = {}", report.values[0], report.values[1]);
    println!("Duration: {:?}", report.duration);
    println!();
    super::print_stats(&report.stats);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_commits_both_threads() {
        run(1_000, "text").unwrap();
    }
}
