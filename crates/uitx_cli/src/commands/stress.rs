//! Stress command implementation.

use tracing::info;
use uitx_core::{Config, TransactionRegistry};
use uitx_testkit::{run_stress, StressConfig, StressResult};

/// Runs the stress command.
pub fn run(config: &StressConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if config.threads == 0 || config.actors == 0 {
        return Err("threads and actors must be at least 1".into());
    }

    info!(
        threads = config.threads,
        actors = config.actors,
        seed = config.seed,
        "Starting stress run"
    );
    let registry = TransactionRegistry::new(Config::default());
    let result = run_stress(&registry, config)?;
    info!(
        committed = result.committed,
        failed = result.failed,
        retries = result.stats.retries,
        "Stress run finished"
    );

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(config, &result);
        }
    }

    if !result.is_consistent() {
        return Err(format!(
            "counter total {} does not match {} committed touches",
            result.counter_total, result.touches_committed
        )
        .into());
    }
    Ok(())
}

fn print_text_output(config: &StressConfig, result: &StressResult) {
    println!("=== Stress run ===");
    println!();
    println!("Threads:    {}", config.threads);
    println!("Actors:     {}", config.actors);
    println!("Tasks:      {}", config.threads * config.tasks_per_thread);
    println!("Committed:  {}", result.committed);
    println!("Failed:     {}", result.failed);
    println!("Duration:   {:?}", result.duration);
    println!("Throughput: {:.2} tasks/sec", result.tasks_per_second);
    println!(
        "Counters:   {} (expected {})",
        result.counter_total, result.touches_committed
    );
    println!();
    super::print_stats(&result.stats);
}
