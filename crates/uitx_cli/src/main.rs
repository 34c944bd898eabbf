//! uitx CLI
//!
//! Diagnostics for the uitx transaction engine.
//!
//! # Commands
//!
//! - `deadlock` - Run the two-thread lock cycle and report the victim
//! - `stress` - Run randomized lock contention and report throughput
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Diagnostics for the uitx transaction engine.
#[derive(Parser)]
#[command(name = "uitx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the two-thread cross-lock scenario
    Deadlock {
        /// Bounded lock wait in milliseconds
        #[arg(short, long, default_value = "1000")]
        wait_ms: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run randomized lock contention
    Stress {
        /// Number of submitting threads
        #[arg(short, long, default_value = "4")]
        threads: usize,

        /// Number of shared actors
        #[arg(short, long, default_value = "8")]
        actors: usize,

        /// Tasks submitted per thread
        #[arg(long, default_value = "100")]
        tasks: usize,

        /// Most actors one task locks
        #[arg(long, default_value = "3")]
        touches: usize,

        /// Seed for the random task shapes
        #[arg(long, default_value = "24301")]
        seed: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Deadlock { wait_ms, format } => {
            commands::deadlock::run(wait_ms, &format)?;
        }
        Commands::Stress {
            threads,
            actors,
            tasks,
            touches,
            seed,
            format,
        } => {
            let config = uitx_testkit::StressConfig {
                threads,
                actors,
                tasks_per_thread: tasks,
                max_touches: touches,
                seed,
            };
            commands::stress::run(&config, &format)?;
        }
        Commands::Version => {
            println!("uitx CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("uitx core v{}", uitx_core::VERSION);
        }
    }

    Ok(())
}
