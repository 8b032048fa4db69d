//! Output writer simulation runner
//!
//! Runs the consistent-writer and segment-recovery DST harnesses over a
//! range of seeds and prints a summary for each.
//!
//! Usage:
//!   output-dst [start_seed] [count] [baseline|crash|chaos]
//!
//!   # Replay a single failing seed with writer logs
//!   RUST_LOG=shard_output=debug output-dst 1234 1 chaos

use shard_output::output::dst::{
    run_consistent_dst_batch, run_segment_dst_batch, summarize_output_dst_batch,
    OutputDSTConfig,
};
use std::env;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const DEFAULT_SEEDS: u64 = 100;

fn parse_arg(index: usize, default: u64) -> Result<u64, String> {
    match env::args().nth(index) {
        Some(raw) => raw
            .parse()
            .map_err(|e| format!("invalid argument {:?}: {}", raw, e)),
        None => Ok(default),
    }
}

fn config_for(profile: &str) -> Result<OutputDSTConfig, String> {
    match profile {
        "baseline" => Ok(OutputDSTConfig::baseline()),
        "crash" => Ok(OutputDSTConfig::crash_only()),
        "chaos" => Ok(OutputDSTConfig::chaos()),
        "default" => Ok(OutputDSTConfig::default()),
        other => Err(format!("unknown profile {:?}", other)),
    }
}

fn run() -> Result<bool, String> {
    let start = parse_arg(1, 0)?;
    let count = parse_arg(2, DEFAULT_SEEDS)?;
    let profile = env::args().nth(3).unwrap_or_else(|| "chaos".to_string());
    let config = config_for(&profile)?;
    let seeds = start..start.saturating_add(count);

    println!("=== Output Writer DST ===");
    println!("Seeds:   {}..{}", seeds.start, seeds.end);
    println!("Profile: {}", profile);
    println!();

    let consistent = run_consistent_dst_batch(seeds.clone(), config.clone());
    println!("{}", summarize_output_dst_batch("Consistent Writer", &consistent));
    println!();

    let segments = run_segment_dst_batch(seeds, config);
    println!("{}", summarize_output_dst_batch("Segment Recovery", &segments));

    Ok(consistent.iter().chain(&segments).all(|r| r.passed))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}
