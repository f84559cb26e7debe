//! Compare robust-training metrics between two runs for regression detection.
//!
//! Usage:
//!   cargo run --example compare_metrics -- --baseline baseline.jsonl --current current.jsonl --tolerance 0.01

use anyhow::{Context, Result};
use clap::Parser;
use robustmt_modeling::metrics::{MetricsComparison, StepMetrics, compare_metrics, load_metrics};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "compare_metrics")]
#[command(about = "Compare robust-training metrics between two runs")]
struct Args {
    /// Path to the baseline metrics file (JSONL)
    #[arg(long)]
    baseline: PathBuf,

    /// Path to the current metrics file (JSONL)
    #[arg(long)]
    current: PathBuf,

    /// Maximum allowed loss deviation (absolute, bits)
    #[arg(long, default_value_t = 0.01)]
    tolerance: f64,

    /// Output comparison as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn print_comparison(comparison: &MetricsComparison) {
    println!("steps compared:        {:>12}", comparison.steps_compared);
    println!("tolerance:             {:>12.6}", comparison.tolerance);
    println!("max loss difference:   {:>12.6}", comparison.max_loss_diff);
    println!("  at step:             {:>12}", comparison.max_diff_step);
    println!("mean loss difference:  {:>12.6}", comparison.mean_loss_diff);
    println!("final loss difference: {:>12.6}", comparison.final_loss_diff);
    println!("max kl difference:     {:>12.6}", comparison.max_kl_diff);
    println!(
        "status:                {:>12}",
        if comparison.passed { "PASSED" } else { "FAILED" }
    );
}

fn print_trajectory(baseline: &[StepMetrics], current: &[StepMetrics]) {
    println!();
    println!("{:>8} {:>12} {:>12} {:>12} {:>10}", "step", "baseline", "current", "diff", "noise");
    for b in baseline {
        let Some(c) = current.iter().find(|m| m.step == b.step) else {
            continue;
        };
        let noise = c
            .noise_rate
            .map(|rate| format!("{rate:.3}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>8} {:>12.6} {:>12.6} {:>+12.6} {:>10}",
            b.step,
            b.loss,
            c.loss,
            c.loss - b.loss,
            noise
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let baseline = load_metrics(&args.baseline)
        .with_context(|| format!("Failed to load baseline metrics from {:?}", args.baseline))?;
    if baseline.is_empty() {
        anyhow::bail!("Baseline metrics file is empty");
    }

    let current = load_metrics(&args.current)
        .with_context(|| format!("Failed to load current metrics from {:?}", args.current))?;
    if current.is_empty() {
        anyhow::bail!("Current metrics file is empty");
    }

    let comparison = compare_metrics(&baseline, &current, args.tolerance);

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&comparison)
                .context("Failed to serialize comparison to JSON")?
        );
    } else {
        print_comparison(&comparison);
        print_trajectory(&baseline, &current);
    }

    if !comparison.passed {
        std::process::exit(1);
    }

    Ok(())
}
