use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use ether_lab_simulator::scenario_runner;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared-bus ethernet contention simulator")]
struct Args {
    /// Scenario file to run.
    #[arg(long)]
    scenario: PathBuf,

    /// Write a JSON report of the finished run.
    #[arg(long)]
    report_out: Option<PathBuf>,

    /// Write the captured packet trace as text.
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Stop the run once the next event would land at or past this
    /// simulation time, in seconds. Overrides the scenario's own cap.
    #[arg(long)]
    until: Option<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    info!("ether-lab-sim starting…");

    let path = args
        .scenario
        .to_str()
        .context("Scenario path contains invalid UTF-8")?;
    let report = scenario_runner::run_scenario_file(path, args.until)?;

    println!(
        "{}: {} deliveries in {:.6} s",
        report.scenario,
        report.deliveries.len(),
        report.duration_secs
    );

    if let Some(path) = &args.report_out {
        let data = serde_json::to_vec_pretty(&report).context("Failed to serialize report")?;
        fs::write(path, &data)
            .with_context(|| format!("Failed to write report file {}", path.display()))?;
    }
    if let Some(path) = &args.trace_out {
        fs::write(path, report.trace.as_bytes())
            .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    }
    Ok(())
}
