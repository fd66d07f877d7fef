//! CLI Command Handlers
//!
//! Implementation of all CLI commands for causify.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::adapters::cache::{CachedTableSource, TableCache};
use crate::adapters::csv::{write_table, CsvSchema, CsvTableSource, RunWriter};
use crate::application::pipeline::{AnalysisConfig, AnalysisPipeline, AnalysisReport, MatchingStatus};
use crate::config::{expand_path, load_config, Config};
use crate::domain::{simulate_experiment, SimulationConfig};
use crate::estimators::hypothesis::{HypothesisTester, ProportionTestResult};
use crate::ports::TableSource;

/// Causify - causal analysis of randomized booking experiments
#[derive(Parser, Debug)]
#[command(
    name = "causify",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "CUPED, propensity matching and X-learner uplift for booking experiments",
    long_about = "Causify reads a unit-level experiment table, tests the booking lift, \
                  reduces variance with CUPED, checks covariate balance with propensity \
                  matching, scores per-unit uplift and writes a reconciled dashboard table."
)]
pub struct CliApp {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the full analysis pipeline
    Run(RunCmd),

    /// Two-proportion test only
    Ztest(ZtestCmd),

    /// Write a synthetic experiment CSV
    Simulate(SimulateCmd),

    /// Load and validate a configuration file
    CheckConfig(CheckConfigCmd),
}

/// Run the full pipeline
#[derive(Parser, Debug)]
pub struct RunCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/pipeline.toml")]
    pub config: PathBuf,

    /// Override the experiment CSV
    #[arg(long, value_name = "PATH")]
    pub data: Option<PathBuf>,

    /// Override the output directory
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Override the seed; repeat to run once per seed on the same snapshot
    #[arg(short, long, value_name = "N")]
    pub seed: Vec<u64>,

    /// Print the summary without writing output files
    #[arg(long)]
    pub no_write: bool,
}

/// Hypothesis test only
#[derive(Parser, Debug)]
pub struct ZtestCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/pipeline.toml")]
    pub config: PathBuf,

    /// Override the experiment CSV
    #[arg(long, value_name = "PATH")]
    pub data: Option<PathBuf>,

    /// Confidence level of the interval
    #[arg(long, value_name = "LEVEL", default_value = "0.95")]
    pub confidence: f64,

    /// Output format (text, json)
    #[arg(short, long, value_name = "FORMAT", default_value = "text")]
    pub format: String,
}

/// Generate a synthetic experiment
#[derive(Parser, Debug)]
pub struct SimulateCmd {
    /// Output CSV path
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Number of units
    #[arg(short, long, value_name = "N", default_value = "1000")]
    pub units: usize,

    /// Additive treatment lift on the booking probability
    #[arg(long, value_name = "F", default_value = "0.10")]
    pub lift: f64,

    /// Control booking rate
    #[arg(long, value_name = "F", default_value = "0.15")]
    pub base_rate: f64,

    /// Share of treated units
    #[arg(long, value_name = "F", default_value = "0.5")]
    pub treatment_rate: f64,

    /// Spread of the lift across the age range
    #[arg(long, value_name = "F", default_value = "0.0")]
    pub heterogeneity: f64,

    /// Effect of engagement on the booking probability
    #[arg(long, value_name = "F", default_value = "0.0")]
    pub prognostic: f64,

    /// Dependence of treatment assignment on engagement
    #[arg(long, value_name = "F", default_value = "0.0")]
    pub confounding: f64,

    /// Independent coin flips instead of a fixed treated count
    #[arg(long)]
    pub bernoulli: bool,

    /// Random seed
    #[arg(short, long, value_name = "N", default_value = "42")]
    pub seed: u64,
}

/// Validate configuration
#[derive(Parser, Debug)]
pub struct CheckConfigCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/pipeline.toml")]
    pub config: PathBuf,
}

/// Execute the CLI command
pub fn execute(command: Command) -> Result<()> {
    match command {
        Command::Run(cmd) => run_command(cmd),
        Command::Ztest(cmd) => ztest_command(cmd),
        Command::Simulate(cmd) => simulate_command(cmd),
        Command::CheckConfig(cmd) => check_config_command(cmd),
    }
}

fn load(path: &Path) -> Result<Config> {
    load_config(path).with_context(|| format!("Failed to load configuration {}", path.display()))
}

fn data_path(config: &Config, data: Option<&Path>) -> PathBuf {
    match data {
        Some(path) => expand_path(&path.to_string_lossy()),
        None => config.data.get_data_path(),
    }
}

/// Handle run command
fn run_command(cmd: RunCmd) -> Result<()> {
    let config = load(&cmd.config)?;
    let data = data_path(&config, cmd.data.as_deref());
    let output_dir = match &cmd.output_dir {
        Some(dir) => expand_path(&dir.to_string_lossy()),
        None => config.data.get_output_dir(),
    };
    let seeds = if cmd.seed.is_empty() {
        vec![config.run.seed]
    } else {
        cmd.seed.clone()
    };

    let source = CachedTableSource::with_cache(
        CsvTableSource::new(CsvSchema::from(&config)),
        TableCache::from(&config),
    );
    let writer = RunWriter::new(&output_dir, CsvSchema::from(&config));
    // One snapshot for every seed
    let as_of = Utc::now();

    for seed in seeds {
        tracing::info!("Starting run with seed {} on {}", seed, data.display());
        let table = source
            .load(&data, as_of)
            .with_context(|| format!("Failed to load {}", data.display()))?;

        let analysis = AnalysisConfig::from(&config.clone().with_seed(seed));
        let pipeline = AnalysisPipeline::new(analysis).context("Invalid analysis configuration")?;
        let report = pipeline
            .run(&table)
            .with_context(|| format!("Analysis of {} failed", data.display()))?;

        print_report(&report);

        if cmd.no_write {
            println!("  Output: skipped (--no-write)");
        } else {
            let run_dir = writer
                .write(&report)
                .with_context(|| format!("Failed to write run {}", report.run_id))?;
            println!("  Output: {}", run_dir.display());
        }
    }

    let stats = source.stats();
    tracing::debug!("Table cache: {} hits, {} misses", stats.hits, stats.misses);
    Ok(())
}

/// Handle ztest command
fn ztest_command(cmd: ZtestCmd) -> Result<()> {
    let config = load(&cmd.config)?;
    let data = data_path(&config, cmd.data.as_deref());
    let tester = HypothesisTester::new(cmd.confidence).context("Invalid confidence level")?;

    let table = CsvTableSource::new(CsvSchema::from(&config))
        .load(&data, Utc::now())
        .with_context(|| format!("Failed to load {}", data.display()))?;
    let result = tester.test_table(&table).context("Hypothesis test failed")?;

    match cmd.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        "text" => print_test(&result),
        other => bail!("Unknown output format '{}' (expected text or json)", other),
    }
    Ok(())
}

/// Handle simulate command
fn simulate_command(cmd: SimulateCmd) -> Result<()> {
    let sim = SimulationConfig {
        n_units: cmd.units,
        treatment_rate: cmd.treatment_rate,
        complete_randomization: !cmd.bernoulli,
        base_rate: cmd.base_rate,
        lift: cmd.lift,
        heterogeneity: cmd.heterogeneity,
        prognostic: cmd.prognostic,
        confounding: cmd.confounding,
        seed: cmd.seed,
    };
    let table = simulate_experiment(&sim).context("Invalid simulation settings")?;

    if let Some(parent) = cmd.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    write_table(&cmd.output, &table, &CsvSchema::default())
        .with_context(|| format!("Failed to write {}", cmd.output.display()))?;

    let (treated, control) = table.arm_counts();
    println!("✓ Simulated {} units ({} treated, {} control)", table.len(), treated, control);
    println!("  True lift: {:+.3}", cmd.lift);
    println!("  Written to: {}", cmd.output.display());
    Ok(())
}

/// Handle check-config command
fn check_config_command(cmd: CheckConfigCmd) -> Result<()> {
    let config = load(&cmd.config)?;
    let analysis = AnalysisConfig::from(&config);

    println!("✓ Configuration valid: {}", cmd.config.display());
    println!("  Data: {}", config.data.get_data_path().display());
    println!("  Output: {}", config.data.get_output_dir().display());
    println!("  Seed: {}", analysis.seed());
    println!(
        "  Matching: k={} caliper={} replacement={}",
        analysis.params.matching.n_neighbors,
        analysis.params.matching.caliper,
        analysis.params.matching.with_replacement
    );
    println!(
        "  Uplift: {} trees, depth {}, {} buckets",
        analysis.params.uplift.forest.n_trees,
        analysis.params.uplift.forest.max_depth,
        analysis.params.uplift.n_buckets
    );
    let segments: Vec<&str> = analysis.segments.iter().map(|s| s.name()).collect();
    println!("  Segments: {}", segments.join(", "));
    Ok(())
}

fn print_test(result: &ProportionTestResult) {
    println!("Two-proportion z-test ({:.0}% CI)", result.confidence_level * 100.0);
    println!(
        "  Treated: {}/{} = {:.4}",
        result.treated.successes, result.treated.n, result.treated.rate
    );
    println!(
        "  Control: {}/{} = {:.4}",
        result.control.successes, result.control.n, result.control.rate
    );
    println!(
        "  Effect:  {:+.4} [{:+.4}, {:+.4}]",
        result.effect_size, result.ci_lower, result.ci_upper
    );
    println!("  z = {:.3}, p = {:.4}, h = {:.3}", result.z_stat, result.p_value, result.cohens_h);
    println!(
        "  Result:  {:?} (evidence: {:?})",
        result.significance,
        result.evidence_strength()
    );
}

fn print_report(report: &AnalysisReport) {
    println!("┌─────────────────────────────────────┐");
    println!("│  Causify - Analysis Run             │");
    println!("└─────────────────────────────────────┘");
    println!("  Run: {}", report.run_id);
    println!("  Started: {}", format_time(report.started_at));
    println!("  Units: {} ({} analyzed)", report.input_rows, report.reconciled.len());
    println!();
    print_test(&report.hypothesis);
    println!();
    println!(
        "CUPED: variance {:.5} -> {:.5} ({:.1}% reduction), {} rows dropped",
        report.cuped.original_variance,
        report.cuped.adjusted_variance,
        report.cuped.variance_reduction_pct,
        report.cuped.dropped_rows
    );
    if let Some(reason) = &report.cuped.degenerate {
        println!("  Outcome left unadjusted: {}", reason);
    }
    println!(
        "  Adjusted effect: {:+.4} [{:+.4}, {:+.4}]",
        report.adjusted_test.difference, report.adjusted_test.ci_lower, report.adjusted_test.ci_upper
    );
    println!(
        "Propensity: mean {:.4}, range [{:.4}, {:.4}], balance {:.3}",
        report.propensity.mean,
        report.propensity.min,
        report.propensity.max,
        report.propensity.randomization_balance
    );
    match &report.matching {
        MatchingStatus::Matched(outcome) => {
            println!(
                "Matching: {} pairs ({:.1}% of treated), {} unique controls, ATE {:+.4}",
                outcome.n_matched(),
                outcome.match_rate() * 100.0,
                outcome.unique_controls(),
                outcome.ate
            );
            for b in &outcome.balance {
                println!(
                    "  {:<20} SMD {:+.3} -> {:+.3}{}",
                    b.covariate,
                    b.smd_before,
                    b.smd_after,
                    if b.well_balanced { "" } else { "  (imbalanced)" }
                );
            }
        }
        MatchingStatus::Insufficient { reason, .. } => {
            println!("Matching: insufficient ({})", reason);
        }
    }
    println!(
        "Uplift: validation n={}, predicted {:+.4} vs observed {:+.4}, performance {:.3} ({})",
        report.uplift.validation.n,
        report.uplift.validation.mean_predicted,
        report.uplift.validation.observed_effect,
        report.reconciled.globals.uplift_model_performance,
        report.reconciled.calibration_status
    );
    if let Some(top) = report.top_units.first() {
        println!(
            "  Highest uplift: {} ({:+.4})",
            top.id.clone().unwrap_or_else(|| format!("row {}", top.row)),
            top.score
        );
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
