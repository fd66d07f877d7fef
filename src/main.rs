//! Causify - Causal analysis of randomized booking experiments
//!
//! Command-line entry point.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use causify::adapters::cli;

fn main() -> Result<()> {
    // Load .env file if it exists (CAUSIFY_DATA_PATH, CAUSIFY_OUTPUT_DIR)
    dotenvy::dotenv().ok();

    let app = cli::init();
    init_logging(app.verbose, app.debug)?;

    cli::execute(app.command)
}

fn init_logging(verbose: bool, debug: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    fmt().with_env_filter(filter).with_target(false).init();
    Ok(())
}
