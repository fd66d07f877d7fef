//! CLI Adapter
//!
//! Command-line interface for causify.
//! Uses clap derive macros for argument parsing.

mod commands;

pub use commands::{
    execute, CheckConfigCmd, CliApp, Command, RunCmd, SimulateCmd, ZtestCmd,
};

/// Initialize the CLI application
pub fn init() -> CliApp {
    use clap::Parser;
    CliApp::parse()
}
