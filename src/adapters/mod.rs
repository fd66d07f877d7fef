//! Adapters Layer - External System Implementations
//!
//! This module contains implementations of the port traits and the outer
//! surfaces of the crate:
//! - CSV: table loading, run output and simulated-table export
//! - Cache: TTL memoization over any `TableSource`
//! - CLI: Command-line interface handlers

pub mod cache;
pub mod cli;
pub mod csv;

pub use self::cache::{CacheStats, CachedTableSource, TableCache};
pub use self::cli::CliApp;
pub use self::csv::{CsvSchema, CsvTableSource, RunWriter};
