//! Configuration Loader
//!
//! Loads and validates configuration from TOML files matching config/pipeline.toml.
//! Every section except `[data]` may be omitted and falls back to the
//! estimator defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::adapters::cache::TableCache;
use crate::adapters::csv::{
    CsvSchema, DEFAULT_ID_COLUMN, DEFAULT_OUTCOME_COLUMN, DEFAULT_TREATMENT_COLUMN,
};
use crate::application::pipeline::{AnalysisConfig, DEFAULT_TOP_N};
use crate::application::segments::{default_segments, SegmentRule};
use crate::estimators::params::{
    AnalysisParams, CupedConfig, ForestConfig, MatchingConfig, PropensityConfig, UpliftConfig,
    DEFAULT_SEED,
};

/// Overrides `[data] path`
pub const DATA_PATH_ENV: &str = "CAUSIFY_DATA_PATH";
/// Overrides `[data] output_dir`
pub const OUTPUT_DIR_ENV: &str = "CAUSIFY_OUTPUT_DIR";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main configuration structure matching config/pipeline.toml
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub data: DataSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub cuped: CupedSection,
    #[serde(default)]
    pub propensity: PropensitySection,
    #[serde(default)]
    pub matching: MatchingSection,
    #[serde(default)]
    pub uplift: UpliftSection,
    /// Omitted: age quintiles, activity and engagement levels
    #[serde(default = "default_segments")]
    pub segments: Vec<SegmentRule>,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Input table and output location
#[derive(Debug, Clone, Deserialize)]
pub struct DataSection {
    /// Experiment CSV (`~` is expanded)
    pub path: String,
    #[serde(default = "default_treatment_column")]
    pub treatment_column: String,
    #[serde(default = "default_outcome_column")]
    pub outcome_column: String,
    /// Empty string: the table has no unit id
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Covariate columns to load; omitted loads every other column
    #[serde(default)]
    pub covariates: Option<Vec<String>>,
    /// Run directories are created below this path
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_treatment_column() -> String {
    DEFAULT_TREATMENT_COLUMN.to_string()
}

fn default_outcome_column() -> String {
    DEFAULT_OUTCOME_COLUMN.to_string()
}

fn default_id_column() -> String {
    DEFAULT_ID_COLUMN.to_string()
}

fn default_output_dir() -> String {
    "output".to_string()
}

impl DataSection {
    /// Get data path with environment variable override
    /// Checks CAUSIFY_DATA_PATH env var first, falls back to config value
    pub fn get_data_path(&self) -> PathBuf {
        expand_path(std::env::var(DATA_PATH_ENV).ok().as_deref().unwrap_or(&self.path))
    }

    /// Get output directory with environment variable override
    /// Checks CAUSIFY_OUTPUT_DIR env var first, falls back to config value
    pub fn get_output_dir(&self) -> PathBuf {
        expand_path(
            std::env::var(OUTPUT_DIR_ENV)
                .ok()
                .as_deref()
                .unwrap_or(&self.output_dir),
        )
    }
}

/// Expand `~` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Run-wide settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Seed shared by the CUPED split and the uplift model
    pub seed: u64,
    /// Units listed in the top / bottom uplift rankings
    pub top_n: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            top_n: DEFAULT_TOP_N,
        }
    }
}

/// CUPED section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CupedSection {
    /// Share of rows used to estimate theta
    pub estimation_fraction: f64,
    pub covariates: Vec<String>,
}

impl Default for CupedSection {
    fn default() -> Self {
        let defaults = CupedConfig::default();
        Self {
            estimation_fraction: defaults.estimation_fraction,
            covariates: defaults.covariates,
        }
    }
}

/// Propensity model section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PropensitySection {
    pub covariates: Vec<String>,
    pub l2_penalty: f64,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for PropensitySection {
    fn default() -> Self {
        let defaults = PropensityConfig::default();
        Self {
            covariates: defaults.covariates,
            l2_penalty: defaults.l2_penalty,
            max_iter: defaults.max_iter,
            tolerance: defaults.tolerance,
        }
    }
}

/// Matching section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingSection {
    pub n_neighbors: usize,
    /// Maximum propensity distance (`inf` disables the caliper)
    pub caliper: f64,
    pub with_replacement: bool,
}

impl Default for MatchingSection {
    fn default() -> Self {
        let defaults = MatchingConfig::default();
        Self {
            n_neighbors: defaults.n_neighbors,
            caliper: defaults.caliper,
            with_replacement: defaults.with_replacement,
        }
    }
}

/// Uplift section, including the random forest base learner
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpliftSection {
    pub covariates: Vec<String>,
    pub test_fraction: f64,
    pub n_buckets: usize,
    pub clip_bound: f64,
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub max_features: Option<usize>,
}

impl Default for UpliftSection {
    fn default() -> Self {
        let defaults = UpliftConfig::default();
        Self {
            covariates: defaults.covariates,
            test_fraction: defaults.test_fraction,
            n_buckets: defaults.n_buckets,
            clip_bound: defaults.clip_bound,
            n_trees: defaults.forest.n_trees,
            max_depth: defaults.forest.max_depth,
            min_samples_leaf: defaults.forest.min_samples_leaf,
            max_features: defaults.forest.max_features,
        }
    }
}

/// Table cache section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: TableCache::DEFAULT_TTL.as_secs(),
            max_entries: TableCache::DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "data.path cannot be empty".to_string(),
            ));
        }

        if self.data.treatment_column == self.data.outcome_column {
            return Err(ConfigError::ValidationError(format!(
                "treatment and outcome must be different columns, both are '{}'",
                self.data.treatment_column
            )));
        }

        if self.run.top_n == 0 {
            return Err(ConfigError::ValidationError(
                "run.top_n must be > 0".to_string(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache.max_entries must be > 0".to_string(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of {:?}, got '{}'",
                LOG_LEVELS, self.logging.level
            )));
        }

        AnalysisParams::from(self)
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        for rule in &self.segments {
            rule.validate()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        let mut names: Vec<&str> = self.segments.iter().map(SegmentRule::name).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::ValidationError(format!(
                "segment '{}' is defined twice",
                dup[0]
            )));
        }

        Ok(())
    }

    /// Same configuration with a different seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.run.seed = seed;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}

// Conversion from Config to the typed estimator parameters
impl From<&Config> for AnalysisParams {
    fn from(config: &Config) -> Self {
        AnalysisParams {
            cuped: CupedConfig {
                estimation_fraction: config.cuped.estimation_fraction,
                covariates: config.cuped.covariates.clone(),
                seed: config.run.seed,
            },
            propensity: PropensityConfig {
                covariates: config.propensity.covariates.clone(),
                l2_penalty: config.propensity.l2_penalty,
                max_iter: config.propensity.max_iter,
                tolerance: config.propensity.tolerance,
            },
            matching: MatchingConfig {
                n_neighbors: config.matching.n_neighbors,
                caliper: config.matching.caliper,
                with_replacement: config.matching.with_replacement,
            },
            uplift: UpliftConfig {
                covariates: config.uplift.covariates.clone(),
                test_fraction: config.uplift.test_fraction,
                n_buckets: config.uplift.n_buckets,
                clip_bound: config.uplift.clip_bound,
                seed: config.run.seed,
                forest: ForestConfig {
                    n_trees: config.uplift.n_trees,
                    max_depth: config.uplift.max_depth,
                    min_samples_leaf: config.uplift.min_samples_leaf,
                    max_features: config.uplift.max_features,
                    bootstrap: true,
                },
            },
        }
    }
}

impl From<&Config> for AnalysisConfig {
    fn from(config: &Config) -> Self {
        AnalysisConfig {
            params: AnalysisParams::from(config),
            segments: config.segments.clone(),
            top_n: config.run.top_n,
        }
    }
}

impl From<&Config> for CsvSchema {
    fn from(config: &Config) -> Self {
        let id = config.data.id_column.trim();
        CsvSchema {
            treatment_column: config.data.treatment_column.clone(),
            outcome_column: config.data.outcome_column.clone(),
            id_column: (!id.is_empty()).then(|| id.to_string()),
            covariates: config.data.covariates.clone(),
        }
    }
}

impl From<&Config> for TableCache {
    fn from(config: &Config) -> Self {
        TableCache::with_config(config.cache_ttl(), config.cache.max_entries)
    }
}
