//! Runtime configuration, read once from the environment at startup.
//!
//! Generalises `mo-gc`'s `constants` module (which hard-coded its tuning
//! knobs) into values read once into a `Config` and threaded down by
//! reference, per §9.2 of the spec.

use std::env;
use std::sync::Arc;

use thiserror::Error;

/// Default young-generation promotion age (collections survived before
/// promotion to mature).
pub const PROMOTION_AGE: u8 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {name} must be a positive integer, got {value:?}")]
    InvalidCount { name: &'static str, value: String },
    #[error("environment variable {name} must be a positive number, got {value:?}")]
    InvalidFactor { name: &'static str, value: String },
}

/// All tunables documented in the spec's CLI surface (§6), collected once so
/// no component re-reads the environment itself.
#[derive(Debug, Clone)]
pub struct Config {
    pub process_threads: usize,
    pub blocking_threads: usize,
    pub tracer_threads: usize,
    pub young_threshold: usize,
    pub mature_threshold: usize,
    pub growth_factor: f64,
    pub reductions: usize,
    pub block_pool_chunk: usize,
    pub permanent_space_limit_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            process_threads: num_cpus::get().max(1),
            blocking_threads: 128,
            tracer_threads: num_cpus::get().max(1),
            young_threshold: 8,
            mature_threshold: 32,
            growth_factor: 1.5,
            reductions: 4096,
            block_pool_chunk: crate::block_pool::DEFAULT_CHUNK_BLOCKS,
            permanent_space_limit_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Reads the documented environment variables, falling back to defaults
    /// for anything unset. An invalid (non-numeric, or zero where a positive
    /// count is required) value is a hard configuration error.
    pub fn from_env() -> Result<Arc<Self>, ConfigError> {
        let defaults = Config::default();

        let process_threads = read_count("PROCESS_THREADS", defaults.process_threads)?;
        let blocking_threads = read_count("BLOCKING_THREADS", defaults.blocking_threads)?;
        let tracer_threads = read_count("TRACER_THREADS", defaults.tracer_threads)?;
        let young_threshold = read_count("YOUNG_THRESHOLD", defaults.young_threshold)?;
        let mature_threshold = read_count("MATURE_THRESHOLD", defaults.mature_threshold)?;
        let growth_factor = read_factor("GROWTH_FACTOR", defaults.growth_factor)?;
        let reductions = read_count("REDUCTIONS", defaults.reductions)?;

        Ok(Arc::new(Config {
            process_threads,
            blocking_threads,
            tracer_threads,
            young_threshold,
            mature_threshold,
            growth_factor,
            reductions,
            ..defaults
        }))
    }
}

fn read_count(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::InvalidCount { name, value }),
    }
}

fn read_factor(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse::<f64>()
            .ok()
            .filter(|f| *f > 1.0)
            .ok_or(ConfigError::InvalidFactor { name, value }),
    }
}
