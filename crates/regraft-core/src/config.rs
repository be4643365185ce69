use crate::error::{EngineError, ErrorOrigin};
use serde::{Deserialize, Serialize};
use std::{env, thread};

/// Environment override for the batch-executor worker count.
pub const MAX_WORKERS_ENV: &str = "REGRAFT_MAX_WORKERS";

/// Tables whose id span does not exceed this run as a single statement.
pub const DEFAULT_SMALL_TABLE_THRESHOLD: i64 = 10_000;

const MAX_DEFAULT_WORKERS: usize = 8;

///
/// EngineConfig
///
/// Tunables for one migration run. Worker count only buys I/O concurrency;
/// nothing in the engine is CPU-bound beyond statement templating.
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineConfig {
    pub max_workers: usize,
    pub small_table_threshold: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            small_table_threshold: DEFAULT_SMALL_TABLE_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Build a config honoring the `REGRAFT_MAX_WORKERS` override.
    /// A non-numeric override is a configuration bug, not a fallback case.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut config = Self::default();
        if let Ok(raw) = env::var(MAX_WORKERS_ENV) {
            let workers: usize = raw.parse().map_err(|_| {
                EngineError::invariant(
                    ErrorOrigin::Session,
                    format!("wrong parameter: {MAX_WORKERS_ENV} should be an integer, got '{raw}'"),
                )
            })?;
            config.max_workers = workers.max(1);
        }
        Ok(config)
    }

    #[must_use]
    pub const fn with_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    #[must_use]
    pub const fn with_small_table_threshold(mut self, threshold: i64) -> Self {
        self.small_table_threshold = threshold;
        self
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .clamp(1, MAX_DEFAULT_WORKERS)
}
