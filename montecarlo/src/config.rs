use crate::error::EstimateError;
use crate::strategy::process::{locate_worker_program, WORKER_PROGRAM_ENV};
use crate::strategy::{
    DistributedStrategy, ExecutionStrategy, ProcessStrategy, StrategyKind, ThreadStrategy,
};
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TOTAL_SAMPLES: u64 = 12_000_000;

static AVAILABLE_UNITS: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

/// Execution units reported by the host, queried once per process.
pub fn default_worker_count() -> usize {
    *AVAILABLE_UNITS
}

#[derive(Debug, Clone)]
pub struct Config {
    total_samples: u64,
    worker_count: usize,
    strategy: StrategyKind,
    timeout: Option<Duration>,
    worker_program: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            total_samples: DEFAULT_TOTAL_SAMPLES,
            worker_count: default_worker_count(),
            strategy: StrategyKind::default(),
            timeout: None,
            worker_program: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_total_samples(mut self, total_samples: u64) -> Self {
        self.total_samples = total_samples;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program started for each isolated-process worker.
    ///
    /// Without one, the `montecarlo` binary is located on first use and
    /// building the strategy fails if there is none.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn validate(&self) -> Result<(), EstimateError> {
        if self.total_samples < 1 {
            return Err(EstimateError::InvalidArgument(
                "total samples must be at least 1".to_string(),
            ));
        }
        if self.worker_count < 1 {
            return Err(EstimateError::InvalidArgument(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(EstimateError::Config("timeout must be positive".to_string()));
        }
        if self.timeout.is_some() && self.strategy == StrategyKind::Distributed {
            return Err(EstimateError::Config(
                "the distributed strategy does not support timeouts".to_string(),
            ));
        }
        Ok(())
    }

    pub fn build_strategy(&self) -> Result<Box<dyn ExecutionStrategy>, EstimateError> {
        Ok(match self.strategy {
            StrategyKind::InProcess => {
                let mut strategy = ThreadStrategy::new();
                if let Some(timeout) = self.timeout {
                    strategy = strategy.with_timeout(timeout);
                }
                Box::new(strategy)
            }
            StrategyKind::IsolatedProcess => {
                let program = match &self.worker_program {
                    Some(program) => program.clone(),
                    None => locate_worker_program().ok_or_else(|| {
                        EstimateError::Config(format!(
                            "no montecarlo worker program found; set {} or configure one",
                            WORKER_PROGRAM_ENV
                        ))
                    })?,
                };
                let mut strategy = ProcessStrategy::new(program);
                if let Some(timeout) = self.timeout {
                    strategy = strategy.with_timeout(timeout);
                }
                Box::new(strategy)
            }
            StrategyKind::Distributed => Box::new(DistributedStrategy::new()),
        })
    }
}
