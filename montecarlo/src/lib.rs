//! Parallel Monte-Carlo estimation of pi.
//!
//! A sample budget is partitioned across workers with fixed seeds, every
//! worker counts its own hits, and the counts are summed once all workers
//! have finished. Where the workers run is decided by an
//! [`ExecutionStrategy`]: threads, child processes, or ranks merged through a
//! reduce-to-root collective.

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod partition;
pub mod sampler;
pub mod strategy;
pub mod task;

use log::info;
use std::sync::Arc;

pub use config::Config;
pub use engine::{aggregate, estimate, EstimateResult, Tally};
pub use error::EstimateError;
pub use partition::{plan, PartitionPlan, SamplingTask};
pub use sampler::{QuarterCircle, SampleError, Sampler};
pub use strategy::{ExecutionStrategy, StrategyKind};
pub use task::{FailureCause, TaskFailure, TaskResult, TaskState};

pub fn estimate_pi(
    total_samples: u64,
    worker_count: usize,
    strategy: StrategyKind,
) -> Result<EstimateResult, EstimateError> {
    let config = Config::new()
        .with_total_samples(total_samples)
        .with_worker_count(worker_count)
        .with_strategy(strategy);
    estimate_with(&config)
}

pub fn estimate_with(config: &Config) -> Result<EstimateResult, EstimateError> {
    config.validate()?;
    let plan = partition::plan(config.total_samples(), config.worker_count())?;
    let strategy = config.build_strategy()?;

    let result = engine::estimate(&plan, strategy.as_ref(), Arc::new(QuarterCircle))?;
    info!(
        "pi ~ {:.6} from {} of {} samples",
        result.value(),
        result.total_hits(),
        result.total_samples()
    );
    Ok(result)
}
