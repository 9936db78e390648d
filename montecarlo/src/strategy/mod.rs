pub mod distributed;
pub mod process;
pub mod threads;

use crate::partition::SamplingTask;
use crate::sampler::Sampler;
use crate::task::TaskState;
use clap::ValueEnum;
use std::fmt;
use std::sync::Arc;

pub use distributed::{Communicator, DistributedStrategy, LocalCluster};
pub use process::ProcessStrategy;
pub use threads::ThreadStrategy;

/// How the workers of a plan are physically scheduled.
pub trait ExecutionStrategy {
    fn name(&self) -> &'static str;

    /// Runs every task and returns one terminal state per task, in task order.
    fn run_all(&self, tasks: &[SamplingTask], sampler: Arc<dyn Sampler>) -> Vec<TaskState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StrategyKind {
    /// One OS thread per worker
    #[default]
    InProcess,
    /// One child process per worker
    IsolatedProcess,
    /// One rank per worker, merged by reduce-to-root
    Distributed,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::InProcess => "in-process",
            StrategyKind::IsolatedProcess => "isolated-process",
            StrategyKind::Distributed => "distributed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip_through_clap() {
        for kind in StrategyKind::value_variants() {
            let parsed = StrategyKind::from_str(&kind.to_string(), false).unwrap();
            assert_eq!(&parsed, kind);
        }
    }
}
