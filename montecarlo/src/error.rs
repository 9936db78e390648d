use crate::codec::CodecError;
use crate::engine::Tally;
use crate::strategy::distributed::CommError;
use crate::task::TaskFailure;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimateError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{} of {planned} tasks failed", .failures.len())]
    PartialFailure {
        failures: Vec<TaskFailure>,
        completed: Tally,
        planned: usize,
    },
    #[error("cancelled with tasks {indices:?} unfinished")]
    Cancelled { indices: Vec<usize>, completed: Tally },
    #[error("aggregation mismatch: {0}")]
    AggregationMismatch(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("communication error: {0}")]
    Comm(#[from] CommError),
}

impl EstimateError {
    /// Indices of the tasks that did not complete, if this error concerns tasks.
    pub fn failed_indices(&self) -> Vec<usize> {
        match self {
            EstimateError::PartialFailure { failures, .. } => {
                failures.iter().map(|failure| failure.index).collect()
            }
            EstimateError::Cancelled { indices, .. } => indices.clone(),
            _ => Vec::new(),
        }
    }
}
