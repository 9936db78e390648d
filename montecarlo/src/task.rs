use crate::partition::SamplingTask;
use crate::sampler::Sampler;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Hit count produced by one completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskResult {
    hit_count: u64,
    sample_count: u64,
}

impl TaskResult {
    pub fn new(hit_count: u64, sample_count: u64) -> Self {
        Self {
            hit_count,
            sample_count,
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// At least one sample and no more hits than samples.
    pub fn is_consistent(&self) -> bool {
        self.sample_count >= 1 && self.hit_count <= self.sample_count
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    #[error("sampler error: {0}")]
    Sampler(String),
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("could not start worker: {0}")]
    Spawn(String),
    #[error("worker process failed: {0}")]
    Process(String),
    #[error("malformed worker reply: {0}")]
    Protocol(String),
    #[error("rank reported a failed task")]
    Remote,
    #[error("communication failed: {0}")]
    Communication(String),
    #[error("worker exited without reporting")]
    Lost,
    #[error("cancelled")]
    Cancelled,
}

impl FailureCause {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FailureCause::Cancelled)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task {index} failed: {cause}")]
pub struct TaskFailure {
    pub index: usize,
    pub cause: FailureCause,
}

impl TaskFailure {
    pub fn new(index: usize, cause: FailureCause) -> Self {
        Self { index, cause }
    }
}

/// Lifecycle of a single task: `Pending -> Running -> Completed | Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed(TaskResult),
    Failed(TaskFailure),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed(_) | TaskState::Failed(_))
    }
}

/// Runs the sampler for one task, turning errors and panics into `Failed`.
pub fn run_task(sampler: &dyn Sampler, task: &SamplingTask) -> TaskState {
    match panic::catch_unwind(AssertUnwindSafe(|| sampler.sample(task))) {
        Ok(Ok(result)) => TaskState::Completed(result),
        Ok(Err(e)) => TaskState::Failed(TaskFailure::new(
            task.index(),
            FailureCause::Sampler(e.to_string()),
        )),
        Err(payload) => TaskState::Failed(TaskFailure::new(
            task.index(),
            FailureCause::Panicked(panic_message(payload.as_ref())),
        )),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
