use super::ExecutionStrategy;
use crate::partition::SamplingTask;
use crate::sampler::Sampler;
use crate::task::{run_task, FailureCause, TaskFailure, TaskState};
use log::{debug, warn};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Runs each task on its own OS thread inside this process.
///
/// Workers own their counters; only the calling thread writes the result
/// slots, one message at a time.
#[derive(Debug, Clone, Default)]
pub struct ThreadStrategy {
    timeout: Option<Duration>,
}

impl ThreadStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon workers still running after `timeout`; they are reported as cancelled.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl ExecutionStrategy for ThreadStrategy {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn run_all(&self, tasks: &[SamplingTask], sampler: Arc<dyn Sampler>) -> Vec<TaskState> {
        let mut slots = vec![TaskState::Pending; tasks.len()];
        let (tx, rx) = mpsc::channel::<(usize, TaskState)>();
        let mut handles = Vec::with_capacity(tasks.len());

        for (slot, task) in tasks.iter().enumerate() {
            let task = *task;
            let tx = tx.clone();
            let sampler = Arc::clone(&sampler);

            slots[slot] = TaskState::Running;
            let spawned = thread::Builder::new()
                .name(format!("montecarlo-worker-{}", task.index()))
                .spawn(move || {
                    let state = run_task(sampler.as_ref(), &task);
                    // The receiver is gone once the deadline passed.
                    let _ = tx.send((slot, state));
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    slots[slot] = TaskState::Failed(TaskFailure::new(
                        task.index(),
                        FailureCause::Spawn(e.to_string()),
                    ));
                }
            }
        }
        drop(tx);

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut outstanding = handles.len();
        let mut timed_out = false;

        while outstanding > 0 {
            let received = match deadline {
                Some(deadline) => {
                    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok((slot, state)) => {
                    debug!("worker {} finished: {:?}", slot, state);
                    slots[slot] = state;
                    outstanding -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("{} workers still running at the deadline", outstanding);
                    timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        drop(rx);

        for (slot, task) in slots.iter_mut().zip(tasks) {
            if !slot.is_terminal() {
                let cause = if timed_out {
                    FailureCause::Cancelled
                } else {
                    FailureCause::Lost
                };
                *slot = TaskState::Failed(TaskFailure::new(task.index(), cause));
            }
        }

        if !timed_out {
            for handle in handles {
                let _ = handle.join();
            }
        }

        slots
    }
}
