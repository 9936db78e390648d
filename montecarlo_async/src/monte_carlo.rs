use log::{debug, warn};
use montecarlo::task::run_task;
use montecarlo::{
    aggregate, EstimateError, EstimateResult, FailureCause, PartitionPlan, Sampler, TaskFailure,
    TaskState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tokio::time::{self, Instant};

/// Runs every task of `plan` on the blocking pool and aggregates the outcome.
///
/// Sampling is CPU bound, so each task gets a blocking thread rather than an
/// async task. Tasks still running when `timeout` expires are detached and
/// reported as cancelled.
pub async fn estimate_async(
    plan: &PartitionPlan,
    sampler: Arc<dyn Sampler>,
    timeout: Option<Duration>,
) -> Result<EstimateResult, EstimateError> {
    let mut handles = Vec::with_capacity(plan.len());

    for task in plan.tasks() {
        let task = *task;
        let sampler = Arc::clone(&sampler);
        let handle = spawn_blocking(move || run_task(sampler.as_ref(), &task));
        handles.push(handle);
    }

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut states = Vec::with_capacity(plan.len());

    for (task, handle) in plan.tasks().iter().zip(handles) {
        let joined = match deadline {
            Some(deadline) => match time::timeout_at(deadline, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("task {} still running at the deadline", task.index());
                    states.push(TaskState::Failed(TaskFailure::new(
                        task.index(),
                        FailureCause::Cancelled,
                    )));
                    continue;
                }
            },
            None => handle.await,
        };

        let state = match joined {
            Ok(state) => state,
            Err(e) => TaskState::Failed(TaskFailure::new(
                task.index(),
                FailureCause::Panicked(e.to_string()),
            )),
        };
        debug!("task {} finished: {:?}", task.index(), state);
        states.push(state);
    }

    aggregate(plan, states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use montecarlo::strategy::ThreadStrategy;
    use montecarlo::{estimate, plan, QuarterCircle, SampleError, SamplingTask, TaskResult};

    #[tokio::test]
    async fn test_matches_threaded_engine() {
        let plan = plan(120_000, 4).unwrap();
        let pooled = estimate_async(&plan, Arc::new(QuarterCircle), None).await.unwrap();
        let threaded = estimate(&plan, &ThreadStrategy::new(), Arc::new(QuarterCircle)).unwrap();
        assert_eq!(pooled, threaded);
    }

    #[tokio::test]
    async fn test_failed_task_is_reported() {
        let plan = plan(40_000, 4).unwrap();
        let sampler = |task: &SamplingTask| -> Result<TaskResult, SampleError> {
            if task.index() == 0 {
                return Err(SampleError::new("bad seed"));
            }
            QuarterCircle.sample(task)
        };

        let err = estimate_async(&plan, Arc::new(sampler), None).await.unwrap_err();
        assert!(matches!(err, EstimateError::PartialFailure { .. }));
        assert_eq!(err.failed_indices(), vec![0]);
    }

    #[tokio::test]
    async fn test_timeout_cancels_stalled_task() {
        let plan = plan(2_000, 2).unwrap();
        let sampler = |task: &SamplingTask| -> Result<TaskResult, SampleError> {
            if task.index() == 1 {
                std::thread::sleep(Duration::from_millis(300));
            }
            QuarterCircle.sample(task)
        };

        let err = estimate_async(&plan, Arc::new(sampler), Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, EstimateError::Cancelled { .. }));
        assert_eq!(err.failed_indices(), vec![1]);
    }
}
