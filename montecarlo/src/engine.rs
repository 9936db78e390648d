use crate::error::EstimateError;
use crate::partition::PartitionPlan;
use crate::sampler::Sampler;
use crate::strategy::ExecutionStrategy;
use crate::task::{FailureCause, TaskFailure, TaskResult, TaskState};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

/// Running sums of hits and samples over completed tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub hits: u64,
    pub samples: u64,
}

impl Tally {
    pub fn checked_add(self, result: &TaskResult) -> Option<Tally> {
        Some(Tally {
            hits: self.hits.checked_add(result.hit_count())?,
            samples: self.samples.checked_add(result.sample_count())?,
        })
    }
}

/// Sums results in any order. `None` on overflow.
pub fn sum_results<'a, I>(results: I) -> Option<Tally>
where
    I: IntoIterator<Item = &'a TaskResult>,
{
    results
        .into_iter()
        .try_fold(Tally::default(), |tally, result| tally.checked_add(result))
}

/// Final ratio estimate over every sample of a plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimateResult {
    value: f64,
    total_samples: u64,
    total_hits: u64,
}

impl EstimateResult {
    pub fn from_tally(tally: Tally) -> Result<Self, EstimateError> {
        if tally.samples == 0 {
            return Err(EstimateError::AggregationMismatch(
                "no samples to estimate from".to_string(),
            ));
        }
        if tally.hits > tally.samples {
            return Err(EstimateError::AggregationMismatch(format!(
                "{} hits out of {} samples",
                tally.hits, tally.samples
            )));
        }

        Ok(Self {
            value: 4.0 * tally.hits as f64 / tally.samples as f64,
            total_samples: tally.samples,
            total_hits: tally.hits,
        })
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn total_hits(&self) -> u64 {
        self.total_hits
    }

    pub fn abs_error(&self) -> f64 {
        (std::f64::consts::PI - self.value).abs()
    }
}

/// Runs every task of `plan` under `strategy` and aggregates the outcome.
///
/// Blocks until all tasks have completed or failed.
pub fn estimate(
    plan: &PartitionPlan,
    strategy: &dyn ExecutionStrategy,
    sampler: Arc<dyn Sampler>,
) -> Result<EstimateResult, EstimateError> {
    info!(
        "estimating over {} samples with {} {} workers",
        plan.total_samples(),
        plan.len(),
        strategy.name()
    );

    let start = Instant::now();
    let states = strategy.run_all(plan.tasks(), sampler);
    debug!("{} workers finished in {:?}", strategy.name(), start.elapsed());

    aggregate(plan, states)
}

/// Reconciles per-task states with the plan and combines completed results.
///
/// Any failed or unfinished task turns the whole estimate into an error.
pub fn aggregate(
    plan: &PartitionPlan,
    states: Vec<TaskState>,
) -> Result<EstimateResult, EstimateError> {
    if states.len() != plan.len() {
        return Err(EstimateError::AggregationMismatch(format!(
            "{} task states for a plan of {} tasks",
            states.len(),
            plan.len()
        )));
    }

    let mut failures = Vec::new();
    let mut completed = Tally::default();

    for (task, state) in plan.tasks().iter().zip(states) {
        match state {
            TaskState::Completed(result) => {
                if result.sample_count() != task.sample_count() || !result.is_consistent() {
                    return Err(EstimateError::AggregationMismatch(format!(
                        "task {} returned {} hits over {} samples, planned {}",
                        task.index(),
                        result.hit_count(),
                        result.sample_count(),
                        task.sample_count()
                    )));
                }
                completed = completed.checked_add(&result).ok_or_else(|| {
                    EstimateError::AggregationMismatch("sample totals overflow u64".to_string())
                })?;
            }
            TaskState::Failed(failure) => {
                warn!("{}", failure);
                failures.push(failure);
            }
            TaskState::Pending | TaskState::Running => {
                failures.push(TaskFailure::new(task.index(), FailureCause::Lost));
            }
        }
    }

    if !failures.is_empty() {
        if failures.iter().all(|failure| failure.cause.is_cancellation()) {
            return Err(EstimateError::Cancelled {
                indices: failures.iter().map(|failure| failure.index).collect(),
                completed,
            });
        }
        return Err(EstimateError::PartialFailure {
            failures,
            completed,
            planned: plan.len(),
        });
    }

    if completed.samples != plan.total_samples() {
        return Err(EstimateError::AggregationMismatch(format!(
            "aggregated {} samples, plan requested {}",
            completed.samples,
            plan.total_samples()
        )));
    }

    EstimateResult::from_tally(completed)
}
