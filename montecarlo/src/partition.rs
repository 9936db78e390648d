use crate::error::EstimateError;

/// One worker's share of a sampling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplingTask {
    index: usize,
    sample_count: u64,
    seed: u64,
}

impl SamplingTask {
    pub(crate) fn new(index: usize, sample_count: u64, seed: u64) -> Self {
        Self {
            index,
            sample_count,
            seed,
        }
    }

    /// Position of the worker within the plan it was created for.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

/// Ordered, immutable assignment of samples and seeds to workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    total_samples: u64,
    tasks: Vec<SamplingTask>,
}

impl PartitionPlan {
    /// Rebuilds a plan from decoded tasks, rejecting any that break the plan invariants.
    pub(crate) fn from_tasks(tasks: Vec<SamplingTask>) -> Result<Self, EstimateError> {
        if tasks.is_empty() {
            return Err(EstimateError::InvalidArgument(
                "a plan needs at least one task".to_string(),
            ));
        }

        let mut total_samples: u64 = 0;
        for task in &tasks {
            if task.sample_count == 0 {
                return Err(EstimateError::InvalidArgument(format!(
                    "task {} has no samples",
                    task.index
                )));
            }
            total_samples = total_samples.checked_add(task.sample_count).ok_or_else(|| {
                EstimateError::InvalidArgument("plan sample total overflows u64".to_string())
            })?;
        }

        Ok(Self {
            total_samples,
            tasks,
        })
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn tasks(&self) -> &[SamplingTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn seeds(&self) -> Vec<u64> {
        self.tasks.iter().map(SamplingTask::seed).collect()
    }

    pub fn sample_counts(&self) -> Vec<u64> {
        self.tasks.iter().map(SamplingTask::sample_count).collect()
    }

    /// Plan holding only the tasks with the given indices, seeds and counts unchanged.
    ///
    /// Used to rerun the workers that failed in an earlier attempt.
    pub fn subplan(&self, indices: &[usize]) -> Result<PartitionPlan, EstimateError> {
        let mut tasks = Vec::with_capacity(indices.len());
        for &index in indices {
            let task = self
                .tasks
                .iter()
                .find(|task| task.index == index)
                .ok_or_else(|| {
                    EstimateError::InvalidArgument(format!("no task with index {} in plan", index))
                })?;
            if tasks.iter().any(|t: &SamplingTask| t.index == index) {
                return Err(EstimateError::InvalidArgument(format!(
                    "task {} requested twice",
                    index
                )));
            }
            tasks.push(*task);
        }

        PartitionPlan::from_tasks(tasks)
    }
}

/// Splits `total_samples` across `worker_count` workers.
///
/// Every worker gets `total_samples / worker_count` samples and the first
/// `total_samples % worker_count` workers one more, so nothing is dropped.
/// Worker `i` is seeded with `i`.
///
/// Every worker must get at least one sample, so asking for more workers than
/// samples is an `InvalidArgument`. That includes the default worker count on
/// a budget smaller than the host's CPU count.
pub fn plan(total_samples: u64, worker_count: usize) -> Result<PartitionPlan, EstimateError> {
    if total_samples < 1 {
        return Err(EstimateError::InvalidArgument(
            "total samples must be at least 1".to_string(),
        ));
    }
    if worker_count < 1 {
        return Err(EstimateError::InvalidArgument(
            "worker count must be at least 1".to_string(),
        ));
    }
    if worker_count as u64 > total_samples {
        return Err(EstimateError::InvalidArgument(format!(
            "{} workers cannot share {} samples",
            worker_count, total_samples
        )));
    }

    let workers = worker_count as u64;
    let samples_per_worker = total_samples / workers;
    let remainder = total_samples % workers;

    let tasks = (0..worker_count)
        .map(|worker_id| {
            let extra = u64::from((worker_id as u64) < remainder);
            SamplingTask::new(worker_id, samples_per_worker + extra, worker_id as u64)
        })
        .collect();

    Ok(PartitionPlan {
        total_samples,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remainder_goes_to_first_workers() {
        let plan = plan(10, 4).unwrap();
        assert_eq!(plan.sample_counts(), vec![3, 3, 2, 2]);
        assert_eq!(plan.total_samples(), 10);
    }

    #[test]
    fn test_partition_covers_budget_exactly() {
        for total in 1..200u64 {
            for workers in 1..=total.min(17) as usize {
                let plan = plan(total, workers).unwrap();
                assert_eq!(plan.len(), workers);
                assert_eq!(plan.sample_counts().iter().sum::<u64>(), total);
                assert!(plan.tasks().iter().all(|t| t.sample_count() >= 1));
            }
        }
    }

    #[test]
    fn test_large_budget_coverage() {
        let plan = plan(12_000_001, 7).unwrap();
        assert_eq!(plan.sample_counts().iter().sum::<u64>(), 12_000_001);
    }

    #[test]
    fn test_seeds_are_worker_indices() {
        let first = plan(1_000, 6).unwrap();
        let second = plan(1_000, 6).unwrap();
        assert_eq!(first.seeds(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_out_of_domain_arguments() {
        assert!(matches!(plan(0, 4), Err(EstimateError::InvalidArgument(_))));
        assert!(matches!(plan(10, 0), Err(EstimateError::InvalidArgument(_))));
        assert!(matches!(plan(3, 4), Err(EstimateError::InvalidArgument(_))));
    }

    #[test]
    fn test_subplan_keeps_seeds_and_counts() {
        let plan = plan(10, 4).unwrap();
        let retry = plan.subplan(&[1, 3]).unwrap();
        assert_eq!(retry.seeds(), vec![1, 3]);
        assert_eq!(retry.sample_counts(), vec![3, 2]);
        assert_eq!(retry.total_samples(), 5);
        assert_eq!(retry.tasks()[1].index(), 3);
    }

    #[test]
    fn test_subplan_rejects_unknown_and_duplicate_indices() {
        let plan = plan(10, 4).unwrap();
        assert!(plan.subplan(&[4]).is_err());
        assert!(plan.subplan(&[2, 2]).is_err());
        assert!(plan.subplan(&[]).is_err());
    }
}
