//! Rank-per-worker execution merged through a reduce-to-root collective.
//!
//! Each rank runs the task at its own rank index, waits at a barrier and then
//! contributes a vector of `3 * size` counters: hits, samples and a failure
//! flag in its own triple, zeros everywhere else. The element-wise sum held
//! by rank 0 therefore carries every rank's outcome.

use super::ExecutionStrategy;
use crate::codec::{self, CodecError};
use crate::engine::{aggregate, EstimateResult};
use crate::error::EstimateError;
use crate::partition::{PartitionPlan, SamplingTask};
use crate::sampler::Sampler;
use crate::task::{panic_message, run_task, FailureCause, TaskFailure, TaskResult, TaskState};
use bytes::Bytes;
use log::{debug, warn};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier};
use std::thread;
use thiserror::Error;

const ROOT: usize = 0;
const SLOT_WIDTH: usize = 3;

#[derive(Error, Debug)]
pub enum CommError {
    #[error("rank {0} lost its connection to the group")]
    Disconnected(usize),
    #[error("rank {rank} contributed {actual} values, expected {expected}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        actual: usize,
    },
    #[error("reduced value overflows u64")]
    Overflow,
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
}

/// What an external message-passing substrate must provide.
pub trait Communicator: Send {
    /// Position of this participant, `0..size()`.
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) -> Result<(), CommError>;

    /// Element-wise sum of `values` over all ranks, returned to rank 0 only.
    fn reduce_sum(&self, values: &[u64]) -> Result<Option<Vec<u64>>, CommError>;
}

/// In-process group of ranks connected by channels that carry encoded frames.
pub struct LocalCluster;

impl LocalCluster {
    /// One communicator per rank; hand each to its own thread.
    pub fn create(size: usize) -> Vec<ChannelCommunicator> {
        let barrier = Arc::new(Barrier::new(size));
        let (tx, rx) = mpsc::channel();
        let mut inbox = Some(rx);

        (0..size)
            .map(|rank| ChannelCommunicator {
                rank,
                size,
                barrier: Arc::clone(&barrier),
                outbox: (rank != ROOT).then(|| tx.clone()),
                inbox: if rank == ROOT { inbox.take() } else { None },
            })
            .collect()
    }
}

pub struct ChannelCommunicator {
    rank: usize,
    size: usize,
    barrier: Arc<Barrier>,
    outbox: Option<Sender<Bytes>>,
    inbox: Option<Receiver<Bytes>>,
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.barrier.wait();
        Ok(())
    }

    fn reduce_sum(&self, values: &[u64]) -> Result<Option<Vec<u64>>, CommError> {
        if let Some(outbox) = &self.outbox {
            outbox
                .send(codec::encode_frame(self.rank, values)?)
                .map_err(|_| CommError::Disconnected(self.rank))?;
            return Ok(None);
        }

        let inbox = self.inbox.as_ref().ok_or(CommError::Disconnected(self.rank))?;
        let mut sum = values.to_vec();
        for _ in 1..self.size {
            let frame = inbox.recv().map_err(|_| CommError::Disconnected(self.rank))?;
            let (from, contribution) = codec::decode_frame(&frame)?;
            if contribution.len() != sum.len() {
                return Err(CommError::LengthMismatch {
                    rank: from,
                    expected: sum.len(),
                    actual: contribution.len(),
                });
            }
            for (acc, value) in sum.iter_mut().zip(contribution) {
                *acc = acc.checked_add(value).ok_or(CommError::Overflow)?;
            }
        }
        Ok(Some(sum))
    }
}

/// Runs this rank's share of `tasks` and merges at the root.
///
/// Returns the per-task states at rank 0 and `None` elsewhere.
fn run_ranked<C>(
    comm: &C,
    tasks: &[SamplingTask],
    sampler: &dyn Sampler,
) -> Result<Option<Vec<TaskState>>, EstimateError>
where
    C: Communicator + ?Sized,
{
    if comm.size() != tasks.len() {
        return Err(EstimateError::InvalidArgument(format!(
            "{} ranks for {} tasks",
            comm.size(),
            tasks.len()
        )));
    }
    let rank = comm.rank();
    let task = tasks.get(rank).ok_or_else(|| {
        EstimateError::InvalidArgument(format!("rank {} outside group of {}", rank, comm.size()))
    })?;

    let mut contribution = vec![0u64; SLOT_WIDTH * tasks.len()];
    let slot = SLOT_WIDTH * rank;
    match run_task(sampler, task) {
        TaskState::Completed(result) => {
            contribution[slot] = result.hit_count();
            contribution[slot + 1] = result.sample_count();
        }
        state => {
            warn!("rank {}: {:?}", rank, state);
            contribution[slot + 2] = 1;
        }
    }

    comm.barrier()?;
    let Some(reduced) = comm.reduce_sum(&contribution)? else {
        return Ok(None);
    };
    debug!("rank {} reduced {} counters", rank, reduced.len());

    if reduced.len() != contribution.len() {
        return Err(EstimateError::AggregationMismatch(format!(
            "reduce returned {} counters, expected {}",
            reduced.len(),
            contribution.len()
        )));
    }

    let states = tasks
        .iter()
        .zip(reduced.chunks_exact(SLOT_WIDTH))
        .map(|(task, counters)| match counters {
            [_, _, failed] if *failed != 0 => {
                TaskState::Failed(TaskFailure::new(task.index(), FailureCause::Remote))
            }
            [hits, samples, _] => TaskState::Completed(TaskResult::new(*hits, *samples)),
            _ => TaskState::Failed(TaskFailure::new(task.index(), FailureCause::Lost)),
        })
        .collect();

    Ok(Some(states))
}

/// Entry point for one rank of a multi-host run.
///
/// Every rank calls this with the same plan; rank 0 gets the estimate, the
/// others `None` once their contribution has been sent.
pub fn run_rank<C>(
    comm: &C,
    plan: &PartitionPlan,
    sampler: &dyn Sampler,
) -> Result<Option<EstimateResult>, EstimateError>
where
    C: Communicator + ?Sized,
{
    match run_ranked(comm, plan.tasks(), sampler)? {
        Some(states) => aggregate(plan, states).map(Some),
        None => Ok(None),
    }
}

/// Simulates a rank group on local threads through [`LocalCluster`].
///
/// Ranks share nothing with the caller but the sampler: each one decodes its
/// own copy of the plan from the encoded form a remote rank would receive.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistributedStrategy;

impl DistributedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionStrategy for DistributedStrategy {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn run_all(&self, tasks: &[SamplingTask], sampler: Arc<dyn Sampler>) -> Vec<TaskState> {
        let fail_all = |cause: FailureCause| -> Vec<TaskState> {
            tasks
                .iter()
                .map(|task| TaskState::Failed(TaskFailure::new(task.index(), cause.clone())))
                .collect()
        };

        let wire = match PartitionPlan::from_tasks(tasks.to_vec())
            .and_then(|plan| codec::encode_plan(&plan).map_err(EstimateError::from))
        {
            Ok(wire) => wire,
            Err(e) => return fail_all(FailureCause::Communication(e.to_string())),
        };

        let comms = LocalCluster::create(tasks.len());
        let sampler = sampler.as_ref();

        thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let wire = wire.clone();
                    scope.spawn(move || -> Result<_, EstimateError> {
                        let plan = codec::decode_plan(&wire)?;
                        run_ranked(&comm, plan.tasks(), sampler)
                    })
                })
                .collect();

            let mut root_states = None;
            for (rank, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(Ok(Some(states))) => root_states = Some(Ok(states)),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        warn!("rank {} failed: {}", rank, e);
                        if rank == ROOT {
                            root_states = Some(Err(FailureCause::Communication(e.to_string())));
                        }
                    }
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        warn!("rank {} panicked: {}", rank, msg);
                        if rank == ROOT {
                            root_states = Some(Err(FailureCause::Panicked(msg)));
                        }
                    }
                }
            }

            match root_states {
                Some(Ok(states)) => states,
                Some(Err(cause)) => fail_all(cause),
                None => fail_all(FailureCause::Lost),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::estimate;
    use crate::partition::plan;
    use crate::sampler::{QuarterCircle, SampleError};
    use crate::strategy::threads::ThreadStrategy;

    #[test]
    fn test_reduce_sums_at_root_only() {
        let comms = LocalCluster::create(3);
        let results: Vec<Option<Vec<u64>>> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        comm.barrier().unwrap();
                        let rank = comm.rank() as u64;
                        comm.reduce_sum(&[1, rank, 10 * rank]).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results[0], Some(vec![3, 3, 30]));
        assert_eq!(results[1], None);
        assert_eq!(results[2], None);
    }

    #[test]
    fn test_reduce_rejects_mismatched_lengths() {
        let mut comms = LocalCluster::create(2);
        let worker = comms.pop().unwrap();
        let root = comms.pop().unwrap();
        let outcome = thread::scope(|scope| {
            let sender = scope.spawn(move || worker.reduce_sum(&[1, 2]).unwrap());
            let reduced = root.reduce_sum(&[1, 2, 3]);
            sender.join().unwrap();
            reduced
        });
        assert!(matches!(
            outcome,
            Err(CommError::LengthMismatch {
                rank: 1,
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_matches_in_process_estimate() {
        let plan = plan(90_001, 3).unwrap();
        let threaded = estimate(&plan, &ThreadStrategy::new(), Arc::new(QuarterCircle)).unwrap();
        let ranked = estimate(&plan, &DistributedStrategy::new(), Arc::new(QuarterCircle)).unwrap();
        assert_eq!(threaded, ranked);
    }

    #[test]
    fn test_failed_rank_is_identified() {
        let plan = plan(8_000, 4).unwrap();
        let sampler = |task: &SamplingTask| -> Result<TaskResult, SampleError> {
            if task.index() == 3 {
                return Err(SampleError::new("rank down"));
            }
            QuarterCircle.sample(task)
        };
        let err = estimate(&plan, &DistributedStrategy::new(), Arc::new(sampler)).unwrap_err();
        assert!(matches!(err, EstimateError::PartialFailure { .. }));
        assert_eq!(err.failed_indices(), vec![3]);
    }

    #[test]
    fn test_run_rank_returns_estimate_at_root() {
        let plan = plan(20_000, 4).unwrap();
        let comms = LocalCluster::create(4);
        let outcomes: Vec<Option<EstimateResult>> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let plan = &plan;
                    scope.spawn(move || run_rank(&comm, plan, &QuarterCircle).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let root = outcomes[0].expect("root holds the estimate");
        assert_eq!(root.total_samples(), 20_000);
        assert!(outcomes[1..].iter().all(Option::is_none));
    }

    #[test]
    fn test_ranks_rebuild_a_retry_plan() {
        let retry = plan(9_000, 3).unwrap().subplan(&[0, 2]).unwrap();
        let ranked = DistributedStrategy::new().run_all(retry.tasks(), Arc::new(QuarterCircle));
        let threaded = ThreadStrategy::new().run_all(retry.tasks(), Arc::new(QuarterCircle));
        assert_eq!(ranked, threaded);
        assert!(ranked.iter().all(|state| matches!(state, TaskState::Completed(_))));
    }

    #[test]
    fn test_group_size_must_match_plan() {
        let plan = plan(100, 2).unwrap();
        let comms = LocalCluster::create(3);
        assert!(matches!(
            run_rank(&comms[0], &plan, &QuarterCircle),
            Err(EstimateError::InvalidArgument(_))
        ));
    }
}
