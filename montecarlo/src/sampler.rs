use crate::partition::SamplingTask;
use crate::task::TaskResult;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SampleError(String);

impl SampleError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The per-worker sampling function.
///
/// Implementations must be a pure function of the task: the same task always
/// yields the same result, whichever worker runs it.
pub trait Sampler: Send + Sync {
    fn sample(&self, task: &SamplingTask) -> Result<TaskResult, SampleError>;
}

impl<F> Sampler for F
where
    F: Fn(&SamplingTask) -> Result<TaskResult, SampleError> + Send + Sync,
{
    fn sample(&self, task: &SamplingTask) -> Result<TaskResult, SampleError> {
        self(task)
    }
}

/// Counts uniform points of the unit square that land inside the quarter circle.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuarterCircle;

impl Sampler for QuarterCircle {
    fn sample(&self, task: &SamplingTask) -> Result<TaskResult, SampleError> {
        Ok(count_hits(task.sample_count(), task.seed()))
    }
}

pub fn count_hits(samples: u64, seed: u64) -> TaskResult {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut inside = 0u64;

    for _ in 0..samples {
        let x: f64 = rng.gen();
        let y: f64 = rng.gen();
        if x * x + y * y < 1.0 {
            inside += 1;
        }
    }

    TaskResult::new(inside, samples)
}
