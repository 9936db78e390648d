use super::ExecutionStrategy;
use crate::codec::{self, CodecError, FixedRecord};
use crate::partition::SamplingTask;
use crate::sampler::{SampleError, Sampler};
use crate::task::{FailureCause, TaskFailure, TaskResult, TaskState};
use log::{debug, warn};
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Bytes kept from each worker pipe; anything beyond is read and dropped.
const CAPTURE_LIMIT: u64 = 64 * 1024;

const WORKER_PROGRAM: &str = "montecarlo";

/// Overrides where [`locate_worker_program`] looks for the worker binary.
pub const WORKER_PROGRAM_ENV: &str = "MONTECARLO_WORKER_PROGRAM";

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("sampling failed: {0}")]
    Sample(#[from] SampleError),
}

/// Runs each task in a child process with no memory shared with the parent.
///
/// The child receives one encoded `SamplingTask` on stdin and must answer with
/// one encoded `TaskResult` on stdout (see [`serve_worker`]). Children sample
/// with their own built-in sampler, so the sampler handed to `run_all` is not
/// used.
#[derive(Debug, Clone)]
pub struct ProcessStrategy {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl ProcessStrategy {
    /// Workers are started as `program worker`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![OsString::from("worker")],
            timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Kill workers still running after `timeout`; they are reported as cancelled.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn spawn(&self, task: &SamplingTask) -> io::Result<RunningWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let started = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&codec::encode(task)),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin unavailable")),
        }
        .and_then(|()| {
            let stdout = spawn_reader(child.stdout.take())?;
            let stderr = spawn_reader(child.stderr.take())?;
            Ok((stdout, stderr))
        });

        match started {
            Ok((stdout, stderr)) => Ok(RunningWorker {
                child,
                stdout,
                stderr,
            }),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }
}

/// A started child with one thread draining each output pipe, so a chatty
/// worker never blocks on a full pipe while the parent waits for it to exit.
struct RunningWorker {
    child: Child,
    stdout: JoinHandle<io::Result<Vec<u8>>>,
    stderr: JoinHandle<io::Result<Vec<u8>>>,
}

impl RunningWorker {
    fn abandon(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> io::Result<JoinHandle<io::Result<Vec<u8>>>>
where
    R: Read + Send + 'static,
{
    let pipe =
        pipe.ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker pipe unavailable"))?;
    thread::Builder::new()
        .name("montecarlo-pipe".to_string())
        .spawn(move || drain(pipe))
}

fn drain<R: Read>(mut pipe: R) -> io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    pipe.by_ref().take(CAPTURE_LIMIT).read_to_end(&mut kept)?;
    io::copy(&mut pipe, &mut io::sink())?;
    Ok(kept)
}

fn join_reader(reader: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    reader
        .join()
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "pipe reader panicked")))
}

impl ExecutionStrategy for ProcessStrategy {
    fn name(&self) -> &'static str {
        "isolated-process"
    }

    fn run_all(&self, tasks: &[SamplingTask], _sampler: Arc<dyn Sampler>) -> Vec<TaskState> {
        let mut slots = vec![TaskState::Pending; tasks.len()];
        let mut children: Vec<Option<RunningWorker>> = Vec::with_capacity(tasks.len());

        for (slot, task) in tasks.iter().enumerate() {
            slots[slot] = TaskState::Running;
            match self.spawn(task) {
                Ok(worker) => {
                    debug!("worker {} started as pid {}", task.index(), worker.child.id());
                    children.push(Some(worker));
                }
                Err(e) => {
                    slots[slot] = TaskState::Failed(TaskFailure::new(
                        task.index(),
                        FailureCause::Spawn(format!("{}: {}", self.program.display(), e)),
                    ));
                    children.push(None);
                }
            }
        }

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            for (slot, (task, entry)) in tasks.iter().zip(children.iter_mut()).enumerate() {
                let Some(worker) = entry else { continue };
                match worker.child.try_wait() {
                    Ok(Some(status)) => {
                        if let Some(worker) = entry.take() {
                            slots[slot] = collect(task, worker, status);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if let Some(worker) = entry.take() {
                            worker.abandon();
                        }
                        slots[slot] = TaskState::Failed(TaskFailure::new(
                            task.index(),
                            FailureCause::Process(e.to_string()),
                        ));
                    }
                }
            }

            if children.iter().all(Option::is_none) {
                break;
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                for (slot, (task, entry)) in tasks.iter().zip(children.iter_mut()).enumerate() {
                    if let Some(worker) = entry.take() {
                        warn!("killing worker {} at the deadline", task.index());
                        worker.abandon();
                        slots[slot] =
                            TaskState::Failed(TaskFailure::new(task.index(), FailureCause::Cancelled));
                    }
                }
                break;
            }

            thread::sleep(POLL_INTERVAL);
        }

        slots
    }
}

fn collect(task: &SamplingTask, worker: RunningWorker, status: ExitStatus) -> TaskState {
    let fail = |cause| TaskState::Failed(TaskFailure::new(task.index(), cause));
    let stdout = join_reader(worker.stdout);
    let stderr = join_reader(worker.stderr).unwrap_or_default();

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr);
        return fail(FailureCause::Process(format!("{}: {}", status, stderr.trim())));
    }

    let reply = match stdout {
        Ok(reply) => reply,
        Err(e) => return fail(FailureCause::Process(e.to_string())),
    };

    match codec::decode::<TaskResult>(&reply) {
        Ok(result) if result.sample_count() == task.sample_count() => TaskState::Completed(result),
        Ok(result) => fail(FailureCause::Protocol(format!(
            "sampled {} of {} samples",
            result.sample_count(),
            task.sample_count()
        ))),
        Err(e) => fail(FailureCause::Protocol(e.to_string())),
    }
}

/// Finds the `montecarlo` binary that serves the `worker` subcommand.
///
/// `MONTECARLO_WORKER_PROGRAM` wins when set. Otherwise the binary is looked
/// up next to the running executable, then one directory up, which is where
/// cargo puts it relative to test binaries.
pub fn locate_worker_program() -> Option<PathBuf> {
    if let Some(program) = std::env::var_os(WORKER_PROGRAM_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(program));
    }
    let exe = std::env::current_exe().ok()?;
    worker_beside(&exe)
}

fn worker_beside(exe: &Path) -> Option<PathBuf> {
    let file_name = format!("{}{}", WORKER_PROGRAM, std::env::consts::EXE_SUFFIX);
    exe.parent()?
        .ancestors()
        .take(2)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
}

/// Worker side of [`ProcessStrategy`]: reads one task, samples it, writes one result.
pub fn serve_worker<R, W>(mut input: R, mut output: W, sampler: &dyn Sampler) -> Result<(), WorkerError>
where
    R: Read,
    W: Write,
{
    let mut request = [0u8; SamplingTask::LEN];
    input.read_exact(&mut request)?;
    let task: SamplingTask = codec::decode(&request)?;
    debug!("worker sampling {} points with seed {}", task.sample_count(), task.seed());

    let result = sampler.sample(&task)?;
    output.write_all(&codec::encode(&result))?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::plan;
    use crate::sampler::{count_hits, QuarterCircle};
    use std::io::Cursor;

    #[test]
    fn test_serve_worker_answers_one_task() {
        let plan = plan(5_000, 2).unwrap();
        let request = codec::encode(&plan.tasks()[1]);
        let mut reply = Vec::new();

        serve_worker(Cursor::new(request.to_vec()), &mut reply, &QuarterCircle).unwrap();

        let result: TaskResult = codec::decode(&reply).unwrap();
        assert_eq!(result, count_hits(2_500, 1));
    }

    #[test]
    fn test_serve_worker_rejects_short_request() {
        let mut reply = Vec::new();
        let err = serve_worker(Cursor::new(vec![0u8; 10]), &mut reply, &QuarterCircle).unwrap_err();
        assert!(matches!(err, WorkerError::Io(_)));
        assert!(reply.is_empty());
    }

    #[test]
    fn test_serve_worker_propagates_sampler_error() {
        let plan = plan(10, 1).unwrap();
        let request = codec::encode(&plan.tasks()[0]);
        let sampler = |_: &SamplingTask| -> Result<TaskResult, SampleError> {
            Err(SampleError::new("out of entropy"))
        };
        let err = serve_worker(Cursor::new(request.to_vec()), Vec::new(), &sampler).unwrap_err();
        assert!(matches!(err, WorkerError::Sample(_)));
    }

    #[test]
    fn test_missing_program_fails_every_task() {
        let plan = plan(100, 3).unwrap();
        let strategy = ProcessStrategy::new("/nonexistent/montecarlo-worker");
        let states = strategy.run_all(plan.tasks(), Arc::new(QuarterCircle));
        for (index, state) in states.iter().enumerate() {
            match state {
                TaskState::Failed(failure) => {
                    assert_eq!(failure.index, index);
                    assert!(matches!(failure.cause, FailureCause::Spawn(_)));
                }
                other => panic!("unexpected state {:?}", other),
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_flooding_stderr_is_a_process_failure() {
        let plan = plan(100, 1).unwrap();
        let strategy = ProcessStrategy::new("/bin/sh")
            .with_args(["-c", "head -c 200000 /dev/zero >&2; exit 1"])
            .with_timeout(Duration::from_secs(30));
        let states = strategy.run_all(plan.tasks(), Arc::new(QuarterCircle));
        match &states[0] {
            TaskState::Failed(failure) => {
                assert!(matches!(failure.cause, FailureCause::Process(_)), "{:?}", failure)
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_flooding_stdout_is_a_protocol_failure() {
        let plan = plan(100, 2).unwrap();
        let strategy = ProcessStrategy::new("/bin/sh")
            .with_args(["-c", "head -c 300000 /dev/zero"])
            .with_timeout(Duration::from_secs(30));
        let states = strategy.run_all(plan.tasks(), Arc::new(QuarterCircle));
        for state in &states {
            match state {
                TaskState::Failed(failure) => {
                    assert!(matches!(failure.cause, FailureCause::Protocol(_)), "{:?}", failure)
                }
                other => panic!("unexpected state {:?}", other),
            }
        }
    }

    #[test]
    fn test_worker_found_beside_or_above_executable() {
        let root = std::env::temp_dir().join(format!("montecarlo-locate-{}", std::process::id()));
        let deps = root.join("deps");
        std::fs::create_dir_all(&deps).unwrap();
        let binary = root.join(format!("montecarlo{}", std::env::consts::EXE_SUFFIX));
        std::fs::write(&binary, b"").unwrap();

        assert_eq!(worker_beside(&deps.join("process_strategy-0123")), Some(binary.clone()));
        assert_eq!(worker_beside(&root.join("montecarlo_async")), Some(binary));
        assert_eq!(worker_beside(&deps.join("deeper").join("tool")), None);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
