//! Parallel dispatcher.
//!
//! Splits a catalog round-robin across N workers, launches one worker per
//! non-empty partition and polls them until all have finished. Each finished
//! worker is drained exactly once: its terminal summary line is parsed into
//! counts and added to the run total.
//!
//! # Workers
//!
//! | Launcher | Worker | Result artifact |
//! |----------|--------|-----------------|
//! | [`TaskLauncher`] | tokio task in this process | summary line + case results |
//! | [`ProcessLauncher`] | `fleetrun run --worker i/N` child process | summary file |
//!
//! Workers share nothing but the catalog: each bucketizes and runs its own
//! partition sequentially, with environment names suffixed `-w{i}`.
//!
//! # Failure
//!
//! A worker that cannot be launched, crashes, or leaves no summary line
//! counts as not completed. The dispatch then fails with
//! [`DispatchError::MissingWorkers`]; when all workers complete but report
//! fewer outcomes than expected it fails with
//! [`DispatchError::UnderReported`]. Both carry the partial result.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::runner::CaseRunner;
use super::scheduler::Scheduler;
use super::{Orchestrator, RunResult};
use crate::catalog::TestCase;
use crate::context::{RunContext, WorkerSlot};
use crate::outcome::{AggregateSummary, CaseResult, CleanupFailure, find_summary_line};
use crate::provider::Provider;
use crate::report::ResultSink;

/// Errors from launching, collecting or merging workers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to launch worker {slot}: {reason}")]
    Launch { slot: WorkerSlot, reason: String },

    #[error("worker {slot} failed: {reason}")]
    Worker { slot: WorkerSlot, reason: String },

    #[error("only {completed} of {launched} workers completed")]
    MissingWorkers {
        launched: usize,
        completed: usize,
        partial: Box<RunResult>,
    },

    #[error("workers reported {reported} outcomes, expected {expected}")]
    UnderReported {
        expected: usize,
        reported: usize,
        partial: Box<RunResult>,
    },
}

impl DispatchError {
    /// The merged result of the workers that did complete, if any.
    pub fn partial(&self) -> Option<&RunResult> {
        match self {
            DispatchError::MissingWorkers { partial, .. }
            | DispatchError::UnderReported { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// One worker's share of the catalog.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub slot: WorkerSlot,
    pub cases: Vec<TestCase>,
}

/// What a finished worker leaves behind.
#[derive(Debug, Clone, Default)]
pub struct WorkerArtifact {
    /// Free-text output ending in the terminal summary line.
    pub text: String,
    pub results: Vec<CaseResult>,
    pub cleanup_failures: Vec<CleanupFailure>,
}

/// Starts workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerHandle>, DispatchError>;
}

/// A running worker.
#[async_trait]
pub trait WorkerHandle: Send {
    fn slot(&self) -> WorkerSlot;

    /// Non-blocking liveness check.
    fn is_finished(&mut self) -> bool;

    /// Collects the artifact of a finished worker. Consumes the handle, so a
    /// worker can only be drained once.
    async fn collect(self: Box<Self>) -> Result<WorkerArtifact, DispatchError>;
}

/// Launches workers as tokio tasks sharing the provider, runner and sink.
pub struct TaskLauncher<P: ?Sized, R: ?Sized, S: ?Sized> {
    ctx: RunContext,
    provider: Arc<P>,
    runner: Arc<R>,
    sink: Arc<S>,
}

impl<P: ?Sized, R: ?Sized, S: ?Sized> TaskLauncher<P, R, S> {
    pub fn new(ctx: RunContext, provider: Arc<P>, runner: Arc<R>, sink: Arc<S>) -> Self {
        Self {
            ctx,
            provider,
            runner,
            sink,
        }
    }
}

#[async_trait]
impl<P, R, S> WorkerLauncher for TaskLauncher<P, R, S>
where
    P: Provider + ?Sized + 'static,
    R: CaseRunner + ?Sized + 'static,
    S: ResultSink + ?Sized + 'static,
{
    async fn launch(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerHandle>, DispatchError> {
        let orchestrator = Orchestrator::new(
            self.ctx.for_worker(spec.slot),
            self.provider.clone(),
            self.runner.clone(),
            self.sink.clone(),
        );
        let cases = spec.cases;
        let handle = tokio::spawn(async move { orchestrator.execute(&cases).await });
        Ok(Box::new(TaskHandle {
            slot: spec.slot,
            handle,
        }))
    }
}

struct TaskHandle {
    slot: WorkerSlot,
    handle: JoinHandle<RunResult>,
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    fn slot(&self) -> WorkerSlot {
        self.slot
    }

    fn is_finished(&mut self) -> bool {
        self.handle.is_finished()
    }

    async fn collect(self: Box<Self>) -> Result<WorkerArtifact, DispatchError> {
        let slot = self.slot;
        let result = self.handle.await.map_err(|e| DispatchError::Worker {
            slot,
            reason: e.to_string(),
        })?;
        let mut text = result.notes.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&result.summary.to_string());
        Ok(WorkerArtifact {
            text,
            results: result.results,
            cleanup_failures: result.cleanup_failures,
        })
    }
}

/// Launches workers as child processes of the current executable.
///
/// Each child re-reads the configuration, takes partition `i` of the same
/// catalog and writes its summary to a file under `work_dir`. Its console
/// output goes to `worker-{i}.log` next to it.
pub struct ProcessLauncher {
    program: PathBuf,
    base_args: Vec<String>,
    run_id: String,
    work_dir: PathBuf,
}

impl ProcessLauncher {
    /// `base_args` select the run subcommand and are passed before the worker
    /// arguments, e.g. `["--config", "fleetrun.toml", "run"]`.
    pub fn new(
        program: impl Into<PathBuf>,
        base_args: Vec<String>,
        run_id: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            base_args,
            run_id: run_id.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Uses the running executable as the worker program.
    pub fn current_exe(
        base_args: Vec<String>,
        run_id: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, base_args, run_id, work_dir))
    }

    fn summary_path(&self, slot: WorkerSlot) -> PathBuf {
        self.work_dir.join(format!("worker-{}.summary", slot.index))
    }

    fn log_path(&self, slot: WorkerSlot) -> PathBuf {
        self.work_dir.join(format!("worker-{}.log", slot.index))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerHandle>, DispatchError> {
        let slot = spec.slot;
        let launch_err = |reason: String| DispatchError::Launch { slot, reason };

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| launch_err(format!("{}: {}", self.work_dir.display(), e)))?;

        let summary_path = self.summary_path(slot);
        let log_path = self.log_path(slot);
        // A stale summary from an earlier run must not be read back.
        let _ = tokio::fs::remove_file(&summary_path).await;

        let log = std::fs::File::create(&log_path)
            .map_err(|e| launch_err(format!("{}: {}", log_path.display(), e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| launch_err(format!("{}: {}", log_path.display(), e)))?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--worker")
            .arg(slot.to_string())
            .arg("--run-id")
            .arg(&self.run_id)
            .arg("--summary-file")
            .arg(&summary_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        debug!("Launching worker {}: {:?}", slot, cmd);
        let child = cmd
            .spawn()
            .map_err(|e| launch_err(format!("{}: {}", self.program.display(), e)))?;

        info!(
            "Worker {} started ({} tests, log {})",
            slot,
            spec.cases.len(),
            log_path.display()
        );
        Ok(Box::new(ProcessHandle {
            slot,
            child,
            summary_path,
        }))
    }
}

struct ProcessHandle {
    slot: WorkerSlot,
    child: tokio::process::Child,
    summary_path: PathBuf,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn slot(&self) -> WorkerSlot {
        self.slot
    }

    fn is_finished(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn collect(self: Box<Self>) -> Result<WorkerArtifact, DispatchError> {
        let ProcessHandle {
            slot,
            mut child,
            summary_path,
        } = *self;
        let status = child.wait().await.map_err(|e| DispatchError::Worker {
            slot,
            reason: e.to_string(),
        })?;
        debug!("Worker {} exited with {}", slot, status);

        // Only the summary file counts. The log holds tracing output.
        let text = tokio::fs::read_to_string(&summary_path)
            .await
            .map_err(|e| DispatchError::Worker {
                slot,
                reason: format!(
                    "exited with {} and no summary file {}: {}",
                    status,
                    summary_path.display(),
                    e
                ),
            })?;

        Ok(WorkerArtifact {
            text,
            ..Default::default()
        })
    }
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Fans a catalog out to workers and merges their results.
pub struct ParallelDispatcher<L> {
    launcher: L,
    workers: usize,
    poll_interval: Duration,
}

impl<L: WorkerLauncher> ParallelDispatcher<L> {
    pub fn new(launcher: L, workers: usize) -> Self {
        Self {
            launcher,
            workers: workers.max(1),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Sets how often workers are polled. Clamped to at least a millisecond.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Runs `catalog` across the workers.
    ///
    /// `expected` is the number of outcomes the whole catalog must produce
    /// after expansion.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::MissingWorkers`] - a worker did not complete
    /// - [`DispatchError::UnderReported`] - fewer outcomes than `expected`
    pub async fn dispatch(
        &self,
        catalog: &[TestCase],
        expected: usize,
    ) -> Result<RunResult, DispatchError> {
        let start = Instant::now();
        let partitions = Scheduler::new(self.workers).partition(catalog);

        let mut running: Vec<Option<Box<dyn WorkerHandle>>> = Vec::new();
        let mut launched = 0usize;

        for (index, cases) in partitions.into_iter().enumerate() {
            if cases.is_empty() {
                continue;
            }
            launched += 1;
            let slot = WorkerSlot {
                index,
                count: self.workers,
            };
            match self.launcher.launch(WorkerSpec { slot, cases }).await {
                Ok(handle) => running.push(Some(handle)),
                Err(e) => error!("{}", e),
            }
        }

        info!(
            "Dispatched {} tests to {} workers",
            catalog.len(),
            running.len()
        );

        let mut result = RunResult::default();
        let mut completed = 0usize;
        let mut ticker = tokio::time::interval(self.poll_interval);

        while running.iter().any(Option::is_some) {
            ticker.tick().await;

            for entry in running.iter_mut() {
                let finished = entry.as_mut().is_some_and(|h| h.is_finished());
                if !finished {
                    continue;
                }
                let Some(handle) = entry.take() else {
                    continue;
                };
                let slot = handle.slot();

                match handle.collect().await {
                    Ok(artifact) => {
                        if merge_artifact(&mut result, slot, artifact) {
                            completed += 1;
                            info!("Worker {} finished", slot);
                        } else {
                            error!("Worker {} left no summary line", slot);
                        }
                    }
                    Err(e) => error!("{}", e),
                }
            }
        }

        result.summary.elapsed = start.elapsed();

        if completed < launched {
            return Err(DispatchError::MissingWorkers {
                launched,
                completed,
                partial: Box::new(result),
            });
        }

        let reported = result.summary.total();
        if reported < expected {
            return Err(DispatchError::UnderReported {
                expected,
                reported,
                partial: Box::new(result),
            });
        }

        Ok(result)
    }
}

/// Adds a worker's artifact to the run. Returns `false` when the artifact
/// carries no summary line.
fn merge_artifact(result: &mut RunResult, slot: WorkerSlot, artifact: WorkerArtifact) -> bool {
    let Some(counts) = find_summary_line(&artifact.text) else {
        return false;
    };
    result.summary.merge(&counts);

    for line in artifact.text.lines().map(str::trim) {
        if !line.is_empty() && line.parse::<AggregateSummary>().is_err() {
            result.notes.push(format!("[worker {}] {}", slot, line));
        }
    }
    result.notes.push(format!("[worker {}] {}", slot, counts));

    result.results.extend(artifact.results);
    for failure in artifact.cleanup_failures {
        warn!("Worker {}: cleanup failure {}", slot, failure);
        result.cleanup_failures.push(failure);
    }
    true
}
