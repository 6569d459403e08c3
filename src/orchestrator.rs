//! Test run orchestration.
//!
//! This module ties the bucketizer, the per-group state machine and the
//! parallel dispatcher together.
//!
//! # Architecture
//!
//! ```text
//!  Test catalog
//!       │
//!       ├─────────── sequential ──────────┐
//!       │                                 ▼
//!       │                           Bucketizer ──► Vec<SetupGroup>
//!       │                                 │
//!       │                                 ▼  one group at a time
//!       │                           GroupExecutor ◄──► Provider
//!       │                                 │      ◄──► CaseRunner
//!       │                                 ▼
//!       │                            ResultSink
//!       │
//!       └─── parallel (N workers) ───► Scheduler (i mod N)
//!                                         │
//!                     ┌───────────────────┼───────────────────┐
//!                     ▼                   ▼                   ▼
//!                 worker 0/N          worker 1/N   ...    worker N-1/N
//!            (sequential run of its partition, names suffixed -w{i})
//!                     │                   │                   │
//!                     └──── ParallelDispatcher polls, drains ─┘
//!                                         │
//!                                         ▼
//!                               merged RunResult
//! ```
//!
//! # Key Components
//!
//! - [`Orchestrator`]: sequential run of a catalog
//! - [`GroupExecutor`]: the per-group reuse/restart/teardown state machine
//! - [`ParallelDispatcher`]: fans a catalog out to workers and merges results
//! - [`Scheduler`]: round-robin partitioning
//! - [`CaseRunner`]: runs one test script
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleetrun::config::load_config;
//! use fleetrun::context::RunContext;
//! use fleetrun::orchestrator::{Orchestrator, ScriptRunner};
//! use fleetrun::provider::ready::ReadyProvider;
//! use fleetrun::config::ProviderConfig;
//! use fleetrun::report::ConsoleSink;
//! use fleetrun::shell::ShellRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("fleetrun.toml"))?;
//!     let ProviderConfig::Ready(ready) = config.provider.clone() else {
//!         anyhow::bail!("expected a ready provider");
//!     };
//!
//!     let ctx = RunContext::new(
//!         RunContext::generate_run_id(),
//!         config.run.clone(),
//!         Arc::new(config.setups.clone()),
//!     );
//!     let runner = ScriptRunner::new(ShellRunner::new("/bin/sh"), ".", "test-results");
//!     let orchestrator =
//!         Orchestrator::new(ctx, ReadyProvider::new(ready), runner, ConsoleSink::new(false));
//!
//!     let result = orchestrator.run(&config.tests).await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod dispatch;
pub mod machine;
pub mod runner;
pub mod scheduler;

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bucket::Bucketizer;
use crate::catalog::TestCase;
use crate::context::RunContext;
use crate::outcome::{AggregateSummary, CaseResult, CleanupFailure, ExecutionOutcome};
use crate::provider::Provider;
use crate::report::ResultSink;

pub use dispatch::{
    DispatchError, ParallelDispatcher, ProcessLauncher, TaskLauncher, WorkerArtifact,
    WorkerHandle, WorkerLauncher, WorkerSpec,
};
pub use machine::{GroupExecutor, GroupReport, LifecycleEvent, TeardownAction};
pub use runner::{CaseRunner, ScriptRunner};
pub use scheduler::Scheduler;

/// Aggregated results of a run (or of one worker's share of it).
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | No test failed or aborted |
/// | 1 | Some test failed or aborted |
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    pub summary: AggregateSummary,

    /// Per-case results. Empty for workers that only report a summary line.
    pub results: Vec<CaseResult>,

    /// Environments that could not be destroyed.
    pub cleanup_failures: Vec<CleanupFailure>,

    /// Free-text worker summaries, in completion order.
    pub notes: Vec<String>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.summary.success()
    }

    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code()
    }

    /// Adds a case result to the list and the counters.
    pub fn push(&mut self, result: CaseResult) {
        self.summary.record(result.outcome);
        self.results.push(result);
    }
}

/// Errors that stop a run from producing a result.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("the test catalog is empty")]
    EmptyCatalog,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Sequential orchestrator.
///
/// Owns its collaborators; wrap them in [`Arc`](std::sync::Arc) to share
/// them between workers.
pub struct Orchestrator<P, R, S> {
    ctx: RunContext,
    provider: P,
    runner: R,
    sink: S,
}

impl<P, R, S> Orchestrator<P, R, S>
where
    P: Provider,
    R: CaseRunner,
    S: ResultSink,
{
    pub fn new(ctx: RunContext, provider: P, runner: R, sink: S) -> Self {
        Self {
            ctx,
            provider,
            runner,
            sink,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Number of outcomes a run of `catalog` produces, after expansion.
    pub fn expected_outcomes(&self, catalog: &[TestCase]) -> usize {
        Bucketizer::new(self.ctx.setups(), self.ctx.policy())
            .expand(catalog)
            .len()
    }

    /// Runs `catalog` and reports start and completion to the sink.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::EmptyCatalog`] when there is nothing to run.
    pub async fn run(&self, catalog: &[TestCase]) -> Result<RunResult, RunError> {
        if catalog.is_empty() {
            return Err(RunError::EmptyCatalog);
        }
        self.sink.on_run_start(self.expected_outcomes(catalog)).await;
        let result = self.execute(catalog).await;
        self.sink.on_run_complete(&result).await;
        Ok(result)
    }

    /// Bucketizes and runs `catalog` group by group, then waits for the
    /// provider's background teardown of the environments this run released.
    ///
    /// Every expanded test case yields exactly one result, including those
    /// rejected by the bucketizer.
    pub async fn execute(&self, catalog: &[TestCase]) -> RunResult {
        let start = Instant::now();
        let mut result = RunResult::default();

        let bucketized = Bucketizer::new(self.ctx.setups(), self.ctx.policy()).bucketize(catalog);
        info!(
            "{} tests in {} groups ({} rejected){}",
            bucketized.case_count(),
            bucketized.groups.len(),
            bucketized.rejected.len(),
            self.ctx
                .worker()
                .map(|w| format!(" on worker {}", w))
                .unwrap_or_default()
        );

        for rejected in &bucketized.rejected {
            let case = &rejected.case;
            self.sink.on_case_start(case).await;
            let outcome = ExecutionOutcome::aborted(rejected.error.to_string());
            let case_result = CaseResult {
                name: case.name.clone(),
                iteration: case.setup_config.iteration,
                group: case.setup_type.clone().unwrap_or_default(),
                environment: None,
                outcome: outcome.outcome,
                duration: std::time::Duration::ZERO,
                summary: outcome.summary,
                telemetry: None,
            };
            self.sink.on_case_complete(&case_result).await;
            result.push(case_result);
        }

        let executor = GroupExecutor::new(&self.ctx, &self.provider, &self.runner, &self.sink);
        let mut released = Vec::new();
        for (index, group) in bucketized.groups.iter().enumerate() {
            let report = executor.execute(index, group).await;
            for event in &report.lifecycle {
                debug!("group {}: {:?}", index, event);
                if let LifecycleEvent::Released { environment, .. } = event {
                    released.push(environment.clone());
                }
            }
            for case_result in report.results {
                result.push(case_result);
            }
            result.cleanup_failures.extend(report.cleanup_failures);
        }

        let background = self.provider.run_test_cleanup(&released).await;
        for failure in &background {
            warn!("Cleanup failure: {}", failure);
        }
        result.cleanup_failures.extend(background);

        result.summary.elapsed = start.elapsed();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{SetupCatalog, SetupConfig, SetupType};
    use crate::config::RunPolicy;
    use crate::orchestrator::runner::scripted::ScriptedRunner;
    use crate::outcome::Outcome;
    use crate::provider::fake::{Call, FakeProvider};
    use crate::report::recording::RecordingSink;

    fn setups() -> SetupCatalog {
        let setup = |size: &str| SetupType {
            vm_count: 1,
            size_class: size.to_string(),
            topology: "single".to_string(),
        };
        SetupCatalog::new()
            .with_setup("small", setup("A2"))
            .with_setup("large", setup("D16"))
    }

    fn orchestrator(
        policy: RunPolicy,
        provider: FakeProvider,
        runner: ScriptedRunner,
    ) -> Orchestrator<Arc<FakeProvider>, Arc<ScriptedRunner>, Arc<RecordingSink>> {
        let ctx = RunContext::new("run", policy, Arc::new(setups()));
        Orchestrator::new(
            ctx,
            Arc::new(provider),
            Arc::new(runner),
            Arc::new(RecordingSink::default()),
        )
    }

    fn catalog() -> Vec<TestCase> {
        let mut bad_generation = TestCase::new("BAD-GEN", "small");
        bad_generation.setup_config = SetupConfig {
            generation: Some("3".to_string()),
            ..Default::default()
        };
        let mut no_setup = TestCase::new("NO-SETUP", "small");
        no_setup.setup_type = None;

        vec![
            TestCase::new("T1", "small"),
            TestCase::new("T2", "large").with_priority(1),
            TestCase::new("T3", "small").with_priority(2),
            TestCase::new("T4", "unknown"),
            bad_generation,
            no_setup,
        ]
    }

    #[tokio::test]
    async fn test_every_case_gets_exactly_one_outcome() {
        let policy = RunPolicy {
            test_iterations: 2,
            ..Default::default()
        };
        let orch = orchestrator(
            policy,
            FakeProvider::new(),
            ScriptedRunner::new().with_outcome("T3", Outcome::Fail),
        );

        let catalog = catalog();
        let result = orch.run(&catalog).await.unwrap();

        assert_eq!(orch.expected_outcomes(&catalog), 12);
        assert_eq!(result.summary.total(), 12);
        assert_eq!(result.results.len(), 12);
        assert_eq!(result.summary.aborted, 6);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.passed, 5);

        let mut names: Vec<String> = result.results.iter().map(|r| r.display_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 12);

        let sink = &orch.sink;
        assert_eq!(*sink.total.lock().unwrap(), Some(12));
        assert_eq!(sink.completed().len(), 12);
        assert!(*sink.finished.lock().unwrap());
    }

    #[tokio::test]
    async fn test_groups_run_one_after_another() {
        let orch = orchestrator(RunPolicy::default(), FakeProvider::new(), ScriptedRunner::new());
        orch.run(&catalog()[..3]).await.unwrap();

        // small group (T1, T3) finishes before large (T2) is deployed.
        let calls = orch.provider.calls();
        let deploys: Vec<_> = calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| matches!(c, Call::Deploy { .. }).then_some(i))
            .collect();
        let deletes: Vec<_> = calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| matches!(c, Call::Delete(_)).then_some(i))
            .collect();
        assert_eq!(deploys.len(), 2);
        assert_eq!(deletes.len(), 2);
        assert!(deletes[0] < deploys[1]);
        assert_eq!(calls.last(), Some(&Call::TestCleanup));
    }

    #[tokio::test]
    async fn test_background_cleanup_failures_are_surfaced() {
        let orch = orchestrator(
            RunPolicy::default(),
            FakeProvider::new()
                .with_cleanup_failure("fleetrun-run-small-g0-d0", "timed out")
                .with_cleanup_failure("fleetrun-other-small-g0-d0", "locked"),
            ScriptedRunner::new(),
        );
        let result = orch.run(&catalog()[..1]).await.unwrap();

        // Only failures of environments this run released are claimed.
        assert!(result.success());
        assert_eq!(result.cleanup_failures.len(), 1);
        assert_eq!(
            result.cleanup_failures[0].resource,
            "fleetrun-run-small-g0-d0"
        );
    }

    #[tokio::test]
    async fn test_empty_catalog_is_an_error() {
        let orch = orchestrator(RunPolicy::default(), FakeProvider::new(), ScriptedRunner::new());
        assert!(matches!(orch.run(&[]).await, Err(RunError::EmptyCatalog)));
    }
}
