//! Per-group execution state machine.
//!
//! A [`GroupExecutor`] runs the cases of one [`SetupGroup`] in order against
//! at most one live environment, deciding after every case whether to reuse,
//! restart or release it.
//!
//! # States
//!
//! ```text
//!                 deploy ok
//!   NoEnvironment ─────────► Live ──► run case ──┐
//!        ▲    │                ▲                 │
//!        │    │ deploy failed  │ pass, reuse     │
//!        │    ▼                │ fail, restart ok│
//!        │  (abort rest of     └─────────────────┤
//!        │   the group)                          │ must not persist
//!        └──────────── release (abandon / delete / preserve) ◄┘
//! ```
//!
//! # Release Decision
//!
//! | `resource_cleanup` | `use_existing_rg` | after failure | otherwise |
//! |--------------------|-------------------|---------------|-----------|
//! | `keep` | any | abandon | abandon |
//! | `delete` | any | delete | delete |
//! | `default` | true | delete | delete |
//! | `default` | false | preserve | delete |
//!
//! Abandon and preserve never call [`Provider::delete`]; the state machine
//! stops tracking the environment and tells the provider through
//! [`Provider::forget`].
//!
//! # Retries
//!
//! A case with `retry = n` that fails or aborts is run again, up to `n` more
//! times, each time on a newly deployed environment. The environment of the
//! failed attempt is released as failed. Only the last attempt produces a
//! result.

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::bucket::{ConfigurationError, SetupGroup};
use crate::catalog::{SetupType, TestCase};
use crate::config::{ResourceCleanup, RunPolicy};
use crate::context::RunContext;
use crate::orchestrator::runner::CaseRunner;
use crate::outcome::{CaseResult, CleanupFailure, ExecutionOutcome};
use crate::provider::{DeployError, DeployRequest, Environment, Provider};
use crate::report::ResultSink;

/// What happens to an environment the state machine lets go of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownAction {
    /// Left running and untracked.
    Abandon,
    /// Destroyed through the provider.
    Delete,
    /// Left running for manual inspection.
    Preserve,
}

impl TeardownAction {
    /// Picks the action for an environment released after a failure or a
    /// healthy run.
    pub fn decide(policy: &RunPolicy, failed: bool) -> Self {
        match policy.resource_cleanup {
            ResourceCleanup::Keep => TeardownAction::Abandon,
            ResourceCleanup::Delete => TeardownAction::Delete,
            ResourceCleanup::Default if policy.use_existing_rg => TeardownAction::Delete,
            ResourceCleanup::Default if failed => TeardownAction::Preserve,
            ResourceCleanup::Default => TeardownAction::Delete,
        }
    }
}

impl fmt::Display for TeardownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TeardownAction::Abandon => "abandon",
            TeardownAction::Delete => "delete",
            TeardownAction::Preserve => "preserve",
        })
    }
}

/// Environment lifecycle transitions of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Deployed {
        environment: String,
        case: String,
    },
    DeployFailed {
        case: String,
        error: String,
        partial: Option<String>,
    },
    Restarted {
        environment: String,
        ok: bool,
    },
    Released {
        environment: String,
        action: TeardownAction,
    },
}

/// Everything a group run produced.
#[derive(Debug, Clone, Default)]
pub struct GroupReport {
    pub results: Vec<CaseResult>,
    pub cleanup_failures: Vec<CleanupFailure>,
    pub lifecycle: Vec<LifecycleEvent>,
}

/// Drives one setup group through its cases.
pub struct GroupExecutor<'a, P: ?Sized, R: ?Sized, S: ?Sized> {
    ctx: &'a RunContext,
    provider: &'a P,
    runner: &'a R,
    sink: &'a S,
}

impl<'a, P, R, S> GroupExecutor<'a, P, R, S>
where
    P: Provider + ?Sized,
    R: CaseRunner + ?Sized,
    S: ResultSink + ?Sized,
{
    pub fn new(ctx: &'a RunContext, provider: &'a P, runner: &'a R, sink: &'a S) -> Self {
        Self {
            ctx,
            provider,
            runner,
            sink,
        }
    }

    /// Runs every case of `group`. `index` distinguishes the group's
    /// environment names from those of other groups in the run.
    ///
    /// Every case gets exactly one result; nothing here fails the run.
    pub async fn execute(&self, index: usize, group: &SetupGroup) -> GroupReport {
        let mut report = GroupReport::default();
        let key = group.key();
        let label = key.to_string();
        let policy = self.ctx.policy();

        let Some(setup) = self.ctx.setups().get(&key.setup_type) else {
            let error = ConfigurationError::UnknownSetupType(key.setup_type.clone());
            for case in group.cases() {
                self.sink.on_case_start(case).await;
                let outcome = ExecutionOutcome::aborted(error.to_string());
                self.record(&mut report, case, &label, None, outcome, Instant::now())
                    .await;
            }
            return report;
        };

        info!("Running group {} ({} cases)", label, group.len());

        let mut live: Option<Environment> = None;
        let mut deployments = 0usize;
        let mut provisioning_error: Option<String> = None;

        for case in group.cases() {
            self.sink.on_case_start(case).await;
            let mut attempt = 0u32;

            loop {
                let started = Instant::now();

                if let Some(error) = &provisioning_error {
                    let outcome = ExecutionOutcome::aborted(error.clone());
                    self.record(&mut report, case, &label, None, outcome, started)
                        .await;
                    break;
                }

                if case.use_new_environment
                    && let Some(env) = live.take()
                {
                    info!("{} requires a new environment", case.display_name());
                    self.release(env, setup, false, &mut report).await;
                }

                let mut env = match live.take() {
                    Some(env) => env,
                    None => {
                        let identifier =
                            self.ctx
                                .environment_name(&key.setup_type, index, deployments);
                        deployments += 1;
                        let location = key.location.as_deref();
                        match self.deploy(case, &key.setup_type, setup, location, &identifier).await {
                            Ok(env) => {
                                report.lifecycle.push(LifecycleEvent::Deployed {
                                    environment: env.name.clone(),
                                    case: case.display_name(),
                                });
                                env
                            }
                            Err(DeployError { partial, error }) => {
                                let message = format!("provisioning failed: {}", error);
                                warn!("Group {}: {}", label, message);
                                report.lifecycle.push(LifecycleEvent::DeployFailed {
                                    case: case.display_name(),
                                    error: error.to_string(),
                                    partial: partial.as_ref().map(|e| e.name.clone()),
                                });
                                if let Some(partial) = partial {
                                    self.release(partial, setup, true, &mut report).await;
                                }
                                let outcome = ExecutionOutcome::aborted(message.clone());
                                self.record(&mut report, case, &label, None, outcome, started)
                                    .await;
                                provisioning_error = Some(message);
                                break;
                            }
                        }
                    }
                };

                let outcome = match self.provider.run_setup(&env, case).await {
                    Ok(()) => self.runner.run_case(&env, case).await,
                    Err(e) => ExecutionOutcome::aborted(format!("setup failed: {}", e)),
                };
                if let Err(e) = self.provider.run_test_case_cleanup(&env, case).await {
                    warn!(
                        "Cleanup after {} failed on {}: {}",
                        case.display_name(),
                        env.name,
                        e
                    );
                }

                let mut failed = !outcome.outcome.is_pass_like();

                // Retries run on a new environment; only the last attempt is recorded.
                if failed && attempt < case.retry {
                    attempt += 1;
                    info!(
                        "{} {} on {}, retrying on a new environment ({}/{})",
                        case.display_name(),
                        outcome.outcome,
                        env.name,
                        attempt,
                        case.retry
                    );
                    self.release(env, setup, true, &mut report).await;
                    continue;
                }

                let env_name = env.name.clone();
                self.record(&mut report, case, &label, Some(env_name), outcome, started)
                    .await;

                if !failed && !self.provider.is_reachable(&env).await {
                    warn!(
                        "{} unreachable after {}, not reusing it",
                        env.name,
                        case.display_name()
                    );
                    failed = true;
                }

                if !failed {
                    if policy.deploy_vm_per_each_test {
                        self.release(env, setup, false, &mut report).await;
                    } else {
                        live = Some(env);
                    }
                    break;
                }

                if policy.reuse_vm_on_failure
                    && !policy.deploy_vm_per_each_test
                    && self.provider.is_reachable(&env).await
                {
                    let ok = self.provider.restart(&mut env).await;
                    report.lifecycle.push(LifecycleEvent::Restarted {
                        environment: env.name.clone(),
                        ok,
                    });
                    if ok {
                        // Healthy again; released under the normal rules at the end.
                        info!("Restarted {}, reusing it", env.name);
                        live = Some(env);
                        break;
                    }
                    warn!("Restart of {} failed", env.name);
                }

                self.release(env, setup, true, &mut report).await;
                break;
            }
        }

        if let Some(env) = live.take() {
            self.release(env, setup, false, &mut report).await;
        }

        report
    }

    async fn deploy(
        &self,
        case: &TestCase,
        setup_type: &str,
        setup: &SetupType,
        location: Option<&str>,
        identifier: &str,
    ) -> Result<Environment, DeployError> {
        let request = DeployRequest {
            setup_type,
            setup,
            case,
            location,
            identifier,
            use_existing: self.ctx.policy().use_existing_rg,
        };
        info!(
            "Deploying {} for {} via {}",
            identifier,
            case.display_name(),
            self.provider.name()
        );
        self.provider.deploy(&request).await
    }

    /// Lets go of an environment according to the teardown decision.
    async fn release(
        &self,
        env: Environment,
        setup: &SetupType,
        failed: bool,
        report: &mut GroupReport,
    ) {
        let policy = self.ctx.policy();
        let action = TeardownAction::decide(policy, failed);
        let name = env.name.clone();

        match action {
            TeardownAction::Abandon => {
                info!("Keeping {} (resource_cleanup = keep)", name);
                self.provider.forget(&env).await;
            }
            TeardownAction::Preserve => {
                info!("Preserving {} for inspection", name);
                self.provider.forget(&env).await;
            }
            TeardownAction::Delete => {
                if let Err(e) = self
                    .provider
                    .delete(env, setup, policy.use_existing_rg)
                    .await
                {
                    warn!("Failed to delete {}: {}", name, e);
                    report.cleanup_failures.push(CleanupFailure {
                        resource: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.lifecycle.push(LifecycleEvent::Released {
            environment: name,
            action,
        });
    }

    async fn record(
        &self,
        report: &mut GroupReport,
        case: &TestCase,
        group: &str,
        environment: Option<String>,
        outcome: ExecutionOutcome,
        started: Instant,
    ) {
        let result = CaseResult {
            name: case.name.clone(),
            iteration: case.setup_config.iteration,
            group: group.to_string(),
            environment,
            outcome: outcome.outcome,
            duration: started.elapsed(),
            summary: outcome.summary,
            telemetry: outcome.telemetry,
        };
        self.sink.on_case_complete(&result).await;
        report.results.push(result);
    }
}
