//! Scripted in-memory provider for orchestrator tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    DeployError, DeployRequest, Environment, Machine, Provider, ProviderError, ProviderResult,
};
use crate::catalog::{SetupType, TestCase};
use crate::outcome::CleanupFailure;

/// A provider call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Deploy { identifier: String, case: String },
    Delete(String),
    Restart(String),
    Forget(String),
    Setup { environment: String, case: String },
    CaseCleanup { environment: String, case: String },
    TestCleanup,
}

#[derive(Default)]
pub struct FakeProvider {
    calls: Mutex<Vec<Call>>,
    failing_deploys: HashSet<String>,
    partial_deploys: bool,
    restart_ok: bool,
    unreachable_after: HashSet<String>,
    failing_setups: HashSet<String>,
    failing_deletes: bool,
    cleanup_failures: Vec<CleanupFailure>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            restart_ok: true,
            ..Default::default()
        }
    }

    /// Deploys requested for `case` fail.
    pub fn failing_deploy(mut self, case: &str) -> Self {
        self.failing_deploys.insert(case.to_string());
        self
    }

    /// Failed deploys leave a partial environment behind.
    pub fn partial_deploys(mut self) -> Self {
        self.partial_deploys = true;
        self
    }

    pub fn restart_result(mut self, ok: bool) -> Self {
        self.restart_ok = ok;
        self
    }

    /// The environment stops answering once `case` has run on it.
    pub fn unreachable_after(mut self, case: &str) -> Self {
        self.unreachable_after.insert(case.to_string());
        self
    }

    pub fn failing_setup(mut self, case: &str) -> Self {
        self.failing_setups.insert(case.to_string());
        self
    }

    pub fn failing_deletes(mut self) -> Self {
        self.failing_deletes = true;
        self
    }

    /// Failures reported by `run_test_cleanup` to the caller owning
    /// `resource`.
    pub fn with_cleanup_failure(mut self, resource: &str, reason: &str) -> Self {
        self.cleanup_failures.push(CleanupFailure {
            resource: resource.to_string(),
            reason: reason.to_string(),
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn deploy_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Deploy { .. }))
            .count()
    }

    pub fn delete_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Delete(_)))
            .count()
    }

    pub fn restart_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Restart(_)))
            .count()
    }

    fn record(&self, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn last_case_on(&self, environment: &str) -> Option<String> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::Setup {
                environment: env,
                case,
            } if env == environment => Some(case),
            _ => None,
        })
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn deploy(&self, request: &DeployRequest<'_>) -> Result<Environment, DeployError> {
        self.record(Call::Deploy {
            identifier: request.identifier.to_string(),
            case: request.case.name.clone(),
        });

        let environment = Environment::new(request.identifier, "fake")
            .with_machine(Machine::new(format!("{}-0", request.identifier), "127.0.0.1"));

        if self.failing_deploys.contains(&request.case.name) {
            let error = ProviderError::DeployFailed("quota exceeded".to_string());
            return Err(if self.partial_deploys {
                DeployError::partial(environment, error)
            } else {
                DeployError::new(error)
            });
        }

        Ok(environment)
    }

    async fn delete(
        &self,
        environment: Environment,
        _setup: &SetupType,
        _use_existing: bool,
    ) -> ProviderResult<()> {
        self.record(Call::Delete(environment.name.clone()));
        if self.failing_deletes {
            return Err(ProviderError::CommandFailed {
                what: "delete".to_string(),
                detail: "resource locked".to_string(),
            });
        }
        Ok(())
    }

    async fn restart(&self, environment: &mut Environment) -> bool {
        self.record(Call::Restart(environment.name.clone()));
        self.restart_ok
    }

    async fn is_reachable(&self, environment: &Environment) -> bool {
        match self.last_case_on(&environment.name) {
            Some(case) => !self.unreachable_after.contains(&case),
            None => true,
        }
    }

    async fn run_setup(&self, environment: &Environment, case: &TestCase) -> ProviderResult<()> {
        self.record(Call::Setup {
            environment: environment.name.clone(),
            case: case.name.clone(),
        });
        if self.failing_setups.contains(&case.name) {
            return Err(ProviderError::CommandFailed {
                what: "setup".to_string(),
                detail: "package install failed".to_string(),
            });
        }
        Ok(())
    }

    async fn run_test_case_cleanup(
        &self,
        environment: &Environment,
        case: &TestCase,
    ) -> ProviderResult<()> {
        self.record(Call::CaseCleanup {
            environment: environment.name.clone(),
            case: case.name.clone(),
        });
        Ok(())
    }

    async fn forget(&self, environment: &Environment) {
        self.record(Call::Forget(environment.name.clone()));
    }

    async fn run_test_cleanup(&self, owned: &[String]) -> Vec<CleanupFailure> {
        self.record(Call::TestCleanup);
        self.cleanup_failures
            .iter()
            .filter(|f| owned.contains(&f.resource))
            .cloned()
            .collect()
    }
}
