//! Provider trait and implementations for provisioning test environments.
//!
//! A provider owns every back-end specific detail of creating, restarting
//! and destroying the machines a test runs against. The orchestrator only
//! sees the [`Provider`] contract and the opaque [`Environment`] handles it
//! returns.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Provider                             │
//! │                                                               │
//! │  deploy(DeployRequest) ──────────► Environment                │
//! │  run_setup(&Environment, &TestCase)                           │
//! │  run_test_case_cleanup(&Environment, &TestCase)               │
//! │  is_reachable(&Environment)                                   │
//! │  restart(&mut Environment) ──────► bool                       │
//! │  delete(Environment)               (consumes the handle)      │
//! │  forget(&Environment)              (released, not destroyed)  │
//! │  run_test_cleanup(owned) ────────► Vec<CleanupFailure>        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Providers
//!
//! | Provider | Module | Description |
//! |----------|--------|-------------|
//! | Cloud | [`cloud`] | Resource groups created through a cloud CLI |
//! | Hyper-V | [`hyperv`] | VMs created on a fleet of hypervisor hosts |
//! | Ready | [`ready`] | Pre-existing machines, never destroyed |
//! | Guest | [`guest`] | Guest VMs layered on another provider |
//!
//! # Error Handling
//!
//! Every fallible operation returns an explicit error value. Providers never
//! panic the caller and never decide test outcomes; the execution state
//! machine turns provider errors into outcomes or warnings.

pub mod cloud;
#[cfg(test)]
pub(crate) mod fake;
pub mod guest;
pub mod hyperv;
pub mod lifecycle;
pub mod ready;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::catalog::{SetupType, TestCase};
use crate::outcome::CleanupFailure;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The back-end refused or failed to create the environment.
    #[error("Failed to deploy: {0}")]
    DeployFailed(String),

    /// A lifecycle command exited unsuccessfully.
    #[error("{what} failed: {detail}")]
    CommandFailed { what: String, detail: String },

    /// A command could not be started or communication failed.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// The environment or machine does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Not enough machines or quota to satisfy the request.
    #[error("Insufficient capacity: {0}")]
    Capacity(String),

    /// The operation did not finish in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider-specific error not covered by other variants.
    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

/// One machine inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    pub address: String,
}

impl Machine {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// A live set of machines returned by [`Provider::deploy`].
///
/// The state machine owns the handle while the environment is live and
/// hands it to [`Provider::delete`] to destroy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Back-end identifier (resource group, VM name prefix, ...).
    pub name: String,

    /// Name of the provider that created it.
    pub backend: String,

    pub machines: Vec<Machine>,

    /// Whether the environment existed before this run adopted it.
    pub adopted: bool,

    /// Back-end specific identifiers (host name, image path, ...).
    pub details: BTreeMap<String, String>,

    /// The environment this one is layered on, for guest environments.
    pub host: Option<Box<Environment>>,
}

impl Environment {
    pub fn new(name: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            machines: Vec::new(),
            adopted: false,
            details: BTreeMap::new(),
            host: None,
        }
    }

    pub fn with_machine(mut self, machine: Machine) -> Self {
        self.machines.push(machine);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Comma-separated machine addresses.
    pub fn addresses(&self) -> String {
        self.machines
            .iter()
            .map(|m| m.address.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Everything a provider needs to create (or adopt) an environment.
#[derive(Debug, Clone, Copy)]
pub struct DeployRequest<'a> {
    pub setup_type: &'a str,
    pub setup: &'a SetupType,
    pub case: &'a TestCase,
    pub location: Option<&'a str>,
    /// Name the environment is created or adopted under.
    pub identifier: &'a str,
    /// Adopt an existing environment named `identifier` instead of creating one.
    pub use_existing: bool,
}

impl DeployRequest<'_> {
    /// VM size, honoring the test's override.
    pub fn vm_size(&self) -> &str {
        self.case.setup_config.effective_vm_size(self.setup)
    }

    pub fn image(&self) -> &str {
        self.case.setup_config.image.as_deref().unwrap_or("")
    }
}

/// A failed deployment, possibly leaving a partially created environment.
///
/// The orchestrator still tears down `partial` according to policy.
#[derive(Debug)]
pub struct DeployError {
    pub partial: Option<Environment>,
    pub error: ProviderError,
}

impl DeployError {
    pub fn new(error: ProviderError) -> Self {
        Self {
            partial: None,
            error,
        }
    }

    pub fn partial(environment: Environment, error: ProviderError) -> Self {
        Self {
            partial: Some(environment),
            error,
        }
    }
}

impl fmt::Display for DeployError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partial {
            Some(env) => write!(f, "{} (partial environment '{}')", self.error, env.name),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for DeployError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<ProviderError> for DeployError {
    fn from(error: ProviderError) -> Self {
        Self::new(error)
    }
}

/// A back-end that provisions environments for test cases.
///
/// Providers are shared across workers and must be `Send + Sync`. Beyond the
/// [`Environment`] handle and their construction-time configuration they
/// keep only bookkeeping such as machine leases and pending teardowns.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short back-end name for logs.
    fn name(&self) -> &str;

    /// Creates an environment, or adopts the one named
    /// [`identifier`](DeployRequest::identifier) when it already exists and
    /// [`use_existing`](DeployRequest::use_existing) is set.
    ///
    /// # Errors
    ///
    /// Returns a [`DeployError`] carrying any partially created environment.
    async fn deploy(&self, request: &DeployRequest<'_>) -> Result<Environment, DeployError>;

    /// Destroys an environment. Best effort: callers log failures and move on.
    async fn delete(
        &self,
        environment: Environment,
        setup: &SetupType,
        use_existing: bool,
    ) -> ProviderResult<()>;

    /// Restarts every machine and waits until the environment is reachable
    /// again or a bounded timeout elapses. Returns `false` on any failure.
    async fn restart(&self, environment: &mut Environment) -> bool;

    /// Whether the machines still answer.
    async fn is_reachable(&self, _environment: &Environment) -> bool {
        true
    }

    /// Runs before each test case.
    async fn run_setup(&self, _environment: &Environment, _case: &TestCase) -> ProviderResult<()> {
        Ok(())
    }

    /// Runs after each test case.
    async fn run_test_case_cleanup(
        &self,
        _environment: &Environment,
        _case: &TestCase,
    ) -> ProviderResult<()> {
        Ok(())
    }

    /// Called when an environment is let go of without being deleted
    /// (abandoned or preserved). The machines stay as they are.
    async fn forget(&self, _environment: &Environment) {}

    /// Runs once at the end of a run. Waits for background teardown work to
    /// drain and returns the cleanup failures of the `owned` environments,
    /// the ones the caller released. Failures of environments owned by
    /// other workers sharing this provider are left for them.
    async fn run_test_cleanup(&self, _owned: &[String]) -> Vec<CleanupFailure> {
        Vec::new()
    }
}

macro_rules! forward_provider {
    ($wrapper:ty) => {
        #[async_trait]
        impl<P: Provider + ?Sized> Provider for $wrapper {
            fn name(&self) -> &str {
                (**self).name()
            }

            async fn deploy(
                &self,
                request: &DeployRequest<'_>,
            ) -> Result<Environment, DeployError> {
                (**self).deploy(request).await
            }

            async fn delete(
                &self,
                environment: Environment,
                setup: &SetupType,
                use_existing: bool,
            ) -> ProviderResult<()> {
                (**self).delete(environment, setup, use_existing).await
            }

            async fn restart(&self, environment: &mut Environment) -> bool {
                (**self).restart(environment).await
            }

            async fn is_reachable(&self, environment: &Environment) -> bool {
                (**self).is_reachable(environment).await
            }

            async fn run_setup(
                &self,
                environment: &Environment,
                case: &TestCase,
            ) -> ProviderResult<()> {
                (**self).run_setup(environment, case).await
            }

            async fn run_test_case_cleanup(
                &self,
                environment: &Environment,
                case: &TestCase,
            ) -> ProviderResult<()> {
                (**self).run_test_case_cleanup(environment, case).await
            }

            async fn forget(&self, environment: &Environment) {
                (**self).forget(environment).await
            }

            async fn run_test_cleanup(&self, owned: &[String]) -> Vec<CleanupFailure> {
                (**self).run_test_cleanup(owned).await
            }
        }
    };
}

forward_provider!(Box<P>);
forward_provider!(Arc<P>);

/// Background teardown work joined at the end of a run.
///
/// Providers that delete environments without blocking the next test spawn
/// the delete here; [`drain`](Self::drain) waits for all of them and hands
/// back the failures of the resources the caller owns.
#[derive(Debug, Clone, Default)]
pub struct TeardownTracker {
    tracker: TaskTracker,
    failures: Arc<Mutex<Vec<CleanupFailure>>>,
}

impl TeardownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a teardown task for `resource`. Its error, if any, is recorded.
    pub fn spawn<F>(&self, resource: String, teardown: F)
    where
        F: Future<Output = ProviderResult<()>> + Send + 'static,
    {
        let failures = self.failures.clone();
        self.tracker.spawn(async move {
            if let Err(e) = teardown.await {
                warn!("Background teardown of {} failed: {}", resource, e);
                if let Ok(mut guard) = failures.lock() {
                    guard.push(CleanupFailure {
                        resource,
                        reason: e.to_string(),
                    });
                }
            }
        });
    }

    /// Number of teardown tasks still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for every spawned teardown and takes the failures recorded for
    /// `owned` resources. Other failures stay for their owners to drain.
    pub async fn drain(&self, owned: &[String]) -> Vec<CleanupFailure> {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        let Ok(mut guard) = self.failures.lock() else {
            return Vec::new();
        };
        let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut *guard)
            .into_iter()
            .partition(|f| owned.contains(&f.resource));
        *guard = others;
        mine
    }
}
