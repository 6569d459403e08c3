//! Resource-group based public cloud provider.
//!
//! Every environment is one resource group. The provider never talks to a
//! cloud API directly: it renders the configured command templates (usually
//! cloud CLI invocations or deployment scripts) and runs them.
//!
//! # Command Protocol
//!
//! | Command | Placeholders | Contract |
//! |---------|--------------|----------|
//! | `exists_command` | `{name}` | exit 0 when the group exists |
//! | `list_command` | `{name}` `{location}` `{setup}` | prints `machine address` per line of an existing group |
//! | `deploy_command` | `{name}` `{location}` `{vm_size}` `{image}` `{vm_count}` `{setup}` | prints `machine address` per line |
//! | `delete_command` | `{name}` `{location}` | destroys the group |
//!
//! Restart, probe and the per-test hooks come from [`LifecycleCommands`].
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Adopt existing environment | Yes, via `exists_command` and `list_command`; never redeployed |
//! | Partial deployments | Reported with the machines listed so far |
//! | Background delete | Yes (default), joined at end of run |
//!
//! [`LifecycleCommands`]: crate::config::LifecycleCommands

use async_trait::async_trait;
use tracing::{info, warn};

use super::lifecycle::{MachineCommands, parse_machines};
use super::{
    DeployError, DeployRequest, Environment, Provider, ProviderError, ProviderResult,
    TeardownTracker,
};
use crate::catalog::{SetupType, TestCase};
use crate::config::CloudProviderConfig;
use crate::outcome::CleanupFailure;
use crate::shell::render;

/// Provider that manages resource groups through command templates.
pub struct CloudProvider {
    config: CloudProviderConfig,
    commands: MachineCommands,
    teardown: TeardownTracker,
}

impl CloudProvider {
    pub fn new(config: CloudProviderConfig) -> Self {
        let commands = MachineCommands::new(config.lifecycle.clone());
        Self {
            config,
            commands,
            teardown: TeardownTracker::new(),
        }
    }

    fn location<'a>(&'a self, request: &'a DeployRequest<'_>) -> &'a str {
        request
            .location
            .or(request.case.setup_config.location.as_deref())
            .or(self.config.default_location.as_deref())
            .unwrap_or("")
    }

    /// Whether a resource group named `name` already exists.
    async fn exists(&self, name: &str) -> bool {
        let Some(template) = &self.config.exists_command else {
            return false;
        };
        let cmd = render(template, &[("name", name)]);
        match self.commands.runner().run(&cmd).await {
            Ok(output) => output.success(),
            Err(e) => {
                warn!("Could not check whether {} exists: {}", name, e);
                false
            }
        }
    }
}

#[async_trait]
impl Provider for CloudProvider {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn deploy(&self, request: &DeployRequest<'_>) -> Result<Environment, DeployError> {
        let location = self.location(request);
        let adopted = request.use_existing && self.exists(request.identifier).await;
        if adopted {
            info!("Adopting existing resource group {}", request.identifier);
        } else {
            info!(
                "Deploying resource group {} ({} x {} in {})",
                request.identifier,
                request.setup.vm_count,
                request.vm_size(),
                if location.is_empty() { "default location" } else { location }
            );
        }

        let mut environment = Environment::new(request.identifier, self.name())
            .with_detail("location", location)
            .with_detail("setup", request.setup_type);
        environment.adopted = adopted;

        let cmd = if adopted {
            let Some(template) = &self.config.list_command else {
                return Err(DeployError::new(ProviderError::DeployFailed(format!(
                    "{} exists but no list_command is configured to adopt it",
                    request.identifier
                ))));
            };
            render(template, &[
                ("name", request.identifier),
                ("location", location),
                ("setup", request.setup_type),
            ])
        } else {
            let vm_count = request.setup.vm_count.to_string();
            render(&self.config.deploy_command, &[
                ("name", request.identifier),
                ("location", location),
                ("vm_size", request.vm_size()),
                ("image", request.image()),
                ("vm_count", &vm_count),
                ("setup", request.setup_type),
            ])
        };

        let output = match self.commands.runner().run(&cmd).await {
            Ok(output) => output,
            Err(e) if adopted => return Err(DeployError::new(e)),
            Err(e) => return Err(DeployError::partial(environment, e)),
        };

        environment.machines = parse_machines(&output.stdout);

        if !output.success() {
            let error = ProviderError::DeployFailed(output.error_line());
            // A group that existed before is never reported as partial.
            if adopted || environment.machines.is_empty() {
                return Err(DeployError::new(error));
            }
            return Err(DeployError::partial(environment, error));
        }

        if environment.machines.is_empty() {
            let what = if adopted { "list" } else { "deploy" };
            let error = ProviderError::DeployFailed(format!("{} command listed no machines", what));
            if adopted {
                return Err(DeployError::new(error));
            }
            return Err(DeployError::partial(environment, error));
        }

        Ok(environment)
    }

    async fn delete(
        &self,
        environment: Environment,
        _setup: &SetupType,
        use_existing: bool,
    ) -> ProviderResult<()> {
        let location = environment
            .details
            .get("location")
            .map(String::as_str)
            .unwrap_or("");
        let cmd = render(&self.config.delete_command, &[
            ("name", &environment.name),
            ("location", location),
        ]);

        if use_existing && environment.adopted {
            info!("Deleting adopted resource group {}", environment.name);
        } else {
            info!("Deleting resource group {}", environment.name);
        }

        if self.config.background_delete {
            let runner = self.commands.runner().clone();
            self.teardown.spawn(environment.name, async move {
                runner.run_checked("delete", &cmd).await.map(|_| ())
            });
            return Ok(());
        }

        self.commands.runner().run_checked("delete", &cmd).await?;
        Ok(())
    }

    async fn restart(&self, environment: &mut Environment) -> bool {
        self.commands.restart(environment).await
    }

    async fn is_reachable(&self, environment: &Environment) -> bool {
        self.commands.probe(environment).await
    }

    async fn run_setup(&self, environment: &Environment, case: &TestCase) -> ProviderResult<()> {
        self.commands.run_setup(environment, case).await
    }

    async fn run_test_case_cleanup(
        &self,
        environment: &Environment,
        case: &TestCase,
    ) -> ProviderResult<()> {
        self.commands.run_case_cleanup(environment, case).await
    }

    async fn run_test_cleanup(&self, owned: &[String]) -> Vec<CleanupFailure> {
        if self.teardown.pending() > 0 {
            info!(
                "Waiting for {} background deletes to finish",
                self.teardown.pending()
            );
        }
        self.teardown.drain(owned).await
    }
}
