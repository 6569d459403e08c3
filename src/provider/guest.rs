//! Guest VMs layered on another provider.
//!
//! The host provider deploys the machines; this provider then starts
//! `guests_per_host` guest VMs on each of them and exposes the guests as the
//! environment's machines. The host environment travels along in
//! [`Environment::host`] and is deleted after the guests are stopped.
//!
//! ```text
//! GuestProvider::deploy
//!   ├── host.deploy(request)            ──► host environment
//!   └── per host machine, per guest:
//!         start_guest_command {host} {host_address} {guest} {image}
//!                                       ──► guest address (last stdout line)
//!
//! GuestProvider::delete
//!   ├── stop_guest_command per guest
//!   └── host.delete(host environment)
//! ```

use async_trait::async_trait;
use tracing::{info, warn};

use super::lifecycle::MachineCommands;
use super::{
    DeployError, DeployRequest, Environment, Machine, Provider, ProviderError, ProviderResult,
};
use crate::catalog::{SetupType, TestCase};
use crate::config::GuestProviderConfig;
use crate::outcome::CleanupFailure;
use crate::shell::render;

const HOST_KEY_PREFIX: &str = "host-of.";

pub struct GuestProvider {
    config: GuestProviderConfig,
    commands: MachineCommands,
    host: Box<dyn Provider>,
}

impl GuestProvider {
    pub fn new(config: GuestProviderConfig, host: Box<dyn Provider>) -> Self {
        let commands = MachineCommands::new(config.lifecycle.clone());
        Self {
            config,
            commands,
            host,
        }
    }

    fn host_machine<'a>(environment: &'a Environment, guest: &Machine) -> Option<&'a Machine> {
        let host_name = environment
            .details
            .get(&format!("{}{}", HOST_KEY_PREFIX, guest.name))?;
        environment
            .host
            .as_ref()?
            .machines
            .iter()
            .find(|m| &m.name == host_name)
    }

    async fn start_guest(
        &self,
        host: &Machine,
        guest: &str,
        image: &str,
    ) -> ProviderResult<String> {
        let cmd = render(&self.config.start_guest_command, &[
            ("host", &host.name),
            ("host_address", &host.address),
            ("guest", guest),
            ("image", image),
        ]);
        let output = self.commands.runner().run_checked("start guest", &cmd).await?;
        output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::NotFound(format!("no address reported for {}", guest)))
    }
}

#[async_trait]
impl Provider for GuestProvider {
    fn name(&self) -> &str {
        "guest"
    }

    async fn deploy(&self, request: &DeployRequest<'_>) -> Result<Environment, DeployError> {
        let mut environment = Environment::new(request.identifier, self.name());

        let host_env = match self.host.deploy(request).await {
            Ok(env) => env,
            Err(DeployError { partial, error }) => {
                return Err(match partial {
                    Some(host_env) => {
                        environment.host = Some(Box::new(host_env));
                        DeployError::partial(environment, error)
                    }
                    None => DeployError::new(error),
                });
            }
        };
        environment.adopted = host_env.adopted;
        let hosts = host_env.machines.clone();
        environment.host = Some(Box::new(host_env));

        for host in &hosts {
            for n in 0..self.config.guests_per_host {
                let guest = format!("{}-{}-g{}", request.identifier, host.name, n);
                match self.start_guest(host, &guest, request.image()).await {
                    Ok(address) => {
                        info!("Started guest {} on {}", guest, host.name);
                        environment
                            .details
                            .insert(format!("{}{}", HOST_KEY_PREFIX, guest), host.name.clone());
                        environment.machines.push(Machine::new(guest, address));
                    }
                    Err(e) => return Err(DeployError::partial(environment, e)),
                }
            }
        }

        Ok(environment)
    }

    async fn delete(
        &self,
        mut environment: Environment,
        setup: &SetupType,
        use_existing: bool,
    ) -> ProviderResult<()> {
        let stops = environment.machines.iter().filter_map(|guest| {
            let host = Self::host_machine(&environment, guest)?;
            let cmd = render(&self.config.stop_guest_command, &[
                ("host", &host.name),
                ("host_address", &host.address),
                ("guest", &guest.name),
            ]);
            Some(async move {
                let result = self.commands.runner().run_checked("stop guest", &cmd).await;
                (guest.name.clone(), result)
            })
        });

        // Guests stop concurrently, hosts only after all of them.
        let mut first_error = None;
        for (guest, result) in futures::future::join_all(stops).await {
            if let Err(e) = result {
                warn!("Stopping guest {} failed: {}", guest, e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(host_env) = environment.host.take()
            && let Err(e) = self.host.delete(*host_env, setup, use_existing).await
        {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
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

    async fn forget(&self, environment: &Environment) {
        if let Some(host_env) = &environment.host {
            self.host.forget(host_env).await;
        }
    }

    async fn run_test_cleanup(&self, owned: &[String]) -> Vec<CleanupFailure> {
        self.host.run_test_cleanup(owned).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleCommands, ReadyMachine, ReadyProviderConfig};
    use crate::provider::ready::ReadyProvider;

    fn host() -> Box<dyn Provider> {
        Box::new(ReadyProvider::new(ReadyProviderConfig {
            machines: vec![
                ReadyMachine {
                    name: "host-a".to_string(),
                    address: "10.1.0.1".to_string(),
                },
                ReadyMachine {
                    name: "host-b".to_string(),
                    address: "10.1.0.2".to_string(),
                },
            ],
            lifecycle: LifecycleCommands::default(),
        }))
    }

    fn provider(start: &str, stop: &str) -> GuestProvider {
        GuestProvider::new(
            GuestProviderConfig {
                host: Box::new(crate::config::ProviderConfig::Ready(ReadyProviderConfig {
                    machines: Vec::new(),
                    lifecycle: LifecycleCommands::default(),
                })),
                start_guest_command: start.to_string(),
                stop_guest_command: stop.to_string(),
                guests_per_host: 2,
                lifecycle: LifecycleCommands::default(),
            },
            host(),
        )
    }

    fn setup() -> SetupType {
        SetupType {
            vm_count: 2,
            size_class: "any".to_string(),
            topology: "single".to_string(),
        }
    }

    #[tokio::test]
    async fn test_deploy_starts_guests_on_every_host() {
        let provider = provider("echo {host_address}-{guest}", "true");
        let setup = setup();
        let case = TestCase::new("VERIFY-BOOT", "small");
        let request = DeployRequest {
            setup_type: "small",
            setup: &setup,
            case: &case,
            location: None,
            identifier: "nested",
            use_existing: false,
        };

        let env = provider.deploy(&request).await.unwrap();

        assert_eq!(env.machines.len(), 4);
        assert_eq!(env.machines[0].name, "nested-host-a-g0");
        assert_eq!(env.machines[0].address, "10.1.0.1-nested-host-a-g0");
        assert_eq!(env.host.as_ref().unwrap().machines.len(), 2);

        provider.delete(env, &setup, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_deploy_failure_keeps_host_for_teardown() {
        let provider = provider("[ {host} = host-a ] && echo ok || exit 1", "true");
        let setup = setup();
        let case = TestCase::new("VERIFY-BOOT", "small");
        let request = DeployRequest {
            setup_type: "small",
            setup: &setup,
            case: &case,
            location: None,
            identifier: "nested",
            use_existing: false,
        };

        let err = provider.deploy(&request).await.unwrap_err();
        let partial = err.partial.unwrap();
        assert_eq!(partial.machines.len(), 2);
        assert!(partial.host.is_some());
    }

    #[tokio::test]
    async fn test_delete_reports_stop_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stopped");
        let provider = provider(
            "echo addr",
            &format!("echo {{guest}} >> {}; exit 1", log.display()),
        );
        let setup = setup();
        let case = TestCase::new("VERIFY-BOOT", "small");
        let request = DeployRequest {
            setup_type: "small",
            setup: &setup,
            case: &case,
            location: None,
            identifier: "nested",
            use_existing: false,
        };

        let env = provider.deploy(&request).await.unwrap();
        let err = provider.delete(env, &setup, false).await.unwrap_err();

        assert!(err.to_string().starts_with("stop guest failed"));
        let stopped = std::fs::read_to_string(&log).unwrap();
        assert_eq!(stopped.lines().count(), 4);
    }
}
