//! Hypervisor host fleet provider.
//!
//! Environments are sets of VMs created on one of the configured hosts. Hosts
//! are picked round-robin so consecutive environments spread across the
//! fleet. VMs are named `<identifier>-<n>`.
//!
//! With `use_existing`, every host is checked for the full set of VMs before
//! anything is created; the first host holding all of them is adopted.
//!
//! # Deploy Sequence
//!
//! ```text
//! pick host ──► copy_image_command (once)
//!           ──► for n in 0..vm_count:
//!                   create_vm_command  {host} {vm} {image} {vm_size} {generation}
//!                   address_command    {host} {vm}   (prints the address)
//! ```
//!
//! A failure part-way leaves a partial environment containing the VMs that
//! were created, so the orchestrator can still remove them.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use super::lifecycle::MachineCommands;
use super::{
    DeployError, DeployRequest, Environment, Machine, Provider, ProviderError, ProviderResult,
    TeardownTracker,
};
use crate::catalog::{SetupType, TestCase};
use crate::config::HyperVProviderConfig;
use crate::outcome::CleanupFailure;
use crate::shell::{ShellRunner, render};

pub struct HyperVProvider {
    config: HyperVProviderConfig,
    commands: MachineCommands,
    teardown: TeardownTracker,
    next_host: AtomicUsize,
}

impl HyperVProvider {
    pub fn new(config: HyperVProviderConfig) -> Self {
        let commands = MachineCommands::new(config.lifecycle.clone());
        Self {
            config,
            commands,
            teardown: TeardownTracker::new(),
            next_host: AtomicUsize::new(0),
        }
    }

    fn pick_host(&self) -> ProviderResult<&str> {
        if self.config.hosts.is_empty() {
            return Err(ProviderError::Capacity(
                "no hypervisor hosts configured".to_string(),
            ));
        }
        let idx = self.next_host.fetch_add(1, Ordering::Relaxed) % self.config.hosts.len();
        Ok(&self.config.hosts[idx])
    }

    async fn vm_exists(&self, host: &str, vm: &str) -> bool {
        let Some(template) = &self.config.exists_command else {
            return false;
        };
        let cmd = render(template, &[("host", host), ("vm", vm)]);
        matches!(self.commands.runner().run(&cmd).await, Ok(o) if o.success())
    }

    /// The first host on which every VM in `vm_names` already exists.
    async fn find_existing(&self, vm_names: &[String]) -> Option<&str> {
        if self.config.exists_command.is_none() || vm_names.is_empty() {
            return None;
        }
        for host in &self.config.hosts {
            let mut all_exist = true;
            for vm in vm_names {
                if !self.vm_exists(host, vm).await {
                    all_exist = false;
                    break;
                }
            }
            if all_exist {
                return Some(host.as_str());
            }
            debug!("{} does not hold {}", host, vm_names.join(", "));
        }
        None
    }

    async fn address_of(&self, host: &str, vm: &str) -> ProviderResult<String> {
        let cmd = render(&self.config.address_command, &[("host", host), ("vm", vm)]);
        let output = self.commands.runner().run_checked("address lookup", &cmd).await?;
        output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::NotFound(format!("no address reported for {}", vm)))
    }
}

/// Removes every VM of an environment, returning the first failure.
async fn remove_vms(
    runner: &ShellRunner,
    template: &str,
    environment: &Environment,
) -> ProviderResult<()> {
    let host = environment
        .details
        .get("host")
        .map(String::as_str)
        .unwrap_or("");
    let mut first_error = None;
    for machine in &environment.machines {
        let cmd = render(template, &[("host", host), ("vm", &machine.name)]);
        if let Err(e) = runner.run_checked("remove vm", &cmd).await {
            debug!("Removing {} from {} failed: {}", machine.name, host, e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[async_trait]
impl Provider for HyperVProvider {
    fn name(&self) -> &str {
        "hyperv"
    }

    async fn deploy(&self, request: &DeployRequest<'_>) -> Result<Environment, DeployError> {
        let vm_names: Vec<String> = (0..request.setup.vm_count)
            .map(|n| format!("{}-{}", request.identifier, n))
            .collect();

        if request.use_existing
            && let Some(host) = self.find_existing(&vm_names).await
        {
            info!("Adopting existing VMs {} on {}", request.identifier, host);
            let mut environment = Environment::new(request.identifier, self.name())
                .with_detail("host", host)
                .with_detail("setup", request.setup_type);
            environment.adopted = true;
            for vm in &vm_names {
                match self.address_of(host, vm).await {
                    Ok(address) => environment.machines.push(Machine::new(vm, address)),
                    Err(e) => return Err(DeployError::partial(environment, e)),
                }
            }
            return Ok(environment);
        }

        let host = self.pick_host()?;
        let mut environment = Environment::new(request.identifier, self.name())
            .with_detail("host", host)
            .with_detail("setup", request.setup_type);

        info!(
            "Creating {} VMs for {} on {}",
            vm_names.len(),
            request.identifier,
            host
        );

        let generation = request
            .case
            .setup_config
            .generation
            .as_deref()
            .unwrap_or("1");

        if let Some(template) = &self.config.copy_image_command {
            let cmd = render(template, &[("host", host), ("image", request.image())]);
            self.commands.runner().run_checked("copy image", &cmd).await?;
        }

        for vm in &vm_names {
            let cmd = render(&self.config.create_vm_command, &[
                ("host", host),
                ("vm", vm),
                ("image", request.image()),
                ("vm_size", request.vm_size()),
                ("generation", generation),
            ]);
            if let Err(e) = self.commands.runner().run_checked("create vm", &cmd).await {
                // The failed VM may exist half-configured; include it for removal.
                environment.machines.push(Machine::new(vm, ""));
                return Err(DeployError::partial(environment, e));
            }
            match self.address_of(host, vm).await {
                Ok(address) => environment.machines.push(Machine::new(vm, address)),
                Err(e) => {
                    environment.machines.push(Machine::new(vm, ""));
                    return Err(DeployError::partial(environment, e));
                }
            }
        }

        Ok(environment)
    }

    async fn delete(
        &self,
        environment: Environment,
        _setup: &SetupType,
        _use_existing: bool,
    ) -> ProviderResult<()> {
        info!(
            "Removing {} VMs of {}",
            environment.machines.len(),
            environment.name
        );

        if self.config.background_delete {
            let runner = self.commands.runner().clone();
            let template = self.config.remove_vm_command.clone();
            let resource = environment.name.clone();
            self.teardown.spawn(resource, async move {
                remove_vms(&runner, &template, &environment).await
            });
            return Ok(());
        }

        remove_vms(
            self.commands.runner(),
            &self.config.remove_vm_command,
            &environment,
        )
        .await
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
        self.teardown.drain(owned).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleCommands;

    fn setup(vm_count: u32) -> SetupType {
        SetupType {
            vm_count,
            size_class: "A2".to_string(),
            topology: "single".to_string(),
        }
    }

    fn provider(create: &str, hosts: &[&str]) -> HyperVProvider {
        HyperVProvider::new(HyperVProviderConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            exists_command: Some("[ {vm} = keep-0 ]".to_string()),
            copy_image_command: None,
            create_vm_command: create.to_string(),
            address_command: "echo {host}/{vm}".to_string(),
            remove_vm_command: "true".to_string(),
            background_delete: false,
            lifecycle: LifecycleCommands::default(),
        })
    }

    fn request<'a>(
        setup: &'a SetupType,
        case: &'a TestCase,
        identifier: &'a str,
        use_existing: bool,
    ) -> DeployRequest<'a> {
        DeployRequest {
            setup_type: "small",
            setup,
            case,
            location: None,
            identifier,
            use_existing,
        }
    }

    #[tokio::test]
    async fn test_deploy_creates_named_vms_round_robin() {
        let provider = provider("true", &["hv-a", "hv-b"]);
        let setup = setup(2);
        let case = TestCase::new("VERIFY-BOOT", "small");

        let first = provider
            .deploy(&request(&setup, &case, "env-1", false))
            .await
            .unwrap();
        assert_eq!(first.details["host"], "hv-a");
        assert_eq!(first.addresses(), "hv-a/env-1-0,hv-a/env-1-1");

        let second = provider
            .deploy(&request(&setup, &case, "env-2", false))
            .await
            .unwrap();
        assert_eq!(second.details["host"], "hv-b");
    }

    #[tokio::test]
    async fn test_deploy_partial_on_create_failure() {
        let provider = provider("[ {vm} = env-1-0 ] || exit 1", &["hv-a"]);
        let setup = setup(3);
        let case = TestCase::new("VERIFY-BOOT", "small");

        let err = provider
            .deploy(&request(&setup, &case, "env-1", false))
            .await
            .unwrap_err();
        let partial = err.partial.unwrap();
        let names: Vec<_> = partial.machines.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["env-1-0", "env-1-1"]);
    }

    #[tokio::test]
    async fn test_deploy_adopts_existing_vms() {
        let provider = provider("exit 1", &["hv-a"]);
        let setup = setup(1);
        let case = TestCase::new("VERIFY-BOOT", "small");

        let env = provider
            .deploy(&request(&setup, &case, "keep", true))
            .await
            .unwrap();
        assert!(env.adopted);
        assert_eq!(env.addresses(), "hv-a/keep-0");
    }

    #[tokio::test]
    async fn test_deploy_adopts_existing_vms_on_any_host() {
        let dir = tempfile::tempdir().unwrap();
        let created = dir.path().join("created");
        let mut config = provider("true", &["hv-a", "hv-b"]).config;
        config.exists_command = Some("[ {host} = hv-b ] && [ {vm} = keep-0 ]".to_string());
        config.create_vm_command = format!("echo {{host}} >> {}", created.display());
        let provider = HyperVProvider::new(config);
        let setup = setup(1);
        let case = TestCase::new("VERIFY-BOOT", "small");

        // Round-robin would pick hv-a first; the VMs live on hv-b.
        let env = provider
            .deploy(&request(&setup, &case, "keep", true))
            .await
            .unwrap();
        assert!(env.adopted);
        assert_eq!(env.details["host"], "hv-b");
        assert_eq!(env.addresses(), "hv-b/keep-0");
        assert!(!created.exists());

        // Missing everywhere: created on the next round-robin host.
        let env = provider
            .deploy(&request(&setup, &case, "fresh", true))
            .await
            .unwrap();
        assert!(!env.adopted);
        assert_eq!(env.details["host"], "hv-a");
        assert_eq!(std::fs::read_to_string(&created).unwrap(), "hv-a\n");
    }

    #[tokio::test]
    async fn test_background_delete_failures_drain_per_owner() {
        let mut config = provider("true", &["hv-a"]).config;
        config.remove_vm_command = "echo 'vm is running' >&2; exit 1".to_string();
        config.background_delete = true;
        let provider = HyperVProvider::new(config);

        for name in ["env-w0", "env-w1"] {
            let env = Environment::new(name, "hyperv")
                .with_detail("host", "hv-a")
                .with_machine(Machine::new(format!("{}-0", name), ""));
            provider.delete(env, &setup(1), false).await.unwrap();
        }

        let failures = provider.run_test_cleanup(&["env-w1".to_string()]).await;
        assert_eq!(failures, vec![CleanupFailure {
            resource: "env-w1".to_string(),
            reason: "remove vm failed: vm is running".to_string(),
        }]);
    }

    #[tokio::test]
    async fn test_deploy_without_hosts_is_capacity_error() {
        let provider = provider("true", &[]);
        let setup = setup(1);
        let case = TestCase::new("VERIFY-BOOT", "small");

        let err = provider
            .deploy(&request(&setup, &case, "env-1", false))
            .await
            .unwrap_err();
        assert!(matches!(err.error, ProviderError::Capacity(_)));
    }
}
