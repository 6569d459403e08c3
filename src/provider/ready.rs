//! Provider for machines that already exist.
//!
//! Nothing is created or destroyed: deploy leases the first `vm_count`
//! free machines and delete only returns the lease. A machine is never
//! handed to two live environments at once; when too few are free, deploy
//! fails with [`ProviderError::Capacity`]. Restart, probe and the per-test
//! hooks run the configured lifecycle commands.
//!
//! Leases live in one process. Worker processes of a parallel run each take
//! a disjoint share of the machine list instead (see
//! [`ReadyProvider::for_worker`]).
//!
//! # Example Configuration
//!
//! ```toml
//! [provider]
//! type = "ready"
//! machines = [
//!     { name = "lab-01", address = "10.0.0.4" },
//!     { name = "lab-02", address = "10.0.0.5" },
//! ]
//! restart_command = "ssh root@{address} reboot"
//! probe_command = "ssh -o ConnectTimeout=5 root@{address} true"
//! ```

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use super::lifecycle::MachineCommands;
use super::{
    DeployError, DeployRequest, Environment, Machine, Provider, ProviderError, ProviderResult,
};
use crate::catalog::{SetupType, TestCase};
use crate::config::{ReadyMachine, ReadyProviderConfig};
use crate::context::WorkerSlot;

pub struct ReadyProvider {
    config: ReadyProviderConfig,
    commands: MachineCommands,
    /// Names of machines held by a live environment.
    leased: Mutex<HashSet<String>>,
}

impl ReadyProvider {
    pub fn new(config: ReadyProviderConfig) -> Self {
        let commands = MachineCommands::new(config.lifecycle.clone());
        Self {
            config,
            commands,
            leased: Mutex::new(HashSet::new()),
        }
    }

    /// Keeps only the machines at positions `i` with `i % count == index`,
    /// so worker processes of one run never share a machine.
    pub fn for_worker(mut config: ReadyProviderConfig, slot: WorkerSlot) -> Self {
        let count = slot.count.max(1);
        config.machines = config
            .machines
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % count == slot.index)
            .map(|(_, m)| m)
            .collect();
        debug!(
            "Worker {} uses {} ready machines",
            slot,
            config.machines.len()
        );
        Self::new(config)
    }

    fn leases(&self) -> ProviderResult<MutexGuard<'_, HashSet<String>>> {
        self.leased
            .lock()
            .map_err(|_| ProviderError::Other(anyhow::anyhow!("ready machine leases poisoned")))
    }

    /// Leases `wanted` free machines.
    fn lease(&self, setup_type: &str, wanted: usize) -> ProviderResult<Vec<ReadyMachine>> {
        let configured = self.config.machines.len();
        if wanted > configured {
            return Err(ProviderError::Capacity(format!(
                "setup '{}' needs {} machines, {} configured",
                setup_type, wanted, configured
            )));
        }

        let mut leased = self.leases()?;
        let free: Vec<ReadyMachine> = self
            .config
            .machines
            .iter()
            .filter(|m| !leased.contains(&m.name))
            .take(wanted)
            .cloned()
            .collect();
        if free.len() < wanted {
            return Err(ProviderError::Capacity(format!(
                "setup '{}' needs {} machines, {} of {} free",
                setup_type,
                wanted,
                configured - leased.len(),
                configured
            )));
        }
        leased.extend(free.iter().map(|m| m.name.clone()));
        Ok(free)
    }

    fn release(&self, environment: &Environment) {
        if let Ok(mut leased) = self.leases() {
            for machine in &environment.machines {
                leased.remove(&machine.name);
            }
        }
    }
}

#[async_trait]
impl Provider for ReadyProvider {
    fn name(&self) -> &str {
        "ready"
    }

    async fn deploy(&self, request: &DeployRequest<'_>) -> Result<Environment, DeployError> {
        let machines = self.lease(request.setup_type, request.setup.vm_count as usize)?;

        let mut environment = Environment::new(request.identifier, self.name());
        environment.adopted = true;
        environment.machines = machines
            .iter()
            .map(|m| Machine::new(&m.name, &m.address))
            .collect();

        info!(
            "Using ready machines {} for {}",
            environment.addresses(),
            request.identifier
        );
        Ok(environment)
    }

    async fn delete(
        &self,
        environment: Environment,
        _setup: &SetupType,
        _use_existing: bool,
    ) -> ProviderResult<()> {
        info!(
            "Releasing ready machines of {}; they are not destroyed",
            environment.name
        );
        self.release(&environment);
        Ok(())
    }

    async fn forget(&self, environment: &Environment) {
        self.release(environment);
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
}
