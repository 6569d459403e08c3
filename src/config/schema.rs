//! Configuration schema definitions for fleetrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for deserialization and
//! a tagged enum for provider type selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunPolicy              - Cleanup, reuse, iteration and parallelism policy
//! ├── ProviderConfig         - Tagged enum selecting the back-end
//! │   ├── Cloud              - Resource-group based public cloud
//! │   ├── HyperV             - Hypervisor host fleet
//! │   ├── Ready              - Pre-existing machines
//! │   └── Guest              - Guest VMs layered on another back-end
//! ├── SetupCatalog           - Named environment shapes
//! ├── Vec<TestCase>          - The selected test catalog
//! └── ReportConfig           - Result output settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::catalog::{SetupCatalog, TestCase};

/// Root configuration structure for fleetrun.
///
/// # TOML Structure
///
/// ```toml
/// [run]
/// resource_cleanup = "default"
/// reuse_vm_on_failure = true
/// parallel_workers = 2
///
/// [provider]
/// type = "ready"
/// machines = [{ name = "lab-01", address = "10.0.0.4" }]
///
/// [setups.small]
/// size_class = "Standard_D2s_v3"
///
/// [[tests]]
/// name = "VERIFY-BOOT"
/// setup_type = "small"
/// script = "scripts/verify_boot.sh"
///
/// [report]
/// output_dir = "test-results"
/// ```
///
/// # Example
///
/// ```
/// use fleetrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [provider]
///     type = "ready"
///     machines = [{ name = "lab-01", address = "10.0.0.4" }]
/// "#).unwrap();
/// assert_eq!(config.run.test_iterations, 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Run policy (optional, has defaults).
    #[serde(default)]
    pub run: RunPolicy,

    /// Provider configuration determining where environments come from.
    pub provider: ProviderConfig,

    /// Named setup types.
    #[serde(default)]
    pub setups: SetupCatalog,

    /// Test catalog. May also be supplied from a separate file.
    #[serde(default)]
    pub tests: Vec<TestCase>,

    /// Report configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// What happens to an environment that must not persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceCleanup {
    /// Never destroy environments; stop tracking them instead.
    Keep,
    /// Always destroy environments.
    Delete,
    /// Destroy healthy environments, preserve failed ones for inspection.
    #[default]
    Default,
}

/// How the parallel dispatcher runs its workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Workers are tokio tasks inside this process.
    #[default]
    Task,
    /// Workers are child processes of the current executable.
    Process,
}

/// Run-wide policy flags.
///
/// Captured once when a run starts and never changed afterwards.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `resource_cleanup` | `default` |
/// | `use_existing_rg` | false |
/// | `reuse_vm_on_failure` | false |
/// | `deploy_vm_per_each_test` | false |
/// | `test_iterations` | 1 |
/// | `parallel_workers` | 1 |
/// | `resource_prefix` | `"fleetrun"` |
/// | `poll_interval_secs` | 5 |
/// | `worker_mode` | `task` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunPolicy {
    #[serde(default)]
    pub resource_cleanup: ResourceCleanup,

    /// Adopt a pre-existing environment instead of provisioning one.
    #[serde(default)]
    pub use_existing_rg: bool,

    /// Name of the environment adopted when `use_existing_rg` is set.
    pub existing_environment: Option<String>,

    /// Restart and reuse an environment after a failed test.
    #[serde(default)]
    pub reuse_vm_on_failure: bool,

    /// Provision a fresh environment for every test.
    #[serde(default)]
    pub deploy_vm_per_each_test: bool,

    /// How many times each test is repeated.
    #[serde(default = "default_one")]
    pub test_iterations: u32,

    /// Number of parallel workers the catalog is split across.
    #[serde(default = "default_one_usize")]
    pub parallel_workers: usize,

    /// Location override. A comma-separated list runs each test once per location.
    pub test_location: Option<String>,

    /// Forces this VM size on every test.
    pub override_vm_size: Option<String>,

    /// Forces this image on every test.
    pub override_image: Option<String>,

    /// Prefix for generated environment names.
    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,

    /// Seconds between dispatcher liveness checks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub worker_mode: WorkerMode,
}

fn default_one() -> u32 {
    1
}

fn default_one_usize() -> usize {
    1
}

fn default_resource_prefix() -> String {
    "fleetrun".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            resource_cleanup: ResourceCleanup::Default,
            use_existing_rg: false,
            existing_environment: None,
            reuse_vm_on_failure: false,
            deploy_vm_per_each_test: false,
            test_iterations: default_one(),
            parallel_workers: default_one_usize(),
            test_location: None,
            override_vm_size: None,
            override_image: None,
            resource_prefix: default_resource_prefix(),
            poll_interval_secs: default_poll_interval(),
            worker_mode: WorkerMode::Task,
        }
    }
}

/// Invalid combinations of run policy values.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("test_iterations must be at least 1")]
    ZeroIterations,

    #[error("parallel_workers must be at least 1")]
    ZeroWorkers,

    #[error("poll_interval_secs must be at least 1")]
    ZeroPollInterval,

    #[error("use_existing_rg is set but existing_environment is missing")]
    MissingExistingEnvironment,

    #[error("resource_prefix must not be empty")]
    EmptyPrefix,
}

impl RunPolicy {
    /// Checks the policy for values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.test_iterations == 0 {
            return Err(PolicyError::ZeroIterations);
        }
        if self.parallel_workers == 0 {
            return Err(PolicyError::ZeroWorkers);
        }
        if self.poll_interval_secs == 0 {
            return Err(PolicyError::ZeroPollInterval);
        }
        if self.use_existing_rg
            && self
                .existing_environment
                .as_deref()
                .is_none_or(|name| name.trim().is_empty())
        {
            return Err(PolicyError::MissingExistingEnvironment);
        }
        if self.resource_prefix.trim().is_empty() {
            return Err(PolicyError::EmptyPrefix);
        }
        Ok(())
    }

    /// Locations from `test_location`, in the order given.
    pub fn locations(&self) -> Vec<String> {
        self.test_location
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Provider configuration specifying where environments come from.
///
/// # Provider Types
///
/// | Type | Description |
/// |------|-------------|
/// | `cloud` | Resource groups in a public cloud, driven by CLI commands |
/// | `hyperv` | VMs created on a fleet of hypervisor hosts |
/// | `ready` | Machines that already exist and are never destroyed |
/// | `guest` | Guest VMs started inside another provider's machines |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Cloud(CloudProviderConfig),
    HyperV(HyperVProviderConfig),
    Ready(ReadyProviderConfig),
    Guest(GuestProviderConfig),
}

impl ProviderConfig {
    /// Short back-end name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderConfig::Cloud(_) => "cloud",
            ProviderConfig::HyperV(_) => "hyperv",
            ProviderConfig::Ready(_) => "ready",
            ProviderConfig::Guest(_) => "guest",
        }
    }
}

/// Command templates shared by every back-end.
///
/// Templates may use `{name}` (environment), `{machine}`, `{address}` and
/// `{test}` placeholders.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleCommands {
    /// Restarts one machine.
    pub restart_command: Option<String>,

    /// Exits 0 when a machine is reachable.
    pub probe_command: Option<String>,

    /// Runs on every machine before each test.
    pub setup_command: Option<String>,

    /// Runs on every machine after each test.
    pub case_cleanup_command: Option<String>,

    /// Timeout for a single provisioning command.
    ///
    /// Default: 3600
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// How long a restarted environment may take to become reachable.
    ///
    /// Default: 600
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_secs: u64,

    /// Seconds between reachability probes while waiting.
    ///
    /// Default: 10
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Shell used to run the templates.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Environment variables for every command.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_command_timeout() -> u64 {
    3600
}

fn default_restart_timeout() -> u64 {
    600
}

fn default_probe_interval() -> u64 {
    10
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Default for LifecycleCommands {
    fn default() -> Self {
        Self {
            restart_command: None,
            probe_command: None,
            setup_command: None,
            case_cleanup_command: None,
            command_timeout_secs: default_command_timeout(),
            restart_timeout_secs: default_restart_timeout(),
            probe_interval_secs: default_probe_interval(),
            shell: default_shell(),
            env: HashMap::new(),
        }
    }
}

/// Configuration for the cloud provider.
///
/// Extra placeholders: `{location}`, `{vm_size}`, `{image}`, `{vm_count}`,
/// `{setup}`.
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "cloud"
/// exists_command = "az group exists -n {name} | grep -q true"
/// list_command = "az vm list-ip-addresses -g {name} --query '[].[virtualMachine.name, virtualMachine.network.privateIpAddresses[0]]' -o tsv"
/// deploy_command = "./scripts/deploy.sh {name} {location} {vm_size} {vm_count} {image}"
/// delete_command = "az group delete -n {name} --yes"
/// restart_command = "az vm restart -g {name} -n {machine}"
/// probe_command = "nc -z -w 5 {address} 22"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudProviderConfig {
    /// Exits 0 when an environment named `{name}` already exists.
    pub exists_command: Option<String>,

    /// Prints `machine address` lines for an existing environment. Adopted
    /// environments are listed with it instead of being deployed again.
    pub list_command: Option<String>,

    /// Creates the environment and prints `machine address` lines.
    pub deploy_command: String,

    /// Destroys the environment.
    pub delete_command: String,

    /// Run deletes in the background; they are joined at the end of the run.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub background_delete: bool,

    /// Location used when neither the test nor the policy names one.
    pub default_location: Option<String>,

    #[serde(flatten)]
    pub lifecycle: LifecycleCommands,
}

/// Configuration for the Hyper-V host fleet provider.
///
/// Extra placeholders: `{host}`, `{vm}`, `{image}`, `{vm_size}`,
/// `{generation}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HyperVProviderConfig {
    /// Hypervisor hosts environments are spread across.
    pub hosts: Vec<String>,

    /// Exits 0 when VM `{vm}` exists on `{host}`.
    pub exists_command: Option<String>,

    /// Copies the image onto the host.
    pub copy_image_command: Option<String>,

    /// Creates and starts VM `{vm}` on `{host}`.
    pub create_vm_command: String,

    /// Prints the address of VM `{vm}` on `{host}`.
    pub address_command: String,

    /// Stops and removes VM `{vm}` from `{host}`.
    pub remove_vm_command: String,

    /// Run deletes in the background; they are joined at the end of the run.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub background_delete: bool,

    #[serde(flatten)]
    pub lifecycle: LifecycleCommands,
}

/// A machine that already exists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReadyMachine {
    pub name: String,
    pub address: String,
}

/// Configuration for pre-existing machines.
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "ready"
/// machines = [
///     { name = "lab-01", address = "10.0.0.4" },
///     { name = "lab-02", address = "10.0.0.5" },
/// ]
/// restart_command = "ssh root@{address} reboot"
/// probe_command = "ssh -o ConnectTimeout=5 root@{address} true"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadyProviderConfig {
    pub machines: Vec<ReadyMachine>,

    #[serde(flatten)]
    pub lifecycle: LifecycleCommands,
}

/// Configuration for guest VMs layered on a host back-end.
///
/// Extra placeholders: `{host}` and `{host_address}` (the host machine),
/// `{guest}` and `{image}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuestProviderConfig {
    /// Back-end that provides the host machines.
    pub host: Box<ProviderConfig>,

    /// Starts guest `{guest}` on a host machine and prints its address.
    pub start_guest_command: String,

    /// Stops guest `{guest}` on a host machine.
    pub stop_guest_command: String,

    /// Guests started on every host machine.
    ///
    /// Default: 1
    #[serde(default = "default_one")]
    pub guests_per_host: u32,

    #[serde(flatten)]
    pub lifecycle: LifecycleCommands,
}

fn default_true() -> bool {
    true
}

/// Report configuration for result output.
///
/// # Example
///
/// ```toml
/// [report]
/// output_dir = "build/test-results"
/// results_file = "results.jsonl"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where result files are written.
    ///
    /// Default: `"test-results"`
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// JSON-lines file with one record per test, written to `{output_dir}`.
    ///
    /// Default: `"results.jsonl"`
    #[serde(default = "default_results_file")]
    pub results_file: String,

    /// Show progress and per-test lines on the console.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub console: bool,
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_results_file() -> String {
    "results.jsonl".to_string()
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            results_file: default_results_file(),
            console: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults_are_valid() {
        let policy = RunPolicy::default();
        assert_eq!(policy.validate(), Ok(()));
        assert_eq!(policy.resource_cleanup, ResourceCleanup::Default);
    }

    #[test]
    fn test_policy_rejects_zero_values() {
        let policy = RunPolicy {
            test_iterations: 0,
            ..Default::default()
        };
        assert_eq!(policy.validate(), Err(PolicyError::ZeroIterations));

        let policy = RunPolicy {
            parallel_workers: 0,
            ..Default::default()
        };
        assert_eq!(policy.validate(), Err(PolicyError::ZeroWorkers));

        let policy = RunPolicy {
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(policy.validate(), Err(PolicyError::ZeroPollInterval));
    }

    #[test]
    fn test_policy_existing_environment_required() {
        let policy = RunPolicy {
            use_existing_rg: true,
            ..Default::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyError::MissingExistingEnvironment)
        );

        let policy = RunPolicy {
            use_existing_rg: true,
            existing_environment: Some("shared-rg".to_string()),
            ..Default::default()
        };
        assert_eq!(policy.validate(), Ok(()));
    }

    #[test]
    fn test_locations_split() {
        let policy = RunPolicy {
            test_location: Some("westus2, eastus ,".to_string()),
            ..Default::default()
        };
        assert_eq!(policy.locations(), vec!["westus2", "eastus"]);
        assert!(RunPolicy::default().locations().is_empty());
    }

    #[test]
    fn test_guest_provider_nests_host() {
        let config: ProviderConfig = toml::from_str(
            r#"
            type = "guest"
            start_guest_command = "start {guest}"
            stop_guest_command = "stop {guest}"

            [host]
            type = "ready"
            machines = [{ name = "host-1", address = "10.0.0.9" }]
            "#,
        )
        .unwrap();

        let ProviderConfig::Guest(guest) = config else {
            panic!("expected guest provider");
        };
        assert_eq!(guest.host.kind(), "ready");
        assert_eq!(guest.guests_per_host, 1);
        assert_eq!(guest.lifecycle.shell, "/bin/sh");
    }
}
