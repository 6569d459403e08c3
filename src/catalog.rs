//! Test and setup catalogs.
//!
//! The [`TestCase`] records selected for a run and the [`SetupCatalog`] of
//! named environment shapes they refer to. Both are read-only once a run
//! starts and may be shared between sequential and parallel workers.
//!
//! # TOML Structure
//!
//! ```toml
//! [setups.small]
//! vm_count = 1
//! size_class = "Standard_D2s_v3"
//! topology = "single"
//!
//! [[tests]]
//! name = "VERIFY-DEPLOYMENT-PROVISION"
//! category = "Functional"
//! area = "CORE"
//! priority = 0
//! setup_type = "small"
//! script = "scripts/verify_provision.sh"
//! timeout_secs = 600
//!
//! [tests.setup_config]
//! location = "westus2"
//! image = "canonical ubuntuserver 18.04-lts latest"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment parameters a test case needs.
///
/// Known keys are typed fields; back-end specific settings go into
/// [`extra`](Self::extra) and are passed through to providers untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SetupConfig {
    /// Region or datacenter the environment is created in.
    pub location: Option<String>,

    /// Explicit VM size, overriding the setup type's size class.
    pub vm_size: Option<String>,

    /// Networking mode (e.g. `synthetic`, `sriov`).
    pub networking: Option<String>,

    /// Disk type (e.g. `managed`, `unmanaged`).
    pub disk_type: Option<String>,

    /// Guest OS type (e.g. `linux`, `windows`).
    pub os_type: Option<String>,

    /// Image reference the machines boot from.
    pub image: Option<String>,

    /// VM generation, `1` or `2`.
    pub generation: Option<String>,

    /// Iteration index, set when the run repeats each test.
    pub iteration: Option<u32>,

    /// Back-end specific keys.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl SetupConfig {
    /// Returns the VM size for this test, falling back to the setup's size class.
    pub fn effective_vm_size<'a>(&'a self, setup: &'a SetupType) -> &'a str {
        self.vm_size.as_deref().unwrap_or(&setup.size_class)
    }
}

/// A single selected test case.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TestCase {
    /// Unique test name.
    pub name: String,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub area: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Lower values are more critical and run first.
    #[serde(default)]
    pub priority: i32,

    /// Name of the [`SetupType`] this test runs on.
    pub setup_type: Option<String>,

    /// Script executed against the environment.
    pub script: PathBuf,

    /// Files the script needs next to it.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Script timeout in seconds.
    #[serde(default = "default_test_timeout")]
    pub timeout_secs: u64,

    /// Whether this test must get a freshly provisioned environment.
    #[serde(default)]
    pub use_new_environment: bool,

    /// Extra attempts after a failed or aborted run, each on a new
    /// environment.
    #[serde(default)]
    pub retry: u32,

    #[serde(default)]
    pub setup_config: SetupConfig,
}

fn default_test_timeout() -> u64 {
    1800
}

impl TestCase {
    /// Creates a test case with defaults for everything but the name and setup type.
    pub fn new(name: impl Into<String>, setup_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            script: PathBuf::from(format!("{}.sh", name.to_lowercase())),
            name,
            category: String::new(),
            area: String::new(),
            tags: Vec::new(),
            priority: 0,
            setup_type: Some(setup_type.into()),
            files: Vec::new(),
            timeout_secs: default_test_timeout(),
            use_new_environment: false,
            retry: 0,
            setup_config: SetupConfig::default(),
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the script path.
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = script.into();
        self
    }

    /// Sets the setup config.
    pub fn with_setup_config(mut self, setup_config: SetupConfig) -> Self {
        self.setup_config = setup_config;
        self
    }

    /// Requires a fresh environment for this test.
    pub fn with_new_environment(mut self) -> Self {
        self.use_new_environment = true;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Name including the iteration index, if any.
    pub fn display_name(&self) -> String {
        match self.setup_config.iteration {
            Some(iteration) => format!("{}#{}", self.name, iteration),
            None => self.name.clone(),
        }
    }
}

/// Declarative shape of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SetupType {
    /// Number of machines in the environment.
    #[serde(default = "default_vm_count")]
    pub vm_count: u32,

    /// Default VM size.
    pub size_class: String,

    /// Free-form topology description (e.g. `single`, `client-server`).
    #[serde(default = "default_topology")]
    pub topology: String,
}

fn default_vm_count() -> u32 {
    1
}

fn default_topology() -> String {
    "single".to_string()
}

/// Named setup types, keyed by setup-type name.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SetupCatalog {
    setups: HashMap<String, SetupType>,
}

impl SetupCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a setup type, replacing any previous one with the same name.
    pub fn with_setup(mut self, name: impl Into<String>, setup: SetupType) -> Self {
        self.setups.insert(name.into(), setup);
        self
    }

    pub fn get(&self, name: &str) -> Option<&SetupType> {
        self.setups.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.setups.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.setups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.setups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_includes_iteration() {
        let mut case = TestCase::new("VERIFY-BOOT", "small");
        assert_eq!(case.display_name(), "VERIFY-BOOT");

        case.setup_config.iteration = Some(2);
        assert_eq!(case.display_name(), "VERIFY-BOOT#2");
    }

    #[test]
    fn test_effective_vm_size() {
        let setup = SetupType {
            vm_count: 1,
            size_class: "Standard_D2s_v3".to_string(),
            topology: "single".to_string(),
        };
        let mut config = SetupConfig::default();
        assert_eq!(config.effective_vm_size(&setup), "Standard_D2s_v3");

        config.vm_size = Some("Standard_F72s_v2".to_string());
        assert_eq!(config.effective_vm_size(&setup), "Standard_F72s_v2");
    }

    #[test]
    fn test_case_defaults_from_toml() {
        let case: TestCase = toml::from_str(
            r#"
            name = "VERIFY-BOOT"
            setup_type = "small"
            script = "boot.sh"
            "#,
        )
        .unwrap();

        assert_eq!(case.priority, 0);
        assert_eq!(case.timeout_secs, 1800);
        assert!(!case.use_new_environment);
        assert_eq!(case.retry, 0);
        assert_eq!(case.setup_config, SetupConfig::default());
    }

    #[test]
    fn test_case_retry_from_toml() {
        let case: TestCase = toml::from_str(
            r#"
            name = "FLAKY-NET"
            setup_type = "small"
            retry = 2
            "#,
        )
        .unwrap();
        assert_eq!(case.retry, 2);
    }
}
