//! Configuration loading and schema definitions for fleetrun.
//!
//! This module provides functions for loading fleetrun configuration from
//! TOML files or strings, and for loading a test catalog kept in a separate
//! file. The schema itself lives in [`schema`].

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::catalog::TestCase;

/// Loads fleetrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - The run policy is invalid
///
/// # Example
///
/// ```no_run
/// use fleetrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("fleetrun.toml"))?;
/// println!("Workers: {}", config.run.parallel_workers);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .run
        .validate()
        .with_context(|| format!("Invalid run policy in {}", path.display()))?;

    Ok(config)
}

/// Loads fleetrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use fleetrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     parallel_workers = 4
///
///     [provider]
///     type = "ready"
///     machines = []
/// "#)?;
///
/// assert_eq!(config.run.parallel_workers, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.run.validate().context("Invalid run policy")?;

    Ok(config)
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tests: Vec<TestCase>,
}

/// Loads a test catalog from a TOML file containing `[[tests]]` entries.
pub fn load_catalog(path: &Path) -> Result<Vec<TestCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;

    let catalog: CatalogFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse catalog file: {}", path.display()))?;

    Ok(catalog.tests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_str_full() {
        let config = load_config_str(
            r#"
            [run]
            resource_cleanup = "keep"
            reuse_vm_on_failure = true
            test_iterations = 2

            [provider]
            type = "cloud"
            deploy_command = "deploy {name}"
            delete_command = "delete {name}"

            [setups.small]
            vm_count = 1
            size_class = "Standard_D2s_v3"

            [[tests]]
            name = "VERIFY-BOOT"
            setup_type = "small"
            script = "boot.sh"
            priority = 1

            [tests.setup_config]
            location = "westus2"
            "#,
        )
        .unwrap();

        assert_eq!(config.run.resource_cleanup, ResourceCleanup::Keep);
        assert!(config.run.reuse_vm_on_failure);
        assert_eq!(config.run.test_iterations, 2);
        assert_eq!(config.provider.kind(), "cloud");
        assert!(config.setups.contains("small"));
        assert_eq!(config.tests.len(), 1);
        assert_eq!(
            config.tests[0].setup_config.location.as_deref(),
            Some("westus2")
        );
        assert_eq!(config.report.results_file, "results.jsonl");
    }

    #[test]
    fn test_load_config_str_rejects_invalid_policy() {
        let err = load_config_str(
            r#"
            [run]
            parallel_workers = 0

            [provider]
            type = "ready"
            machines = []
            "#,
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("parallel_workers"));
    }

    #[test]
    fn test_load_config_str_rejects_zero_poll_interval() {
        let err = load_config_str(
            r#"
            [run]
            parallel_workers = 2
            poll_interval_secs = 0

            [provider]
            type = "ready"
            machines = []
            "#,
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("poll_interval_secs must be at least 1"));
    }

    #[test]
    fn test_load_catalog_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[tests]]
            name = "A"
            setup_type = "small"
            script = "a.sh"

            [[tests]]
            name = "B"
            setup_type = "small"
            script = "b.sh"
            "#
        )
        .unwrap();

        let tests = load_catalog(file.path()).unwrap();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[1].name, "B");
    }
}
