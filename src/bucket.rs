//! Grouping of test cases into setup groups.
//!
//! Test cases whose environment-shaping parameters match can share one
//! provisioned environment. The [`Bucketizer`] first expands the catalog
//! (iterations, location list, forced overrides), then partitions it by
//! [`GroupKey`].
//!
//! ```text
//!  Vec<TestCase> ──expand()──► Vec<TestCase> ──bucketize()──► Bucketized
//!                                                             ├── groups:   Vec<SetupGroup>
//!                                                             └── rejected: Vec<RejectedCase>
//! ```
//!
//! Bucketizing is a pure function of the catalog and the run policy: the
//! same input always yields the same keys in the same order.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::catalog::{SetupCatalog, TestCase};
use crate::config::RunPolicy;

/// A test case that cannot be placed in any group.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("test case has no setup type")]
    MissingSetupType,

    #[error("unknown setup type '{0}'")]
    UnknownSetupType(String),

    #[error("invalid {field} '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// The subset of a test's configuration that determines environment shape.
///
/// Two test cases share an environment iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupKey {
    pub setup_type: String,
    pub location: Option<String>,
    pub vm_size: Option<String>,
    pub networking: Option<String>,
    pub disk_type: Option<String>,
    pub os_type: Option<String>,
    pub image: Option<String>,
    pub generation: Option<String>,
}

impl GroupKey {
    fn from_case(setup_type: &str, case: &TestCase) -> Self {
        let config = &case.setup_config;
        Self {
            setup_type: setup_type.to_string(),
            location: config.location.clone(),
            vm_size: config.vm_size.clone(),
            networking: config.networking.clone(),
            disk_type: config.disk_type.clone(),
            os_type: config.os_type.clone(),
            image: config.image.clone(),
            generation: config.generation.clone(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.setup_type)?;
        let parts = [
            &self.location,
            &self.vm_size,
            &self.networking,
            &self.disk_type,
            &self.os_type,
            &self.image,
            &self.generation,
        ];
        for part in parts.into_iter().flatten() {
            write!(f, "/{}", part)?;
        }
        Ok(())
    }
}

/// Test cases that share one environment.
///
/// Cases are ordered by priority, then name, then iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupGroup {
    key: GroupKey,
    cases: Vec<TestCase>,
}

impl SetupGroup {
    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Lowest (most critical) priority in the group.
    fn top_priority(&self) -> i32 {
        self.cases.first().map(|c| c.priority).unwrap_or(i32::MAX)
    }
}

/// A test case the bucketizer refused, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedCase {
    pub case: TestCase,
    pub error: ConfigurationError,
}

/// Output of [`Bucketizer::bucketize`].
#[derive(Debug, Clone, Default)]
pub struct Bucketized {
    pub groups: Vec<SetupGroup>,
    pub rejected: Vec<RejectedCase>,
}

impl Bucketized {
    /// Number of test cases across groups and rejections.
    pub fn case_count(&self) -> usize {
        self.groups.iter().map(SetupGroup::len).sum::<usize>() + self.rejected.len()
    }
}

/// Groups a test catalog into setup groups.
pub struct Bucketizer<'a> {
    setups: &'a SetupCatalog,
    policy: &'a RunPolicy,
}

impl<'a> Bucketizer<'a> {
    pub fn new(setups: &'a SetupCatalog, policy: &'a RunPolicy) -> Self {
        Self { setups, policy }
    }

    /// Applies policy-derived overrides and expansions.
    ///
    /// Each test is repeated once per location in the location override (or
    /// kept with its own location), then once per iteration. Iteration clones
    /// are tagged with their index. Forced image and VM size overrides
    /// replace the test's own values.
    pub fn expand(&self, catalog: &[TestCase]) -> Vec<TestCase> {
        let locations = self.policy.locations();
        let iterations = self.policy.test_iterations.max(1);

        let mut expanded = Vec::with_capacity(catalog.len() * iterations as usize);
        for case in catalog {
            let mut base = case.clone();
            if let Some(image) = &self.policy.override_image {
                base.setup_config.image = Some(image.clone());
            }
            if let Some(vm_size) = &self.policy.override_vm_size {
                base.setup_config.vm_size = Some(vm_size.clone());
            }

            let located: Vec<TestCase> = if locations.is_empty() {
                vec![base]
            } else {
                locations
                    .iter()
                    .map(|location| {
                        let mut c = base.clone();
                        c.setup_config.location = Some(location.clone());
                        c
                    })
                    .collect()
            };

            for c in located {
                if iterations == 1 {
                    expanded.push(c);
                } else {
                    for iteration in 1..=iterations {
                        let mut clone = c.clone();
                        clone.setup_config.iteration = Some(iteration);
                        expanded.push(clone);
                    }
                }
            }
        }
        expanded
    }

    /// Expands the catalog and partitions it into setup groups.
    pub fn bucketize(&self, catalog: &[TestCase]) -> Bucketized {
        let mut buckets: BTreeMap<GroupKey, Vec<TestCase>> = BTreeMap::new();
        let mut rejected = Vec::new();

        for case in self.expand(catalog) {
            match self.key_for(&case) {
                Ok(key) => buckets.entry(key).or_default().push(case),
                Err(error) => {
                    warn!("Rejecting test case {}: {}", case.display_name(), error);
                    rejected.push(RejectedCase { case, error });
                }
            }
        }

        let mut groups: Vec<SetupGroup> = buckets
            .into_iter()
            .map(|(key, mut cases)| {
                cases.sort_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then_with(|| a.name.cmp(&b.name))
                        .then_with(|| a.setup_config.iteration.cmp(&b.setup_config.iteration))
                });
                SetupGroup { key, cases }
            })
            .collect();

        // Stable sort keeps key order between groups of equal priority.
        groups.sort_by_key(SetupGroup::top_priority);

        Bucketized { groups, rejected }
    }

    fn key_for(&self, case: &TestCase) -> Result<GroupKey, ConfigurationError> {
        let setup_type = case
            .setup_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigurationError::MissingSetupType)?;

        if !self.setups.contains(setup_type) {
            return Err(ConfigurationError::UnknownSetupType(setup_type.to_string()));
        }

        validate_setup_config(case)?;

        Ok(GroupKey::from_case(setup_type, case))
    }
}

fn validate_setup_config(case: &TestCase) -> Result<(), ConfigurationError> {
    let config = &case.setup_config;
    let known = [
        ("location", &config.location),
        ("vm_size", &config.vm_size),
        ("networking", &config.networking),
        ("disk_type", &config.disk_type),
        ("os_type", &config.os_type),
        ("image", &config.image),
        ("generation", &config.generation),
    ];
    for (field, value) in known {
        if let Some(value) = value
            && value.trim().is_empty()
        {
            return Err(ConfigurationError::InvalidField {
                field,
                value: value.clone(),
                reason: "must not be empty",
            });
        }
    }

    if let Some(generation) = &config.generation
        && generation != "1"
        && generation != "2"
    {
        return Err(ConfigurationError::InvalidField {
            field: "generation",
            value: generation.clone(),
            reason: "must be 1 or 2",
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{SetupConfig, SetupType};

    fn setups() -> SetupCatalog {
        let setup = |size: &str| SetupType {
            vm_count: 1,
            size_class: size.to_string(),
            topology: "single".to_string(),
        };
        SetupCatalog::new()
            .with_setup("small", setup("Standard_D2s_v3"))
            .with_setup("large", setup("Standard_F72s_v2"))
    }

    fn located(name: &str, setup: &str, location: &str) -> TestCase {
        TestCase::new(name, setup).with_setup_config(SetupConfig {
            location: Some(location.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_same_shape_shares_group() {
        let setups = setups();
        let policy = RunPolicy::default();
        let catalog = vec![
            located("A", "small", "westus2"),
            located("B", "small", "westus2"),
            located("C", "small", "eastus"),
            located("D", "large", "westus2"),
        ];

        let result = Bucketizer::new(&setups, &policy).bucketize(&catalog);

        assert!(result.rejected.is_empty());
        assert_eq!(result.groups.len(), 3);
        let sizes: Vec<usize> = result.groups.iter().map(SetupGroup::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 4);
        let shared = result
            .groups
            .iter()
            .find(|g| g.len() == 2)
            .expect("A and B share a group");
        assert_eq!(shared.key().setup_type, "small");
        assert_eq!(shared.key().location.as_deref(), Some("westus2"));
    }

    #[test]
    fn test_group_ordering_priority_then_name() {
        let setups = setups();
        let policy = RunPolicy::default();
        let catalog = vec![
            TestCase::new("ZETA", "small").with_priority(1),
            TestCase::new("BETA", "small").with_priority(2),
            TestCase::new("ALPHA", "small").with_priority(1),
            TestCase::new("OMEGA", "small").with_priority(0),
        ];

        let result = Bucketizer::new(&setups, &policy).bucketize(&catalog);
        let names: Vec<&str> = result.groups[0]
            .cases()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["OMEGA", "ALPHA", "ZETA", "BETA"]);
    }

    #[test]
    fn test_groups_ordered_by_most_critical_member() {
        let setups = setups();
        let policy = RunPolicy::default();
        let catalog = vec![
            TestCase::new("SMALL", "small").with_priority(3),
            TestCase::new("LARGE", "large").with_priority(0),
        ];

        let result = Bucketizer::new(&setups, &policy).bucketize(&catalog);
        assert_eq!(result.groups[0].key().setup_type, "large");
        assert_eq!(result.groups[1].key().setup_type, "small");
    }

    #[test]
    fn test_bucketize_is_deterministic() {
        let setups = setups();
        let policy = RunPolicy {
            test_iterations: 3,
            test_location: Some("westus2,eastus".to_string()),
            ..Default::default()
        };
        let catalog: Vec<TestCase> = (0..12)
            .map(|i| {
                let setup = if i % 3 == 0 { "large" } else { "small" };
                TestCase::new(format!("TEST-{:02}", 11 - i), setup).with_priority(i % 4)
            })
            .collect();

        let bucketizer = Bucketizer::new(&setups, &policy);
        let first = bucketizer.bucketize(&catalog);
        let second = bucketizer.bucketize(&catalog);

        assert_eq!(first.groups, second.groups);
        assert_eq!(first.case_count(), 12 * 3 * 2);
    }

    #[test]
    fn test_missing_and_unknown_setup_rejected() {
        let setups = setups();
        let policy = RunPolicy::default();
        let mut orphan = TestCase::new("ORPHAN", "small");
        orphan.setup_type = None;
        let catalog = vec![
            orphan,
            TestCase::new("MYSTERY", "huge"),
            TestCase::new("OK", "small"),
        ];

        let result = Bucketizer::new(&setups, &policy).bucketize(&catalog);

        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.rejected.len(), 2);
        assert_eq!(
            result.rejected[0].error,
            ConfigurationError::MissingSetupType
        );
        assert_eq!(
            result.rejected[1].error,
            ConfigurationError::UnknownSetupType("huge".to_string())
        );
        assert_eq!(result.case_count(), 3);
    }

    #[test]
    fn test_malformed_setup_config_rejected() {
        let setups = setups();
        let policy = RunPolicy::default();
        let bad_generation = TestCase::new("GEN3", "small").with_setup_config(SetupConfig {
            generation: Some("3".to_string()),
            ..Default::default()
        });
        let empty_image = TestCase::new("NOIMAGE", "small").with_setup_config(SetupConfig {
            image: Some("  ".to_string()),
            ..Default::default()
        });

        let result =
            Bucketizer::new(&setups, &policy).bucketize(&[bad_generation, empty_image]);

        assert!(result.groups.is_empty());
        assert!(matches!(
            result.rejected[0].error,
            ConfigurationError::InvalidField {
                field: "generation",
                ..
            }
        ));
        assert!(matches!(
            result.rejected[1].error,
            ConfigurationError::InvalidField { field: "image", .. }
        ));
    }

    #[test]
    fn test_iterations_tagged_and_ordered() {
        let setups = setups();
        let policy = RunPolicy {
            test_iterations: 3,
            ..Default::default()
        };
        let catalog = vec![TestCase::new("A", "small"), TestCase::new("B", "small")];

        let bucketizer = Bucketizer::new(&setups, &policy);
        let expanded = bucketizer.expand(&catalog);
        let tags: Vec<(String, Option<u32>)> = expanded
            .iter()
            .map(|c| (c.name.clone(), c.setup_config.iteration))
            .collect();
        assert_eq!(
            tags,
            vec![
                ("A".to_string(), Some(1)),
                ("A".to_string(), Some(2)),
                ("A".to_string(), Some(3)),
                ("B".to_string(), Some(1)),
                ("B".to_string(), Some(2)),
                ("B".to_string(), Some(3)),
            ]
        );

        // Iterations share the group; iteration index is not part of the key.
        let result = bucketizer.bucketize(&catalog);
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].len(), 6);
    }

    #[test]
    fn test_forced_overrides_applied_before_grouping() {
        let setups = setups();
        let policy = RunPolicy {
            override_image: Some("forced-image".to_string()),
            override_vm_size: Some("Standard_B1s".to_string()),
            ..Default::default()
        };
        let catalog = vec![
            TestCase::new("A", "small").with_setup_config(SetupConfig {
                image: Some("image-a".to_string()),
                ..Default::default()
            }),
            TestCase::new("B", "small").with_setup_config(SetupConfig {
                image: Some("image-b".to_string()),
                ..Default::default()
            }),
        ];

        let result = Bucketizer::new(&setups, &policy).bucketize(&catalog);

        assert_eq!(result.groups.len(), 1);
        let key = result.groups[0].key();
        assert_eq!(key.image.as_deref(), Some("forced-image"));
        assert_eq!(key.vm_size.as_deref(), Some("Standard_B1s"));
    }

    #[test]
    fn test_location_override_expands_per_location() {
        let setups = setups();
        let policy = RunPolicy {
            test_location: Some("westus2,eastus".to_string()),
            ..Default::default()
        };
        let catalog = vec![located("A", "small", "northeurope")];

        let result = Bucketizer::new(&setups, &policy).bucketize(&catalog);

        let mut locations: Vec<String> = result
            .groups
            .iter()
            .filter_map(|g| g.key().location.clone())
            .collect();
        locations.sort();
        assert_eq!(locations, vec!["eastus", "westus2"]);
    }

    #[test]
    fn test_group_key_display() {
        let key = GroupKey {
            setup_type: "small".to_string(),
            location: Some("westus2".to_string()),
            vm_size: None,
            networking: Some("sriov".to_string()),
            disk_type: None,
            os_type: None,
            image: None,
            generation: Some("2".to_string()),
        };
        assert_eq!(key.to_string(), "small/westus2/sriov/2");
    }
}
