// src/delta.rs

//! Configuration delta reporting
//!
//! Compares two configurations over `(name, architecture)` keys and reports
//! added and removed packages plus version transitions. The output is stable
//! and sorted so it can be diffed or consumed by CI.

use crate::blueprint::RenderedBlueprint;
use serde::Serialize;
use std::collections::BTreeMap;

/// One package present in only one of the two configurations
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PackageEntry {
    pub name: String,
    pub architecture: String,
    pub version: String,
}

/// A package present in both configurations with different versions
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct VersionChange {
    pub name: String,
    pub architecture: String,
    pub old: String,
    pub new: String,
}

/// Structured diff between two configurations
#[derive(Debug, Default, Serialize)]
pub struct ConfigurationDelta {
    pub added: Vec<PackageEntry>,
    pub removed: Vec<PackageEntry>,
    pub updated: Vec<VersionChange>,
}

impl ConfigurationDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Human-readable summary, one line per change
    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();
        for package in &self.removed {
            lines.push(format!(
                "- {} {} {}",
                package.name, package.version, package.architecture
            ));
        }
        for package in &self.added {
            lines.push(format!(
                "+ {} {} {}",
                package.name, package.version, package.architecture
            ));
        }
        for change in &self.updated {
            lines.push(format!(
                "* {} {} {} -> {}",
                change.name, change.architecture, change.old, change.new
            ));
        }
        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }
}

type Key = (String, String);

fn versions_by_key(rendered: &[RenderedBlueprint]) -> BTreeMap<Key, Vec<String>> {
    let mut map: BTreeMap<Key, Vec<String>> = BTreeMap::new();
    for blueprint in rendered {
        let key = (blueprint.name.clone(), blueprint.architecture.to_string());
        let versions = map.entry(key).or_default();
        if !versions.contains(&blueprint.version) {
            versions.push(blueprint.version.clone());
        }
    }
    for versions in map.values_mut() {
        versions.sort();
    }
    map
}

/// Compute the delta from configuration `old` to configuration `new`
pub fn compute(old: &[RenderedBlueprint], new: &[RenderedBlueprint]) -> ConfigurationDelta {
    let old_map = versions_by_key(old);
    let new_map = versions_by_key(new);
    let mut delta = ConfigurationDelta::default();

    for ((name, architecture), versions) in &new_map {
        match old_map.get(&(name.clone(), architecture.clone())) {
            None => {
                for version in versions {
                    delta.added.push(PackageEntry {
                        name: name.clone(),
                        architecture: architecture.clone(),
                        version: version.clone(),
                    });
                }
            }
            Some(old_versions) if old_versions != versions => {
                delta.updated.push(VersionChange {
                    name: name.clone(),
                    architecture: architecture.clone(),
                    old: old_versions.join(", "),
                    new: versions.join(", "),
                });
            }
            Some(_) => {}
        }
    }
    for ((name, architecture), versions) in &old_map {
        if !new_map.contains_key(&(name.clone(), architecture.clone())) {
            for version in versions {
                delta.removed.push(PackageEntry {
                    name: name.clone(),
                    architecture: architecture.clone(),
                    version: version.clone(),
                });
            }
        }
    }

    delta.added.sort();
    delta.removed.sort();
    delta.updated.sort();
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{expand, Blueprint};

    fn rendered(yaml: &str) -> Vec<RenderedBlueprint> {
        let blueprints: Vec<Blueprint> = serde_yml::from_str(yaml).unwrap();
        expand(&blueprints).unwrap()
    }

    const OLD: &str = "
- name: demo
  version: 1.0.0
  summary: hi
- name: gone
  version: 0.1.0
  summary: hi
";

    const NEW: &str = "
- name: demo
  version: 2.0.0
  summary: hi
- name: fresh
  version: 3.0.0
  summary: hi
";

    #[test]
    fn test_delta_fields() {
        let delta = compute(&rendered(OLD), &rendered(NEW));
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].name, "fresh");
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].name, "gone");
        assert_eq!(delta.updated.len(), 1);
        assert_eq!(delta.updated[0].old, "1.0.0");
        assert_eq!(delta.updated[0].new, "2.0.0");
    }

    #[test]
    fn test_delta_of_identical_configurations_is_empty() {
        let delta = compute(&rendered(OLD), &rendered(OLD));
        assert!(delta.is_empty());
        assert_eq!(delta.to_text(), "");
    }

    #[test]
    fn test_delta_symmetry() {
        let forward = compute(&rendered(OLD), &rendered(NEW));
        let backward = compute(&rendered(NEW), &rendered(OLD));
        assert_eq!(forward.added, backward.removed);
        assert_eq!(forward.removed, backward.added);
    }

    #[test]
    fn test_architecture_is_part_of_the_key() {
        let old = rendered(
            "
- name: demo
  version: 1.0.0
  summary: hi
",
        );
        let new = rendered(
            "
- name: demo
  version: 1.0.0
  architecture: arm64
  summary: hi
",
        );
        let delta = compute(&old, &new);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.removed.len(), 1);
        assert!(delta.updated.is_empty());
    }

    #[test]
    fn test_json_form() {
        let delta = compute(&rendered(OLD), &rendered(NEW));
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["updated"][0]["name"], "demo");
        assert_eq!(json["added"][0]["version"], "3.0.0");
    }

    #[test]
    fn test_text_form_is_sorted_and_stable() {
        let delta = compute(&rendered(OLD), &rendered(NEW));
        let text = delta.to_text();
        assert_eq!(
            text,
            "- gone 0.1.0 amd64\n+ fresh 3.0.0 amd64\n* demo amd64 1.0.0 -> 2.0.0\n"
        );
    }
}
