// src/migrate.rs

//! Legacy configuration migration
//!
//! Early configurations carried upstream hashes inline, under
//! `fetch.sha256`, either as a single digest or as a per-architecture map.
//! Migration moves every digest into the lockfile and rewrites the
//! configuration to the split layout: a plain `fetch` URL (the object form
//! survives only when `targets` is present) and, for per-architecture
//! digests, a `matrix.architectures` axis. No network access is needed: the
//! digests to lock are already in the file.

use crate::blueprint::Architecture;
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::formatter;
use crate::lockfile::Lock;
use serde_yml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Inline digests removed from one legacy blueprint
#[derive(Debug, Clone, PartialEq)]
enum HashSpec {
    None,
    Single(String),
    PerArchitecture(BTreeMap<String, String>),
}

/// Migrate a legacy configuration file in place, writing its lockfile
pub fn migrate(configuration_path: &Path) -> Result<()> {
    let raw = fs::read_to_string(configuration_path).map_err(|e| {
        Error::ParseError(format!("File not found: {} ({e})", configuration_path.display()))
    })?;
    let document: Value =
        serde_yml::from_str(&raw).map_err(|e| Error::ParseError(e.to_string()))?;

    let (items, was_sequence) = match document {
        Value::Sequence(items) => (items, true),
        other => (vec![other], false),
    };

    let mut specs = Vec::new();
    let mut migrated_items = Vec::new();
    for item in items {
        let (item, spec) = migrate_blueprint(item)?;
        specs.push(spec);
        migrated_items.push(item);
    }

    let migrated = if was_sequence {
        Value::Sequence(migrated_items)
    } else {
        migrated_items.into_iter().next().unwrap_or(Value::Null)
    };
    let migrated_yaml =
        serde_yml::to_string(&migrated).map_err(|e| Error::ParseError(e.to_string()))?;

    // reparse strictly; keep the original header comments
    let header = raw
        .lines()
        .take_while(|l| l.trim().starts_with('#') || l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let full = if header.trim().is_empty() {
        migrated_yaml
    } else {
        format!("{header}\n{migrated_yaml}")
    };
    let configuration = Configuration::parse(&full, configuration_path)?;

    // move the digests into the lockfile
    let mut lock = Lock::load(&configuration.lockfile_path)?;
    for (blueprint, spec) in configuration.blueprints.iter().zip(&specs) {
        if *spec == HashSpec::None {
            continue;
        }
        for rendered in crate::blueprint::expand(std::slice::from_ref(blueprint))? {
            let Some(url) = rendered.render_fetch_url()? else { continue };
            let sha256 = match spec {
                HashSpec::Single(sha256) => sha256.clone(),
                HashSpec::PerArchitecture(map) => map
                    .get(rendered.architecture.name())
                    .cloned()
                    .ok_or_else(|| {
                        Error::ParseError(format!(
                            "{}: no sha256 for architecture {}",
                            rendered.name, rendered.architecture
                        ))
                    })?,
                HashSpec::None => unreachable!(),
            };
            lock.put(&url, &sha256);
        }
    }
    lock.save()?;

    let formatted = formatter::format_configuration(&configuration)?;
    fs::write(configuration_path, formatted)
        .map_err(|e| Error::IoError(format!("failed to write configuration: {e}")))?;
    info!(
        "Migrated {} ({} lockfile entries)",
        configuration_path.display(),
        lock.len()
    );
    Ok(())
}

/// Rewrite one legacy blueprint mapping, extracting its inline digests
fn migrate_blueprint(item: Value) -> Result<(Value, HashSpec)> {
    let Value::Mapping(mut mapping) = item else {
        return Err(Error::ParseError("blueprint must be a mapping".to_string()));
    };

    // legacy field name for the architecture
    if let Some(arch) = mapping.remove("arch") {
        mapping.insert(Value::from("architecture"), arch);
    }

    let mut spec = HashSpec::None;
    if let Some(Value::Mapping(mut fetch)) = mapping.remove("fetch") {
        match fetch.remove("sha256") {
            Some(Value::String(sha256)) => spec = HashSpec::Single(sha256),
            Some(Value::Mapping(by_arch)) => {
                let mut map = BTreeMap::new();
                let mut architectures = Vec::new();
                for (key, value) in by_arch {
                    let (Value::String(architecture), Value::String(sha256)) = (key, value)
                    else {
                        return Err(Error::ParseError(
                            "fetch.sha256 map must be architecture: digest".to_string(),
                        ));
                    };
                    // validated later by the strict reparse
                    let _: Architecture = serde_yml::from_str(&architecture)
                        .map_err(|e| Error::ParseError(e.to_string()))?;
                    architectures.push(Value::from(architecture.clone()));
                    map.insert(architecture, sha256);
                }
                spec = HashSpec::PerArchitecture(map);

                // the per-architecture digests define the expansion axis
                mapping.remove("architecture");
                let mut matrix = serde_yml::Mapping::new();
                matrix.insert(Value::from("architectures"), Value::Sequence(architectures));
                mapping.insert(Value::from("matrix"), Value::Mapping(matrix));
            }
            Some(other) => {
                return Err(Error::ParseError(format!(
                    "unexpected fetch.sha256 value: {other:?}"
                )));
            }
            None => {}
        }

        // collapse to the plain URL form unless targets survive
        let url = fetch.remove("url");
        let targets = fetch.remove("targets");
        let new_fetch = match (url, targets) {
            (Some(url), None) => url,
            (Some(url), Some(targets)) => {
                let mut object = serde_yml::Mapping::new();
                object.insert(Value::from("url"), url);
                object.insert(Value::from("targets"), targets);
                Value::Mapping(object)
            }
            (None, _) => {
                return Err(Error::ParseError("fetch mapping has no url".to_string()));
            }
        };
        mapping.insert(Value::from("fetch"), new_fetch);
    }

    Ok((Value::Mapping(mapping), spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_migrate_single_hash() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("ops2deb.yml");
        fs::write(
            &config_path,
            "\
- name: demo
  version: 1.0.0
  summary: hi
  description: hi
  fetch:
    url: https://e.test/{{version}}.tar.gz
    sha256: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
",
        )
        .unwrap();

        migrate(&config_path).unwrap();

        let migrated = fs::read_to_string(&config_path).unwrap();
        assert!(migrated.contains("fetch: https://e.test/{{version}}.tar.gz"));
        assert!(!migrated.contains("sha256"));

        let lock = Lock::load(&temp.path().join("ops2deb.lock.yml")).unwrap();
        assert_eq!(
            lock.get("https://e.test/1.0.0.tar.gz"),
            Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
        );
    }

    #[test]
    fn test_migrate_per_architecture_hashes() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("ops2deb.yml");
        fs::write(
            &config_path,
            "\
- name: demo
  version: 1.0.0
  arch: amd64
  summary: hi
  fetch:
    url: https://e.test/{{version}}/{{goarch}}.tar.gz
    sha256:
      amd64: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
      arm64: bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb
",
        )
        .unwrap();

        migrate(&config_path).unwrap();

        let migrated = fs::read_to_string(&config_path).unwrap();
        assert!(migrated.contains("matrix:"));
        assert!(migrated.contains("- amd64"));
        assert!(migrated.contains("- arm64"));
        assert!(!migrated.contains("sha256"));
        assert!(!migrated.contains("arch: amd64"));

        let lock = Lock::load(&temp.path().join("ops2deb.lock.yml")).unwrap();
        assert_eq!(
            lock.get("https://e.test/1.0.0/amd64.tar.gz"),
            Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
        );
        assert_eq!(
            lock.get("https://e.test/1.0.0/arm64.tar.gz"),
            Some("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
        );
    }

    #[test]
    fn test_migrate_keeps_targets() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("ops2deb.yml");
        fs::write(
            &config_path,
            "\
- name: demo
  version: 1.0.0
  summary: hi
  fetch:
    url: https://e.test/{{version}}/{{target}}.tar.gz
    sha256:
      amd64: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
    targets:
      amd64: x86_64
",
        )
        .unwrap();

        migrate(&config_path).unwrap();
        let migrated = fs::read_to_string(&config_path).unwrap();
        assert!(migrated.contains("targets:"));
        assert!(migrated.contains("amd64: x86_64"));
        let lock = Lock::load(&temp.path().join("ops2deb.lock.yml")).unwrap();
        assert!(lock.contains("https://e.test/1.0.0/x86_64.tar.gz"));
    }

    #[test]
    fn test_migrate_without_fetch_is_noop_on_lockfile() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("ops2deb.yml");
        fs::write(&config_path, "name: demo\nversion: 1.0.0\nsummary: hi\n").unwrap();
        migrate(&config_path).unwrap();
        let lock = Lock::load(&temp.path().join("ops2deb.lock.yml")).unwrap();
        assert!(lock.is_empty());
    }
}
