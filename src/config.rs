// src/config.rs

//! Configuration file loading
//!
//! A configuration file is a YAML document holding either one blueprint
//! mapping or a sequence of them. The file's leading comment block is
//! preserved verbatim so that rewrites (update, format, migrate) keep it; a
//! `# lockfile=PATH` line inside that block selects the lockfile path, which
//! otherwise defaults to `ops2deb.lock.yml` next to the configuration.

use crate::blueprint::{self, Blueprint, RenderedBlueprint};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Default lockfile name, resolved next to the configuration file
pub const DEFAULT_LOCKFILE_NAME: &str = "ops2deb.lock.yml";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConfigurationRoot {
    Many(Vec<Blueprint>),
    One(Box<Blueprint>),
}

/// A loaded configuration file
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Path the configuration was loaded from
    pub path: PathBuf,
    /// Lockfile path, from the `# lockfile=` directive or the default
    pub lockfile_path: PathBuf,
    /// Leading comment block, kept verbatim across rewrites
    pub header: String,
    /// Raw file content, the source of truth for in-place rewrites
    pub raw: String,
    /// Parsed blueprints in declaration order
    pub blueprints: Vec<Blueprint>,
    /// True when the document was a single mapping rather than a sequence
    pub single_blueprint: bool,
}

impl Configuration {
    /// Load and parse a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                Error::ParseError(format!("File not found: {}", path.display()))
            }
            _ => Error::IoError(format!("Failed to read {}: {e}", path.display())),
        })?;
        Self::parse(&content, path)
    }

    /// Parse configuration text as if loaded from `path`
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let root: ConfigurationRoot = serde_yml::from_str(content)
            .map_err(|e| Error::ParseError(e.to_string()))?;
        let (blueprints, single_blueprint) = match root {
            ConfigurationRoot::Many(list) => (list, false),
            ConfigurationRoot::One(blueprint) => (vec![*blueprint], true),
        };

        let header = leading_comments(content);
        let lockfile_path = lockfile_path_from_header(&header, path);

        Ok(Self {
            path: path.to_path_buf(),
            lockfile_path,
            header,
            raw: content.to_string(),
            blueprints,
            single_blueprint,
        })
    }

    /// Validate blueprints and expand the matrix axes
    pub fn rendered(&self) -> Result<Vec<RenderedBlueprint>> {
        blueprint::validate(&self.blueprints)?;
        blueprint::expand(&self.blueprints)
    }

    /// Every fetch URL referenced by the rendered configuration, deduplicated
    pub fn fetch_urls(&self) -> Result<Vec<String>> {
        let mut urls = Vec::new();
        for rendered in self.rendered()? {
            if let Some(url) = rendered.render_fetch_url()? {
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
        Ok(urls)
    }

    /// Rewrite the `version:` scalar of the named blueprint in place.
    ///
    /// The edit is line-oriented: every byte of the file other than the
    /// rewritten scalar survives untouched, which is how comments, field
    /// order, blank lines and quoting are preserved. Returns an error when
    /// the blueprint or its version line cannot be found.
    pub fn set_version(&mut self, name: &str, old: &str, new: &str) -> Result<()> {
        let mut current_name: Option<String> = None;
        let mut replaced = false;
        let mut lines: Vec<String> = Vec::new();

        for line in self.raw.lines() {
            let trimmed = line.trim_start().trim_start_matches("- ").trim_start();
            if let Some(value) = trimmed.strip_prefix("name:") {
                current_name = Some(unquote(value.trim()).to_string());
            }
            if !replaced && current_name.as_deref() == Some(name) {
                if let Some((prefix, value)) = split_key_value(line, "version:") {
                    if unquote(value.trim()) == old {
                        let quoted = requote(value.trim(), new);
                        lines.push(format!("{prefix} {quoted}"));
                        replaced = true;
                        continue;
                    }
                }
            }
            lines.push(line.to_string());
        }

        if !replaced {
            return Err(Error::ParseError(format!(
                "could not find version {old} of blueprint {name} in {}",
                self.path.display()
            )));
        }

        let mut raw = lines.join("\n");
        if self.raw.ends_with('\n') {
            raw.push('\n');
        }
        let reparsed = Self::parse(&raw, &self.path)?;
        *self = reparsed;
        Ok(())
    }

    /// Write the raw content back to disk
    pub fn save(&self) -> Result<()> {
        fs::write(&self.path, &self.raw)
            .map_err(|e| Error::IoError(format!("Failed to write {}: {e}", self.path.display())))
    }
}

/// Extract the leading comment block of a document, blank lines included
fn leading_comments(content: &str) -> String {
    let mut header = String::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            header.push_str(line);
            header.push('\n');
        } else {
            break;
        }
    }
    header
}

/// Resolve the lockfile path from a `# lockfile=PATH` header directive
fn lockfile_path_from_header(header: &str, configuration_path: &Path) -> PathBuf {
    let parent = configuration_path.parent().unwrap_or_else(|| Path::new("."));
    for line in header.lines() {
        if let Some(value) = line.trim().strip_prefix("# lockfile=") {
            let path = Path::new(value.trim());
            return if path.is_absolute() {
                path.to_path_buf()
            } else {
                parent.join(path)
            };
        }
    }
    parent.join(DEFAULT_LOCKFILE_NAME)
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}

/// Reapply the quoting style of `old_value` to `new`
fn requote(old_value: &str, new: &str) -> String {
    if old_value.starts_with('"') {
        format!("\"{new}\"")
    } else if old_value.starts_with('\'') {
        format!("'{new}'")
    } else {
        new.to_string()
    }
}

/// Split a line into its `key:` prefix and scalar value, if it matches
fn split_key_value<'a>(line: &'a str, key: &str) -> Option<(&'a str, &'a str)> {
    let trimmed = line.trim_start();
    let body = trimmed.strip_prefix("- ").unwrap_or(trimmed);
    if !body.starts_with(key) {
        return None;
    }
    let offset = line.len() - body.len() + key.len();
    Some((&line[..offset], &line[offset..]))
}
