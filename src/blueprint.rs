// src/blueprint.rs

//! Blueprint data model, validation and matrix expansion
//!
//! A blueprint describes one upstream application to package, or a matrix of
//! them across architectures and versions. Matrix expansion turns each
//! blueprint into one `RenderedBlueprint` per `(version, architecture)`
//! combination; everything downstream (fetcher, generator, builder, updater)
//! works on rendered blueprints only.

use crate::error::{Error, Result};
use crate::template::{self, TemplateVars};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

/// Debian architectures understood by ops2deb
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    All,
    Amd64,
    Arm64,
    Armhf,
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::Armhf => "armhf",
        }
    }

    /// Go toolchain name for this architecture, used by `{{goarch}}`.
    ///
    /// `all` has no Go equivalent; referencing `{{goarch}}` from an `all`
    /// blueprint is a template error.
    pub fn goarch(&self) -> Option<&'static str> {
        match self {
            Self::Amd64 => Some("amd64"),
            Self::Arm64 => Some("arm64"),
            Self::Armhf => Some("arm"),
            Self::All => None,
        }
    }

    /// Rust target triple for this architecture, used by `{{rust_target}}`
    pub fn rust_target(&self) -> Option<&'static str> {
        match self {
            Self::Amd64 => Some("x86_64-unknown-linux-gnu"),
            Self::Arm64 => Some("aarch64-unknown-linux-gnu"),
            Self::Armhf => Some("armv7-unknown-linux-gnueabihf"),
            Self::All => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A file to download before running the build script
///
/// Either a bare URL template or an object carrying an architecture to
/// target-name map used to expand `{{target}}` in the URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fetch {
    Url(String),
    Object {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        targets: Option<BTreeMap<Architecture, String>>,
    },
}

impl Fetch {
    pub fn url(&self) -> &str {
        match self {
            Self::Url(url) => url,
            Self::Object { url, .. } => url,
        }
    }

    pub fn target_for(&self, architecture: Architecture) -> Option<&str> {
        match self {
            Self::Url(_) => None,
            Self::Object { targets, .. } => targets
                .as_ref()
                .and_then(|map| map.get(&architecture))
                .map(String::as_str),
        }
    }
}

/// One entry of the `install` list
///
/// Strings are either `"SOURCE:DESTINATION"` copies or `"dir/"` recursive
/// copies; mappings materialise a here-document at `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstallEntry {
    HereDocument { path: String, content: String },
    Str(String),
}

/// Parsed form of an install entry, produced after template rendering
#[derive(Debug, Clone, PartialEq)]
pub enum InstallDirective {
    /// Copy `source` (relative to the staging directory) to `destination`
    /// (an absolute path materialised under `src/`)
    Copy { source: String, destination: String },
    /// Recursively copy the directory into `src/<dir>/`
    CopyDir { directory: String },
    /// Write `content` to `src/<path>` with mode 0644
    Write { path: String, content: String },
}

impl InstallEntry {
    /// Turn a rendered entry into a directive, rejecting malformed strings
    pub fn directive(path_or_str: &InstallEntry) -> Result<InstallDirective> {
        match path_or_str {
            InstallEntry::HereDocument { path, content } => Ok(InstallDirective::Write {
                path: path.clone(),
                content: content.clone(),
            }),
            InstallEntry::Str(s) if s.ends_with('/') => Ok(InstallDirective::CopyDir {
                directory: s.trim_end_matches('/').to_string(),
            }),
            InstallEntry::Str(s) => {
                let mut parts = s.splitn(2, ':');
                let source = parts.next().unwrap_or_default();
                let destination = parts.next().ok_or_else(|| {
                    Error::SchemaError(vec![format!(
                        "install entry \"{s}\" must be \"SOURCE:DESTINATION\", \"dir/\" \
                         or a path/content mapping"
                    )])
                })?;
                if source.is_empty() || destination.is_empty() {
                    return Err(Error::SchemaError(vec![format!(
                        "install entry \"{s}\" has an empty source or destination"
                    )]));
                }
                Ok(InstallDirective::Copy {
                    source: source.to_string(),
                    destination: destination.to_string(),
                })
            }
        }
    }
}

/// Expansion axes for a blueprint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Matrix {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architectures: Option<Vec<Architecture>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_versions"
    )]
    pub versions: Option<Vec<String>>,
}

fn default_revision() -> u32 {
    1
}

/// YAML scalar accepted where a version string is expected.
///
/// Unquoted versions like `1.0` or `2024` parse as YAML numbers; they are
/// coerced to strings here, before any validation looks at them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum VersionScalar {
    String(String),
    Number(serde_yml::Value),
}

impl VersionScalar {
    fn into_string(self) -> String {
        match self {
            Self::String(s) => s,
            Self::Number(value) => match value {
                serde_yml::Value::Number(n) => n.to_string(),
                other => serde_yml::to_string(&other).unwrap_or_default().trim().to_string(),
            },
        }
    }
}

fn deserialize_version<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let scalar: Option<VersionScalar> = Option::deserialize(deserializer)?;
    Ok(scalar.map(VersionScalar::into_string))
}

fn deserialize_versions<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let scalars: Option<Vec<VersionScalar>> = Option::deserialize(deserializer)?;
    Ok(scalars.map(|list| list.into_iter().map(VersionScalar::into_string).collect()))
}

/// A declarative description of one package (or a matrix of them)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Blueprint {
    /// Package name
    pub name: String,
    /// Upstream version; mutually exclusive with `matrix.versions`
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_version"
    )]
    pub version: Option<String>,
    /// Expansion axes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<Matrix>,
    /// Package revision
    #[serde(default = "default_revision")]
    pub revision: u32,
    /// Package epoch
    #[serde(default)]
    pub epoch: u32,
    /// Package architecture; mutually exclusive with `matrix.architectures`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
    /// Upstream project homepage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    /// Package short description, one line only
    pub summary: String,
    /// Package long description
    #[serde(default)]
    pub description: String,
    /// Package dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    /// Package recommended dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommends: Vec<String>,
    /// Conflicting packages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    /// Virtual packages provided by this package
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    /// Packages replaced by this package
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<String>,
    /// A file (or a file per architecture) to download before the build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch: Option<Fetch>,
    /// Files to copy or materialise into the package payload
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<InstallEntry>,
    /// Build instructions, run with `sh -c`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub script: Vec<String>,
}

impl Blueprint {
    /// Architectures this blueprint expands to, in declaration order
    pub fn architectures(&self) -> Vec<Architecture> {
        if let Some(matrix) = &self.matrix {
            if let Some(architectures) = &matrix.architectures {
                return architectures.clone();
            }
        }
        vec![self.architecture.unwrap_or(Architecture::Amd64)]
    }

    /// Versions this blueprint expands to, in declaration order.
    ///
    /// Inline templating in versions (typically `env()` calls) is rendered
    /// here, before any scalar is validated or compared.
    pub fn versions(&self) -> Result<Vec<String>> {
        let raw = if let Some(versions) = self.matrix.as_ref().and_then(|m| m.versions.as_ref()) {
            versions.clone()
        } else {
            vec![self.version.clone().unwrap_or_default()]
        };
        let empty = TemplateVars::new();
        raw.iter().map(|v| template::render(v, &empty)).collect()
    }
}

/// One concrete `(name, version, architecture)` instance of a blueprint
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedBlueprint {
    pub name: String,
    pub version: String,
    pub revision: u32,
    pub epoch: u32,
    pub architecture: Architecture,
    pub homepage: Option<String>,
    pub summary: String,
    pub description: String,
    pub depends: Vec<String>,
    pub recommends: Vec<String>,
    pub conflicts: Vec<String>,
    pub provides: Vec<String>,
    pub replaces: Vec<String>,
    pub fetch: Option<Fetch>,
    pub install: Vec<InstallEntry>,
    pub script: Vec<String>,
}

impl RenderedBlueprint {
    fn from_blueprint(blueprint: &Blueprint, version: String, architecture: Architecture) -> Self {
        Self {
            name: blueprint.name.clone(),
            version,
            revision: blueprint.revision,
            epoch: blueprint.epoch,
            architecture,
            homepage: blueprint.homepage.clone(),
            summary: blueprint.summary.clone(),
            description: blueprint.description.clone(),
            depends: blueprint.depends.clone(),
            recommends: blueprint.recommends.clone(),
            conflicts: blueprint.conflicts.clone(),
            provides: blueprint.provides.clone(),
            replaces: blueprint.replaces.clone(),
            fetch: blueprint.fetch.clone(),
            install: blueprint.install.clone(),
            script: blueprint.script.clone(),
        }
    }

    /// Directory name of the generated source package
    pub fn slug(&self) -> String {
        format!("{}_{}_{}", self.name, self.version, self.architecture)
    }

    /// Full debian version string, `[epoch:]version-revision~ops2deb`
    pub fn debian_version(&self) -> String {
        let epoch = if self.epoch > 0 {
            format!("{}:", self.epoch)
        } else {
            String::new()
        };
        format!("{}{}-{}~ops2deb", epoch, self.version, self.revision)
    }

    /// Template variables available outside script/install contexts
    pub fn template_vars(&self) -> TemplateVars {
        self.template_vars_for_version(&self.version)
    }

    /// Same as [`template_vars`](Self::template_vars) with a version override,
    /// used by the updater to probe candidate releases.
    pub fn template_vars_for_version(&self, version: &str) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.set("name", self.name.as_str())
            .set("arch", self.architecture.name())
            .set("version", version);
        if let Some(goarch) = self.architecture.goarch() {
            vars.set("goarch", goarch);
        }
        if let Some(rust_target) = self.architecture.rust_target() {
            vars.set("rust_target", rust_target);
        }
        if let Some(fetch) = &self.fetch {
            if let Some(target) = fetch.target_for(self.architecture) {
                vars.set("target", target);
            }
        }
        vars
    }

    /// Render the fetch URL for this blueprint, if any
    pub fn render_fetch_url(&self) -> Result<Option<String>> {
        self.render_fetch_url_for_version(&self.version)
    }

    /// Render the fetch URL against a candidate version
    pub fn render_fetch_url_for_version(&self, version: &str) -> Result<Option<String>> {
        match &self.fetch {
            None => Ok(None),
            Some(fetch) => {
                let vars = self.template_vars_for_version(version);
                template::render(fetch.url(), &vars).map(Some)
            }
        }
    }

    /// Render script lines against a concrete staging directory
    pub fn render_script(&self, src: &Path) -> Result<Vec<String>> {
        let mut vars = self.template_vars();
        vars.set("src", src.display().to_string());
        self.script
            .iter()
            .map(|line| template::render(line, &vars))
            .collect()
    }

    /// Render install entries against a concrete staging directory
    pub fn render_install(&self, src: &Path) -> Result<Vec<InstallDirective>> {
        let mut vars = self.template_vars();
        vars.set("src", src.display().to_string());
        self.install
            .iter()
            .map(|entry| {
                let rendered = match entry {
                    InstallEntry::Str(s) => InstallEntry::Str(template::render(s, &vars)?),
                    InstallEntry::HereDocument { path, content } => InstallEntry::HereDocument {
                        path: template::render(path, &vars)?,
                        content: template::render(content, &vars)?,
                    },
                };
                InstallEntry::directive(&rendered)
            })
            .collect()
    }
}

/// Validate a list of blueprints, aggregating every violation
pub fn validate(blueprints: &[Blueprint]) -> Result<()> {
    let name_re = regex::Regex::new(r"^[a-z0-9][a-z0-9.+-]*$").unwrap();
    let mut errors: Vec<String> = Vec::new();

    for blueprint in blueprints {
        let who = if blueprint.name.is_empty() {
            "<unnamed>".to_string()
        } else {
            blueprint.name.clone()
        };
        let mut push = |message: String| errors.push(format!("{who}: {message}"));

        if !name_re.is_match(&blueprint.name) {
            push(format!("invalid package name \"{}\"", blueprint.name));
        }
        if blueprint.revision == 0 {
            push("revision must be a positive integer".to_string());
        }
        if blueprint.summary.is_empty() {
            push("summary must not be empty".to_string());
        }
        if blueprint.summary.contains('\n') {
            push("summary must be a single line".to_string());
        }

        let matrix_versions = blueprint
            .matrix
            .as_ref()
            .and_then(|m| m.versions.as_ref());
        match (&blueprint.version, matrix_versions) {
            (Some(_), Some(_)) => {
                push("version and matrix.versions are mutually exclusive".to_string())
            }
            (None, None) => push("either version or matrix.versions is required".to_string()),
            (None, Some(versions)) if versions.is_empty() => {
                push("matrix.versions must not be empty".to_string())
            }
            _ => {}
        }

        let matrix_architectures = blueprint
            .matrix
            .as_ref()
            .and_then(|m| m.architectures.as_ref());
        if blueprint.architecture.is_some() && matrix_architectures.is_some() {
            push("architecture and matrix.architectures are mutually exclusive".to_string());
        }
        if matches!(matrix_architectures, Some(a) if a.is_empty()) {
            push("matrix.architectures must not be empty".to_string());
        }

        if let Some(fetch) = &blueprint.fetch {
            let refs = template::references(fetch.url());
            for architecture in blueprint.architectures() {
                if refs.iter().any(|r| r == "target")
                    && fetch.target_for(architecture).is_none()
                {
                    push(format!(
                        "fetch url references {{{{target}}}} but fetch.targets has no \
                         entry for {architecture}"
                    ));
                }
                if refs.iter().any(|r| r == "goarch") && architecture.goarch().is_none() {
                    push(format!(
                        "fetch url references {{{{goarch}}}} which is undefined for \
                         architecture {architecture}"
                    ));
                }
            }
        }

        for entry in &blueprint.install {
            if let InstallEntry::Str(s) = entry {
                if !s.ends_with('/') && s.splitn(2, ':').count() != 2 {
                    push(format!("install entry \"{s}\" must have one ':' separator"));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::SchemaError(errors))
    }
}

/// Expand blueprints over their matrix axes.
///
/// The output is stable: declaration order, then versions, then
/// architectures. Every rendered `(name, version, revision, epoch,
/// architecture)` tuple must be unique within a configuration.
pub fn expand(blueprints: &[Blueprint]) -> Result<Vec<RenderedBlueprint>> {
    let mut rendered = Vec::new();
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();

    for blueprint in blueprints {
        for version in blueprint.versions()? {
            for architecture in blueprint.architectures() {
                let instance =
                    RenderedBlueprint::from_blueprint(blueprint, version.clone(), architecture);
                let key = (
                    instance.name.clone(),
                    instance.version.clone(),
                    instance.revision,
                    instance.epoch,
                    instance.architecture,
                );
                if !seen.insert(key) {
                    duplicates.push(format!(
                        "{}: duplicate package {} {} {}",
                        instance.name, instance.name, instance.version, instance.architecture
                    ));
                }
                rendered.push(instance);
            }
        }
    }

    if duplicates.is_empty() {
        Ok(rendered)
    } else {
        Err(Error::SchemaError(duplicates))
    }
}
