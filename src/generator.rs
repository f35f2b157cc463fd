// src/generator.rs

//! Debian source tree generation
//!
//! Each rendered blueprint produces one source tree under
//! `<output>/<name>_<version>_<architecture>/`: a `src/` payload directory
//! populated from the fetch extraction, `install` directives and build
//! scripts, and a `debian/` directory with the control files `dpkg-buildpackage`
//! (or the in-process builder) needs. Regenerating with unchanged inputs is
//! byte-identical except for the changelog timestamp.

use crate::blueprint::{InstallDirective, RenderedBlueprint};
use crate::error::{Error, Result};
use crate::fetcher::{FetchResult, Fetcher};
use chrono::Utc;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Maintainer recorded in generated control files and changelogs
pub const MAINTAINER: &str = "ops2deb <ops2deb@upciti.com>";

/// Outcome of a generation run: per-blueprint failures do not abort the run
pub struct GenerateReport {
    pub packages: Vec<SourcePackage>,
    pub errors: Vec<(String, Error)>,
}

/// One debian source package being generated
pub struct SourcePackage {
    pub blueprint: RenderedBlueprint,
    pub package_directory: PathBuf,
    pub debian_directory: PathBuf,
    pub src_directory: PathBuf,
}

impl SourcePackage {
    pub fn new(blueprint: RenderedBlueprint, output_directory: &Path) -> Self {
        let package_directory = output_directory.join(blueprint.slug());
        Self {
            debian_directory: package_directory.join("debian"),
            src_directory: package_directory.join("src"),
            package_directory,
            blueprint,
        }
    }

    /// Generate the source tree from scratch, overwriting a stale one
    pub async fn generate(&self, fetch: Option<&FetchResult>) -> Result<()> {
        info!("Generating source package {}...", self.blueprint.slug());
        self.init()?;
        if let Some(fetch) = fetch {
            self.populate_from_fetch(fetch)?;
        }
        self.apply_install_directives()?;
        self.run_scripts().await?;
        self.write_debian_files()?;
        Ok(())
    }

    fn init(&self) -> Result<()> {
        if self.package_directory.exists() {
            fs::remove_dir_all(&self.package_directory).map_err(|e| {
                Error::IoError(format!(
                    "failed to clean {}: {e}",
                    self.package_directory.display()
                ))
            })?;
        }
        fs::create_dir_all(&self.debian_directory)?;
        fs::create_dir_all(&self.src_directory)?;
        for path in ["usr/bin", "usr/share", "usr/lib"] {
            fs::create_dir_all(self.src_directory.join(path))?;
        }
        Ok(())
    }

    /// Copy the cached fetch payload into `src/`
    fn populate_from_fetch(&self, fetch: &FetchResult) -> Result<()> {
        let storage = fetch.storage_path();
        if storage.is_dir() {
            copy_tree(storage, &self.src_directory)
        } else {
            let file_name = storage
                .file_name()
                .ok_or_else(|| Error::IoError(format!("bad cache path {}", storage.display())))?;
            fs::copy(storage, self.src_directory.join(file_name))?;
            Ok(())
        }
    }

    fn apply_install_directives(&self) -> Result<()> {
        for directive in self.blueprint.render_install(&self.src_directory)? {
            match directive {
                InstallDirective::Copy { source, destination } => {
                    let from = self.src_directory.join(&source);
                    let to = self
                        .src_directory
                        .join(destination.trim_start_matches('/'));
                    if let Some(parent) = to.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    if from.is_dir() {
                        copy_tree(&from, &to)?;
                    } else {
                        fs::copy(&from, &to).map_err(|e| {
                            Error::IoError(format!("failed to install {source}: {e}"))
                        })?;
                    }
                }
                InstallDirective::CopyDir { directory } => {
                    let from = PathBuf::from(&directory);
                    let name = from.file_name().ok_or_else(|| {
                        Error::IoError(format!("bad install directory \"{directory}\""))
                    })?;
                    let to = self.src_directory.join(name);
                    fs::create_dir_all(&to)?;
                    copy_tree(&from, &to)?;
                }
                InstallDirective::Write { path, content } => {
                    let to = self.src_directory.join(path.trim_start_matches('/'));
                    if let Some(parent) = to.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&to, &content)?;
                    fs::set_permissions(&to, fs::Permissions::from_mode(0o644))?;
                }
            }
        }
        Ok(())
    }

    /// Run blueprint script lines with `sh -c`, aborting on the first failure
    async fn run_scripts(&self) -> Result<()> {
        for line in self.blueprint.render_script(&self.src_directory)? {
            info!("$ {line}");
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&line)
                .current_dir(&self.package_directory)
                .env("SRC", &self.src_directory)
                .output()
                .await
                .map_err(|e| Error::ScriptError(format!("failed to run \"{line}\": {e}")))?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stdout.is_empty() {
                debug!("{}", format_command_output(&stdout));
            }
            if !stderr.is_empty() {
                debug!("{}", format_command_output(&stderr));
            }
            if !output.status.success() {
                return Err(Error::ScriptError(format!(
                    "{}: \"{line}\" exited with {}{}",
                    self.blueprint.slug(),
                    output
                        .status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    if stderr.is_empty() {
                        String::new()
                    } else {
                        format!("\n{}", format_command_output(&stderr))
                    }
                )));
            }
        }
        Ok(())
    }

    fn write_debian_files(&self) -> Result<()> {
        fs::write(self.debian_directory.join("control"), self.control_file())?;
        fs::write(self.debian_directory.join("changelog"), self.changelog_file())?;
        fs::write(self.debian_directory.join("rules"), RULES)?;
        fs::write(self.debian_directory.join("copyright"), self.copyright_file())?;
        fs::write(self.debian_directory.join("install"), self.install_file()?)?;
        fs::write(
            self.debian_directory.join("lintian-overrides"),
            self.lintian_overrides_file(),
        )?;
        fs::set_permissions(
            self.debian_directory.join("rules"),
            fs::Permissions::from_mode(0o755),
        )?;
        Ok(())
    }

    fn control_file(&self) -> String {
        let blueprint = &self.blueprint;
        let mut control = format!(
            "Source: {}\n\
             Section: devops\n\
             Priority: optional\n\
             Maintainer: {MAINTAINER}\n\
             Build-Depends: debhelper-compat (= 13)\n\
             \n\
             Package: {}\n\
             Architecture: {}\n",
            blueprint.name, blueprint.name, blueprint.architecture
        );
        if let Some(homepage) = &blueprint.homepage {
            control.push_str(&format!("Homepage: {homepage}\n"));
        }
        for (field, values) in [
            ("Provides", &blueprint.provides),
            ("Depends", &blueprint.depends),
            ("Recommends", &blueprint.recommends),
            ("Replaces", &blueprint.replaces),
            ("Conflicts", &blueprint.conflicts),
        ] {
            if !values.is_empty() {
                control.push_str(&format!("{field}: {}\n", values.join(", ")));
            }
        }
        control.push_str(&format!("Description: {}\n", blueprint.summary));
        for line in blueprint.description.lines() {
            if line.is_empty() {
                control.push_str(" .\n");
            } else {
                control.push_str(&format!(" {line}\n"));
            }
        }
        control
    }

    fn changelog_file(&self) -> String {
        format!(
            "{} ({}) unstable; urgency=medium\n\
             \n\
             \x20 * Package generated with ops2deb.\n\
             \n\
             \x20-- {MAINTAINER}  {}\n",
            self.blueprint.name,
            self.blueprint.debian_version(),
            Utc::now().to_rfc2822(),
        )
    }

    fn copyright_file(&self) -> String {
        let mut copyright = format!(
            "Format: https://www.debian.org/doc/packaging-manuals/copyright-format/1.0/\n\
             Upstream-Name: {}\n",
            self.blueprint.name
        );
        if let Some(homepage) = &self.blueprint.homepage {
            copyright.push_str(&format!("Source: {homepage}\n"));
        }
        copyright
    }

    /// One `debian/install` line per file under `src/`
    fn install_file(&self) -> Result<String> {
        let mut files = Vec::new();
        collect_files(&self.src_directory, &self.src_directory, &mut files)?;
        files.sort();
        let mut install = String::new();
        for relative in files {
            let destination = relative
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| format!("/{}", p.display()))
                .unwrap_or_else(|| "/".to_string());
            install.push_str(&format!("src/{} {destination}\n", relative.display()));
        }
        Ok(install)
    }

    fn lintian_overrides_file(&self) -> String {
        format!(
            "{name}: statically-linked-binary\n{name}: binary-without-manpage\n",
            name = self.blueprint.name
        )
    }
}

const RULES: &str = "\
#!/usr/bin/make -f

%:
\tdh $@

override_dh_shlibdeps:
\ttrue

override_dh_strip:
\tdh_strip --no-ddebs

override_dh_builddeb:
\tdh_builddeb -- -Zxz
";

/// Generate every rendered blueprint, fetching upstream files in parallel.
///
/// Per-blueprint failures (fetch, script, io) are collected in the report;
/// only infrastructure failures abort the run.
pub async fn generate(
    rendered: &[RenderedBlueprint],
    fetcher: &Fetcher,
    output_directory: &Path,
    only: Option<&[String]>,
) -> Result<GenerateReport> {
    let selected: Vec<&RenderedBlueprint> = rendered
        .iter()
        .filter(|b| only.map(|names| names.contains(&b.name)).unwrap_or(true))
        .collect();

    // fetch first: one flight per distinct URL across all blueprints
    let mut urls = Vec::new();
    let mut blueprint_urls = Vec::new();
    for blueprint in &selected {
        let url = blueprint.render_fetch_url()?;
        if let Some(url) = &url {
            urls.push(url.clone());
        }
        blueprint_urls.push(url);
    }
    let (fetched, fetch_errors) = fetcher.fetch_all(&urls).await;

    let mut report = GenerateReport { packages: Vec::new(), errors: Vec::new() };
    for (blueprint, url) in selected.into_iter().zip(blueprint_urls) {
        let fetch = match &url {
            Some(url) => match fetched.get(url) {
                Some(result) => Some(result),
                None => {
                    let error = fetch_errors
                        .get(url)
                        .cloned()
                        .unwrap_or_else(|| Error::NetworkError(format!("missing fetch for {url}")));
                    error!("{}: {error}", blueprint.slug());
                    report.errors.push((blueprint.slug(), error));
                    continue;
                }
            },
            None => None,
        };

        let package = SourcePackage::new(blueprint.clone(), output_directory);
        match package.generate(fetch).await {
            Ok(()) => report.packages.push(package),
            Err(error) => {
                error!("{}: {error}", blueprint.slug());
                report.errors.push((blueprint.slug(), error));
            }
        }
    }
    Ok(report)
}

/// Recursively copy a directory, preserving permissions and symlinks
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)
        .map_err(|e| Error::IoError(format!("cannot read {}: {e}", source.display())))?
    {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| Error::IoError(e.to_string()))?;
            files.push(relative.to_path_buf());
        }
    }
    Ok(())
}

fn format_command_output(output: &str) -> String {
    let body = output.trim_end().lines().collect::<Vec<_>>().join("\n  ");
    format!("> {body}")
}
