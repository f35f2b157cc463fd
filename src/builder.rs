// src/builder.rs

//! Parallel debian package builds
//!
//! Turns generated source trees into `.deb` files with bounded parallelism
//! and per-package failure isolation: one failing package never aborts the
//! others, and the run report carries both the produced artifacts and the
//! failures.

use crate::deb::{self, DebCompression};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info};

/// Wall-clock budget for one package build
const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// One failed package build
#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub name: String,
    pub architecture: String,
    pub error: String,
}

/// Structured outcome of a build run
#[derive(Debug, Default)]
pub struct BuildReport {
    pub built: Vec<PathBuf>,
    pub failed: Vec<BuildFailure>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Default build parallelism: the machine's CPU count
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// Find generated source packages in `output_directory` and build them all
pub async fn build_all(output_directory: &Path, workers: usize) -> Result<BuildReport> {
    if !output_directory.exists() {
        return Err(Error::BuildError(format!(
            "Directory {} does not exist",
            output_directory.display()
        )));
    }
    if !output_directory.is_dir() {
        return Err(Error::BuildError(format!(
            "{} is not a directory",
            output_directory.display()
        )));
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(output_directory)
        .map_err(|e| Error::IoError(format!("cannot read {}: {e}", output_directory.display())))?
    {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        let path = entry.path();
        if path.is_dir() && path.join("debian/control").is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    build(paths, workers).await
}

/// Build the given source packages with at most `workers` running at once
pub async fn build(package_directories: Vec<PathBuf>, workers: usize) -> Result<BuildReport> {
    info!("Building {} source packages...", package_directories.len());
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));

    let mut handles = Vec::new();
    for package_directory in package_directories {
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await;
            let outcome = match permit {
                Ok(_permit) => build_package(&package_directory).await,
                Err(e) => Err(Error::BuildError(format!("worker pool closed: {e}"))),
            };
            (package_directory, outcome)
        }));
    }

    let mut report = BuildReport::default();
    for handle in handles {
        let (package_directory, outcome) = handle
            .await
            .map_err(|e| Error::BuildError(format!("build task failed: {e}")))?;
        match outcome {
            Ok(deb_path) => {
                info!("Successfully built {}", deb_path.display());
                report.built.push(deb_path);
            }
            Err(build_error) => {
                let (name, architecture) = identify(&package_directory);
                error!("{name} ({architecture}): {build_error}");
                report.failed.push(BuildFailure {
                    name,
                    architecture,
                    error: build_error.to_string(),
                });
            }
        }
    }
    Ok(report)
}

/// Build one package in-process, bounded by [`BUILD_TIMEOUT`]
async fn build_package(package_directory: &Path) -> Result<PathBuf> {
    info!("Building {}...", package_directory.display());
    let directory = package_directory.to_path_buf();
    let assembly =
        tokio::task::spawn_blocking(move || deb::assemble(&directory, DebCompression::default()));
    match tokio::time::timeout(BUILD_TIMEOUT, assembly).await {
        Err(_) => Err(Error::BuildError(format!(
            "build of {} timed out",
            package_directory.display()
        ))),
        Ok(Err(join_error)) => Err(Error::BuildError(format!("build task failed: {join_error}"))),
        Ok(Ok(result)) => result,
    }
}

/// Best-effort package identity for failure reports
fn identify(package_directory: &Path) -> (String, String) {
    if let Ok(fields) = deb::parse_control(package_directory) {
        if let (Some(name), Some(architecture)) =
            (fields.field("Package"), fields.field("Architecture"))
        {
            return (name.to_string(), architecture.to_string());
        }
    }
    let slug = package_directory
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    (slug, String::new())
}
