// src/commands.rs

//! Command implementations behind the CLI
//!
//! Each function maps to one subcommand and wires the components together:
//! configuration loading, lockfile, fetcher, generator, builder, updater,
//! delta and formatter. Per-blueprint failures are reported and folded into
//! the command's exit code; only global failures abort early.

use crate::blueprint::RenderedBlueprint;
use crate::cli::DeltaFormat;
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::fetcher::{FetchMode, Fetcher};
use crate::lockfile::Lock;
use crate::settings::Settings;
use crate::updater::{self, UpdateOptions};
use crate::{builder, delta, formatter, generator, migrate};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

fn load_configuration(settings: &Settings) -> Result<Configuration> {
    let configuration = Configuration::load(&settings.configuration_path)?;
    info!(
        "Loaded {} blueprint(s) from {}",
        configuration.blueprints.len(),
        configuration.path.display()
    );
    Ok(configuration)
}

fn shared_lock(configuration: &Configuration) -> Result<Arc<Mutex<Lock>>> {
    Ok(Arc::new(Mutex::new(Lock::load(&configuration.lockfile_path)?)))
}

fn only_filter(only: &[String]) -> Option<&[String]> {
    if only.is_empty() {
        None
    } else {
        Some(only)
    }
}

/// Fold per-blueprint errors into the command outcome
fn finish(errors: Vec<Error>) -> Result<()> {
    match Error::most_severe(&errors) {
        None => Ok(()),
        Some(worst) => {
            info!("{} failure(s) occurred", errors.len());
            Err(worst.clone())
        }
    }
}

/// `ops2deb generate`
pub async fn generate(settings: &Settings, only: &[String]) -> Result<()> {
    let configuration = load_configuration(settings)?;
    let rendered = configuration.rendered()?;
    let lock = shared_lock(&configuration)?;
    let fetcher = Fetcher::new(&settings.cache_directory, lock, FetchMode::Verify)?;

    let report = generator::generate(
        &rendered,
        &fetcher,
        &settings.output_directory,
        only_filter(only),
    )
    .await?;
    finish(report.errors.into_iter().map(|(_, e)| e).collect())
}

/// `ops2deb build`
pub async fn build(settings: &Settings, workers: Option<usize>) -> Result<()> {
    let workers = workers.unwrap_or_else(builder::default_workers);
    let report = builder::build_all(&settings.output_directory, workers).await?;
    if report.is_success() {
        Ok(())
    } else {
        Err(Error::BuildError(format!(
            "{} package(s) failed to build",
            report.failed.len()
        )))
    }
}

/// `ops2deb default`: generate then build
pub async fn default_command(
    settings: &Settings,
    only: &[String],
    workers: Option<usize>,
) -> Result<()> {
    let configuration = load_configuration(settings)?;
    let rendered = configuration.rendered()?;
    let lock = shared_lock(&configuration)?;
    let fetcher = Fetcher::new(&settings.cache_directory, lock, FetchMode::Verify)?;

    let report = generator::generate(
        &rendered,
        &fetcher,
        &settings.output_directory,
        only_filter(only),
    )
    .await?;
    let mut errors: Vec<Error> = report.errors.into_iter().map(|(_, e)| e).collect();

    let directories = report
        .packages
        .iter()
        .map(|p| p.package_directory.clone())
        .collect();
    let workers = workers.unwrap_or_else(builder::default_workers);
    let build_report = builder::build(directories, workers).await?;
    if !build_report.is_success() {
        errors.push(Error::BuildError(format!(
            "{} package(s) failed to build",
            build_report.failed.len()
        )));
    }
    finish(errors)
}

/// `ops2deb update`
pub async fn update(
    settings: &Settings,
    only: &[String],
    skip: &[String],
    dry_run: bool,
    skip_build: bool,
) -> Result<()> {
    let mut configuration = load_configuration(settings)?;
    let lock = shared_lock(&configuration)?;
    let fetcher = Fetcher::new(&settings.cache_directory, lock, FetchMode::Lock)?;

    let options = UpdateOptions {
        only: only_filter(only).map(<[String]>::to_vec),
        skip: skip.to_vec(),
        dry_run,
    };
    let results = updater::update(
        &mut configuration,
        &fetcher,
        settings.github_token.as_deref(),
        &options,
    )
    .await?;

    let failures: Vec<Error> = results
        .iter()
        .filter_map(|result| match &result.outcome {
            updater::UpdateOutcome::Failed { reason } => {
                Some(Error::NetworkError(format!("{}: {reason}", result.name)))
            }
            _ => None,
        })
        .collect();

    let updated = results.iter().any(|result| {
        matches!(result.outcome, updater::UpdateOutcome::Updated { .. })
    });
    if updated && !dry_run && !skip_build {
        default_command(settings, only, None).await?;
    }
    finish(failures)
}

/// `ops2deb lock`: fetch every referenced URL and write the lockfile
pub async fn lock(settings: &Settings) -> Result<()> {
    let configuration = load_configuration(settings)?;
    let urls = configuration.fetch_urls()?;
    let lock = shared_lock(&configuration)?;
    let fetcher = Fetcher::new(&settings.cache_directory, lock.clone(), FetchMode::Lock)?;

    let (_, errors) = fetcher.fetch_all(&urls).await;
    lock.lock().await.save()?;
    finish(errors.into_values().collect())
}

/// `ops2deb purge`
pub fn purge(settings: &Settings) -> Result<()> {
    if settings.cache_directory.exists() {
        std::fs::remove_dir_all(&settings.cache_directory)
            .map_err(|e| Error::IoError(format!("failed to clear cache: {e}")))?;
    }
    info!("Cleared {}", settings.cache_directory.display());
    Ok(())
}

/// `ops2deb migrate`
pub fn migrate_command(settings: &Settings) -> Result<()> {
    migrate::migrate(&settings.configuration_path)
}

/// `ops2deb validate`
pub fn validate(settings: &Settings) -> Result<()> {
    let configuration = load_configuration(settings)?;
    let rendered = configuration.rendered()?;
    info!("{} package(s) validated", rendered.len());
    Ok(())
}

/// `ops2deb format`
pub fn format(settings: &Settings) -> Result<()> {
    let configuration = load_configuration(settings)?;
    configuration.rendered()?;
    let formatted = formatter::format_configuration(&configuration)?;
    if formatted != configuration.raw {
        std::fs::write(&configuration.path, &formatted)
            .map_err(|e| Error::IoError(format!("failed to write configuration: {e}")))?;
        info!("Formatted {}", configuration.path.display());
    }
    Ok(())
}

/// `ops2deb delta OLD NEW`
pub fn delta_command(old: &Path, new: &Path, format: DeltaFormat) -> Result<()> {
    let old_rendered = rendered_configuration(old)?;
    let new_rendered = rendered_configuration(new)?;
    let delta = delta::compute(&old_rendered, &new_rendered);
    match format {
        DeltaFormat::Text => print!("{}", delta.to_text()),
        DeltaFormat::Json => {
            let json = serde_json::to_string_pretty(&delta)
                .map_err(|e| Error::IoError(e.to_string()))?;
            println!("{json}");
        }
    }
    Ok(())
}

fn rendered_configuration(path: &Path) -> Result<Vec<RenderedBlueprint>> {
    Configuration::load(path)?.rendered()
}

/// `ops2deb version`
pub fn version() {
    println!("{}", env!("CARGO_PKG_VERSION"));
}
