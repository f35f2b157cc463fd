// src/updater/mod.rs

//! Version bump engine
//!
//! For every blueprint with a fetch instruction, ask an upstream strategy
//! for versions newer than the pinned one, confirm that the best candidate
//! exists for every architecture of the blueprint, download the new
//! artifacts to compute their hashes, then rewrite the configuration in
//! place and reconcile the lockfile. Discovery and downloads run with
//! bounded parallelism; configuration and lockfile writes are serialised at
//! the end of the run.

pub mod strategy;

use crate::blueprint::RenderedBlueprint;
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use futures::StreamExt;
use semver::Version;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use self::strategy::{head_ok, select_strategy};
use tracing::{info, warn};

/// Blueprints probed concurrently
const UPDATE_CONCURRENCY: usize = 4;

/// Per-blueprint outcome of an update run
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    UpToDate,
    Updated { old: String, new: String },
    Skipped { reason: String },
    Failed { reason: String },
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up-to-date"),
            Self::Updated { old, new } => write!(f, "updated ({old} -> {new})"),
            Self::Skipped { reason } => write!(f, "skipped ({reason})"),
            Self::Failed { reason } => write!(f, "failed ({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub name: String,
    pub outcome: UpdateOutcome,
}

/// Update run options, mapped from the CLI
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub only: Option<Vec<String>>,
    pub skip: Vec<String>,
    pub dry_run: bool,
}

/// An update confirmed upstream, ready to be written back
struct PlannedUpdate {
    name: String,
    old: String,
    new: String,
}

/// What probing one blueprint concluded
enum Examined {
    UpToDate,
    Skip(String),
    Planned(PlannedUpdate),
}

/// Run the updater over a configuration.
///
/// The fetcher must run in locking mode so new hashes land in the lockfile.
/// Returns one result per examined blueprint, in declaration order.
pub async fn update(
    configuration: &mut Configuration,
    fetcher: &Fetcher,
    github_token: Option<&str>,
    options: &UpdateOptions,
) -> Result<Vec<UpdateResult>> {
    let rendered = configuration.rendered()?;

    // group rendered instances per blueprint name, declaration order kept
    let mut groups: Vec<(String, Vec<RenderedBlueprint>)> = Vec::new();
    for instance in rendered {
        match groups.iter_mut().find(|(name, _)| *name == instance.name) {
            Some((_, instances)) => instances.push(instance),
            None => groups.push((instance.name.clone(), vec![instance])),
        }
    }
    groups.retain(|(name, _)| {
        options
            .only
            .as_ref()
            .map(|only| only.contains(name))
            .unwrap_or(true)
            && !options.skip.contains(name)
    });

    // blueprints pinning several versions cannot be rewritten line-wise
    let multi_version: HashSet<String> = configuration
        .blueprints
        .iter()
        .filter(|b| b.version.is_none())
        .map(|b| b.name.clone())
        .collect();

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| Error::NetworkError(format!("failed to create HTTP client: {e}")))?;

    info!("Looking for new releases...");
    let mut stream = futures::stream::iter(groups.iter().map(|(name, instances)| {
        let client = client.clone();
        let multi_version = &multi_version;
        async move {
            let outcome = examine(name, instances, multi_version, github_token, fetcher, &client)
                .await;
            (name.clone(), outcome)
        }
    }))
    .buffer_unordered(UPDATE_CONCURRENCY);

    let mut outcomes: Vec<(String, std::result::Result<Examined, Error>)> = Vec::new();
    while let Some(entry) = stream.next().await {
        outcomes.push(entry);
    }
    drop(stream);

    // report in declaration order
    outcomes.sort_by_key(|(name, _)| {
        groups
            .iter()
            .position(|(n, _)| n == name)
            .unwrap_or(usize::MAX)
    });

    let mut results = Vec::new();
    let mut planned = Vec::new();
    for (name, outcome) in outcomes {
        let outcome = match outcome {
            Ok(Examined::UpToDate) => UpdateOutcome::UpToDate,
            Ok(Examined::Skip(reason)) => UpdateOutcome::Skipped { reason },
            Ok(Examined::Planned(update)) => {
                let outcome = UpdateOutcome::Updated {
                    old: update.old.clone(),
                    new: update.new.clone(),
                };
                planned.push(update);
                outcome
            }
            Err(error) => UpdateOutcome::Failed { reason: error.to_string() },
        };
        info!("{name}: {outcome}");
        results.push(UpdateResult { name, outcome });
    }

    // serialised write phase
    if !options.dry_run && !planned.is_empty() {
        for update in &planned {
            configuration.set_version(&update.name, &update.old, &update.new)?;
        }
        configuration.save()?;
        info!("Configuration file updated");

        let referenced: HashSet<String> = configuration.fetch_urls()?.into_iter().collect();
        let lock = fetcher.lock();
        let mut lock = lock.lock().await;
        lock.retain_urls(&referenced);
        lock.save()?;
    }

    Ok(results)
}

/// Probe one blueprint for a newer upstream version
async fn examine(
    name: &str,
    instances: &[RenderedBlueprint],
    multi_version: &HashSet<String>,
    github_token: Option<&str>,
    fetcher: &Fetcher,
    client: &reqwest::Client,
) -> Result<Examined> {
    let representative = &instances[0];
    if representative.fetch.is_none() {
        return Ok(Examined::Skip("no fetch instruction".to_string()));
    }
    if multi_version.contains(name) {
        return Ok(Examined::Skip(
            "pins several versions with matrix.versions".to_string(),
        ));
    }
    let Ok(current) = Version::parse(&representative.version) else {
        warn!("{name} is not using semantic versioning");
        return Ok(Examined::Skip("not using semantic versioning".to_string()));
    };

    let strategy = select_strategy(representative, github_token);
    let candidates = strategy.newer_versions(representative, &current, client).await?;

    for candidate in candidates {
        let version = candidate.to_string();
        let mut urls = Vec::new();
        let mut all_exist = true;
        for instance in instances {
            let Some(url) = instance.render_fetch_url_for_version(&version)? else {
                all_exist = false;
                break;
            };
            if !head_ok(client, &url).await? {
                all_exist = false;
                break;
            }
            urls.push(url);
        }
        if !all_exist {
            continue;
        }

        // download through the fetcher to record the new hashes
        let (_, errors) = fetcher.fetch_all(&urls).await;
        if let Some((url, error)) = errors.into_iter().next() {
            return Err(Error::NetworkError(format!(
                "failed to fetch {url}: {error}"
            )));
        }

        info!(
            "{name} can be bumped from {} to {version}",
            representative.version
        );
        return Ok(Examined::Planned(PlannedUpdate {
            name: name.to_string(),
            old: representative.version.clone(),
            new: version,
        }));
    }
    Ok(Examined::UpToDate)
}
