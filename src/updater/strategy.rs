// src/updater/strategy.rs

//! Version discovery strategies
//!
//! A strategy looks upstream for versions newer than the one a blueprint
//! currently pins. Two strategies exist: the GitHub releases API for fetch
//! URLs pointing at `github.com/OWNER/REPO/releases/download/...`, and a
//! generic HEAD-polling walk that bumps the minor then the patch component
//! until the rendered URL stops resolving.

use crate::blueprint::RenderedBlueprint;
use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use semver::Version;
use serde::Deserialize;
use tracing::debug;

/// Safety bound on HEAD probes per version component
const MAX_PROBES: u32 = 256;

#[async_trait]
pub trait UpdateStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Versions newer than `current`, best candidate first
    async fn newer_versions(
        &self,
        blueprint: &RenderedBlueprint,
        current: &Version,
        client: &reqwest::Client,
    ) -> Result<Vec<Version>>;
}

/// Pick the strategy for a blueprint from its fetch URL shape
pub fn select_strategy(
    blueprint: &RenderedBlueprint,
    github_token: Option<&str>,
) -> Box<dyn UpdateStrategy> {
    if let Some(fetch) = &blueprint.fetch {
        if let Some(github) = GithubReleases::try_from_url(fetch.url(), github_token) {
            return Box::new(github);
        }
    }
    Box::new(GenericHttpHead)
}

/// Probe one URL with a HEAD request.
///
/// `Ok(false)` means the upstream answered 4xx (the version does not
/// exist); 5xx and transport failures are network errors.
pub async fn head_ok(client: &reqwest::Client, url: &str) -> Result<bool> {
    debug!("Trying {url}");
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|e| Error::NetworkError(format!("Failed HEAD request to {url}. {e}")))?;
    let status = response.status();
    if status.is_server_error() {
        return Err(Error::NetworkError(format!(
            "Server error when requesting {url}"
        )));
    }
    Ok(status.is_success())
}

/// Version discovery via the GitHub releases API
pub struct GithubReleases {
    owner: String,
    repository: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
}

impl GithubReleases {
    /// Recognise `github.com/OWNER/REPO/releases/download/...` fetch URLs
    pub fn try_from_url(url: &str, token: Option<&str>) -> Option<Self> {
        let pattern = Regex::new(r"github\.com/([^/]+)/([^/]+)/releases/").unwrap();
        let captures = pattern.captures(url)?;
        Some(Self {
            owner: captures[1].to_string(),
            repository: captures[2].to_string(),
            token: token.map(str::to_string),
        })
    }

    fn releases_url(&self) -> String {
        format!(
            "https://api.github.com/repos/{}/{}/releases?per_page=100",
            self.owner, self.repository
        )
    }
}

#[async_trait]
impl UpdateStrategy for GithubReleases {
    fn name(&self) -> &'static str {
        "github-releases"
    }

    async fn newer_versions(
        &self,
        _blueprint: &RenderedBlueprint,
        current: &Version,
        client: &reqwest::Client,
    ) -> Result<Vec<Version>> {
        let url = self.releases_url();
        let mut request = client
            .get(&url)
            .header("User-Agent", "ops2deb")
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::NetworkError(format!("Failed to query {url}. {e}")))?;
        if !response.status().is_success() {
            return Err(Error::NetworkError(format!(
                "GitHub API responded with {} for {url}",
                response.status()
            )));
        }
        let releases: Vec<GithubRelease> = response
            .json()
            .await
            .map_err(|e| Error::NetworkError(format!("Bad GitHub API response: {e}")))?;

        let mut versions: Vec<Version> = releases
            .iter()
            .filter(|release| !release.draft && !release.prerelease)
            .filter_map(|release| parse_tag(&release.tag_name))
            .filter(|version| version > current)
            .collect();
        versions.sort();
        versions.dedup();
        versions.reverse();
        Ok(versions)
    }
}

/// Parse a release tag into a semver version, tolerating a leading `v`
pub fn parse_tag(tag: &str) -> Option<Version> {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    Version::parse(tag).ok()
}

/// Version discovery by HEAD-polling rendered URLs
///
/// Bumps the minor component while the URL keeps resolving, then does the
/// same with the patch component. Yields at most one candidate.
pub struct GenericHttpHead;

impl GenericHttpHead {
    async fn bump_and_poll(
        &self,
        blueprint: &RenderedBlueprint,
        mut version: Version,
        bump_patch: bool,
        client: &reqwest::Client,
    ) -> Result<Version> {
        let mut best = version.clone();
        for _ in 0..MAX_PROBES {
            version = if bump_patch {
                Version::new(version.major, version.minor, version.patch + 1)
            } else {
                Version::new(version.major, version.minor + 1, 0)
            };
            let Some(url) = blueprint.render_fetch_url_for_version(&version.to_string())? else {
                break;
            };
            if head_ok(client, &url).await? {
                best = version.clone();
            } else {
                break;
            }
        }
        Ok(best)
    }
}

#[async_trait]
impl UpdateStrategy for GenericHttpHead {
    fn name(&self) -> &'static str {
        "generic-http-head"
    }

    async fn newer_versions(
        &self,
        blueprint: &RenderedBlueprint,
        current: &Version,
        client: &reqwest::Client,
    ) -> Result<Vec<Version>> {
        let version = self
            .bump_and_poll(blueprint, current.clone(), false, client)
            .await?;
        let version = self.bump_and_poll(blueprint, version, true, client).await?;
        if version > *current {
            Ok(vec![version])
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{expand, Blueprint};

    fn rendered(url: &str) -> RenderedBlueprint {
        let blueprint: Blueprint = serde_yml::from_str(&format!(
            "name: demo\nversion: 1.0.0\nsummary: hi\nfetch: {url}\n"
        ))
        .unwrap();
        expand(&[blueprint]).unwrap().remove(0)
    }

    #[test]
    fn test_github_strategy_inferred_from_url() {
        let blueprint =
            rendered("https://github.com/upciti/ops2deb/releases/download/{{version}}/x.tgz");
        let strategy = select_strategy(&blueprint, None);
        assert_eq!(strategy.name(), "github-releases");
    }

    #[test]
    fn test_generic_strategy_is_the_fallback() {
        let blueprint = rendered("https://e.test/{{version}}.tgz");
        let strategy = select_strategy(&blueprint, None);
        assert_eq!(strategy.name(), "generic-http-head");
    }

    #[test]
    fn test_github_url_parsing() {
        let github = GithubReleases::try_from_url(
            "https://github.com/owner/repo/releases/download/v{{version}}/app.tgz",
            Some("token"),
        )
        .unwrap();
        assert_eq!(github.owner, "owner");
        assert_eq!(github.repository, "repo");
        assert_eq!(
            github.releases_url(),
            "https://api.github.com/repos/owner/repo/releases?per_page=100"
        );
        assert!(GithubReleases::try_from_url("https://e.test/x.tgz", None).is_none());
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!(parse_tag("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_tag("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_tag("nightly"), None);
    }
}
