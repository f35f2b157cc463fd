// src/settings.rs

//! Process environment resolved into an explicit settings value
//!
//! Components never read environment variables directly; `Settings` is built
//! once in `main` and threaded through. CLI flags override the environment,
//! the environment overrides the defaults below.

use std::env;
use std::path::PathBuf;

/// Default directory where fetched files and extractions are cached
pub const DEFAULT_CACHE_DIRECTORY: &str = "/tmp/ops2deb_cache";

/// Default directory where source packages are generated and built
pub const DEFAULT_OUTPUT_DIRECTORY: &str = "output";

/// Default configuration file name
pub const DEFAULT_CONFIGURATION_FILE: &str = "ops2deb.yml";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the blueprint configuration file
    pub configuration_path: PathBuf,
    /// Directory where files named in fetch instructions are downloaded
    pub cache_directory: PathBuf,
    /// Directory where debian source packages are generated and built
    pub output_directory: PathBuf,
    /// Bearer token for the GitHub API, used by the updater
    pub github_token: Option<String>,
    /// Enable debug logs
    pub verbose: bool,
}

impl Settings {
    /// Build settings from the process environment
    pub fn from_env() -> Self {
        Self {
            configuration_path: env_path("OPS2DEB_CONFIG", DEFAULT_CONFIGURATION_FILE),
            cache_directory: env_path("OPS2DEB_CACHE_DIR", DEFAULT_CACHE_DIRECTORY),
            output_directory: env_path("OPS2DEB_OUTPUT_DIR", DEFAULT_OUTPUT_DIRECTORY),
            github_token: env::var("OPS2DEB_GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
            verbose: env::var("OPS2DEB_VERBOSE").map(|v| v == "1").unwrap_or(false),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            configuration_path: PathBuf::from(DEFAULT_CONFIGURATION_FILE),
            cache_directory: PathBuf::from(DEFAULT_CACHE_DIRECTORY),
            output_directory: PathBuf::from(DEFAULT_OUTPUT_DIRECTORY),
            github_token: None,
            verbose: false,
        }
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.cache_directory, PathBuf::from("/tmp/ops2deb_cache"));
        assert_eq!(settings.output_directory, PathBuf::from("output"));
        assert_eq!(settings.configuration_path, PathBuf::from("ops2deb.yml"));
        assert!(!settings.verbose);
        assert!(settings.github_token.is_none());
    }
}
