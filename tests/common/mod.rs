// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

use ops2deb::Settings;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Create an isolated workspace with a configuration file.
///
/// Returns (TempDir, Settings) - keep the TempDir alive to prevent cleanup.
pub fn setup_workspace(configuration: &str) -> (TempDir, Settings) {
    let temp = TempDir::new().unwrap();
    let settings = Settings {
        configuration_path: temp.path().join("ops2deb.yml"),
        cache_directory: temp.path().join("cache"),
        output_directory: temp.path().join("output"),
        github_token: None,
        verbose: false,
    };
    fs::write(&settings.configuration_path, configuration).unwrap();
    (temp, settings)
}

/// Build a small gzipped tarball holding `usr/bin/<binary>` and return its
/// bytes.
pub fn make_tarball(binary: &str) -> Vec<u8> {
    let staging = TempDir::new().unwrap();
    let bin = staging.path().join("usr/bin");
    fs::create_dir_all(&bin).unwrap();
    fs::write(bin.join(binary), format!("#!/bin/sh\necho {binary}\n")).unwrap();

    let mut bytes = Vec::new();
    {
        let encoder = flate2::write::GzEncoder::new(&mut bytes, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", staging.path()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }
    bytes
}

/// Sha256 hex digest of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}

/// Seed the fetch cache and the lockfile so that `url` resolves to `bytes`
/// without any network access.
pub fn seed_cache(settings: &Settings, lockfile_path: &Path, url: &str, bytes: &[u8]) {
    let sha256 = sha256_hex(bytes);
    let file_name = url.rsplit('/').next().unwrap();
    let digest_dir = settings.cache_directory.join(&sha256);
    fs::create_dir_all(&digest_dir).unwrap();
    fs::write(digest_dir.join(file_name), bytes).unwrap();

    let mut lock = ops2deb::Lock::load(lockfile_path).unwrap();
    lock.put(url, &sha256);
    lock.save().unwrap();
}
