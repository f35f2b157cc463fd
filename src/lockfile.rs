// src/lockfile.rs

//! URL to checksum lockfile
//!
//! The lockfile decouples upstream hashes from the configuration: it maps
//! every fetch URL to the sha256 of the file it served, plus the timestamp
//! of the first download. Keys are kept sorted and the file is rewritten
//! atomically (temp file, fsync, rename) so an interrupted run can never
//! leave a truncated lockfile behind.
//!
//! # Format
//!
//! ```yaml
//! https://e.test/app-1.0.0-amd64.tar.gz:
//!   sha256: 1f8b...
//!   timestamp: 2024-05-01T12:00:00Z
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One lockfile record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEntry {
    pub sha256: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Serialize timestamps as RFC-3339 UTC with seconds precision
mod timestamp {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// In-memory view of a lockfile
#[derive(Debug, Clone)]
pub struct Lock {
    path: PathBuf,
    entries: BTreeMap<String, LockEntry>,
}

impl Lock {
    /// Load a lockfile, treating a missing file as empty
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.is_dir() {
            return Err(Error::LockfileError(format!(
                "Path points to a directory: {}",
                path.display()
            )));
        } else if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| Error::LockfileError(format!("Failed to read {}: {e}", path.display())))?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_yml::from_str(&content)
                    .map_err(|e| Error::LockfileError(format!("Invalid lockfile. {e}")))?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self { path: path.to_path_buf(), entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    /// Known hash for a URL, if any
    pub fn get(&self, url: &str) -> Option<&str> {
        self.entries.get(url).map(|e| e.sha256.as_str())
    }

    /// Known hash for a URL, `HashMissing` otherwise
    pub fn sha256(&self, url: &str) -> Result<&str> {
        self.get(url).ok_or_else(|| Error::HashMissing(url.to_string()))
    }

    /// Record a hash for a URL.
    ///
    /// The timestamp of an existing record with the same hash is kept so
    /// that re-locking an unchanged configuration is a no-op on disk.
    pub fn put(&mut self, url: &str, sha256: &str) {
        if let Some(existing) = self.entries.get(url) {
            if existing.sha256 == sha256 {
                return;
            }
        }
        let now = Utc::now()
            .with_nanosecond(0)
            .unwrap_or_else(Utc::now);
        self.entries.insert(
            url.to_string(),
            LockEntry { sha256: sha256.to_string(), timestamp: now },
        );
    }

    pub fn remove(&mut self, url: &str) {
        self.entries.remove(url);
    }

    /// Drop every entry whose URL is not in `referenced`
    pub fn retain_urls(&mut self, referenced: &HashSet<String>) {
        self.entries.retain(|url, _| referenced.contains(url));
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Atomically rewrite the lockfile on disk.
    ///
    /// Keys come out sorted because entries live in a `BTreeMap`; the file
    /// always ends with a newline.
    pub fn save(&self) -> Result<()> {
        let content = serde_yml::to_string(&self.entries)
            .map_err(|e| Error::LockfileError(format!("Failed to serialize lockfile: {e}")))?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|e| Error::LockfileError(format!("Failed to create {}: {e}", parent.display())))?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::LockfileError(format!("Failed to create temp file: {e}")))?;
        temp.write_all(content.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| Error::LockfileError(format!("Failed to write lockfile: {e}")))?;
        temp.persist(&self.path)
            .map_err(|e| Error::LockfileError(format!("Failed to write {}: {e}", self.path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let lock = Lock::load(&temp.path().join("ops2deb.lock.yml")).unwrap();
        assert!(lock.is_empty());
    }

    #[test]
    fn test_directory_path_is_an_error() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(Lock::load(temp.path()), Err(Error::LockfileError(_))));
    }

    #[test]
    fn test_put_get_remove() {
        let temp = TempDir::new().unwrap();
        let mut lock = Lock::load(&temp.path().join("l.yml")).unwrap();
        lock.put("https://e.test/a", "aa");
        assert_eq!(lock.get("https://e.test/a"), Some("aa"));
        assert!(lock.sha256("https://e.test/b").is_err());
        lock.remove("https://e.test/a");
        assert!(!lock.contains("https://e.test/a"));
    }

    #[test]
    fn test_put_same_hash_keeps_timestamp() {
        let temp = TempDir::new().unwrap();
        let mut lock = Lock::load(&temp.path().join("l.yml")).unwrap();
        lock.put("u", "aa");
        let first = lock.entries.get("u").unwrap().timestamp;
        lock.put("u", "aa");
        assert_eq!(lock.entries.get("u").unwrap().timestamp, first);
    }

    #[test]
    fn test_save_load_roundtrip_sorted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("l.yml");
        let mut lock = Lock::load(&path).unwrap();
        lock.put("https://e.test/b", "bb");
        lock.put("https://e.test/a", "aa");
        lock.save().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        let a = content.find("https://e.test/a").unwrap();
        let b = content.find("https://e.test/b").unwrap();
        assert!(a < b, "keys must be sorted");

        let reloaded = Lock::load(&path).unwrap();
        assert_eq!(reloaded.get("https://e.test/a"), Some("aa"));
        assert_eq!(reloaded.get("https://e.test/b"), Some("bb"));
    }

    #[test]
    fn test_timestamp_is_rfc3339_seconds() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("l.yml");
        let mut lock = Lock::load(&path).unwrap();
        lock.put("u", "aa");
        lock.save().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let line = content.lines().find(|l| l.contains("timestamp:")).unwrap();
        let value = line.split("timestamp:").nth(1).unwrap().trim();
        assert!(value.ends_with('Z'), "got {value}");
        assert!(!value.contains('.'), "sub-second precision not expected: {value}");
    }

    #[test]
    fn test_retain_urls() {
        let temp = TempDir::new().unwrap();
        let mut lock = Lock::load(&temp.path().join("l.yml")).unwrap();
        lock.put("a", "aa");
        lock.put("b", "bb");
        let keep: HashSet<String> = ["a".to_string()].into_iter().collect();
        lock.retain_urls(&keep);
        assert!(lock.contains("a"));
        assert!(!lock.contains("b"));
    }
}
