// src/fetcher/mod.rs

//! Content-addressed download cache with single-flight coordination
//!
//! Every fetch URL resolves to `<cache>/<sha256>/<file name>` plus, for
//! archives, an `extracted/` directory published by atomic rename. The
//! sha256 of a URL is pinned by the lockfile: a download whose hash differs
//! fails with `HashMismatch`, a URL absent from the lockfile fails with
//! `HashMissing` unless the fetcher runs in locking mode, where the new
//! hash is recorded instead.
//!
//! Concurrency: fetches for the same URL are coalesced. A keyed mutex
//! serialises workers per URL and the first outcome (success or failure) is
//! memoised for the lifetime of the run, so N concurrent callers produce
//! exactly one network request.

pub mod extract;

use crate::error::{Error, Result};
use crate::lockfile::Lock;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Connect timeout for every HTTP request
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall timeout for downloading one artifact
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Attempts for transient network failures
const MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff base delay
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Exponential backoff cap
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Concurrent downloads driven by [`Fetcher::fetch_all`]
const FETCH_CONCURRENCY: usize = 8;

/// How the fetcher treats URLs missing from the lockfile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Every URL must already be locked; a missing entry is `HashMissing`
    Verify,
    /// New hashes are recorded into the lockfile (`lock`, `update`)
    Lock,
}

/// Outcome of a successful fetch
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub sha256: String,
    /// The downloaded file inside the cache
    pub file_path: PathBuf,
    /// The extracted tree, when the file is a recognised archive
    pub extracted_path: Option<PathBuf>,
}

impl FetchResult {
    /// The path callers should consume: the extraction when there is one
    pub fn storage_path(&self) -> &Path {
        self.extracted_path.as_deref().unwrap_or(&self.file_path)
    }
}

/// Downloads, verifies and extracts upstream artifacts
pub struct Fetcher {
    cache_directory: PathBuf,
    client: reqwest::Client,
    lock: Arc<Mutex<Lock>>,
    mode: FetchMode,
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    outcomes: Mutex<HashMap<String, Result<FetchResult>>>,
}

impl Fetcher {
    pub fn new(cache_directory: &Path, lock: Arc<Mutex<Lock>>, mode: FetchMode) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::NetworkError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            cache_directory: cache_directory.to_path_buf(),
            client,
            lock,
            mode,
            slots: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
        })
    }

    /// The lockfile shared with this fetcher
    pub fn lock(&self) -> Arc<Mutex<Lock>> {
        self.lock.clone()
    }

    /// Fetch one URL, coalescing concurrent callers
    pub async fn fetch(&self, url: &str) -> Result<FetchResult> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(url.to_string()).or_default().clone()
        };
        let _guard = slot.lock().await;

        if let Some(outcome) = self.outcomes.lock().await.get(url) {
            debug!("coalesced fetch of {url}");
            return outcome.clone();
        }

        let outcome = self.fetch_uncached(url).await;
        self.outcomes
            .lock()
            .await
            .insert(url.to_string(), outcome.clone());
        outcome
    }

    /// Fetch many URLs concurrently, splitting successes from failures
    pub async fn fetch_all(
        &self,
        urls: &[String],
    ) -> (HashMap<String, FetchResult>, HashMap<String, Error>) {
        let mut unique: Vec<&String> = Vec::new();
        for url in urls {
            if !unique.contains(&url) {
                unique.push(url);
            }
        }
        if !unique.is_empty() {
            info!("Fetching {} files...", unique.len());
        }

        let mut results = HashMap::new();
        let mut errors = HashMap::new();
        let mut stream = futures::stream::iter(
            unique
                .into_iter()
                .map(|url| async move { (url.clone(), self.fetch(url).await) }),
        )
        .buffer_unordered(FETCH_CONCURRENCY);

        while let Some((url, outcome)) = stream.next().await {
            match outcome {
                Ok(result) => {
                    results.insert(url, result);
                }
                Err(error) => {
                    errors.insert(url, error);
                }
            }
        }
        (results, errors)
    }

    async fn fetch_uncached(&self, url: &str) -> Result<FetchResult> {
        let file_name = file_name_from_url(url)?;
        let hint = self.lock.lock().await.get(url).map(str::to_string);

        // outside locking mode the lockfile must already know this URL
        if hint.is_none() && self.mode == FetchMode::Verify {
            return Err(Error::HashMissing(url.to_string()));
        }

        // cache hit: the lockfile pins the digest and the file is present
        if let Some(sha256) = &hint {
            let file_path = self.cache_directory.join(sha256).join(&file_name);
            if file_path.is_file() {
                debug!("cache hit for {url}");
                let extracted_path = self.ensure_extracted(&file_path, sha256).await?;
                return Ok(FetchResult {
                    url: url.to_string(),
                    sha256: sha256.clone(),
                    file_path,
                    extracted_path,
                });
            }
        }

        std::fs::create_dir_all(&self.cache_directory)
            .map_err(|e| Error::IoError(format!("failed to create cache directory: {e}")))?;
        let (temp, computed) = self.download_with_retry(url).await?;

        match &hint {
            Some(expected) if *expected != computed => {
                return Err(Error::HashMismatch {
                    url: url.to_string(),
                    expected: expected.clone(),
                    computed,
                });
            }
            Some(_) => {}
            None => {
                // locking mode, checked above
                self.lock.lock().await.put(url, &computed);
            }
        }

        let digest_directory = self.cache_directory.join(&computed);
        std::fs::create_dir_all(&digest_directory)
            .map_err(|e| Error::IoError(format!("failed to create cache entry: {e}")))?;
        let file_path = digest_directory.join(&file_name);
        temp.persist(&file_path)
            .map_err(|e| Error::IoError(format!("failed to publish download: {e}")))?;

        let extracted_path = self.ensure_extracted(&file_path, &computed).await?;
        info!("Done with {file_name}");
        Ok(FetchResult {
            url: url.to_string(),
            sha256: computed,
            file_path,
            extracted_path,
        })
    }

    /// Extract an archive next to its cache file, publishing atomically.
    ///
    /// The staged directory only becomes `extracted/` through a rename, so a
    /// partially extracted tree is never observable.
    async fn ensure_extracted(&self, file_path: &Path, sha256: &str) -> Result<Option<PathBuf>> {
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if !extract::is_supported(file_name) {
            return Ok(None);
        }

        let digest_directory = self.cache_directory.join(sha256);
        let extract_path = digest_directory.join("extracted");
        if extract_path.is_dir() {
            return Ok(Some(extract_path));
        }

        info!("Extracting {file_name}...");
        let staging = tempfile::Builder::new()
            .prefix(".extract-")
            .tempdir_in(&digest_directory)
            .map_err(|e| Error::IoError(format!("failed to create staging directory: {e}")))?;
        extract::extract(file_path, staging.path()).await?;

        let staged = staging.into_path();
        if let Err(e) = std::fs::rename(&staged, &extract_path) {
            // lost a publish race with another digest-equal URL
            if extract_path.is_dir() {
                let _ = std::fs::remove_dir_all(&staged);
            } else {
                return Err(Error::IoError(format!("failed to publish extraction: {e}")));
            }
        }
        Ok(Some(extract_path))
    }

    async fn download_with_retry(&self, url: &str) -> Result<(tempfile::NamedTempFile, String)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download(url).await {
                Ok(done) => return Ok(done),
                Err(Attempt::Fatal(error)) => return Err(error),
                Err(Attempt::Transient(error)) if attempt >= MAX_ATTEMPTS => return Err(error),
                Err(Attempt::Transient(error)) => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt - 1);
                    let delay = delay.min(BACKOFF_CAP);
                    warn!("Download attempt {attempt} for {url} failed: {error}, retrying...");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One download attempt, streaming to a temp file and hashing in flight
    async fn download(&self, url: &str) -> std::result::Result<(tempfile::NamedTempFile, String), Attempt> {
        info!("Downloading {url}...");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transient(format!("Failed to download {url}. {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(Attempt::Fatal(Error::NetworkError(format!(
                "Failed to download {url}. Server responded with {status}."
            ))));
        }
        if status.is_server_error() {
            return Err(transient(format!(
                "Failed to download {url}. Server responded with {status}."
            )));
        }

        let mut temp = tempfile::NamedTempFile::new_in(&self.cache_directory)
            .map_err(|e| Attempt::Fatal(Error::IoError(format!("failed to create temp file: {e}"))))?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transient(format!("Failed to download {url}. {e}")))?;
            hasher.update(&chunk);
            temp.write_all(&chunk)
                .map_err(|e| Attempt::Fatal(Error::IoError(format!("failed to write download: {e}"))))?;
        }
        temp.flush()
            .map_err(|e| Attempt::Fatal(Error::IoError(format!("failed to flush download: {e}"))))?;

        Ok((temp, format!("{:x}", hasher.finalize())))
    }
}

enum Attempt {
    Transient(Error),
    Fatal(Error),
}

fn transient(message: String) -> Attempt {
    Attempt::Transient(Error::NetworkError(message))
}

/// Last path segment of a URL, query string and fragment stripped
fn file_name_from_url(url: &str) -> Result<String> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let name = trimmed.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || name.contains("//") || !trimmed.contains("://") {
        return Err(Error::NetworkError(format!(
            "cannot determine file name from url {url}"
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sha256_of(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn fetcher_with(temp: &TempDir, mode: FetchMode) -> (Fetcher, Arc<Mutex<Lock>>) {
        let lock = Lock::load(&temp.path().join("test.lock.yml")).unwrap();
        let lock = Arc::new(Mutex::new(lock));
        let cache = temp.path().join("cache");
        (Fetcher::new(&cache, lock.clone(), mode).unwrap(), lock)
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://e.test/dl/app-1.0.tgz?token=x#frag").unwrap(),
            "app-1.0.tgz"
        );
        assert!(file_name_from_url("https://e.test/").is_err());
        assert!(file_name_from_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_cache_hit_needs_no_network() {
        let temp = TempDir::new().unwrap();
        let (fetcher, lock) = fetcher_with(&temp, FetchMode::Verify);

        // seed the cache and the lockfile by hand
        let payload = b"payload bytes";
        let sha256 = sha256_of(payload);
        let url = "https://unreachable.test/app.bin";
        lock.lock().await.put(url, &sha256);
        let digest_dir = temp.path().join("cache").join(&sha256);
        fs::create_dir_all(&digest_dir).unwrap();
        fs::write(digest_dir.join("app.bin"), payload).unwrap();

        let result = fetcher.fetch(url).await.unwrap();
        assert_eq!(result.sha256, sha256);
        assert_eq!(result.storage_path(), digest_dir.join("app.bin"));
        assert!(result.extracted_path.is_none());
    }

    #[tokio::test]
    async fn test_cached_archive_is_extracted_and_published() {
        let temp = TempDir::new().unwrap();
        let (fetcher, lock) = fetcher_with(&temp, FetchMode::Verify);

        // build a tar.gz payload
        let content = temp.path().join("content");
        fs::create_dir_all(&content).unwrap();
        fs::write(content.join("hello.txt"), "hi\n").unwrap();
        let mut bytes = Vec::new();
        {
            let encoder =
                flate2::write::GzEncoder::new(&mut bytes, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(".", &content).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let sha256 = sha256_of(&bytes);
        let url = "https://unreachable.test/app.tar.gz";
        lock.lock().await.put(url, &sha256);
        let digest_dir = temp.path().join("cache").join(&sha256);
        fs::create_dir_all(&digest_dir).unwrap();
        fs::write(digest_dir.join("app.tar.gz"), &bytes).unwrap();

        let result = fetcher.fetch(url).await.unwrap();
        let extracted = result.extracted_path.clone().unwrap();
        assert_eq!(extracted, digest_dir.join("extracted"));
        assert_eq!(fs::read_to_string(extracted.join("hello.txt")).unwrap(), "hi\n");
        // no staging leftovers
        let strays: Vec<_> = fs::read_dir(&digest_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".extract-"))
            .collect();
        assert!(strays.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce_to_one_outcome() {
        let temp = TempDir::new().unwrap();
        let (fetcher, lock) = fetcher_with(&temp, FetchMode::Verify);

        let payload = b"same bytes";
        let sha256 = sha256_of(payload);
        let url = "https://unreachable.test/app.bin";
        lock.lock().await.put(url, &sha256);
        let digest_dir = temp.path().join("cache").join(&sha256);
        fs::create_dir_all(&digest_dir).unwrap();
        fs::write(digest_dir.join("app.bin"), payload).unwrap();

        let fetcher = Arc::new(fetcher);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let fetcher = fetcher.clone();
            let url = url.to_string();
            handles.push(tokio::spawn(async move { fetcher.fetch(&url).await }));
        }
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.sha256, sha256);
        }
        assert_eq!(fetcher.outcomes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_memoised_per_url() {
        let temp = TempDir::new().unwrap();
        let (fetcher, _lock) = fetcher_with(&temp, FetchMode::Verify);

        // bogus url fails fast and identically for every caller
        let first = fetcher.fetch("bogus").await.unwrap_err();
        let second = fetcher.fetch("bogus").await.unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(fetcher.outcomes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_all_splits_results_from_errors() {
        let temp = TempDir::new().unwrap();
        let (fetcher, lock) = fetcher_with(&temp, FetchMode::Verify);

        let payload = b"bytes";
        let sha256 = sha256_of(payload);
        let good = "https://unreachable.test/ok.bin";
        lock.lock().await.put(good, &sha256);
        let digest_dir = temp.path().join("cache").join(&sha256);
        fs::create_dir_all(&digest_dir).unwrap();
        fs::write(digest_dir.join("ok.bin"), payload).unwrap();

        let urls = vec![good.to_string(), "bogus".to_string(), good.to_string()];
        let (results, errors) = fetcher.fetch_all(&urls).await;
        assert_eq!(results.len(), 1);
        assert_eq!(errors.len(), 1);
        assert!(results.contains_key(good));
        assert!(errors.contains_key("bogus"));
    }
}
