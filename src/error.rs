// src/error.rs

//! Error taxonomy shared by every ops2deb component
//!
//! Each variant carries a stable class used to derive the process exit code:
//! configuration problems exit with 2, lockfile/hash discipline violations
//! with 3, build failures with 4, an interrupt with 77 and everything else
//! with 1. Variants hold rendered messages so errors stay cloneable and can
//! be replayed to every caller coalesced behind a single-flight fetch.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid YAML file. {0}")]
    ParseError(String),

    #[error("Invalid configuration file.\n{}", .0.join("\n"))]
    SchemaError(Vec<String>),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown hash for url {0}, please run ops2deb lock")]
    HashMissing(String),

    #[error("Wrong checksum for {url}. Expected {expected}, got {computed}.")]
    HashMismatch {
        url: String,
        expected: String,
        computed: String,
    },

    #[error("Archive error: {0}")]
    ArchiveError(String),

    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Script failed: {0}")]
    ScriptError(String),

    #[error("Build failed: {0}")]
    BuildError(String),

    #[error("Lockfile error: {0}")]
    LockfileError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Interrupted")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e.to_string())
    }
}

impl Error {
    /// Process exit code for this error class
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ParseError(_) | Error::SchemaError(_) | Error::TemplateError(_) => 2,
            Error::HashMissing(_) | Error::HashMismatch { .. } | Error::LockfileError(_) => 3,
            Error::BuildError(_) => 4,
            Error::Cancelled => 77,
            _ => 1,
        }
    }

    /// Rank used to pick the exit code when a run collects several errors.
    ///
    /// Higher rank wins; `Cancelled` always dominates.
    fn severity(&self) -> u8 {
        match self.exit_code() {
            77 => 255,
            code => code as u8,
        }
    }

    /// Pick the error whose class should decide the process exit code
    pub fn most_severe(errors: &[Error]) -> Option<&Error> {
        errors.iter().max_by_key(|e| e.severity())
    }
}
