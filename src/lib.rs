// src/lib.rs

//! ops2deb - Debian packaging tool for portable applications
//!
//! Turns a declarative YAML description of upstream artifacts (blueprints)
//! into debian binary packages:
//!
//! - Blueprints: one package each, or a matrix across architectures and
//!   versions, with a small Jinja-style template language
//! - Lockfile: upstream hashes live next to the configuration, enforced by
//!   a content-addressed download cache with single-flight coordination
//! - Generator: debian source trees built from fetched payloads, install
//!   directives and build scripts
//! - Builder: parallel in-process `.deb` assembly
//! - Updater: strategy-driven discovery of newer upstream releases

pub mod blueprint;
pub mod builder;
pub mod cli;
pub mod commands;
pub mod config;
pub mod deb;
pub mod delta;
mod error;
pub mod fetcher;
pub mod formatter;
pub mod generator;
pub mod lockfile;
pub mod migrate;
pub mod settings;
pub mod template;
pub mod updater;

pub use blueprint::{Architecture, Blueprint, Fetch, InstallEntry, Matrix, RenderedBlueprint};
pub use config::Configuration;
pub use error::{Error, Result};
pub use fetcher::{FetchMode, FetchResult, Fetcher};
pub use lockfile::{Lock, LockEntry};
pub use settings::Settings;
