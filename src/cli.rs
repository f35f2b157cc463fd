// src/cli.rs
//! CLI definitions for ops2deb
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ops2deb")]
#[command(version)]
#[command(about = "Debian packaging tool for portable applications", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        env = "OPS2DEB_CONFIG",
        default_value = "ops2deb.yml"
    )]
    pub config: PathBuf,

    /// Enable more logs; OPS2DEB_VERBOSE=1 does the same
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate debian source packages from the configuration
    Generate {
        /// Directory where source packages are generated
        #[arg(long, env = "OPS2DEB_OUTPUT_DIR")]
        output: Option<PathBuf>,

        /// Only blueprints with matching names are taken into account
        #[arg(long)]
        only: Vec<String>,
    },

    /// Build debian packages from previously generated source packages
    Build {
        /// Directory where source packages are searched and built
        #[arg(long, env = "OPS2DEB_OUTPUT_DIR")]
        output: Option<PathBuf>,

        /// Max number of packages to build in parallel
        #[arg(long, short = 'w')]
        workers: Option<usize>,
    },

    /// Generate and build source packages
    Default {
        /// Directory where source packages are generated and built
        #[arg(long, env = "OPS2DEB_OUTPUT_DIR")]
        output: Option<PathBuf>,

        /// Only blueprints with matching names are taken into account
        #[arg(long)]
        only: Vec<String>,

        /// Max number of packages to build in parallel
        #[arg(long, short = 'w')]
        workers: Option<usize>,
    },

    /// Look for new upstream releases and edit the configuration
    Update {
        /// Only blueprints with matching names are updated
        #[arg(long)]
        only: Vec<String>,

        /// Blueprints that should not be updated
        #[arg(long)]
        skip: Vec<String>,

        /// Don't edit the configuration or the lockfile
        #[arg(long, short = 'd')]
        dry_run: bool,

        /// Don't generate and build packages after updating
        #[arg(long)]
        skip_build: bool,
    },

    /// Download every referenced upstream file and update the lockfile
    Lock,

    /// Clear the download cache
    Purge,

    /// Rewrite a legacy configuration into the split lockfile layout
    Migrate,

    /// Validate the configuration
    Validate,

    /// Rewrite the configuration canonically
    Format,

    /// Compare two configurations
    Delta {
        /// Configuration before the change
        old: PathBuf,

        /// Configuration after the change
        new: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: DeltaFormat,
    },

    /// Output the ops2deb version
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeltaFormat {
    Text,
    Json,
}
