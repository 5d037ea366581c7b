//! Command-line arguments and subcommands for the specrun CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// The main CLI argument structure.
#[derive(Debug, Parser)]
#[command(
    name = "specrun",
    version,
    about = "Run SPEC-described pipeline tests against a content-addressed input cache."
)]
pub struct SpecrunArgs {
    /// Configuration file (defaults to ./specrun.yaml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Discover and run tests from the configured libraries.
    Run {
        /// Test ids to run (default: all).
        ids: Vec<String>,
        /// Run only tests whose id contains this text.
        #[arg(long)]
        filter: Option<String>,
        /// Write all test reports to this JSON file.
        #[arg(long)]
        json: Option<PathBuf>,
        /// Test library (repeatable; overrides the configuration).
        #[arg(short, long = "library")]
        library: Vec<PathBuf>,
        /// File cache directory.
        #[arg(short, long)]
        cache: Option<PathBuf>,
        /// Extra root scanned for missing input files (repeatable).
        #[arg(short, long = "search")]
        search: Vec<PathBuf>,
        /// Only materialize inputs the command line mentions.
        #[arg(long)]
        lazy: bool,
        /// Kill a test command after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List discovered tests and where their SPECs live.
    List {
        /// Test library (repeatable; overrides the configuration).
        #[arg(short, long = "library")]
        library: Vec<PathBuf>,
    },
    /// Populate the file cache with every input the selected tests need.
    Cache {
        /// Test ids (default: every test in the library).
        ids: Vec<String>,
        /// Test library (repeatable; overrides the configuration).
        #[arg(short, long = "library")]
        library: Vec<PathBuf>,
        /// File cache directory.
        #[arg(short, long)]
        cache: Option<PathBuf>,
        /// Directory to search for input files (repeatable).
        #[arg(short, long = "search")]
        search: Vec<PathBuf>,
        /// Hardlink (or copy) files instead of symlinking them.
        #[arg(long)]
        copy: bool,
    },
}
