//! Run configuration.
//!
//! Settings are layered: built-in defaults, then a YAML file (`specrun.yaml`
//! in the working directory, or an explicit path), then the
//! `SPECRUN_LIBRARY_PATH` environment variable, then command-line flags,
//! which the CLI applies on top of the returned [`Config`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{FileCache, LinkMode};
use crate::errors::{Result, SpecrunError};

pub const DEFAULT_CONFIG_FILE: &str = "specrun.yaml";
pub const LIBRARY_PATH_ENV: &str = "SPECRUN_LIBRARY_PATH";
const DEFAULT_LIBRARY: &str = "library";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Test library roots, searched in order.
    pub library: Vec<PathBuf>,
    /// File cache directory; no cache when unset.
    pub cache: Option<PathBuf>,
    /// Extra roots scanned for input files missing from the cache.
    pub search: Vec<PathBuf>,
    pub link_mode: LinkMode,
    pub lazy: bool,
    pub timeout_secs: Option<u64>,
    pub use_colors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library: vec![PathBuf::from(DEFAULT_LIBRARY)],
            cache: None,
            search: Vec::new(),
            link_mode: LinkMode::default(),
            lazy: false,
            timeout_secs: None,
            use_colors: atty::is(atty::Stream::Stdout),
        }
    }
}

impl Config {
    pub fn from_yaml(source: &str, origin: &Path) -> Result<Self> {
        serde_yaml::from_str(source).map_err(|e| SpecrunError::Config {
            message: format!("{}: {}", origin.display(), e),
        })
    }

    /// Loads `explicit`, or `specrun.yaml` when it exists, then applies the
    /// environment. An explicit path that cannot be read is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::read(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::read(default)?
                } else {
                    Self::default()
                }
            }
        };
        if let Some(paths) = std::env::var_os(LIBRARY_PATH_ENV) {
            config.prepend_libraries(std::env::split_paths(&paths));
        }
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        debug!("loading configuration from '{}'", path.display());
        let source = fs::read_to_string(path).map_err(|e| SpecrunError::io(path, e))?;
        Self::from_yaml(&source, path)
    }

    /// Puts `paths` ahead of the configured libraries, dropping repeats.
    pub fn prepend_libraries(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        let mut merged: Vec<PathBuf> = paths
            .into_iter()
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        merged.append(&mut self.library);
        let mut seen = std::collections::HashSet::new();
        merged.retain(|p| seen.insert(p.clone()));
        self.library = merged;
    }

    /// Configured test library locations.
    pub fn library_paths(&self) -> &[PathBuf] {
        &self.library
    }

    /// Roots scanned for inputs: the search paths, then the libraries.
    pub fn scan_roots(&self) -> Vec<PathBuf> {
        self.search
            .iter()
            .chain(self.library.iter())
            .cloned()
            .collect()
    }

    pub fn file_cache(&self) -> Option<FileCache> {
        self.cache.as_ref().map(|p| FileCache::new(p.clone()))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
