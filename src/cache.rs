//! # Content-addressed file cache
//!
//! A flat directory whose entries are named by the hex fingerprint of their
//! content. Entries may be symlinks, hardlinks or plain copies; the mode is
//! chosen at populate time and is not recorded in the name.
//!
//! Population writes to a temporary name inside the cache directory and then
//! renames into place, so a concurrent [`FileCache::resolve`] never sees a
//! partially written entry. An existing symlink entry is replaced; any other
//! pre-existing entry is left untouched and reported as a conflict.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::{Result, SpecrunError};
use crate::hashing::{hash_file_with, Fingerprint, HashAlgorithm};
use crate::spec::Spec;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How a file is placed into the cache or a test bed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Symbolic link to the absolute source path.
    #[default]
    Symlink,
    /// Hard link, falling back to a byte copy when linking fails.
    Hardlink,
    /// Byte copy.
    Copy,
}

/// Result of a single [`FileCache::populate`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulateOutcome {
    /// A new entry was created.
    Placed,
    /// An existing symlink entry was replaced.
    Replaced,
    /// An existing symlink already pointed at the same source.
    Unchanged,
    /// A foreign (non-symlink) entry already exists and was kept.
    Conflict { existing: PathBuf },
}

/// Who asked for a fingerprint, for operator-facing messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOrigin {
    pub test_id: String,
    pub value: String,
}

/// A wanted fingerprint that no search root could supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingFile {
    pub fingerprint: Fingerprint,
    pub origin: FileOrigin,
}

/// The set of fingerprints a group of SPECs needs.
#[derive(Debug, Clone, Default)]
pub struct WantedFiles {
    wanted: BTreeMap<Fingerprint, FileOrigin>,
}

impl WantedFiles {
    /// Records every fingerprinted `file` input of `spec` under `test_id`.
    pub fn add_spec(&mut self, test_id: &str, spec: &Spec) {
        for (_, input) in spec.file_inputs() {
            if let Some(fp) = input.fingerprint() {
                self.wanted.insert(
                    fp,
                    FileOrigin {
                        test_id: test_id.to_string(),
                        value: input.value_display(),
                    },
                );
            }
        }
    }

    pub fn insert(&mut self, fingerprint: Fingerprint, origin: FileOrigin) {
        self.wanted.insert(fingerprint, origin);
    }

    pub fn origin(&self, fingerprint: &Fingerprint) -> Option<&FileOrigin> {
        self.wanted.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.wanted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wanted.is_empty()
    }
}

/// Summary of a bulk [`FileCache::satisfy`] pass.
#[derive(Debug, Clone, Default)]
pub struct CacheReport {
    pub already_cached: usize,
    pub populated: Vec<Fingerprint>,
    pub conflicts: Vec<Fingerprint>,
    pub missing: Vec<MissingFile>,
}

#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    /// A handle on `root`; the directory is created lazily on first populate.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.as_str())
    }

    /// Looks up a fingerprint. Dangling symlink entries do not resolve.
    pub fn resolve(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let path = self.entry_path(fingerprint);
        path.is_file().then_some(path)
    }

    /// Names of all entries that currently resolve to a regular file. Dangling
    /// symlinks are left out so they get repopulated.
    pub fn cached_names(&self) -> io::Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.insert(name);
        }
        Ok(names)
    }

    /// Places `source` into the cache under `fingerprint`.
    pub fn populate(
        &self,
        fingerprint: &Fingerprint,
        source: &Path,
        mode: LinkMode,
    ) -> Result<PopulateOutcome> {
        fs::create_dir_all(&self.root).map_err(|e| SpecrunError::io(&self.root, e))?;
        let dest = self.entry_path(fingerprint);
        let source = source
            .canonicalize()
            .map_err(|e| SpecrunError::io(source, e))?;

        let replacing = match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let current = fs::read_link(&dest).ok();
                if mode == LinkMode::Symlink && current.as_deref() == Some(source.as_path()) {
                    return Ok(PopulateOutcome::Unchanged);
                }
                true
            }
            Ok(_) => return Ok(PopulateOutcome::Conflict { existing: dest }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(SpecrunError::io(&dest, e)),
        };

        let tmp = self.root.join(format!(
            ".{}.{}.{}.tmp",
            fingerprint,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = place_file(&source, &tmp, mode).and_then(|_| fs::rename(&tmp, &dest)) {
            let _ = fs::remove_file(&tmp);
            return Err(SpecrunError::io(&dest, e));
        }
        debug!(fingerprint = %fingerprint, source = %source.display(), ?mode, "populated cache entry");
        Ok(if replacing {
            PopulateOutcome::Replaced
        } else {
            PopulateOutcome::Placed
        })
    }

    /// Bulk satisfaction: find every wanted fingerprint the cache lacks by
    /// hashing files under `roots`, populate what is found, and report the rest.
    pub fn satisfy<P: AsRef<Path>>(
        &self,
        wanted: &WantedFiles,
        roots: &[P],
        mode: LinkMode,
    ) -> Result<CacheReport> {
        let have = self
            .cached_names()
            .map_err(|e| SpecrunError::io(&self.root, e))?;
        let mut report = CacheReport::default();
        let mut outstanding = BTreeSet::new();
        for fp in wanted.wanted.keys() {
            if have.contains(fp.as_str()) {
                report.already_cached += 1;
            } else {
                outstanding.insert(fp.clone());
            }
        }

        let found = scan(roots, &outstanding, Some(&self.root));
        for (fp, source) in &found {
            match self.populate(fp, source, mode)? {
                PopulateOutcome::Conflict { .. } => {
                    let origin = wanted.origin(fp).cloned().unwrap_or_else(unknown_origin);
                    warn!(
                        "will not replace existing non-symlink cache content: [{}: {} ({})]",
                        origin.test_id, origin.value, fp
                    );
                    report.conflicts.push(fp.clone());
                }
                _ => report.populated.push(fp.clone()),
            }
            outstanding.remove(fp);
        }

        if !outstanding.is_empty() {
            warn!("cannot find needed file(s):");
        }
        for fp in outstanding {
            let origin = wanted.origin(&fp).cloned().unwrap_or_else(unknown_origin);
            warn!("  {}: {} ({})", origin.test_id, origin.value, fp);
            report.missing.push(MissingFile {
                fingerprint: fp,
                origin,
            });
        }
        Ok(report)
    }
}

fn unknown_origin() -> FileOrigin {
    FileOrigin {
        test_id: "?".to_string(),
        value: String::new(),
    }
}

/// Walks `roots`, fingerprinting regular files until every wanted fingerprint
/// has a candidate. The first file found for a fingerprint wins. Anything under
/// `skip` (normally the cache directory itself) is never hashed.
pub fn scan<P: AsRef<Path>>(
    roots: &[P],
    wanted: &BTreeSet<Fingerprint>,
    skip: Option<&Path>,
) -> HashMap<Fingerprint, PathBuf> {
    let mut found = HashMap::new();
    if wanted.is_empty() {
        return found;
    }
    let algorithms: BTreeSet<HashAlgorithm> = wanted.iter().map(Fingerprint::algorithm).collect();
    let skip = skip.and_then(|p| p.canonicalize().ok());

    for root in roots {
        let walker = WalkDir::new(root.as_ref()).into_iter().filter_entry(|e| {
            match (&skip, e.path().canonicalize()) {
                (Some(skip), Ok(path)) => !path.starts_with(skip),
                _ => true,
            }
        });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("skipping unreadable search entry: {}", e);
                    continue;
                }
            };
            // symlinks to regular files count, as in annexed data trees
            if !entry.path().is_file() {
                continue;
            }
            let digests = match hash_file_with(entry.path(), &algorithms) {
                Ok(digests) => digests,
                Err(e) => {
                    debug!("cannot fingerprint '{}': {}", entry.path().display(), e);
                    continue;
                }
            };
            for fp in digests {
                if wanted.contains(&fp) && !found.contains_key(&fp) {
                    debug!(fingerprint = %fp, path = %entry.path().display(), "found wanted file");
                    found.insert(fp, entry.path().to_path_buf());
                }
            }
            if found.len() == wanted.len() {
                return found;
            }
        }
    }
    found
}

/// Creates `dest` from `source` according to `mode`.
///
/// Hardlink failures of any kind (cross-device, permissions) fall back to a copy.
pub(crate) fn place_file(source: &Path, dest: &Path, mode: LinkMode) -> io::Result<()> {
    match mode {
        LinkMode::Symlink => symlink(source, dest),
        LinkMode::Hardlink => fs::hard_link(source, dest).or_else(|e| {
            debug!("hardlink of '{}' failed ({}), copying instead", source.display(), e);
            fs::copy(source, dest).map(|_| ())
        }),
        LinkMode::Copy => fs::copy(source, dest).map(|_| ()),
    }
}

#[cfg(unix)]
fn symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(source, dest)
}
