//! # Test beds
//!
//! A [`TestBed`] is a fresh temporary directory owned by exactly one test case
//! run. It is removed when closed or dropped, whatever the outcome of the run.
//!
//! [`TestbedPreparer`] materializes a SPEC's `file` inputs into a test bed,
//! resolving each by fingerprint through the file cache and, failing that, an
//! on-demand scan of the search paths. Preparation is all-or-nothing: if any
//! input cannot be resolved nothing is run.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::cache::{place_file, scan, FileCache, LinkMode, PopulateOutcome};
use crate::errors::{Result, SpecrunError};
use crate::hashing::Fingerprint;
use crate::spec::{InputSpec, Spec};

const TESTBED_PREFIX: &str = "specrun";

// =============================================================================
// TEST BED
// =============================================================================

#[derive(Debug)]
pub struct TestBed {
    dir: TempDir,
}

impl TestBed {
    /// Creates a fresh directory under the system temporary directory.
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(TESTBED_PREFIX)
            .tempdir()
            .map_err(|e| SpecrunError::io(std::env::temp_dir(), e))?;
        debug!("created work dir at '{}'", dir.path().display());
        Ok(Self { dir })
    }

    /// Creates a fresh directory under `parent`.
    pub fn create_in(parent: &Path) -> Result<Self> {
        fs::create_dir_all(parent).map_err(|e| SpecrunError::io(parent, e))?;
        let dir = tempfile::Builder::new()
            .prefix(TESTBED_PREFIX)
            .tempdir_in(parent)
            .map_err(|e| SpecrunError::io(parent, e))?;
        debug!("created work dir at '{}'", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the directory recursively, surfacing any removal error.
    pub fn destroy(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        debug!("remove work dir at '{}'", path.display());
        self.dir.close().map_err(|e| SpecrunError::io(path, e))
    }
}

// =============================================================================
// PREPARATION
// =============================================================================

/// One input placed into a test bed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedInput {
    pub name: String,
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// Where an input's content comes from before it is materialized.
enum Pending {
    Resolved(PathBuf),
    ByFingerprint(Fingerprint),
    Unresolvable,
}

#[derive(Debug, Clone)]
pub struct TestbedPreparer<'a> {
    search_paths: &'a [PathBuf],
    cache: Option<&'a FileCache>,
    fixture_dir: Option<&'a Path>,
    lazy: bool,
    mode: LinkMode,
}

impl<'a> TestbedPreparer<'a> {
    pub fn new(search_paths: &'a [PathBuf]) -> Self {
        Self {
            search_paths,
            cache: None,
            fixture_dir: None,
            lazy: false,
            mode: LinkMode::Symlink,
        }
    }

    pub fn with_cache(mut self, cache: Option<&'a FileCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Directory holding the SPEC's co-located fixtures, used for inputs that
    /// declare no fingerprint.
    pub fn with_fixture_dir(mut self, dir: &'a Path) -> Self {
        self.fixture_dir = Some(dir);
        self
    }

    /// Skip inputs the command line never mentions.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn link_mode(mut self, mode: LinkMode) -> Self {
        self.mode = mode;
        self
    }

    /// Materializes every `file` input of `spec` into `dest`.
    pub fn prepare(&self, spec: &Spec, dest: &Path) -> Result<Vec<MaterializedInput>> {
        let command_line = spec
            .test
            .command
            .as_ref()
            .map(|c| c.to_shell_line())
            .unwrap_or_default();

        let mut planned = Vec::new();
        for (name, input) in spec.file_inputs() {
            let relative = destination_for(spec, name, input)?;
            if self.lazy && !command_line.contains(&*relative.to_string_lossy()) {
                debug!(test_id = %spec.id, input = %name, "deferring input not referenced by command");
                continue;
            }
            let pending = self.resolve_locally(input);
            planned.push((name, input, relative, pending));
        }

        let wanted: BTreeSet<Fingerprint> = planned
            .iter()
            .filter_map(|(_, _, _, p)| match p {
                Pending::ByFingerprint(fp) => Some(fp.clone()),
                _ => None,
            })
            .collect();
        let skip = self.cache.map(FileCache::root);
        let found = scan(self.search_paths, &wanted, skip);

        let mut resolved = Vec::with_capacity(planned.len());
        let mut missing = Vec::new();
        for (name, input, relative, pending) in planned {
            let source = match pending {
                Pending::Resolved(path) => Some(path),
                Pending::ByFingerprint(fp) => found
                    .get(&fp)
                    .map(|path| self.remember(spec, input, &fp, path)),
                Pending::Unresolvable => None,
            };
            match source {
                Some(source) => resolved.push((name, relative, source)),
                None => missing.push((name, input)),
            }
        }

        if let Some((name, input)) = missing.first() {
            for (other, other_input) in &missing {
                warn!(
                    "cannot find input '{}' for test '{}': {} ({})",
                    other,
                    spec.id,
                    other_input.value_display(),
                    fingerprint_display(other_input)
                );
            }
            return Err(SpecrunError::MissingInput {
                test_id: spec.id.clone(),
                input: name.to_string(),
                value: input.value_display(),
                fingerprint: fingerprint_display(input),
            });
        }

        let mut placed = Vec::with_capacity(resolved.len());
        for (name, relative, source) in resolved {
            let target = dest.join(&relative);
            self.materialize(&source, &target)?;
            debug!(test_id = %spec.id, input = %name, "placed '{}'", relative.display());
            placed.push(MaterializedInput {
                name: name.clone(),
                source,
                dest: target,
            });
        }
        Ok(placed)
    }

    fn resolve_locally(&self, input: &InputSpec) -> Pending {
        if let Some(fp) = input.fingerprint() {
            if let Some(path) = self.cache.and_then(|c| c.resolve(&fp)) {
                return Pending::Resolved(path);
            }
            return Pending::ByFingerprint(fp);
        }
        let fixture = self
            .fixture_dir
            .zip(input.value_str())
            .map(|(dir, value)| dir.join(value))
            .filter(|p| p.is_file());
        match fixture {
            Some(path) => Pending::Resolved(path),
            None => Pending::Unresolvable,
        }
    }

    /// Records a scan hit in the cache so later runs resolve it directly.
    fn remember(&self, spec: &Spec, input: &InputSpec, fp: &Fingerprint, found: &Path) -> PathBuf {
        let Some(cache) = self.cache else {
            return found.to_path_buf();
        };
        match cache.populate(fp, found, LinkMode::Symlink) {
            Ok(PopulateOutcome::Conflict { existing }) => {
                warn!(
                    "will not replace existing non-symlink cache content: [{}: {} ({})]",
                    spec.id,
                    input.value_display(),
                    fp
                );
                existing
            }
            Ok(_) => cache.entry_path(fp),
            Err(e) => {
                debug!("could not cache '{}': {}", found.display(), e);
                found.to_path_buf()
            }
        }
    }

    fn materialize(&self, source: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| SpecrunError::io(parent, e))?;
        }
        if fs::symlink_metadata(target).is_ok() {
            fs::remove_file(target).map_err(|e| SpecrunError::io(target, e))?;
        }
        let source = source
            .canonicalize()
            .map_err(|e| SpecrunError::io(source, e))?;
        place_file(&source, target, self.mode).map_err(|e| SpecrunError::io(target, e))
    }
}

/// Relative path an input occupies inside the test bed.
///
/// Relative values are kept as written so the command finds them where it
/// expects; absolute values keep only their file name; inputs without a value
/// use their input name.
fn destination_for(spec: &Spec, name: &str, input: &InputSpec) -> Result<PathBuf> {
    let declared = input.value_str().unwrap_or(name);
    let path = Path::new(declared);
    let relative = if path.is_absolute() {
        path.file_name().map(PathBuf::from)
    } else {
        Some(path.to_path_buf())
    };
    let escapes = |p: &Path| {
        p.components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    };
    match relative {
        Some(p) if !p.as_os_str().is_empty() && !escapes(&p) => Ok(p),
        _ => Err(SpecrunError::InputPathEscapes {
            test_id: spec.id.clone(),
            input: name.to_string(),
            value: declared.to_string(),
        }),
    }
}

fn fingerprint_display(input: &InputSpec) -> String {
    input
        .fingerprint()
        .map(|fp| fp.to_string())
        .unwrap_or_else(|| "no fingerprint".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::{hash_file, HashAlgorithm};
    use tempfile::TempDir;

    fn spec_with_input(value: &str, sha1: Option<&str>, command: &str) -> Spec {
        let sha = sha1
            .map(|s| format!(r#", "sha1sum": "{s}""#))
            .unwrap_or_default();
        let json = format!(
            r#"{{"id": "prep", "inputs": {{"data": {{"type": "file", "value": "{value}"{sha}}}}},
                "test": {{"type": "shell_command", "command": "{command}"}}}}"#
        );
        Spec::from_json(&json, Path::new("inline.json")).unwrap()
    }

    #[test]
    fn test_testbed_is_removed_on_destroy_and_drop() {
        let parent = TempDir::new().unwrap();
        let bed = TestBed::create_in(parent.path()).unwrap();
        let path = bed.path().to_path_buf();
        assert!(path.is_dir());
        bed.destroy().unwrap();
        assert!(!path.exists());

        let bed = TestBed::create_in(parent.path()).unwrap();
        let path = bed.path().to_path_buf();
        drop(bed);
        assert!(!path.exists());
    }

    #[test]
    fn test_prepare_resolves_by_scan_and_keeps_relative_layout() {
        let search = TempDir::new().unwrap();
        let source = search.path().join("store").join("blob");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, "content").unwrap();
        let fp = hash_file(&source, HashAlgorithm::Sha1).unwrap();
        let spec = spec_with_input("sub/in.txt", Some(fp.as_str()), "cat sub/in.txt");

        let bed = TestBed::create().unwrap();
        let roots = vec![search.path().to_path_buf()];
        let placed = TestbedPreparer::new(&roots).prepare(&spec, bed.path()).unwrap();
        assert_eq!(placed.len(), 1);
        assert_eq!(
            fs::read_to_string(bed.path().join("sub/in.txt")).unwrap(),
            "content"
        );
    }

    #[test]
    fn test_prepare_populates_cache_from_scan() {
        let search = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let cache = FileCache::new(cache_dir.path());
        fs::write(search.path().join("blob"), "cached later").unwrap();
        let fp = hash_file(&search.path().join("blob"), HashAlgorithm::Sha1).unwrap();
        let spec = spec_with_input("in.txt", Some(fp.as_str()), "true");

        let bed = TestBed::create().unwrap();
        let roots = vec![search.path().to_path_buf()];
        TestbedPreparer::new(&roots)
            .with_cache(Some(&cache))
            .link_mode(LinkMode::Copy)
            .prepare(&spec, bed.path())
            .unwrap();
        assert!(cache.resolve(&fp).is_some());
        let meta = fs::symlink_metadata(bed.path().join("in.txt")).unwrap();
        assert!(meta.file_type().is_file());
    }

    #[test]
    fn test_unresolvable_input_fails_preparation() {
        let search = TempDir::new().unwrap();
        let spec = spec_with_input("in.txt", Some("a".repeat(40).as_str()), "cat in.txt");
        let bed = TestBed::create().unwrap();
        let roots = vec![search.path().to_path_buf()];
        let err = TestbedPreparer::new(&roots)
            .prepare(&spec, bed.path())
            .unwrap_err();
        match err {
            SpecrunError::MissingInput { test_id, value, fingerprint, .. } => {
                assert_eq!(test_id, "prep");
                assert_eq!(value, "in.txt");
                assert_eq!(fingerprint, "a".repeat(40));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!bed.path().join("in.txt").exists());
    }

    #[test]
    fn test_unfingerprinted_input_comes_from_fixture_dir() {
        let fixtures = TempDir::new().unwrap();
        fs::write(fixtures.path().join("params.cfg"), "k=v").unwrap();
        let spec = spec_with_input("params.cfg", None, "cat params.cfg");
        let bed = TestBed::create().unwrap();
        let roots: Vec<PathBuf> = Vec::new();
        TestbedPreparer::new(&roots)
            .with_fixture_dir(fixtures.path())
            .link_mode(LinkMode::Copy)
            .prepare(&spec, bed.path())
            .unwrap();
        assert_eq!(
            fs::read_to_string(bed.path().join("params.cfg")).unwrap(),
            "k=v"
        );
    }

    #[test]
    fn test_lazy_skips_unreferenced_inputs() {
        let spec = spec_with_input("unused.bin", Some("b".repeat(40).as_str()), "echo nothing");
        let bed = TestBed::create().unwrap();
        let roots: Vec<PathBuf> = Vec::new();
        let placed = TestbedPreparer::new(&roots)
            .lazy(true)
            .prepare(&spec, bed.path())
            .unwrap();
        assert!(placed.is_empty());
    }

    #[test]
    fn test_parent_dir_values_are_rejected() {
        let spec = spec_with_input("../outside.txt", Some("c".repeat(40).as_str()), "true");
        let bed = TestBed::create().unwrap();
        let roots: Vec<PathBuf> = Vec::new();
        let err = TestbedPreparer::new(&roots)
            .prepare(&spec, bed.path())
            .unwrap_err();
        assert!(matches!(err, SpecrunError::InputPathEscapes { .. }));
    }
}
