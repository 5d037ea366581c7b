use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{Spec, SPEC_FILENAME};

/// Where a discovered SPEC lives. Cases hold this, not the parsed document,
/// so edits to the library are picked up when the case runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecLocation {
    /// The id exactly as written in the document.
    pub raw_id: String,
    /// Path of the SPEC document.
    pub path: PathBuf,
    /// The library root the SPEC was found under.
    pub library: PathBuf,
}

impl SpecLocation {
    /// The test directory holding the SPEC and its co-located fixtures.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(&self.library)
    }
}

/// Index of discovered SPECs keyed by normalized id, in id order.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    entries: BTreeMap<String, SpecLocation>,
}

impl SpecRegistry {
    pub fn get(&self, id: &str) -> Option<&SpecLocation> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SpecLocation)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps only entries whose id contains `needle` (case-insensitive).
    pub fn retain_matching(&mut self, needle: &str) {
        let needle = needle.to_lowercase();
        self.entries.retain(|id, loc| {
            id.to_lowercase().contains(&needle) || loc.raw_id.to_lowercase().contains(&needle)
        });
    }

    /// Keeps only entries named in `ids`, by normalized or raw id. Returns the
    /// requested ids that matched nothing.
    pub fn retain_ids<'a>(&mut self, ids: &'a [String]) -> Vec<&'a str> {
        let unmatched = ids
            .iter()
            .filter(|want| {
                !self
                    .entries
                    .iter()
                    .any(|(id, loc)| id == *want || loc.raw_id == **want)
            })
            .map(String::as_str)
            .collect();
        self.entries
            .retain(|id, loc| ids.iter().any(|want| want == id || *want == loc.raw_id));
        unmatched
    }

    /// Registers a SPEC; the first registration of an id wins.
    fn insert(&mut self, id: String, location: SpecLocation) {
        if let Some(existing) = self.entries.get(&id) {
            warn!(
                "found duplicate test ID '{}' in {} and {}: ignoring the latter test",
                id,
                existing.path.display(),
                location.path.display()
            );
            return;
        }
        debug!(test_id = %id, "discovered test SPEC");
        self.entries.insert(id, location);
    }
}

/// Scans every immediate subdirectory of each library root for a SPEC file.
///
/// Directories without a SPEC are not tests and are skipped quietly; invalid
/// SPECs are skipped with a warning. Neither aborts the pass. Subdirectories are
/// visited in file-name order so repeated discovery of the same library yields
/// the same ids and the same duplicate winners.
pub fn discover<P: AsRef<Path>>(paths: &[P]) -> SpecRegistry {
    let mut registry = SpecRegistry::default();
    for root in paths {
        let root = root.as_ref();
        if !root.is_dir() {
            warn!("library path '{}' is not a directory", root.display());
            continue;
        }
        let subdirs = WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();
        for entry in subdirs {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("failed to read library path '{}': {}", root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let spec_path = entry.path().join(SPEC_FILENAME);
            match Spec::from_path(&spec_path) {
                Ok(spec) => registry.insert(
                    spec.normalized_id(),
                    SpecLocation {
                        raw_id: spec.id,
                        path: spec_path,
                        library: root.to_path_buf(),
                    },
                ),
                Err(e) if e.is_not_found() => {
                    debug!(
                        "ignoring '{}' directory in library path '{}': contains no SPEC file",
                        entry.file_name().to_string_lossy(),
                        root.display()
                    );
                }
                Err(e) => warn!("ignoring '{}': not a valid SPEC file ({})", spec_path.display(), e),
            }
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn write_spec(root: &Path, dir: &str, body: &str) {
        let d = root.join(dir);
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join(SPEC_FILENAME), body).unwrap();
    }

    #[test]
    fn test_discover_skips_non_tests_and_invalid_specs() {
        let lib = TempDir::new().unwrap();
        write_spec(lib.path(), "good", r#"{"id": "good-one"}"#);
        write_spec(lib.path(), "broken", "{ not json");
        fs::create_dir_all(lib.path().join("fixtures_only")).unwrap();
        fs::write(lib.path().join("stray.txt"), "x").unwrap();

        let registry = discover(&[lib.path()]);
        assert_eq!(registry.len(), 1);
        let loc = registry.get("good_one").unwrap();
        assert_eq!(loc.raw_id, "good-one");
        assert_eq!(loc.dir(), lib.path().join("good"));
    }

    #[test]
    fn test_duplicate_ids_keep_first_seen() {
        let lib_a = TempDir::new().unwrap();
        let lib_b = TempDir::new().unwrap();
        write_spec(lib_a.path(), "a", r#"{"id": "same-id"}"#);
        write_spec(lib_a.path(), "b", r#"{"id": "same.id"}"#);
        write_spec(lib_b.path(), "c", r#"{"id": "same_id"}"#);

        let registry = discover(&[lib_a.path(), lib_b.path()]);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("same_id").unwrap().path,
            lib_a.path().join("a").join(SPEC_FILENAME)
        );
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_warning_names_both_locations() {
        let lib = TempDir::new().unwrap();
        write_spec(lib.path(), "first", r#"{"id": "twin"}"#);
        write_spec(lib.path(), "second", r#"{"id": "twin"}"#);

        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let registry = tracing::subscriber::with_default(subscriber, || discover(&[lib.path()]));
        assert_eq!(registry.len(), 1);

        let text = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        let first = lib.path().join("first").join(SPEC_FILENAME);
        let second = lib.path().join("second").join(SPEC_FILENAME);
        assert!(text.contains("WARN"), "{text}");
        assert!(text.contains("duplicate test ID 'twin'"), "{text}");
        assert!(text.contains(&first.display().to_string()), "{text}");
        assert!(text.contains(&second.display().to_string()), "{text}");
    }

    #[test]
    fn test_missing_library_root_is_not_fatal() {
        let lib = TempDir::new().unwrap();
        write_spec(lib.path(), "t", r#"{"id": "t"}"#);
        let registry = discover(&[Path::new("/no/such/library"), lib.path()]);
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["t"]);
    }

    #[test]
    fn test_retain_matching_filters_case_insensitively() {
        let lib = TempDir::new().unwrap();
        write_spec(lib.path(), "a", r#"{"id": "Alpha"}"#);
        write_spec(lib.path(), "b", r#"{"id": "beta"}"#);
        let mut registry = discover(&[lib.path()]);
        registry.retain_matching("ALP");
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["Alpha"]);
    }

    #[test]
    fn test_retain_ids_accepts_raw_or_normalized() {
        let lib = TempDir::new().unwrap();
        write_spec(lib.path(), "a", r#"{"id": "img-reg"}"#);
        write_spec(lib.path(), "b", r#"{"id": "seg"}"#);
        write_spec(lib.path(), "c", r#"{"id": "other"}"#);
        let mut registry = discover(&[lib.path()]);
        let ids = vec!["img-reg".to_string(), "seg".to_string(), "nope".to_string()];
        let unmatched = registry.retain_ids(&ids);
        assert_eq!(unmatched, vec!["nope"]);
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["img_reg", "seg"]);
    }
}
