// File cache: idempotent population, bulk satisfaction and conflict handling.

mod common;

use std::fs;

use common::{data_file, shell_spec, Library};
use specrun::cache::{FileCache, LinkMode, PopulateOutcome, WantedFiles};
use specrun::hashing::Fingerprint;
use specrun::spec::Spec;
use tempfile::TempDir;

#[test]
fn test_populating_twice_is_unchanged() {
    let data = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let hex = data_file(data.path(), "a.bin", "payload");
    let fp = Fingerprint::from_hex(&hex).unwrap();
    let cache = FileCache::new(cache_dir.path());

    let first = cache
        .populate(&fp, &data.path().join("a.bin"), LinkMode::Symlink)
        .unwrap();
    let second = cache
        .populate(&fp, &data.path().join("a.bin"), LinkMode::Symlink)
        .unwrap();
    assert_eq!(first, PopulateOutcome::Placed);
    assert_eq!(second, PopulateOutcome::Unchanged);
    assert_eq!(
        fs::read_to_string(cache.resolve(&fp).unwrap()).unwrap(),
        "payload"
    );
}

#[test]
fn test_satisfy_finds_file_in_search_path() {
    let lib = Library::new();
    let search = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let hex = data_file(search.path(), "deep/nested/scan.nii", "voxels");
    let spec_path = lib.add_spec("t", shell_spec("t", &hex, "true"));
    let spec = Spec::from_path(&spec_path).unwrap();

    let mut wanted = WantedFiles::default();
    wanted.add_spec("t", &spec);
    let cache = FileCache::new(cache_dir.path());
    let fp = Fingerprint::from_hex(&hex).unwrap();
    assert!(cache.resolve(&fp).is_none());

    let report = cache
        .satisfy(&wanted, &[search.path()], LinkMode::Symlink)
        .unwrap();
    assert_eq!(report.populated, vec![fp.clone()]);
    assert!(report.missing.is_empty());
    assert!(cache.resolve(&fp).is_some());

    let again = cache
        .satisfy(&wanted, &[search.path()], LinkMode::Symlink)
        .unwrap();
    assert_eq!(again.already_cached, 1);
    assert!(again.populated.is_empty());
}

#[test]
fn test_satisfy_reports_missing_with_origin() {
    let lib = Library::new();
    let cache_dir = TempDir::new().unwrap();
    let absent = "0123456789abcdef0123456789abcdef01234567";
    let spec_path = lib.add_spec("t", shell_spec("needs-absent", absent, "true"));
    let spec = Spec::from_path(&spec_path).unwrap();

    let mut wanted = WantedFiles::default();
    wanted.add_spec("needs-absent", &spec);
    let report = FileCache::new(cache_dir.path())
        .satisfy(&wanted, &[lib.path()], LinkMode::Symlink)
        .unwrap();
    assert_eq!(report.missing.len(), 1);
    assert_eq!(report.missing[0].origin.test_id, "needs-absent");
    assert_eq!(report.missing[0].origin.value, "in/image.nii");
}

#[test]
fn test_foreign_entry_is_kept() {
    let data = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let hex = data_file(data.path(), "a.bin", "real content");
    let fp = Fingerprint::from_hex(&hex).unwrap();
    fs::write(cache_dir.path().join(&hex), "operator placed").unwrap();

    let cache = FileCache::new(cache_dir.path());
    let outcome = cache
        .populate(&fp, &data.path().join("a.bin"), LinkMode::Copy)
        .unwrap();
    assert!(matches!(outcome, PopulateOutcome::Conflict { .. }));
    assert_eq!(
        fs::read_to_string(cache.resolve(&fp).unwrap()).unwrap(),
        "operator placed"
    );
}

#[test]
fn test_hardlink_mode_produces_regular_entry() {
    let data = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let hex = data_file(data.path(), "a.bin", "linked");
    let fp = Fingerprint::from_hex(&hex).unwrap();
    let cache = FileCache::new(cache_dir.path());
    cache
        .populate(&fp, &data.path().join("a.bin"), LinkMode::Hardlink)
        .unwrap();
    let meta = fs::symlink_metadata(cache.entry_path(&fp)).unwrap();
    assert!(meta.file_type().is_file());
}

#[cfg(unix)]
#[test]
fn test_concurrent_populate_never_exposes_partial_entry() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    let data = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let payload = "0123456789abcdef".repeat(64 * 1024);
    let hex = data_file(data.path(), "big.bin", &payload);
    let fp = Fingerprint::from_hex(&hex).unwrap();
    let source = data.path().join("big.bin");
    let cache = Arc::new(FileCache::new(cache_dir.path().join("cache")));
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let (cache, fp, done, payload) = (cache.clone(), fp.clone(), done.clone(), payload.clone());
        thread::spawn(move || {
            let mut seen = 0;
            while !done.load(Ordering::Acquire) {
                if let Some(path) = cache.resolve(&fp) {
                    if let Ok(content) = fs::read_to_string(&path) {
                        assert_eq!(content.len(), payload.len());
                        assert!(content == payload);
                        seen += 1;
                    }
                }
            }
            seen
        })
    };

    let writers: Vec<_> = (0..4)
        .map(|i| {
            let (cache, fp, source) = (cache.clone(), fp.clone(), source.clone());
            thread::spawn(move || {
                let mode = if i % 2 == 0 { LinkMode::Copy } else { LinkMode::Symlink };
                for _ in 0..10 {
                    cache.populate(&fp, &source, mode).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    reader.join().unwrap();

    let resolved = cache.resolve(&fp).unwrap();
    assert_eq!(fs::read_to_string(resolved).unwrap(), payload);
    let leftovers = fs::read_dir(cache_dir.path().join("cache"))
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}
