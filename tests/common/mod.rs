//! Shared fixtures for specrun integration tests: a throwaway test library
//! with helpers to lay out SPECs and their input files.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use specrun::hashing::{hash_file, HashAlgorithm};
use tempfile::TempDir;

pub struct Library {
    dir: TempDir,
}

impl Library {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `spec` as `<subdir>/spec.json` and returns its path.
    pub fn add_spec(&self, subdir: &str, spec: Value) -> PathBuf {
        let dir = self.dir.path().join(subdir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("spec.json");
        fs::write(&path, serde_json::to_string_pretty(&spec).unwrap()).unwrap();
        path
    }
}

/// Writes `content` to `dir/name` and returns the file's sha1 hex digest.
pub fn data_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    hash_file(&path, HashAlgorithm::Sha1).unwrap().to_string()
}

/// A `shell_command` SPEC with one fingerprinted input and one file output.
pub fn shell_spec(id: &str, sha1: &str, command: &str) -> Value {
    serde_json::json!({
        "id": id,
        "inputs": {
            "image": {"type": "file", "value": "in/image.nii", "sha1sum": sha1}
        },
        "test": {"type": "shell_command", "command": command},
        "outputs": {
            "result": {"type": "file", "value": "out.txt"}
        }
    })
}

/// Entries currently inside `dir`.
pub fn entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
