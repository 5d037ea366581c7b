//! Inspection of the executables a SPEC declares.
//!
//! For every `executables` entry that exists on this host we record its
//! content fingerprint and, when the SPEC says how, its version. Nothing here
//! can fail a test: missing required executables are warned about and version
//! probes that do not match are logged at debug level.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::hashing::{hash_file, HashAlgorithm};
use crate::spec::{ExecutableSpec, Spec, VersionProbe};

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .unwrap_or_else(|e| panic!("invalid environment variable pattern: {e}"))
});

/// Everything learned about one executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub path: PathBuf,
    pub kind: String,
    pub sha256sum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Component description keyed by the executable path as declared in the SPEC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComponentInfo {
    pub entities: BTreeMap<String, Entity>,
}

impl ComponentInfo {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

pub fn gather_component_info(spec: &Spec) -> ComponentInfo {
    let mut info = ComponentInfo::default();
    for (declared, exec) in &spec.executables {
        let path = PathBuf::from(expand_vars(declared));
        if !path.exists() {
            if !exec.optional {
                warn!(test_id = %spec.id, "failed to find required executable '{}'", declared);
            }
            continue;
        }
        let sha256sum = match hash_file(&path, HashAlgorithm::Sha256) {
            Ok(fp) => fp.to_string(),
            Err(e) => {
                debug!("cannot fingerprint executable '{}': {}", path.display(), e);
                continue;
            }
        };
        let version = probe_version(exec);
        info.entities.insert(
            declared.clone(),
            Entity {
                path,
                kind: "binary".to_string(),
                sha256sum,
                version,
            },
        );
    }
    info
}

fn probe_version(exec: &ExecutableSpec) -> Option<String> {
    if let Some(probe) = &exec.version_file {
        let path = PathBuf::from(expand_vars(probe.source()));
        let path = path.canonicalize().unwrap_or(path);
        match version_from_file(&path, probe) {
            Some(version) => return Some(version),
            None => debug!("failed to read version from '{}'", path.display()),
        }
    }
    if let Some(probe) = &exec.version_cmd {
        match version_from_command(probe) {
            Some(version) => return Some(version),
            None => debug!("failed to read version from '{}'", probe.source()),
        }
    }
    None
}

fn version_from_file(path: &Path, probe: &VersionProbe) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    first_match(probe.pattern(), content.trim())
}

/// Runs the probe command; stderr is searched first since many tools print
/// their version banner there.
fn version_from_command(probe: &VersionProbe) -> Option<String> {
    let output = Command::new("sh").arg("-c").arg(probe.source()).output().ok()?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    first_match(probe.pattern(), &stderr).or_else(|| first_match(probe.pattern(), &stdout))
}

/// First non-empty match; the first capture group when the pattern has one.
fn first_match(pattern: &str, haystack: &str) -> Option<String> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            debug!("invalid version pattern '{}': {}", pattern, e);
            return None;
        }
    };
    let found = re
        .captures_iter(haystack)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| m.as_str().to_string())
        .find(|s| !s.is_empty());
    found
}

/// Replaces `$NAME` and `${NAME}` with environment values; unknown variables
/// are left as written.
pub fn expand_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_expand_vars_leaves_unknown_untouched() {
        std::env::set_var("SPECRUN_COMPONENT_ROOT", "/opt/tool");
        assert_eq!(expand_vars("$SPECRUN_COMPONENT_ROOT/bin/x"), "/opt/tool/bin/x");
        assert_eq!(expand_vars("${SPECRUN_COMPONENT_ROOT}/y"), "/opt/tool/y");
        assert_eq!(expand_vars("$SPECRUN_NOT_SET_ANYWHERE/z"), "$SPECRUN_NOT_SET_ANYWHERE/z");
    }

    #[test]
    fn test_first_match_prefers_capture_group() {
        assert_eq!(first_match(r"v(\d+\.\d+)", "tool v5.0.1").as_deref(), Some("5.0"));
        assert_eq!(first_match(r".*", "6.0.4").as_deref(), Some("6.0.4"));
        assert_eq!(first_match(r"\d+", "none"), None);
    }

    #[test]
    fn test_gather_records_existing_executables_only() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("tool");
        fs::write(&exe, "#!/bin/sh\n").unwrap();
        let version = dir.path().join("VERSION");
        fs::write(&version, "tool release 2.3.1\n").unwrap();
        let exe_key = exe.to_string_lossy().into_owned();
        let version_path = version.to_string_lossy().into_owned();

        let json = serde_json::json!({
            "id": "c",
            "executables": {
                exe_key.clone(): {
                    "version_file": [version_path, r"(\d+\.\d+\.\d+)"]
                },
                "/no/such/tool": {"optional": true}
            }
        });
        let spec = Spec::from_json(&json.to_string(), Path::new("inline.json")).unwrap();
        let info = gather_component_info(&spec);
        assert_eq!(info.entities.len(), 1);
        let entity = &info.entities[&exe_key];
        assert_eq!(entity.version.as_deref(), Some("2.3.1"));
        assert_eq!(entity.sha256sum.len(), 64);
    }

    #[cfg(unix)]
    #[test]
    fn test_version_from_command_searches_both_streams() {
        let probe = VersionProbe::WithPattern("echo 'release 9.1' >&2".into(), r"(\d+\.\d+)".into());
        assert_eq!(version_from_command(&probe).as_deref(), Some("9.1"));
        let probe = VersionProbe::WithPattern("echo 'release 4.2'".into(), r"(\d+\.\d+)".into());
        assert_eq!(version_from_command(&probe).as_deref(), Some("4.2"));
    }
}
