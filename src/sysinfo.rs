//! Diagnostic metadata attached to test reports: a description of the host
//! and the values of the environment variables a SPEC asks to capture.
//! Neither is ever used to decide how a test runs.

use std::collections::BTreeMap;
use std::fs;
use std::process::Command;

use serde::Serialize;

const UNDEFINED: &str = "UNDEFINED";

/// Opaque description of the host, gathered once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub family: String,
    pub arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    pub tool_version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_release: os_release(),
            kernel: kernel_release(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn os_release() -> Option<String> {
    let content = fs::read_to_string("/etc/os-release").ok()?;
    content.lines().find_map(|line| {
        line.strip_prefix("PRETTY_NAME=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

fn kernel_release() -> Option<String> {
    let output = Command::new("uname").arg("-sr").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Values of the variables named in `names`; unset ones map to `"UNDEFINED"`.
pub fn capture_environment<S: AsRef<str>>(names: &[S]) -> BTreeMap<String, String> {
    names
        .iter()
        .map(|name| {
            let name = name.as_ref();
            let value = std::env::var(name).unwrap_or_else(|_| UNDEFINED.to_string());
            (name.to_string(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_reports_build_target() {
        let info = SystemInfo::collect();
        assert_eq!(info.os, std::env::consts::OS);
        assert_eq!(info.arch, std::env::consts::ARCH);
        assert!(!info.tool_version.is_empty());
    }

    #[test]
    fn test_capture_environment_marks_unset() {
        std::env::set_var("SPECRUN_SYSINFO_PROBE", "42");
        let env = capture_environment(&["SPECRUN_SYSINFO_PROBE", "SPECRUN_SURELY_UNSET_VAR"]);
        assert_eq!(env["SPECRUN_SYSINFO_PROBE"], "42");
        assert_eq!(env["SPECRUN_SURELY_UNSET_VAR"], "UNDEFINED");
    }
}
