//! # SPEC documents
//!
//! A SPEC is a JSON object describing one test: its inputs, the command to
//! run, and the outputs expected afterwards. Unknown fields are kept verbatim
//! in `extra` maps so newer documents parse cleanly and custom sections stay
//! addressable by `section::field` output references.
//!
//! ```json
//! {
//!   "id": "bet-basic",
//!   "inputs": { "head": { "type": "file", "value": "head.nii.gz", "sha1sum": "..." } },
//!   "test": { "type": "shell_command", "command": ["bet", "head.nii.gz", "brain"] },
//!   "outputs": {
//!     "brain": { "type": "file", "value": "brain.nii.gz" },
//!     "test::exitcode": { "type": "string", "value": 0 }
//!   },
//!   "environment": ["FSLDIR"]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::{Result, SpecrunError};
use crate::hashing::{Fingerprint, HashAlgorithm};

pub mod discovery;

/// Fixed file name of the SPEC inside each library test directory.
pub const SPEC_FILENAME: &str = "spec.json";

/// Input/output `type` tag for files.
pub const FILE_TYPE: &str = "file";
/// Output `type` tag for literal comparisons against a SPEC field.
pub const STRING_TYPE: &str = "string";
/// Output id that declares the expected exit code of the test command.
pub const EXITCODE_OUTPUT: &str = "test::exitcode";

// =============================================================================
// DOCUMENT MODEL
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub id: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    #[serde(default)]
    pub test: TestSpec,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
    #[serde(default, deserialize_with = "names_from_list_or_map")]
    pub environment: Vec<String>,
    #[serde(default)]
    pub executables: BTreeMap<String, ExecutableSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1sum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256sum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InputSpec {
    pub fn is_file(&self) -> bool {
        self.kind == FILE_TYPE
    }

    /// The declared content fingerprint, preferring SHA-256 when both are given.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.sha256sum
            .as_deref()
            .map(|hex| Fingerprint::new(HashAlgorithm::Sha256, hex))
            .or_else(|| {
                self.sha1sum
                    .as_deref()
                    .map(|hex| Fingerprint::new(HashAlgorithm::Sha1, hex))
            })
    }

    /// The declared value when it is a string (path hint for file inputs).
    pub fn value_str(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }

    /// Human-readable declared value, empty when absent.
    pub fn value_display(&self) -> String {
        match &self.value {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// Execution descriptor. `kind` selects the handler; the handler writes the
/// run's exit code and captured streams back into `exitcode`/`stdout`/`stderr`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestSpec {
    /// Records the result of an execution run.
    pub fn record_execution(&mut self, exitcode: Option<i32>, stdout: String, stderr: String) {
        self.exitcode = exitcode;
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
    }
}

/// A command given either as one shell string or as an argument vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    /// Flattens the command into a single shell line.
    ///
    /// Vector arguments are quoted only when they contain characters the shell
    /// would otherwise split or interpret; `$` stays live inside double quotes so
    /// environment variables still expand.
    pub fn to_shell_line(&self) -> String {
        match self {
            CommandLine::Shell(line) => line.clone(),
            CommandLine::Argv(args) => args
                .iter()
                .map(|a| quote_arg(a))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    let needs_quotes = arg.chars().any(|c| {
        c.is_whitespace()
            || matches!(
                c,
                '"' | '\'' | '\\' | '`' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*' | '?'
                    | '[' | ']' | '#' | '~' | '!' | '{' | '}'
            )
    });
    if !needs_quotes {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutableSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_file: Option<VersionProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_cmd: Option<VersionProbe>,
    #[serde(default)]
    pub optional: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A version source, optionally paired with an extraction regex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionProbe {
    Plain(String),
    WithPattern(String, String),
}

impl VersionProbe {
    pub fn source(&self) -> &str {
        match self {
            VersionProbe::Plain(s) | VersionProbe::WithPattern(s, _) => s,
        }
    }

    pub fn pattern(&self) -> &str {
        match self {
            VersionProbe::Plain(_) => ".*",
            VersionProbe::WithPattern(_, p) => p,
        }
    }
}

/// `environment` may be a list of names or an object keyed by name.
fn names_from_list_or_map<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        List(Vec<String>),
        Map(BTreeMap<String, Value>),
    }
    Ok(match Names::deserialize(deserializer)? {
        Names::List(names) => names,
        Names::Map(map) => map.into_keys().collect(),
    })
}

// =============================================================================
// PARSING AND ACCESSORS
// =============================================================================

impl Spec {
    /// Parses a SPEC document. `origin` names the document in diagnostics.
    pub fn from_json(source: &str, origin: &Path) -> Result<Self> {
        let spec: Spec = serde_json::from_str(source).map_err(|e| SpecrunError::InvalidSpec {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        if spec.id.trim().is_empty() {
            return Err(SpecrunError::InvalidSpec {
                path: origin.to_path_buf(),
                reason: "empty 'id'".to_string(),
            });
        }
        Ok(spec)
    }

    /// Reads and parses a SPEC file. A missing file is reported as
    /// [`SpecrunError::SpecNotFound`], distinct from an invalid one.
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SpecrunError::SpecNotFound {
                path: path.to_path_buf(),
            });
        }
        let source = fs::read_to_string(path).map_err(|e| SpecrunError::InvalidSpec {
            path: path.to_path_buf(),
            reason: format!("unreadable: {e}"),
        })?;
        Self::from_json(&source, path)
    }

    /// The id with every non-alphanumeric character replaced by `_`.
    pub fn normalized_id(&self) -> String {
        normalize_id(&self.id)
    }

    pub fn inputs_of_type<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a InputSpec)> + 'a {
        self.inputs.iter().filter(move |(_, i)| i.kind == kind)
    }

    pub fn file_inputs(&self) -> impl Iterator<Item = (&String, &InputSpec)> + '_ {
        self.inputs_of_type(FILE_TYPE)
    }

    pub fn outputs_of_type<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a OutputSpec)> + 'a {
        self.outputs.iter().filter(move |(_, o)| o.kind == kind)
    }

    /// Reads the live value at `section::field`, e.g. `test::exitcode`.
    pub fn lookup(&self, section: &str, field: &str) -> Option<Value> {
        let doc = serde_json::to_value(self).ok()?;
        doc.get(section)?.get(field).cloned()
    }
}

/// Turns an id into an identifier usable by downstream tooling.
pub fn normalize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
