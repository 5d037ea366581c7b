//! Output verification.
//!
//! `file` outputs must exist in the test bed after execution; content is not
//! compared. `string` outputs are keyed `section::field` and compared literally
//! against the live value in the executed SPEC, e.g. `test::exitcode` or
//! `test::stdout`. Every declared output is checked and all mismatches are
//! reported together.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::errors::{Result, SpecrunError};
use crate::spec::{OutputSpec, Spec, FILE_TYPE, STRING_TYPE};

/// One output that did not meet its declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    /// A declared output file does not exist.
    MissingFile { output_id: String, path: PathBuf },
    /// A `section::field` value differs from the expected literal.
    ValueMismatch {
        output_id: String,
        expected: Value,
        actual: Option<Value>,
    },
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mismatch::MissingFile { output_id, path } => {
                write!(f, "expected output file missing: '{}' ({})", output_id, path.display())
            }
            Mismatch::ValueMismatch {
                output_id,
                expected,
                actual,
            } => write!(
                f,
                "unexpected output for '{}': expected {}, got {}",
                output_id,
                expected,
                actual
                    .as_ref()
                    .map(Value::to_string)
                    .unwrap_or_else(|| "nothing".to_string())
            ),
        }
    }
}

/// Checks every declared output of an executed `spec` against `workdir`.
///
/// Returns the (possibly empty) list of mismatches. An output type outside
/// `file`/`string`, or a malformed `section::field` id, is a configuration
/// error and is raised before any output is checked.
pub fn verify_outputs(spec: &Spec, workdir: &Path) -> Result<Vec<Mismatch>> {
    let mut checks = Vec::with_capacity(spec.outputs.len());
    for (output_id, output) in &spec.outputs {
        checks.push(plan_check(spec, output_id, output)?);
    }

    let mut mismatches = Vec::new();
    for check in checks {
        match check {
            Check::File { output_id, path } => {
                let path = workdir.join(path);
                if !path.exists() {
                    mismatches.push(Mismatch::MissingFile { output_id, path });
                }
            }
            Check::Field {
                output_id,
                section,
                field,
                expected,
            } => {
                let actual = spec.lookup(&section, &field);
                if !actual.as_ref().is_some_and(|a| values_match(&expected, a)) {
                    mismatches.push(Mismatch::ValueMismatch {
                        output_id,
                        expected,
                        actual,
                    });
                }
            }
        }
    }
    Ok(mismatches)
}

enum Check {
    File {
        output_id: String,
        path: PathBuf,
    },
    Field {
        output_id: String,
        section: String,
        field: String,
        expected: Value,
    },
}

fn plan_check(spec: &Spec, output_id: &str, output: &OutputSpec) -> Result<Check> {
    match output.kind.as_str() {
        FILE_TYPE => {
            let path = match &output.value {
                Value::String(s) => PathBuf::from(s),
                _ => PathBuf::from(output_id),
            };
            Ok(Check::File {
                output_id: output_id.to_string(),
                path,
            })
        }
        STRING_TYPE => {
            let Some((section, field)) = output_id.split_once("::") else {
                return Err(SpecrunError::MalformedOutputRef {
                    test_id: spec.id.clone(),
                    output_id: output_id.to_string(),
                });
            };
            if section.is_empty() || field.is_empty() || field.contains("::") {
                return Err(SpecrunError::MalformedOutputRef {
                    test_id: spec.id.clone(),
                    output_id: output_id.to_string(),
                });
            }
            Ok(Check::Field {
                output_id: output_id.to_string(),
                section: section.to_string(),
                field: field.to_string(),
                expected: output.value.clone(),
            })
        }
        other => Err(SpecrunError::UnknownOutputType {
            test_id: spec.id.clone(),
            output_id: output_id.to_string(),
            output_type: other.to_string(),
        }),
    }
}

/// Literal equality, tolerating a number declared as a string and vice versa.
fn values_match(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    match (scalar_text(expected), scalar_text(actual)) {
        (Some(e), Some(a)) => e == a,
        _ => false,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
