//! Specrun Error Handling
//!
//! A single `miette`-aware diagnostic enum covers every failure the engine can
//! raise. Each variant belongs to exactly one [`ErrorType`], which mirrors the
//! failure taxonomy the runner reports to operators:
//!
//! - **Configuration**: malformed SPEC, unknown test or output type
//! - **Resource**: an input file that neither the cache nor a scan can supply
//! - **Execution**: the declared command could not be launched at all
//! - **Io**: filesystem trouble outside the categories above
//!
//! Assertion failures (non-zero exit, output mismatch) are *not* errors; they
//! are first-class outcomes, see [`crate::case::TestOutcome`]. Cache conflicts
//! are not errors either, see [`crate::cache::PopulateOutcome::Conflict`].

use std::io;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

/// Type-safe error classification used by reports and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    /// Malformed SPEC, unknown test type, unknown output type
    Configuration,
    /// Input file unresolvable by cache or scan
    Resource,
    /// Command could not be launched
    Execution,
    /// Filesystem failures
    Io,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Configuration => "Configuration",
            ErrorType::Resource => "Resource",
            ErrorType::Execution => "Execution",
            ErrorType::Io => "Io",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified error type for all specrun failure modes.
#[derive(Error, Diagnostic, Debug)]
pub enum SpecrunError {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    #[error("no SPEC file at '{}'", path.display())]
    #[diagnostic(code(specrun::spec::not_found))]
    SpecNotFound { path: PathBuf },

    #[error("invalid SPEC '{}': {reason}", path.display())]
    #[diagnostic(
        code(specrun::spec::invalid),
        help("a SPEC must be a JSON object with at least a non-empty string 'id'")
    )]
    InvalidSpec { path: PathBuf, reason: String },

    #[error("unsupported test type '{test_type}' in test '{test_id}'")]
    #[diagnostic(code(specrun::config::test_type))]
    UnknownTestType {
        test_id: String,
        test_type: String,
        #[help]
        known: String,
    },

    #[error("test '{test_id}' declares no command to execute")]
    #[diagnostic(code(specrun::config::command))]
    MissingCommand { test_id: String },

    #[error("unsupported output type '{output_type}' for output '{output_id}' in test '{test_id}'")]
    #[diagnostic(
        code(specrun::config::output_type),
        help("supported output types are 'file' and 'string'")
    )]
    UnknownOutputType {
        test_id: String,
        output_id: String,
        output_type: String,
    },

    #[error("output '{output_id}' in test '{test_id}' is not a 'section::field' reference")]
    #[diagnostic(code(specrun::config::output_ref))]
    MalformedOutputRef { test_id: String, output_id: String },

    #[error("input '{input}' of test '{test_id}' would be placed outside the test bed: {value}")]
    #[diagnostic(code(specrun::config::input_path))]
    InputPathEscapes {
        test_id: String,
        input: String,
        value: String,
    },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(specrun::config::invalid))]
    Config { message: String },

    // ------------------------------------------------------------------
    // Resource
    // ------------------------------------------------------------------
    #[error("cannot find input '{input}' for test '{test_id}': {value} ({fingerprint})")]
    #[diagnostic(
        code(specrun::resource::missing_input),
        help("populate the file cache or add a search path that contains this file")
    )]
    MissingInput {
        test_id: String,
        input: String,
        value: String,
        fingerprint: String,
    },

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------
    #[error("failed to launch command '{command}' for test '{test_id}': {reason}")]
    #[diagnostic(code(specrun::execution::launch))]
    Launch {
        test_id: String,
        command: String,
        reason: String,
    },

    #[error("test bed for '{test_id}' is already set up; concurrent setup of one test case")]
    #[diagnostic(code(specrun::execution::reentrant_setup))]
    ConcurrentSetup { test_id: String },

    // ------------------------------------------------------------------
    // Io
    // ------------------------------------------------------------------
    #[error("I/O error at '{}': {source}", path.display())]
    #[diagnostic(code(specrun::io))]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SpecrunError {
    /// Returns the taxonomy bucket of this error.
    pub fn error_type(&self) -> ErrorType {
        match self {
            SpecrunError::SpecNotFound { .. }
            | SpecrunError::InvalidSpec { .. }
            | SpecrunError::UnknownTestType { .. }
            | SpecrunError::MissingCommand { .. }
            | SpecrunError::UnknownOutputType { .. }
            | SpecrunError::MalformedOutputRef { .. }
            | SpecrunError::InputPathEscapes { .. }
            | SpecrunError::Config { .. } => ErrorType::Configuration,
            SpecrunError::MissingInput { .. } => ErrorType::Resource,
            SpecrunError::Launch { .. } | SpecrunError::ConcurrentSetup { .. } => {
                ErrorType::Execution
            }
            SpecrunError::Io { .. } => ErrorType::Io,
        }
    }

    /// True when a SPEC document is simply absent, as opposed to invalid.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SpecrunError::SpecNotFound { .. })
    }

    /// Wraps an I/O error with the path it happened at.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        SpecrunError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T, E = SpecrunError> = std::result::Result<T, E>;
