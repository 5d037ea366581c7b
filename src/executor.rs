//! # Test execution
//!
//! Dispatch from a SPEC's `test.type` to a [`TestHandler`] registered in a
//! [`HandlerRegistry`]. The set of handlers is closed at run time but open to
//! extension: callers may register their own strategies next to the built-in
//! `shell_command` handler.
//!
//! An execution moves through [`ExecutionState`]: `Pending -> Running ->
//! {Completed, Crashed}`. A non-zero exit is still `Completed`; whether it is a
//! test failure is decided by the caller. A command that cannot be launched at
//! all is neither: it is a [`SpecrunError::Launch`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::errors::{Result, SpecrunError};
use crate::spec::Spec;

pub mod shell;

pub use shell::ShellCommandHandler;

/// Life-cycle of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Running,
    /// The process exited on its own with this code.
    Completed { exit_code: i32 },
    /// The process was killed (signal, timeout or cancellation).
    Crashed { reason: String },
}

/// What a handler observed while running a test.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub command: String,
    pub state: ExecutionState,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl ExecutionRecord {
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ExecutionState::Completed { exit_code } => Some(exit_code),
            _ => None,
        }
    }
}

/// Shared flag an external driver flips to abort a running command.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Knobs an external caller uses to bound a command's run time.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Kill the command after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
}

/// One execution strategy, selected by `test.type`.
///
/// Handlers are the only code allowed to mutate `spec.test`; they write back
/// the exit code and captured streams after the run.
pub trait TestHandler: Send + Sync {
    fn test_type(&self) -> &'static str;

    fn execute(
        &self,
        spec: &mut Spec,
        workdir: &Path,
        options: &ExecutionOptions,
    ) -> Result<ExecutionRecord>;
}

/// Lookup table from test type to handler.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn TestHandler>>,
}

impl HandlerRegistry {
    /// A registry with no handlers at all.
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Adds or replaces the handler for its test type.
    pub fn register(&mut self, handler: Arc<dyn TestHandler>) {
        self.handlers.insert(handler.test_type(), handler);
    }

    pub fn get(&self, test_type: &str) -> Option<&Arc<dyn TestHandler>> {
        self.handlers.get(test_type)
    }

    pub fn test_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// Runs `spec` with the handler for its declared test type.
    pub fn dispatch(
        &self,
        spec: &mut Spec,
        workdir: &Path,
        options: &ExecutionOptions,
    ) -> Result<ExecutionRecord> {
        let test_type = spec.test.kind.clone();
        let Some(handler) = self.get(&test_type) else {
            return Err(SpecrunError::UnknownTestType {
                test_id: spec.id.clone(),
                test_type,
                known: format!(
                    "known test types: {}",
                    self.test_types().collect::<Vec<_>>().join(", ")
                ),
            });
        };
        debug!(test_id = %spec.id, "run test via '{}' handler", test_type);
        handler.execute(spec, workdir, options)
    }
}

impl Default for HandlerRegistry {
    /// The built-in handlers.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ShellCommandHandler));
        registry
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording;

    impl TestHandler for Recording {
        fn test_type(&self) -> &'static str {
            "recording"
        }

        fn execute(
            &self,
            spec: &mut Spec,
            _workdir: &Path,
            _options: &ExecutionOptions,
        ) -> Result<ExecutionRecord> {
            spec.test
                .record_execution(Some(0), "recorded".into(), String::new());
            Ok(ExecutionRecord {
                command: "recording".into(),
                state: ExecutionState::Completed { exit_code: 0 },
                stdout: "recorded".into(),
                stderr: String::new(),
                duration: Duration::ZERO,
            })
        }
    }

    fn spec(test_type: &str) -> Spec {
        Spec::from_json(
            &format!(r#"{{"id": "d", "test": {{"type": "{test_type}"}}}}"#),
            Path::new("inline.json"),
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_test_type_is_configuration_error() {
        let registry = HandlerRegistry::default();
        let mut spec = spec("carrier_pigeon");
        let err = registry
            .dispatch(&mut spec, Path::new("."), &ExecutionOptions::default())
            .unwrap_err();
        match err {
            SpecrunError::UnknownTestType { test_type, known, .. } => {
                assert_eq!(test_type, "carrier_pigeon");
                assert!(known.contains("shell_command"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_registered_handler_is_dispatched() {
        let mut registry = HandlerRegistry::default();
        registry.register(Arc::new(Recording));
        let mut spec = spec("recording");
        let record = registry
            .dispatch(&mut spec, Path::new("."), &ExecutionOptions::default())
            .unwrap();
        assert_eq!(record.exit_code(), Some(0));
        assert_eq!(spec.test.stdout.as_deref(), Some("recorded"));
        assert_eq!(registry.test_types().collect::<Vec<_>>(), vec!["recording", "shell_command"]);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
