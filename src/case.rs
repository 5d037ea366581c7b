//! # Test cases
//!
//! [`generate_cases`] turns every discovered SPEC into a [`SpecTestCase`]
//! bound to the SPEC's location on disk. The document is re-read each time a
//! case runs, so edits to the library are picked up without re-discovery.
//!
//! A run goes through: create test bed, prepare inputs, execute, verify
//! outputs, destroy test bed. The test bed is destroyed on every path,
//! including errors raised by any earlier stage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{FileCache, LinkMode};
use crate::components::{gather_component_info, ComponentInfo};
use crate::errors::{ErrorType, Result, SpecrunError};
use crate::executor::{ExecutionOptions, ExecutionRecord, ExecutionState, HandlerRegistry};
use crate::spec::discovery::{SpecLocation, SpecRegistry};
use crate::spec::{Spec, EXITCODE_OUTPUT};
use crate::sysinfo::{capture_environment, SystemInfo};
use crate::testbed::{TestBed, TestbedPreparer};
use crate::verify::{verify_outputs, Mismatch};

// =============================================================================
// RUN CONTEXT
// =============================================================================

/// Everything shared by the cases of one run.
#[derive(Debug, Default)]
pub struct RunContext {
    pub search_paths: Vec<PathBuf>,
    pub cache: Option<FileCache>,
    pub lazy: bool,
    pub link_mode: LinkMode,
    pub handlers: HandlerRegistry,
    pub execution: ExecutionOptions,
    /// Parent directory for test beds; the system temp dir when unset.
    pub scratch: Option<PathBuf>,
    system: OnceCell<SystemInfo>,
}

impl RunContext {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, cache: Option<FileCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_scratch(mut self, scratch: impl Into<PathBuf>) -> Self {
        self.scratch = Some(scratch.into());
        self
    }

    /// Host description, collected on first use and shared afterwards.
    pub fn system_info(&self) -> &SystemInfo {
        self.system.get_or_init(SystemInfo::collect)
    }

    fn create_bed(&self) -> Result<TestBed> {
        match &self.scratch {
            Some(parent) => TestBed::create_in(parent),
            None => TestBed::create(),
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Why a test that ran did not pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    NonZeroExit {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    Crashed {
        command: String,
        reason: String,
    },
    OutputMismatch {
        mismatches: Vec<Mismatch>,
    },
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::NonZeroExit {
                command, exit_code, ..
            } => write!(f, "command exited with code {exit_code}: {command}"),
            Failure::Crashed { command, reason } => write!(f, "command {reason}: {command}"),
            Failure::OutputMismatch { mismatches } => {
                write!(f, "{} output(s) did not match", mismatches.len())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed(Failure),
    /// The case could not be run to a verdict.
    Errored { kind: ErrorType, message: String },
}

impl TestOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }

    fn from_error(error: &SpecrunError) -> Self {
        TestOutcome::Errored {
            kind: error.error_type(),
            message: error.to_string(),
        }
    }
}

/// Result of one case, with the diagnostics gathered along the way.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub id: String,
    pub spec_path: PathBuf,
    pub outcome: TestOutcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionRecord>,
    pub environment: BTreeMap<String, String>,
    pub system: SystemInfo,
    #[serde(skip_serializing_if = "ComponentInfo::is_empty")]
    pub components: ComponentInfo,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TestSummary {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
}

impl TestSummary {
    pub fn from_reports<'a>(reports: impl IntoIterator<Item = &'a TestReport>) -> Self {
        let mut summary = Self::default();
        for report in reports {
            summary.record(&report.outcome);
        }
        summary
    }

    pub fn record(&mut self, outcome: &TestOutcome) {
        match outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed(_) => self.failed += 1,
            TestOutcome::Errored { .. } => self.errored += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.errored > 0
    }

    pub fn total_tests(&self) -> usize {
        self.passed + self.failed + self.errored
    }
}

// =============================================================================
// TEST CASE
// =============================================================================

/// One runnable test, bound to a SPEC location.
#[derive(Debug)]
pub struct SpecTestCase {
    id: String,
    location: SpecLocation,
    bed: Mutex<Option<TestBed>>,
}

/// Tears the case's test bed down when dropped.
struct Teardown<'a> {
    case: &'a SpecTestCase,
    armed: bool,
}

impl Teardown<'_> {
    /// Tears down now, surfacing the removal error.
    fn finish(mut self) -> Result<()> {
        self.armed = false;
        self.case.tear_down()
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.case.tear_down() {
                warn!(test_id = %self.case.id, "failed to remove test bed: {}", e);
            }
        }
    }
}

impl SpecTestCase {
    pub fn new(id: impl Into<String>, location: SpecLocation) -> Self {
        Self {
            id: id.into(),
            location,
            bed: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec_path(&self) -> &Path {
        &self.location.path
    }

    /// Conventional test name derived from the id.
    pub fn test_name(&self) -> String {
        format!("test_{}", self.id)
    }

    fn slot(&self) -> MutexGuard<'_, Option<TestBed>> {
        self.bed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates this case's test bed and returns its path.
    ///
    /// A case owns at most one test bed at a time; a second set-up before
    /// tear-down is refused.
    pub fn set_up(&self, ctx: &RunContext) -> Result<PathBuf> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(SpecrunError::ConcurrentSetup {
                test_id: self.id.clone(),
            });
        }
        let bed = ctx.create_bed()?;
        let path = bed.path().to_path_buf();
        *slot = Some(bed);
        Ok(path)
    }

    /// Destroys the test bed, if any.
    pub fn tear_down(&self) -> Result<()> {
        let bed = self.slot().take();
        match bed {
            Some(bed) => bed.destroy(),
            None => Ok(()),
        }
    }

    /// Runs the full life-cycle and returns its report. Never panics on a
    /// failing or misconfigured test; those become the report's outcome.
    pub fn run(&self, ctx: &RunContext) -> TestReport {
        let started = Instant::now();
        let mut report = TestReport {
            id: self.id.clone(),
            spec_path: self.location.path.clone(),
            outcome: TestOutcome::Passed,
            duration_ms: 0,
            execution: None,
            environment: BTreeMap::new(),
            system: ctx.system_info().clone(),
            components: ComponentInfo::default(),
        };
        info!(test_id = %self.id, "running");
        report.outcome = match self.run_stages(ctx, &mut report) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(test_id = %self.id, "test errored: {}", e);
                TestOutcome::from_error(&e)
            }
        };
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    fn run_stages(&self, ctx: &RunContext, report: &mut TestReport) -> Result<TestOutcome> {
        let mut spec = Spec::from_path(&self.location.path)?;
        report.environment = capture_environment(&spec.environment);
        report.components = gather_component_info(&spec);

        let workdir = self.set_up(ctx)?;
        let guard = Teardown {
            case: self,
            armed: true,
        };

        TestbedPreparer::new(&ctx.search_paths)
            .with_cache(ctx.cache.as_ref())
            .with_fixture_dir(self.location.dir())
            .lazy(ctx.lazy)
            .link_mode(ctx.link_mode)
            .prepare(&spec, &workdir)?;

        let record = report
            .execution
            .insert(ctx.handlers.dispatch(&mut spec, &workdir, &ctx.execution)?);
        let outcome = judge(&spec, record, &workdir)?;

        guard.finish()?;
        Ok(outcome)
    }
}

/// Exit status first, then outputs. A non-zero exit is tolerated only when
/// the SPEC itself declares the expected exit code.
fn judge(spec: &Spec, record: &ExecutionRecord, workdir: &Path) -> Result<TestOutcome> {
    match &record.state {
        ExecutionState::Crashed { reason } => {
            return Ok(TestOutcome::Failed(Failure::Crashed {
                command: record.command.clone(),
                reason: reason.clone(),
            }));
        }
        ExecutionState::Completed { exit_code }
            if *exit_code != 0 && !spec.outputs.contains_key(EXITCODE_OUTPUT) =>
        {
            return Ok(TestOutcome::Failed(Failure::NonZeroExit {
                command: record.command.clone(),
                exit_code: *exit_code,
                stderr: record.stderr.clone(),
            }));
        }
        _ => {}
    }
    let mismatches = verify_outputs(spec, workdir)?;
    if mismatches.is_empty() {
        Ok(TestOutcome::Passed)
    } else {
        Ok(TestOutcome::Failed(Failure::OutputMismatch { mismatches }))
    }
}

/// One case per discovered SPEC, in registry order.
pub fn generate_cases(registry: &SpecRegistry) -> Vec<SpecTestCase> {
    registry
        .iter()
        .map(|(id, location)| SpecTestCase::new(id.clone(), location.clone()))
        .collect()
}
