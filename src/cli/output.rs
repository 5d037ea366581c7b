//! User-facing output for the CLI: coloured result lines, failure details
//! with stream diffs, summaries and JSON reports.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use difference::{Changeset, Difference};
use serde::Serialize;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::cache::CacheReport;
use crate::case::{Failure, TestOutcome, TestReport, TestSummary};
use crate::errors::{Result, SpecrunError};
use crate::spec::discovery::SpecRegistry;
use crate::verify::Mismatch;

/// Writes result lines to stdout, coloured when enabled.
pub struct Printer {
    out: StandardStream,
}

impl Printer {
    pub fn new(use_colors: bool) -> Self {
        let choice = if use_colors {
            ColorChoice::Auto
        } else {
            ColorChoice::Never
        };
        Self {
            out: StandardStream::stdout(choice),
        }
    }

    fn tag(&mut self, text: &str, color: Color) -> io::Result<()> {
        self.out
            .set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
        write!(self.out, "{text}")?;
        self.out.reset()
    }

    pub fn report(&mut self, report: &TestReport) -> io::Result<()> {
        match &report.outcome {
            TestOutcome::Passed => {
                self.tag("PASS", Color::Green)?;
                writeln!(self.out, ": {} ({} ms)", report.id, report.duration_ms)
            }
            TestOutcome::Failed(failure) => {
                self.tag("FAIL", Color::Red)?;
                writeln!(self.out, ": {} [{}]", report.id, report.spec_path.display())?;
                writeln!(self.out, "  {failure}")?;
                self.failure_details(failure)
            }
            TestOutcome::Errored { kind, message } => {
                self.tag("ERROR", Color::Magenta)?;
                writeln!(self.out, ": {} [{}]", report.id, report.spec_path.display())?;
                writeln!(self.out, "  {kind} error: {message}")
            }
        }
    }

    fn failure_details(&mut self, failure: &Failure) -> io::Result<()> {
        match failure {
            Failure::NonZeroExit { stderr, .. } if !stderr.trim().is_empty() => {
                for line in stderr.trim_end().lines() {
                    writeln!(self.out, "  | {line}")?;
                }
                Ok(())
            }
            Failure::OutputMismatch { mismatches } => {
                for mismatch in mismatches {
                    writeln!(self.out, "  - {mismatch}")?;
                    if let Mismatch::ValueMismatch {
                        expected,
                        actual: Some(actual),
                        ..
                    } = mismatch
                    {
                        if let (Some(e), Some(a)) = (expected.as_str(), actual.as_str()) {
                            self.diff(e, a)?;
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Line diff of expected against actual text.
    fn diff(&mut self, expected: &str, actual: &str) -> io::Result<()> {
        let changeset = Changeset::new(expected, actual, "\n");
        for diff in &changeset.diffs {
            match diff {
                Difference::Same(x) => {
                    self.out.reset()?;
                    writeln!(self.out, "     {x}")?;
                }
                Difference::Add(x) => {
                    self.out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
                    writeln!(self.out, "    +{x}")?;
                }
                Difference::Rem(x) => {
                    self.out.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
                    writeln!(self.out, "    -{x}")?;
                }
            }
        }
        self.out.reset()
    }

    pub fn summary(&mut self, summary: &TestSummary) -> io::Result<()> {
        writeln!(self.out)?;
        write!(self.out, "{} tests: ", summary.total_tests())?;
        self.tag(&format!("{} passed", summary.passed), Color::Green)?;
        write!(self.out, ", ")?;
        self.tag(&format!("{} failed", summary.failed), Color::Red)?;
        write!(self.out, ", ")?;
        self.tag(&format!("{} errored", summary.errored), Color::Magenta)?;
        writeln!(self.out)
    }

    pub fn listing(&mut self, registry: &SpecRegistry) -> io::Result<()> {
        for (id, location) in registry.iter() {
            writeln!(self.out, "{}\t{}", id, location.path.display())?;
        }
        Ok(())
    }

    pub fn cache_report(&mut self, report: &CacheReport) -> io::Result<()> {
        writeln!(
            self.out,
            "{} already cached, {} populated, {} conflicting, {} missing",
            report.already_cached,
            report.populated.len(),
            report.conflicts.len(),
            report.missing.len()
        )?;
        for missing in &report.missing {
            self.tag("MISSING", Color::Yellow)?;
            writeln!(
                self.out,
                ": {}: {} ({})",
                missing.origin.test_id, missing.origin.value, missing.fingerprint
            )?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct RunDocument<'a> {
    summary: &'a TestSummary,
    tests: &'a [TestReport],
}

/// Writes the reports of a run as pretty JSON to `path`.
pub fn write_json_report(path: &Path, reports: &[TestReport], summary: &TestSummary) -> Result<()> {
    let doc = RunDocument {
        summary,
        tests: reports,
    };
    let text = serde_json::to_string_pretty(&doc).map_err(|e| SpecrunError::Config {
        message: format!("cannot serialize report: {e}"),
    })?;
    fs::write(path, text).map_err(|e| SpecrunError::io(path, e))
}
