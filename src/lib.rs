//! # specrun
//!
//! Runs declarative test SPECs against external data-processing pipelines.
//! A SPEC names its input files by content fingerprint, the command to run and
//! the outputs to expect; inputs are resolved through a content-addressed
//! [`cache::FileCache`] and materialized into a throwaway [`testbed::TestBed`].
//!
//! The usual flow is [`spec::discovery::discover`] over the library roots,
//! [`case::generate_cases`] on the result, then [`case::SpecTestCase::run`]
//! for each case with a shared [`case::RunContext`].

pub mod cache;
pub mod case;
pub mod cli;
pub mod components;
pub mod config;
pub mod errors;
pub mod executor;
pub mod hashing;
pub mod spec;
pub mod sysinfo;
pub mod testbed;
pub mod verify;

pub use crate::cache::{FileCache, LinkMode, PopulateOutcome};
pub use crate::case::{
    generate_cases, RunContext, SpecTestCase, TestOutcome, TestReport, TestSummary,
};
pub use crate::errors::{ErrorType, Result, SpecrunError};
pub use crate::executor::{ExecutionOptions, HandlerRegistry, TestHandler};
pub use crate::hashing::{Fingerprint, HashAlgorithm};
pub use crate::spec::discovery::{discover, SpecRegistry};
pub use crate::spec::Spec;
