//! The specrun command-line interface.
//!
//! Resolves configuration, installs logging and dispatches to the
//! subcommand handlers. All test logic lives in the library.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use miette::Report;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::cache::{LinkMode, WantedFiles};
use crate::case::{generate_cases, RunContext, TestSummary};
use crate::cli::args::{Command, SpecrunArgs};
use crate::cli::output::{write_json_report, Printer};
use crate::config::Config;
use crate::errors::{Result, SpecrunError};
use crate::executor::ExecutionOptions;
use crate::spec::discovery::{discover, SpecRegistry};
use crate::spec::{Spec, SPEC_FILENAME};

pub mod args;
pub mod output;

/// The main entry point for the CLI.
pub fn run() {
    let args = SpecrunArgs::parse();
    init_logging(args.verbose);

    let result = Config::load(args.config.as_deref()).and_then(|config| match args.command {
        Command::Run {
            ids,
            filter,
            json,
            library,
            cache,
            search,
            lazy,
            timeout,
        } => {
            let mut config = config;
            override_paths(&mut config, library, cache, search);
            config.lazy |= lazy;
            if timeout.is_some() {
                config.timeout_secs = timeout;
            }
            handle_run(&config, &ids, filter.as_deref(), json)
        }
        Command::List { library } => {
            let mut config = config;
            override_paths(&mut config, library, None, Vec::new());
            handle_list(&config)
        }
        Command::Cache {
            ids,
            library,
            cache,
            search,
            copy,
        } => {
            let mut config = config;
            override_paths(&mut config, library, cache, search);
            if copy {
                config.link_mode = LinkMode::Hardlink;
            }
            handle_cache(&config, &ids)
        }
    });

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("{:?}", Report::new(e));
            process::exit(2);
        }
    }
}

/// `RUST_LOG` wins; otherwise info, or debug with `-v`.
fn init_logging(verbose: bool) {
    let default = if verbose { "specrun=debug" } else { "specrun=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn override_paths(
    config: &mut Config,
    library: Vec<PathBuf>,
    cache: Option<PathBuf>,
    search: Vec<PathBuf>,
) {
    if !library.is_empty() {
        config.library = library;
    }
    if cache.is_some() {
        config.cache = cache;
    }
    if !search.is_empty() {
        config.search = search;
    }
}

/// Discovered SPECs restricted to `ids` (when given) and `filter`.
fn select(config: &Config, ids: &[String], filter: Option<&str>) -> Result<SpecRegistry> {
    let mut registry = discover(config.library_paths());
    if !ids.is_empty() {
        let unknown = registry.retain_ids(ids);
        if !unknown.is_empty() {
            return Err(SpecrunError::Config {
                message: format!("unknown test id(s): {}", unknown.join(", ")),
            });
        }
    }
    if let Some(needle) = filter {
        registry.retain_matching(needle);
    }
    Ok(registry)
}

fn handle_run(
    config: &Config,
    ids: &[String],
    filter: Option<&str>,
    json: Option<PathBuf>,
) -> Result<bool> {
    let registry = select(config, ids, filter)?;
    let cases = generate_cases(&registry);
    info!("running {} test(s)", cases.len());

    let mut ctx = RunContext::new(config.scan_roots()).with_cache(config.file_cache());
    ctx.lazy = config.lazy;
    ctx.link_mode = config.link_mode;
    ctx.execution = ExecutionOptions {
        timeout: config.timeout(),
        ..ExecutionOptions::default()
    };

    let mut printer = Printer::new(config.use_colors);
    let mut reports = Vec::with_capacity(cases.len());
    for case in &cases {
        let report = case.run(&ctx);
        printer
            .report(&report)
            .map_err(|e| SpecrunError::io("<stdout>", e))?;
        reports.push(report);
    }
    let summary = TestSummary::from_reports(&reports);
    printer
        .summary(&summary)
        .map_err(|e| SpecrunError::io("<stdout>", e))?;

    if let Some(path) = json {
        write_json_report(&path, &reports, &summary)?;
        debug!("wrote report to '{}'", path.display());
    }
    Ok(!summary.has_failures())
}

fn handle_list(config: &Config) -> Result<bool> {
    let registry = discover(config.library_paths());
    Printer::new(config.use_colors)
        .listing(&registry)
        .map_err(|e| SpecrunError::io("<stdout>", e))?;
    Ok(true)
}

/// Bulk cache satisfaction for the selected tests. Unlike `run`, an explicit
/// id is looked up as a library subdirectory, so tests can be cached before
/// their SPEC ids are known to discovery.
fn handle_cache(config: &Config, ids: &[String]) -> Result<bool> {
    let cache = config.file_cache().ok_or_else(|| SpecrunError::Config {
        message: "no cache directory configured (use --cache or 'cache:' in specrun.yaml)"
            .to_string(),
    })?;

    let mut wanted = WantedFiles::default();
    if ids.is_empty() {
        for (id, location) in discover(config.library_paths()).iter() {
            let spec = Spec::from_path(&location.path)?;
            wanted.add_spec(id, &spec);
        }
    } else {
        for id in ids {
            let spec = find_spec(config, id)?;
            wanted.add_spec(id, &spec);
        }
    }
    info!("{} input file(s) wanted", wanted.len());

    let report = cache.satisfy(&wanted, &config.scan_roots(), config.link_mode)?;
    Printer::new(config.use_colors)
        .cache_report(&report)
        .map_err(|e| SpecrunError::io("<stdout>", e))?;
    Ok(report.missing.is_empty())
}

fn find_spec(config: &Config, id: &str) -> Result<Spec> {
    for library in config.library_paths() {
        let path = library.join(id).join(SPEC_FILENAME);
        match Spec::from_path(&path) {
            Ok(spec) => return Ok(spec),
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(SpecrunError::SpecNotFound {
        path: PathBuf::from(id).join(SPEC_FILENAME),
    })
}
