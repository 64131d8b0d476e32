//! Test result normalizer: runs a framework's test command and converts its
//! output into a [`TestRunResult`].
//!
//! Frameworks are registered strategies (identifier -> command builder +
//! output format). Adding a framework means registering a strategy. An
//! unknown identifier falls back to the registry default (`jest`) with a
//! warning instead of failing.
//!
//! Process execution sits behind [`TestRunner`] so tests can feed fixture
//! output through the real parser.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::report::{OutputFormat, parse_output};
use crate::core::types::{Coverage, TestRunResult};
use crate::error::{CycleError, CycleResult};
use crate::io::process::{CommandSpec, run_command_with_timeout};

/// Istanbul `json-summary` output, relative to the working directory.
pub const COVERAGE_SUMMARY_PATH: &str = "coverage/coverage-summary.json";

/// Builds the program and arguments for a run: `(pattern, want_coverage) -> argv`.
pub type CommandBuilder = fn(Option<&str>, bool) -> Vec<String>;

/// One registered framework.
#[derive(Debug, Clone)]
pub struct FrameworkStrategy {
    pub id: String,
    pub build_command: CommandBuilder,
    pub format: OutputFormat,
}

/// Identifier -> strategy table.
#[derive(Debug, Clone)]
pub struct FrameworkRegistry {
    strategies: Vec<FrameworkStrategy>,
    fallback: FrameworkStrategy,
}

fn owned(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn jest_command(pattern: Option<&str>, coverage: bool) -> Vec<String> {
    let mut argv = owned(&["npx", "jest", "--ci"]);
    argv.extend(pattern.map(str::to_string));
    if coverage {
        argv.extend(owned(&["--coverage", "--coverageReporters=json-summary"]));
    }
    argv
}

fn vitest_command(pattern: Option<&str>, coverage: bool) -> Vec<String> {
    let mut argv = owned(&["npx", "vitest", "run"]);
    argv.extend(pattern.map(str::to_string));
    if coverage {
        argv.extend(owned(&["--coverage", "--coverage.reporter=json-summary"]));
    }
    argv
}

fn mocha_command(pattern: Option<&str>, coverage: bool) -> Vec<String> {
    let mut argv = if coverage {
        owned(&["npx", "nyc", "--reporter=json-summary", "mocha"])
    } else {
        owned(&["npx", "mocha"])
    };
    argv.extend(pattern.map(str::to_string));
    argv
}

impl FrameworkRegistry {
    /// Registry with `jest` (default), `vitest` and `mocha`.
    pub fn builtin() -> Self {
        let jest = FrameworkStrategy {
            id: "jest".to_string(),
            build_command: jest_command,
            format: OutputFormat::jest(),
        };
        let mut registry = Self {
            strategies: Vec::new(),
            fallback: jest.clone(),
        };
        registry.register(jest);
        registry.register(FrameworkStrategy {
            id: "vitest".to_string(),
            build_command: vitest_command,
            format: OutputFormat::vitest(),
        });
        registry.register(FrameworkStrategy {
            id: "mocha".to_string(),
            build_command: mocha_command,
            format: OutputFormat::mocha(),
        });
        registry
    }

    /// Add or replace a strategy.
    pub fn register(&mut self, strategy: FrameworkStrategy) {
        self.strategies.retain(|existing| existing.id != strategy.id);
        self.strategies.push(strategy);
    }

    pub fn ids(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&FrameworkStrategy> {
        self.strategies.iter().find(|s| s.id == id)
    }

    /// Strategy for `id`, or the `jest` strategy when `id` is unknown.
    pub fn resolve(&self, id: &str) -> &FrameworkStrategy {
        if let Some(strategy) = self.get(id) {
            return strategy;
        }
        warn!(framework = id, fallback = %self.fallback.id, "unknown framework, using default");
        self.get(&self.fallback.id).unwrap_or(&self.fallback)
    }
}

/// A fully resolved invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: CommandSpec,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Raw output of one test command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRun {
    pub output: String,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Abstraction over test command execution.
pub trait TestRunner {
    fn run(&self, request: &RunRequest) -> Result<RawRun>;
}

/// Runs the command as a child process.
pub struct ProcessRunner;

impl TestRunner for ProcessRunner {
    fn run(&self, request: &RunRequest) -> Result<RawRun> {
        let output = run_command_with_timeout(
            &request.command,
            request.timeout,
            request.output_limit_bytes,
        )?;
        Ok(RawRun {
            output: output.combined(),
            duration: output.elapsed,
            timed_out: output.timed_out,
        })
    }
}

/// Settings for [`Normalizer`].
#[derive(Debug, Clone)]
pub struct NormalizerSettings {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub struct Normalizer<R: TestRunner> {
    registry: FrameworkRegistry,
    runner: R,
    settings: NormalizerSettings,
}

impl<R: TestRunner> Normalizer<R> {
    pub fn new(registry: FrameworkRegistry, runner: R, settings: NormalizerSettings) -> Self {
        Self {
            registry,
            runner,
            settings,
        }
    }

    pub fn registry(&self) -> &FrameworkRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Build the command a run would execute.
    pub fn command_for(
        &self,
        framework: &str,
        pattern: Option<&str>,
        coverage: bool,
    ) -> CommandSpec {
        let strategy = self.registry.resolve(framework);
        let mut argv = (strategy.build_command)(pattern, coverage).into_iter();
        let program = argv.next().unwrap_or_default();
        CommandSpec {
            program,
            args: argv.collect(),
            workdir: self.settings.workdir.clone(),
        }
    }

    /// Run the tests and normalize the output.
    ///
    /// A non-zero exit status is a normal outcome (RED phase). Spawn failure
    /// and timeout are `Execution` errors.
    #[instrument(skip_all, fields(framework = %framework, coverage = want_coverage))]
    pub fn run(
        &self,
        framework: &str,
        pattern: Option<&str>,
        want_coverage: bool,
    ) -> CycleResult<TestRunResult> {
        let strategy = self.registry.resolve(framework);
        let command = self.command_for(&strategy.id, pattern, want_coverage);
        info!(command = %command.display(), "running tests");

        let request = RunRequest {
            command,
            timeout: self.settings.timeout,
            output_limit_bytes: self.settings.output_limit_bytes,
        };
        let raw = self
            .runner
            .run(&request)
            .map_err(|err| CycleError::Execution(format!("{err:#}")))?;
        if raw.timed_out {
            return Err(CycleError::Execution(format!(
                "`{}` timed out after {}s",
                request.command.display(),
                request.timeout.as_secs()
            )));
        }

        let mut result = parse_output(
            &strategy.format,
            &strategy.id,
            &raw.output,
            raw.duration.as_millis() as u64,
        );
        if want_coverage {
            result.coverage = read_coverage_summary(&self.settings.workdir);
        }
        debug!(
            passed = result.passed,
            failed = result.failed,
            skipped = result.skipped,
            failures = result.failures.len(),
            "tests normalized"
        );
        Ok(result)
    }
}

#[derive(Debug, Deserialize)]
struct CoverageSummary {
    total: CoverageTotals,
}

#[derive(Debug, Deserialize)]
struct CoverageTotals {
    lines: CoverageMetric,
    branches: CoverageMetric,
    functions: CoverageMetric,
    statements: CoverageMetric,
}

#[derive(Debug, Deserialize)]
struct CoverageMetric {
    pct: serde_json::Value,
}

impl CoverageMetric {
    /// Istanbul writes `"Unknown"` when nothing was instrumented.
    fn percent(&self) -> f64 {
        self.pct.as_f64().unwrap_or(0.0)
    }
}

/// Read the coverage summary under `workdir`; absent or malformed yields `None`.
pub fn read_coverage_summary(workdir: &Path) -> Option<Coverage> {
    let path = workdir.join(COVERAGE_SUMMARY_PATH);
    match parse_coverage_file(&path) {
        Ok(Some(coverage)) => Some(coverage),
        Ok(None) => {
            debug!(path = %path.display(), "no coverage summary");
            None
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                err = %format!("{err:#}"),
                "ignoring unreadable coverage summary"
            );
            None
        }
    }
}

fn parse_coverage_file(path: &Path) -> Result<Option<Coverage>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let summary: CoverageSummary =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(Coverage {
        lines: summary.total.lines.percent(),
        branches: summary.total.branches.percent(),
        functions: summary.total.functions.percent(),
        statements: summary.total.statements.percent(),
    }))
}
