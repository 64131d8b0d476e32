//! Test-only fakes and fixtures for cycles, runs and the generation service.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::backoff::{CircuitBreaker, RetryPolicy};
use crate::core::types::{TestCase, TestCategory, TestFailure, TestRunResult, TestStatus};
use crate::cycle::Orchestrator;
use crate::io::config::RedgreenConfig;
use crate::io::consult::{CallError, GenerateRequest, GenerateTransport, ResilientClient};
use crate::io::files::{FileAccess, FsFiles};
use crate::io::normalizer::{
    FrameworkRegistry, Normalizer, NormalizerSettings, RawRun, RunRequest, TestRunner,
};

/// Jest output for one failing test out of one.
pub const JEST_ONE_FAILING: &str = "\
FAIL test/sum.test.js
  ● sum › adds two numbers

    TypeError: sum is not a function

      at Object.<anonymous> (test/sum.test.js:3:10)

Tests:       1 failed, 1 total
";

/// Jest output for one passing test out of one.
pub const JEST_ONE_PASSING: &str = "\
PASS test/sum.test.js
  ✓ sum › adds two numbers (2 ms)

Tests:       1 passed, 1 total
";

/// Deterministic pending test case.
pub fn test_case(cycle_id: &str, name: &str) -> TestCase {
    TestCase {
        id: format!("test-{}", name.replace(' ', "-")),
        cycle_id: cycle_id.to_string(),
        file_path: PathBuf::from("test/sum.test.js"),
        name: name.to_string(),
        code: format!("test('{name}', () => {{}});\n"),
        category: TestCategory::Unit,
        expect_fail: true,
        status: TestStatus::Pending,
    }
}

/// Clean jest run with `passed` tests.
pub fn passing_result(passed: u32) -> TestRunResult {
    TestRunResult {
        framework: "jest".to_string(),
        success: passed > 0,
        total: passed,
        passed,
        failed: 0,
        skipped: 0,
        duration_ms: 5,
        output: format!("Tests: {passed} passed, {passed} total\n"),
        failures: Vec::new(),
        coverage: None,
    }
}

/// Jest run where each of `failing` is reported as a named failure.
pub fn failing_result(passed: u32, failing: &[&str]) -> TestRunResult {
    let failed = failing.len() as u32;
    TestRunResult {
        success: false,
        total: passed + failed,
        failed,
        output: format!("Tests: {failed} failed, {passed} passed\n"),
        failures: failing
            .iter()
            .map(|name| TestFailure {
                test: name.to_string(),
                message: "expect(received).toBe(expected)".to_string(),
                context: None,
                suggestion: "Check the assertion values against the implementation".to_string(),
            })
            .collect(),
        ..passing_result(passed)
    }
}

/// In-memory [`FileAccess`] with injectable write failures.
#[derive(Debug, Default)]
pub struct MemoryFiles {
    files: RefCell<BTreeMap<PathBuf, String>>,
    failing: RefCell<BTreeSet<PathBuf>>,
}

impl MemoryFiles {
    pub fn insert(&self, path: impl AsRef<Path>, contents: &str) {
        self.files
            .borrow_mut()
            .insert(path.as_ref().to_path_buf(), contents.to_string());
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files.borrow().get(path.as_ref()).cloned()
    }

    /// Make every later write to `path` fail.
    pub fn fail_writes_to(&self, path: impl AsRef<Path>) {
        self.failing
            .borrow_mut()
            .insert(path.as_ref().to_path_buf());
    }
}

impl FileAccess for MemoryFiles {
    fn read(&self, path: &Path) -> io::Result<Option<String>> {
        Ok(self.get(path))
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        if self.failing.borrow().contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("write to {} rejected", path.display()),
            ));
        }
        self.insert(path, contents);
        Ok(())
    }
}

/// [`TestRunner`] that replays canned runs in order and records requests.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    runs: RefCell<VecDeque<RawRun>>,
    requests: RefCell<Vec<RunRequest>>,
}

impl ScriptedRunner {
    pub fn new(runs: Vec<RawRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Runs that complete with the given output.
    pub fn outputs(outputs: &[&str]) -> Self {
        Self::new(
            outputs
                .iter()
                .map(|output| RawRun {
                    output: output.to_string(),
                    duration: Duration::from_millis(5),
                    timed_out: false,
                })
                .collect(),
        )
    }

    /// A single run that hits the timeout.
    pub fn timeout() -> Self {
        Self::new(vec![RawRun {
            output: String::new(),
            duration: Duration::from_secs(300),
            timed_out: true,
        }])
    }

    /// Queue another run after construction.
    pub fn push_output(&self, output: &str) {
        self.runs.borrow_mut().push_back(RawRun {
            output: output.to_string(),
            duration: Duration::from_millis(5),
            timed_out: false,
        });
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.borrow().clone()
    }
}

impl TestRunner for ScriptedRunner {
    fn run(&self, request: &RunRequest) -> Result<RawRun> {
        self.requests.borrow_mut().push(request.clone());
        self.runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted runner exhausted"))
    }
}

/// [`GenerateTransport`] that replays canned outcomes and counts attempts.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    outcomes: RefCell<VecDeque<Result<String, CallError>>>,
    requests: RefCell<Vec<GenerateRequest>>,
    calls: Cell<usize>,
}

impl ScriptedTransport {
    pub fn new(outcomes: Vec<Result<String, CallError>>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.borrow().clone()
    }
}

impl GenerateTransport for ScriptedTransport {
    fn generate(&self, request: &GenerateRequest) -> Result<String, CallError> {
        self.calls.set(self.calls.get() + 1);
        self.requests.borrow_mut().push(request.clone());
        self.outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(CallError::Connect("scripted transport exhausted".to_string())))
    }
}

/// Orchestrator over a real directory with scripted test runs and service.
pub type ProjectOrchestrator = Orchestrator<FsFiles, ScriptedRunner, ScriptedTransport>;

/// Temporary project directory with its state under `.redgreen/`.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> RedgreenConfig {
        RedgreenConfig {
            state_dir: self.root().join(".redgreen"),
            ..RedgreenConfig::default()
        }
    }

    /// Orchestrator replaying `outputs` as test runs; the service never
    /// retries and opens after one failed call.
    pub fn orchestrator(
        &self,
        config: RedgreenConfig,
        outputs: &[&str],
        outcomes: Vec<Result<String, CallError>>,
    ) -> ProjectOrchestrator {
        let normalizer = Normalizer::new(
            FrameworkRegistry::builtin(),
            ScriptedRunner::outputs(outputs),
            NormalizerSettings {
                workdir: self.root().to_path_buf(),
                timeout: config.test_timeout(),
                output_limit_bytes: config.output_limit_bytes,
            },
        );
        let client = ResilientClient::new(
            ScriptedTransport::new(outcomes),
            config.service.model.clone(),
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            CircuitBreaker::new(1, Duration::from_secs(60)),
        );
        Orchestrator::new(config, FsFiles::new(self.root()), normalizer, client)
    }

    pub fn read(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join(relative)).ok()
    }
}
