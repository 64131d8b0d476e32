//! Shared deterministic types for the cycle core.
//!
//! These types define the persisted data model. They carry no I/O and
//! serialize to the stable `snake_case` JSON layout of `state.json`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Position of a cycle in the Red-Green-Refactor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Ready,
    Red,
    Green,
    Refactor,
    Complete,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Ready => "READY",
            Phase::Red => "RED",
            Phase::Green => "GREEN",
            Phase::Refactor => "REFACTOR",
            Phase::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One unit of tracked Red-Green-Refactor work for a single feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: String,
    pub feature: String,
    pub description: String,
    pub phase: Phase,
    pub framework: String,
    pub tests_written: u32,
    pub tests_passing: u32,
    pub tests_failing: u32,
    pub implementation_files: Vec<PathBuf>,
    pub refactoring_files: Vec<PathBuf>,
    /// Coverage reported by the most recent run that collected it.
    #[serde(default)]
    pub last_coverage: Option<Coverage>,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial update applied by `StateStore::update_cycle`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CyclePatch {
    pub phase: Option<Phase>,
    pub tests_written: Option<u32>,
    pub tests_passing: Option<u32>,
    pub tests_failing: Option<u32>,
    pub add_implementation_file: Option<PathBuf>,
    pub add_refactoring_file: Option<PathBuf>,
    pub last_coverage: Option<Coverage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCategory {
    #[default]
    Unit,
    Integration,
    E2e,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pending,
    Failed,
    Passed,
}

/// A test written during the RED phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub cycle_id: String,
    pub file_path: PathBuf,
    pub name: String,
    pub code: String,
    pub category: TestCategory,
    pub expect_fail: bool,
    pub status: TestStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub id: String,
    pub cycle_id: String,
    pub file_path: PathBuf,
    pub code: String,
    pub satisfies: Vec<String>,
    pub minimal: bool,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refactoring {
    pub id: String,
    pub cycle_id: String,
    pub file_path: PathBuf,
    pub description: String,
    pub before: TestRunResult,
    pub after: Option<TestRunResult>,
    pub success: bool,
    /// Pre-edit content was written back because the edit broke the tests.
    #[serde(default)]
    pub reverted: bool,
}

/// Immutable snapshot of file contents and test metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub cycle_id: String,
    pub label: String,
    pub reason: String,
    pub phase: Phase,
    pub files: BTreeMap<PathBuf, String>,
    pub tests: Vec<TestCase>,
    pub created_at: String,
}

/// Structural deep copy of the test collection embedded in a checkpoint.
pub fn copy_tests(tests: &[&TestCase]) -> Vec<TestCase> {
    tests
        .iter()
        .map(|test| TestCase {
            id: test.id.clone(),
            cycle_id: test.cycle_id.clone(),
            file_path: test.file_path.clone(),
            name: test.name.clone(),
            code: test.code.clone(),
            category: test.category,
            expect_fail: test.expect_fail,
            status: test.status,
        })
        .collect()
}

/// One failing test extracted from runner output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test: String,
    pub message: String,
    pub context: Option<String>,
    pub suggestion: String,
}

/// Coverage percentages from a coverage summary document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub lines: f64,
    pub branches: f64,
    pub functions: f64,
    pub statements: f64,
}

impl Coverage {
    /// Lowest of the four percentages.
    pub fn minimum(&self) -> f64 {
        self.lines
            .min(self.branches)
            .min(self.functions)
            .min(self.statements)
    }
}

/// Normalized result of one test-runner invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub framework: String,
    pub success: bool,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_ms: u64,
    pub output: String,
    pub failures: Vec<TestFailure>,
    pub coverage: Option<Coverage>,
}

/// Outcome a caller expects from a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expectation {
    Pass,
    Fail,
}

impl Expectation {
    pub fn label(self) -> &'static str {
        match self {
            Expectation::Pass => "pass",
            Expectation::Fail => "fail",
        }
    }
}

/// Result of comparing a run against its expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationCheck {
    pub expected: Expectation,
    pub actual_outcome: Expectation,
    pub expectation_met: bool,
}
