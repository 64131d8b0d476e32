//! Deterministic parsing of test-runner output into [`TestRunResult`].
//!
//! Each framework contributes an [`OutputFormat`]: the patterns for its
//! summary counts and the marker that starts a per-test failure block.
//! Parsing never fails; unrecognized output yields zero counts.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{Expectation, ExpectationCheck, TestFailure, TestRunResult};

/// Maximum failures extracted from a single run.
pub const MAX_FAILURES: usize = 10;
/// Maximum context lines kept per failure.
pub const MAX_CONTEXT_LINES: usize = 10;

const DEFAULT_SUGGESTION: &str = "Review the implementation against what the test expects";

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap());

/// Substring rules checked in order against the lowercased failure message.
const SUGGESTION_RULES: &[(&str, &str)] = &[
    (
        "is not a function",
        "Define the missing function or check that it is exported",
    ),
    (
        "cannot read propert",
        "Initialize the object before reading its properties",
    ),
    (
        "is not defined",
        "Declare or import the missing identifier",
    ),
    (
        "undefined",
        "Return a value from the implementation; it currently yields undefined",
    ),
    (
        "typeerror",
        "Check the types of the values passed to and returned from the code under test",
    ),
    (
        "timeout",
        "Resolve pending promises or callbacks; the test timed out",
    ),
    (
        "expected",
        "Adjust the implementation so its result matches the asserted value",
    ),
];

/// Framework-specific output patterns.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    passed: Regex,
    failed: Regex,
    skipped: Regex,
    failure_marker: Regex,
    /// Where detailed failure reports begin; markers before it are ignored.
    failure_section: Option<Regex>,
    /// Marker blocks with these titles are not failures (jest's `● Console`).
    ignored_titles: Vec<String>,
    /// Titles span lines up to one ending in `:` (mocha's nested suites).
    multiline_titles: bool,
}

impl OutputFormat {
    /// Build a format from regex sources. Count patterns must capture the number in group 1.
    pub fn new(
        passed: &str,
        failed: &str,
        skipped: &str,
        failure_marker: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            passed: Regex::new(passed)?,
            failed: Regex::new(failed)?,
            skipped: Regex::new(skipped)?,
            failure_marker: Regex::new(failure_marker)?,
            failure_section: None,
            ignored_titles: Vec::new(),
            multiline_titles: false,
        })
    }

    /// Only split on markers after the first match of `pattern`.
    pub fn with_failure_section(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.failure_section = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_ignored_titles(mut self, titles: &[&str]) -> Self {
        self.ignored_titles = titles.iter().map(|title| title.to_string()).collect();
        self
    }

    pub fn with_multiline_titles(mut self) -> Self {
        self.multiline_titles = true;
        self
    }

    /// Jest: `Tests: 3 failed, 12 passed, 15 total`, failures start at `●`.
    ///
    /// Counts come from the `Tests:` line only; `Snapshots:` and
    /// `Test Suites:` use the same wording.
    pub fn jest() -> Self {
        Self::new(
            r"(?m)^[ \t]*Tests:.*?\b(\d+) passed",
            r"(?m)^[ \t]*Tests:.*?\b(\d+) failed",
            r"(?m)^[ \t]*Tests:.*?\b(\d+) skipped",
            r"●[ \t]*",
        )
        .unwrap()
        .with_ignored_titles(&["Console"])
    }

    /// Vitest: `Tests  3 failed | 12 passed (15)`, failures start at a `FAIL` line.
    pub fn vitest() -> Self {
        Self::new(
            r"(?m)^[ \t]*Tests[ \t].*?\b(\d+) passed",
            r"(?m)^[ \t]*Tests[ \t].*?\b(\d+) failed",
            r"(?m)^[ \t]*Tests[ \t].*?\b(\d+) skipped",
            r"(?m)^[ \t]*FAIL[ \t]+",
        )
        .unwrap()
    }

    /// Mocha: `12 passing`, `3 failing`, failures start at a numbered `1) ` line.
    ///
    /// The default reporter also numbers failing tests inline while the suite
    /// runs, so only markers after the `N failing` line count.
    pub fn mocha() -> Self {
        Self::new(
            r"(\d+) passing",
            r"(\d+) failing",
            r"(\d+) pending",
            r"(?m)^[ \t]*\d+\)[ \t]+",
        )
        .and_then(|format| format.with_failure_section(r"(?m)^[ \t]*\d+ failing"))
        .unwrap()
        .with_multiline_titles()
    }
}

/// Strip ANSI escape sequences from runner output.
pub fn strip_ansi(raw: &str) -> String {
    ANSI_RE.replace_all(raw, "").into_owned()
}

/// Convert raw combined output into a normalized result (coverage unset).
///
/// `total = passed + failed`; `success` requires zero failures and a non-empty run.
pub fn parse_output(
    format: &OutputFormat,
    framework: &str,
    raw: &str,
    duration_ms: u64,
) -> TestRunResult {
    let clean = strip_ansi(raw);
    let passed = last_count(&format.passed, &clean);
    let failed = last_count(&format.failed, &clean);
    let skipped = last_count(&format.skipped, &clean);
    let total = passed + failed;

    let failures = if failed > 0 {
        extract_failures(format, &clean)
    } else {
        Vec::new()
    };

    TestRunResult {
        framework: framework.to_string(),
        success: failed == 0 && total > 0,
        total,
        passed,
        failed,
        skipped,
        duration_ms,
        output: raw.to_string(),
        failures,
        coverage: None,
    }
}

/// The final summary wins over earlier per-suite lines (e.g. jest's `Test Suites:`).
fn last_count(pattern: &Regex, text: &str) -> u32 {
    pattern
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Split output on the failure marker and extract up to [`MAX_FAILURES`] entries.
pub fn extract_failures(format: &OutputFormat, output: &str) -> Vec<TestFailure> {
    let section = format
        .failure_section
        .as_ref()
        .and_then(|pattern| pattern.find(output))
        .map_or(output, |found| &output[found.end()..]);
    let mut failures: Vec<TestFailure> = Vec::new();

    // The first piece precedes any marker and never describes a failure.
    for block in format.failure_marker.split(section).skip(1) {
        if failures.len() >= MAX_FAILURES {
            break;
        }
        let Some(failure) = parse_failure_block(format, block) else {
            continue;
        };
        if format.ignored_titles.contains(&failure.test)
            || failures.iter().any(|existing| existing.test == failure.test)
        {
            continue;
        }
        failures.push(failure);
    }

    failures
}

fn parse_failure_block(format: &OutputFormat, block: &str) -> Option<TestFailure> {
    let lines: Vec<&str> = block.lines().collect();
    let (test, title_end) = block_title(&lines, format.multiline_titles)?;
    let rest = &lines[title_end..];

    let message = rest
        .iter()
        .map(|line| line.trim())
        .find(|line| !line.is_empty() && !is_stack_line(line))?
        .to_string();

    let context_lines: Vec<&str> = rest
        .iter()
        .map(|line| line.trim_end())
        .filter(|line| !line.trim().is_empty())
        .take(MAX_CONTEXT_LINES)
        .collect();
    let context = if context_lines.is_empty() {
        None
    } else {
        Some(context_lines.join("\n"))
    };

    let suggestion = suggest_fix(&message).to_string();
    Some(TestFailure {
        test,
        message,
        context,
        suggestion,
    })
}

/// Title of a block and the index of the first line after it.
fn block_title(lines: &[&str], multiline: bool) -> Option<(String, usize)> {
    let first = lines.iter().position(|line| !line.trim().is_empty())?;
    let single = || {
        let title = lines[first].trim().trim_end_matches(':').to_string();
        Some((title, first + 1))
    };
    if !multiline {
        return single();
    }

    let mut parts = Vec::new();
    for (idx, line) in lines.iter().enumerate().skip(first) {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        match line.strip_suffix(':') {
            Some(last) => {
                parts.push(last);
                return Some((parts.join(" › "), idx + 1));
            }
            None => parts.push(line),
        }
    }
    single()
}

fn is_stack_line(line: &str) -> bool {
    line.starts_with("at ") || line.starts_with("❯ ") || line.contains("node_modules/")
}

/// Map an error message to a remediation hint.
pub fn suggest_fix(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    SUGGESTION_RULES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, suggestion)| *suggestion)
        .unwrap_or(DEFAULT_SUGGESTION)
}

/// Compare a run against what the caller expected (`fail` iff `failed > 0`).
pub fn validate_expectation(expected: Expectation, result: &TestRunResult) -> ExpectationCheck {
    let actual_outcome = if result.failed > 0 {
        Expectation::Fail
    } else {
        Expectation::Pass
    };
    ExpectationCheck {
        expected,
        actual_outcome,
        expectation_met: expected == actual_outcome,
    }
}
