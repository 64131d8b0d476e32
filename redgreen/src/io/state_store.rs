//! Cycle state store persisted as a single JSON document (`state.json`).
//!
//! The store is an explicit handle: callers own it and pass it into every
//! action. Every successful mutation stamps `updated_at` and rewrites the
//! whole document (temp file + rename). There is no partial update and no
//! locking; one process owns a state directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::phase::{TestCounts, check_transition};
use crate::core::types::{
    Checkpoint, Cycle, CyclePatch, Implementation, Phase, Refactoring, TestCase, TestRunResult,
    TestStatus,
};
use crate::error::{CycleError, CycleResult};
use crate::io::config::RedgreenConfig;

/// Full persisted state graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDocument {
    pub active_cycle_id: Option<String>,
    pub cycles: Vec<Cycle>,
    pub tests: Vec<TestCase>,
    pub implementations: Vec<Implementation>,
    pub refactorings: Vec<Refactoring>,
    pub checkpoints: Vec<Checkpoint>,
    pub config: Option<RedgreenConfig>,
}

/// Owner of the single active cycle and its records.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    strict: bool,
    doc: StateDocument,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl StateStore {
    /// Open the store at `path`, falling back to an empty document when the
    /// file is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>, config: &RedgreenConfig) -> Self {
        let path = path.into();
        let mut doc = load(&path);
        doc.config = Some(config.clone());
        Self {
            path,
            strict: config.strict,
            doc,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn document(&self) -> &StateDocument {
        &self.doc
    }

    /// Apply `edit` to a copy of the document and keep it only once written.
    ///
    /// A failed edit or write leaves the in-memory document untouched, so it
    /// never runs ahead of what is on disk.
    fn commit<T>(
        &mut self,
        edit: impl FnOnce(&mut StateDocument) -> CycleResult<T>,
    ) -> CycleResult<T> {
        let mut next = self.doc.clone();
        let out = edit(&mut next)?;
        write_document(&self.path, &next)?;
        self.doc = next;
        Ok(out)
    }

    pub fn create_cycle(
        &mut self,
        feature: &str,
        description: &str,
        framework: &str,
    ) -> CycleResult<Cycle> {
        if let Some(active) = self.active_cycle() {
            return Err(CycleError::Validation(format!(
                "cycle '{}' for '{}' is still active; complete it first",
                active.id, active.feature
            )));
        }
        let now = now_rfc3339();
        let cycle = Cycle {
            id: new_id(),
            feature: feature.to_string(),
            description: description.to_string(),
            phase: Phase::Ready,
            framework: framework.to_string(),
            tests_written: 0,
            tests_passing: 0,
            tests_failing: 0,
            implementation_files: Vec::new(),
            refactoring_files: Vec::new(),
            last_coverage: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.commit(|doc| {
            doc.active_cycle_id = Some(cycle.id.clone());
            doc.cycles.push(cycle.clone());
            Ok(())
        })?;
        info!(cycle_id = %cycle.id, feature, "cycle created");
        Ok(cycle)
    }

    pub fn active_cycle(&self) -> Option<&Cycle> {
        let id = self.doc.active_cycle_id.as_deref()?;
        self.cycle(id)
    }

    /// Active cycle or `NotFound`.
    pub fn require_active(&self) -> CycleResult<&Cycle> {
        self.active_cycle()
            .ok_or_else(|| CycleError::NotFound("no active cycle; run init first".to_string()))
    }

    pub fn cycle(&self, id: &str) -> Option<&Cycle> {
        self.doc.cycles.iter().find(|cycle| cycle.id == id)
    }

    /// All cycles, retired ones included, in creation order.
    pub fn cycles(&self) -> &[Cycle] {
        &self.doc.cycles
    }

    pub fn update_cycle(&mut self, id: &str, patch: CyclePatch) -> CycleResult<Cycle> {
        self.commit(|doc| doc.patch_cycle(id, patch))
    }

    /// Move a cycle to `target` after checking the transition table against
    /// the counts currently recorded on the cycle.
    ///
    /// In non-strict mode violations are logged and allowed, except leaving
    /// `COMPLETE`.
    pub fn transition(&mut self, id: &str, target: Phase) -> CycleResult<Cycle> {
        let cycle = self
            .cycle(id)
            .ok_or_else(|| CycleError::NotFound(format!("cycle '{id}'")))?;
        let from = cycle.phase;
        if let Err(reason) = check_transition(from, target, TestCounts::of(cycle)) {
            if self.strict || from == Phase::Complete {
                return Err(CycleError::PhaseViolation {
                    from,
                    to: target,
                    reason,
                });
            }
            warn!(%from, to = %target, %reason, "allowing transition in non-strict mode");
        }
        if from == target {
            return Ok(cycle.clone());
        }
        let updated = self.update_cycle(
            id,
            CyclePatch {
                phase: Some(target),
                ..CyclePatch::default()
            },
        )?;
        info!(cycle_id = id, %from, to = %target, "phase changed");
        Ok(updated)
    }

    /// Record a test and bump the cycle's written count.
    pub fn add_test(&mut self, test: TestCase) -> CycleResult<()> {
        self.commit(|doc| {
            let written = doc.cycle_mut(&test.cycle_id)?.tests_written + 1;
            doc.patch_cycle(
                &test.cycle_id,
                CyclePatch {
                    tests_written: Some(written),
                    ..CyclePatch::default()
                },
            )?;
            debug!(test = %test.name, "test recorded");
            doc.tests.push(test);
            Ok(())
        })
    }

    pub fn add_implementation(&mut self, implementation: Implementation) -> CycleResult<()> {
        self.commit(|doc| {
            doc.patch_cycle(
                &implementation.cycle_id,
                CyclePatch {
                    add_implementation_file: Some(implementation.file_path.clone()),
                    ..CyclePatch::default()
                },
            )?;
            doc.implementations.push(implementation);
            Ok(())
        })
    }

    pub fn add_refactoring(&mut self, refactoring: Refactoring) -> CycleResult<()> {
        self.commit(|doc| {
            doc.patch_cycle(
                &refactoring.cycle_id,
                CyclePatch {
                    add_refactoring_file: Some(refactoring.file_path.clone()),
                    ..CyclePatch::default()
                },
            )?;
            doc.refactorings.push(refactoring);
            Ok(())
        })
    }

    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) -> CycleResult<()> {
        let (id, label) = (checkpoint.id.clone(), checkpoint.label.clone());
        self.commit(|doc| {
            doc.patch_cycle(&checkpoint.cycle_id, CyclePatch::default())?;
            doc.checkpoints.push(checkpoint);
            Ok(())
        })?;
        info!(checkpoint_id = %id, %label, "checkpoint recorded");
        Ok(())
    }

    /// Retire the active cycle. The cycle record itself is kept.
    pub fn clear_active_cycle(&mut self) -> CycleResult<()> {
        let cleared = self.commit(|doc| Ok(doc.active_cycle_id.take()))?;
        if let Some(id) = cleared {
            info!(cycle_id = %id, "active cycle cleared");
        }
        Ok(())
    }

    pub fn checkpoint(&self, id: &str) -> Option<&Checkpoint> {
        self.doc.checkpoints.iter().find(|cp| cp.id == id)
    }

    pub fn tests_for(&self, cycle_id: &str) -> Vec<&TestCase> {
        self.doc
            .tests
            .iter()
            .filter(|test| test.cycle_id == cycle_id)
            .collect()
    }

    pub fn implementations_for(&self, cycle_id: &str) -> Vec<&Implementation> {
        self.doc
            .implementations
            .iter()
            .filter(|imp| imp.cycle_id == cycle_id)
            .collect()
    }

    pub fn refactorings_for(&self, cycle_id: &str) -> Vec<&Refactoring> {
        self.doc
            .refactorings
            .iter()
            .filter(|r| r.cycle_id == cycle_id)
            .collect()
    }

    pub fn checkpoints_for(&self, cycle_id: &str) -> Vec<&Checkpoint> {
        self.doc
            .checkpoints
            .iter()
            .filter(|cp| cp.cycle_id == cycle_id)
            .collect()
    }

    /// Apply a run to the cycle: test statuses, counts, coverage and, on a
    /// clean run, implementation verification.
    pub fn record_run(&mut self, cycle_id: &str, result: &TestRunResult) -> CycleResult<Cycle> {
        self.commit(|doc| {
            if result.total > 0 {
                for test in doc
                    .tests
                    .iter_mut()
                    .filter(|test| test.cycle_id == cycle_id)
                {
                    test.status = status_after_run(&test.name, result);
                }
            }
            if result.success {
                for imp in doc
                    .implementations
                    .iter_mut()
                    .filter(|imp| imp.cycle_id == cycle_id)
                {
                    imp.verified = true;
                }
            }
            doc.patch_cycle(
                cycle_id,
                CyclePatch {
                    tests_passing: Some(result.passed),
                    tests_failing: Some(result.failed),
                    last_coverage: result.coverage,
                    ..CyclePatch::default()
                },
            )
        })
    }
}

impl StateDocument {
    fn cycle_mut(&mut self, id: &str) -> CycleResult<&mut Cycle> {
        self.cycles
            .iter_mut()
            .find(|cycle| cycle.id == id)
            .ok_or_else(|| CycleError::NotFound(format!("cycle '{id}'")))
    }

    /// Apply every set field of `patch` and stamp `updated_at`.
    fn patch_cycle(&mut self, id: &str, patch: CyclePatch) -> CycleResult<Cycle> {
        let cycle = self.cycle_mut(id)?;
        if let Some(phase) = patch.phase {
            cycle.phase = phase;
        }
        if let Some(count) = patch.tests_written {
            cycle.tests_written = count;
        }
        if let Some(count) = patch.tests_passing {
            cycle.tests_passing = count;
        }
        if let Some(count) = patch.tests_failing {
            cycle.tests_failing = count;
        }
        if let Some(path) = patch.add_implementation_file
            && !cycle.implementation_files.contains(&path)
        {
            cycle.implementation_files.push(path);
        }
        if let Some(path) = patch.add_refactoring_file
            && !cycle.refactoring_files.contains(&path)
        {
            cycle.refactoring_files.push(path);
        }
        if patch.last_coverage.is_some() {
            cycle.last_coverage = patch.last_coverage;
        }
        cycle.updated_at = now_rfc3339();
        Ok(cycle.clone())
    }
}

/// A test is failed if a failure names it, or if failures occurred that
/// could not be attributed to any test.
///
/// Runners report qualified titles (`suite › test`, `file > suite > test`),
/// so names are compared on their last segment.
fn status_after_run(name: &str, result: &TestRunResult) -> TestStatus {
    if result.failed == 0 {
        return TestStatus::Passed;
    }
    if result.failures.is_empty() {
        return TestStatus::Failed;
    }
    let leaf = title_leaf(name);
    let named = result
        .failures
        .iter()
        .any(|failure| title_leaf(&failure.test) == leaf);
    if named {
        TestStatus::Failed
    } else {
        TestStatus::Passed
    }
}

fn title_leaf(title: &str) -> &str {
    title.rsplit(['›', '>']).next().unwrap_or(title).trim()
}

fn write_document(path: &Path, doc: &StateDocument) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(doc).context("serialize state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Load the document, returning defaults when missing or unreadable.
pub fn load(path: &Path) -> StateDocument {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(doc) => {
                debug!(path = %path.display(), "state loaded");
                doc
            }
            Err(err) => {
                warn!(path = %path.display(), err = %err, "state unreadable, starting empty");
                StateDocument::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no state yet, starting empty");
            StateDocument::default()
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "state unreadable, starting empty");
            StateDocument::default()
        }
    }
}

/// Atomically replace `path` (temp file + rename), creating parent dirs.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TestCategory;
    use crate::test_support::{failing_result, passing_result, test_case};

    fn store_in(dir: &Path, strict: bool) -> StateStore {
        let cfg = RedgreenConfig {
            state_dir: dir.to_path_buf(),
            strict,
            ..RedgreenConfig::default()
        };
        StateStore::open(cfg.state_path(), &cfg)
    }

    #[test]
    fn missing_document_starts_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path(), true);
        assert!(store.active_cycle().is_none());
        assert!(store.cycles().is_empty());
    }

    #[test]
    fn corrupt_document_falls_back_to_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("state.json"), "{ not json").expect("write");
        let store = store_in(temp.path(), true);
        assert!(store.cycles().is_empty());
    }

    #[test]
    fn mutations_persist_and_reload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), true);
        let cycle = store.create_cycle("sum", "adds numbers", "jest").expect("create");
        store
            .add_test(test_case(&cycle.id, "adds two numbers"))
            .expect("add test");

        let reopened = store_in(temp.path(), true);
        let active = reopened.active_cycle().expect("active");
        assert_eq!(active.id, cycle.id);
        assert_eq!(active.tests_written, 1);
        assert_eq!(reopened.tests_for(&cycle.id).len(), 1);
        assert_eq!(
            reopened.tests_for(&cycle.id)[0].category,
            TestCategory::Unit
        );
    }

    #[test]
    fn only_one_active_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), true);
        store.create_cycle("a", "", "jest").expect("create");
        let err = store.create_cycle("b", "", "jest").unwrap_err();
        assert!(matches!(err, CycleError::Validation(_)));
    }

    #[test]
    fn strict_violation_leaves_phase_unchanged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), true);
        let cycle = store.create_cycle("a", "", "jest").expect("create");
        let err = store.transition(&cycle.id, Phase::Green).unwrap_err();
        assert!(matches!(
            err,
            CycleError::PhaseViolation {
                from: Phase::Ready,
                to: Phase::Green,
                ..
            }
        ));
        assert_eq!(store.active_cycle().expect("active").phase, Phase::Ready);
    }

    #[test]
    fn lenient_mode_allows_violation_but_not_leaving_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), false);
        let cycle = store.create_cycle("a", "", "jest").expect("create");
        let moved = store.transition(&cycle.id, Phase::Complete).expect("lenient");
        assert_eq!(moved.phase, Phase::Complete);
        assert!(store.transition(&cycle.id, Phase::Red).is_err());
    }

    #[test]
    fn record_run_updates_statuses_and_counts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), true);
        let cycle = store.create_cycle("a", "", "jest").expect("create");
        store.add_test(test_case(&cycle.id, "adds")).expect("add");
        store.add_test(test_case(&cycle.id, "subtracts")).expect("add");

        let updated = store
            .record_run(&cycle.id, &failing_result(1, &["math › adds"]))
            .expect("record");
        assert_eq!((updated.tests_passing, updated.tests_failing), (1, 1));
        let statuses: Vec<TestStatus> = store
            .tests_for(&cycle.id)
            .iter()
            .map(|test| test.status)
            .collect();
        assert_eq!(statuses, vec![TestStatus::Failed, TestStatus::Passed]);

        store
            .record_run(&cycle.id, &passing_result(2))
            .expect("record");
        assert!(
            store
                .tests_for(&cycle.id)
                .iter()
                .all(|test| test.status == TestStatus::Passed)
        );
    }

    #[test]
    fn failure_names_match_on_the_last_segment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), true);
        let cycle = store.create_cycle("a", "", "jest").expect("create");
        store.add_test(test_case(&cycle.id, "adds")).expect("add");
        store
            .add_test(test_case(&cycle.id, "adds negatives"))
            .expect("add");

        store
            .record_run(
                &cycle.id,
                &failing_result(1, &["test/sum.test.js > math > adds negatives"]),
            )
            .expect("record");
        let statuses: Vec<TestStatus> = store
            .tests_for(&cycle.id)
            .iter()
            .map(|test| test.status)
            .collect();
        assert_eq!(statuses, vec![TestStatus::Passed, TestStatus::Failed]);
    }

    #[test]
    fn failed_write_leaves_memory_unchanged() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A regular file where the state directory should be.
        let blocker = temp.path().join("blocked");
        fs::write(&blocker, "").expect("write blocker");
        let mut store = store_in(&blocker, true);
        assert!(matches!(
            store.create_cycle("a", "", "jest"),
            Err(CycleError::Io(_))
        ));
        assert!(store.active_cycle().is_none());
        assert!(store.cycles().is_empty());

        let dir = temp.path().join("state");
        let mut store = store_in(&dir, true);
        let cycle = store.create_cycle("a", "", "jest").expect("create");
        fs::remove_dir_all(&dir).expect("remove state dir");
        fs::write(&dir, "").expect("block state dir");
        assert!(store.add_test(test_case(&cycle.id, "adds")).is_err());
        assert!(store.transition(&cycle.id, Phase::Red).is_err());
        let active = store.active_cycle().expect("active");
        assert_eq!(active.tests_written, 0);
        assert_eq!(active.phase, Phase::Ready);
        assert!(store.tests_for(&cycle.id).is_empty());
    }

    #[test]
    fn records_route_file_paths_through_the_patch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), true);
        let cycle = store.create_cycle("a", "", "jest").expect("create");
        for _ in 0..2 {
            store
                .add_implementation(Implementation {
                    id: new_id(),
                    cycle_id: cycle.id.clone(),
                    file_path: PathBuf::from("src/sum.js"),
                    code: String::new(),
                    satisfies: Vec::new(),
                    minimal: true,
                    verified: false,
                })
                .expect("add implementation");
        }
        let active = store.active_cycle().expect("active");
        assert_eq!(active.implementation_files, vec![PathBuf::from("src/sum.js")]);
        assert_eq!(store.implementations_for(&cycle.id).len(), 2);
    }

    #[test]
    fn clear_active_keeps_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(temp.path(), true);
        store.create_cycle("a", "", "jest").expect("create");
        store.clear_active_cycle().expect("clear");
        assert!(store.active_cycle().is_none());
        assert_eq!(store.cycles().len(), 1);
        assert!(matches!(
            store.require_active(),
            Err(CycleError::NotFound(_))
        ));
    }

    #[test]
    fn write_atomic_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/state.json");
        write_atomic(&path, "{}\n").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "{}\n");
        assert!(!temp.path().join("nested/state.json.tmp").exists());
    }
}
