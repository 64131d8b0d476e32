//! Orchestration of the Red-Green-Refactor actions.
//!
//! [`Orchestrator`] owns the state store and the side-effect seams (files,
//! test runner, generation transport) and turns one [`Action`] into one
//! [`Response`]. Every action works on the single active cycle.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::action::{
    Action, CheckpointRequest, ConsultRequest, ImplementRequest, InitRequest, RefactorRequest,
    Response, RollbackRequest, RunTestsRequest, WriteTestRequest,
};
use crate::core::phase::accepts_implementation;
use crate::core::report::validate_expectation;
use crate::core::types::{
    Checkpoint, Cycle, CyclePatch, Expectation, Implementation, Phase, Refactoring, TestCase,
    TestStatus, copy_tests,
};
use crate::error::{CycleError, CycleResult};
use crate::io::checkpoint::{restore, snapshot};
use crate::io::config::RedgreenConfig;
use crate::io::consult::{GenerateTransport, HttpTransport, ResilientClient};
use crate::io::files::{FileAccess, FsFiles};
use crate::io::normalizer::{
    FrameworkRegistry, Normalizer, NormalizerSettings, ProcessRunner, TestRunner,
};
use crate::io::state_store::{StateStore, new_id, now_rfc3339};

/// Message and payload of a successful action.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub message: String,
    pub data: Value,
}

impl Outcome {
    fn new(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: message.into(),
            data,
        }
    }
}

/// Production wiring: filesystem, child processes, HTTP.
pub type LiveOrchestrator = Orchestrator<FsFiles, ProcessRunner, HttpTransport>;

pub struct Orchestrator<F: FileAccess, R: TestRunner, T: GenerateTransport> {
    config: RedgreenConfig,
    store: StateStore,
    files: F,
    normalizer: Normalizer<R>,
    client: ResilientClient<T>,
}

impl LiveOrchestrator {
    /// Wire the orchestrator against `project_root` (default: current dir).
    pub fn live(config: RedgreenConfig, project_root: Option<PathBuf>) -> anyhow::Result<Self> {
        let root = match project_root {
            Some(root) => root,
            None => env::current_dir().context("resolve current directory")?,
        };
        let transport = HttpTransport::new(
            &config.service.base_url,
            Duration::from_secs(config.service.request_timeout_secs),
        )?;
        let normalizer = Normalizer::new(
            FrameworkRegistry::builtin(),
            ProcessRunner,
            NormalizerSettings {
                workdir: root.clone(),
                timeout: config.test_timeout(),
                output_limit_bytes: config.output_limit_bytes,
            },
        );
        let client = ResilientClient::from_config(transport, &config.service);
        Ok(Self::new(config, FsFiles::new(root), normalizer, client))
    }
}

impl<F: FileAccess, R: TestRunner, T: GenerateTransport> Orchestrator<F, R, T> {
    /// Open the state document named by `config` and assemble the seams.
    pub fn new(
        config: RedgreenConfig,
        files: F,
        normalizer: Normalizer<R>,
        client: ResilientClient<T>,
    ) -> Self {
        let store = StateStore::open(config.state_path(), &config);
        Self {
            config,
            store,
            files,
            normalizer,
            client,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn files(&self) -> &F {
        &self.files
    }

    pub fn normalizer(&self) -> &Normalizer<R> {
        &self.normalizer
    }

    pub fn client(&self) -> &ResilientClient<T> {
        &self.client
    }

    /// Validate and execute one action. Never fails: errors become a
    /// `success: false` response.
    pub fn handle(&mut self, action: Action) -> Response {
        let name = action.name();
        let result = match action.validate() {
            Ok(()) => self.dispatch(action),
            Err(err) => Err(err),
        };
        match result {
            Ok(outcome) => Response::ok(outcome.message, outcome.data),
            Err(err) => {
                warn!(action = name, kind = err.kind(), err = %err, "action failed");
                Response::from_error(&err)
            }
        }
    }

    /// Parse a raw JSON request and handle it.
    pub fn handle_json(&mut self, raw: &str) -> Response {
        match Action::parse(raw) {
            Ok(action) => self.handle(action),
            Err(err) => Response::from_error(&err),
        }
    }

    pub fn dispatch(&mut self, action: Action) -> CycleResult<Outcome> {
        match action {
            Action::Init(req) => self.init(req),
            Action::WriteTest(req) => self.write_test(req),
            Action::Implement(req) => self.implement(req),
            Action::RunTests(req) => self.run_tests(req),
            Action::Refactor(req) => self.refactor(req),
            Action::Checkpoint(req) => self.checkpoint(req),
            Action::Rollback(req) => self.rollback(req),
            Action::Complete => self.complete(),
            Action::Status => self.status(),
            Action::Consult(req) => self.consult(req),
        }
    }

    fn active(&self) -> CycleResult<Cycle> {
        self.store.require_active().cloned()
    }

    #[instrument(skip_all, fields(feature = %req.feature))]
    pub fn init(&mut self, req: InitRequest) -> CycleResult<Outcome> {
        let framework = req
            .framework
            .unwrap_or_else(|| self.config.framework.clone());
        if self.normalizer.registry().get(&framework).is_none() {
            warn!(framework = %framework, "framework not registered; runs will use the default");
        }
        let cycle = self
            .store
            .create_cycle(&req.feature, &req.description, &framework)?;
        Ok(Outcome::new(
            format!("Started cycle for '{}' ({})", cycle.feature, cycle.phase),
            json!({ "cycle": cycle }),
        ))
    }

    /// Write a test file, record it and move to RED.
    #[instrument(skip_all, fields(test = %req.name))]
    pub fn write_test(&mut self, req: WriteTestRequest) -> CycleResult<Outcome> {
        let cycle = self.active()?;
        if self
            .store
            .tests_for(&cycle.id)
            .iter()
            .any(|test| test.name == req.name)
        {
            return Err(CycleError::Validation(format!(
                "test '{}' is already recorded for this cycle",
                req.name
            )));
        }

        self.files
            .write(&req.file_path, &req.code)
            .with_context(|| format!("write test {}", req.file_path.display()))?;
        let test = TestCase {
            id: new_id(),
            cycle_id: cycle.id.clone(),
            file_path: req.file_path,
            name: req.name,
            code: req.code,
            category: req.category,
            expect_fail: req.expect_fail,
            status: TestStatus::Pending,
        };
        self.store.add_test(test.clone())?;
        let cycle = self.store.transition(&cycle.id, Phase::Red)?;
        Ok(Outcome::new(
            format!("Wrote test '{}' ({})", test.name, cycle.phase),
            json!({ "test": test, "phase": cycle.phase, "tests_written": cycle.tests_written }),
        ))
    }

    /// Write implementation code. Allowed in RED or GREEN; the phase does not change.
    #[instrument(skip_all, fields(file = %req.file_path.display()))]
    pub fn implement(&mut self, req: ImplementRequest) -> CycleResult<Outcome> {
        let cycle = self.active()?;
        if !accepts_implementation(cycle.phase) {
            if self.store.strict() {
                return Err(CycleError::Validation(format!(
                    "implementation is accepted in RED or GREEN, cycle is {}",
                    cycle.phase
                )));
            }
            warn!(
                phase = %cycle.phase,
                "recording implementation outside RED/GREEN in non-strict mode"
            );
        }

        let known: Vec<String> = self
            .store
            .tests_for(&cycle.id)
            .iter()
            .map(|test| test.name.clone())
            .collect();
        let unknown: Vec<&String> = req
            .satisfies
            .iter()
            .filter(|name| !known.contains(name))
            .collect();
        if !unknown.is_empty() {
            warn!(?unknown, "implementation names tests that were never written");
        }

        self.files
            .write(&req.file_path, &req.code)
            .with_context(|| format!("write implementation {}", req.file_path.display()))?;
        let implementation = Implementation {
            id: new_id(),
            cycle_id: cycle.id.clone(),
            file_path: req.file_path,
            code: req.code,
            satisfies: req.satisfies,
            minimal: req.minimal,
            verified: false,
        };
        self.store.add_implementation(implementation.clone())?;
        Ok(Outcome::new(
            format!(
                "Wrote implementation {} ({})",
                implementation.file_path.display(),
                cycle.phase
            ),
            json!({ "implementation": implementation, "phase": cycle.phase }),
        ))
    }

    /// Run the cycle's tests, record the outcome and check the expectation.
    ///
    /// A clean run expected to pass while in RED moves the cycle to GREEN.
    /// That transition is judged against the counts recorded before this run,
    /// i.e. the failing tests the implementation was written for.
    #[instrument(skip_all)]
    pub fn run_tests(&mut self, req: RunTestsRequest) -> CycleResult<Outcome> {
        let cycle = self.active()?;
        let result = self
            .normalizer
            .run(&cycle.framework, req.pattern.as_deref(), req.coverage)?;
        let check = req
            .expectation
            .map(|expected| validate_expectation(expected, &result));

        let wants_green = req.expectation == Some(Expectation::Pass)
            && cycle.phase == Phase::Red
            && result.failed == 0
            && result.passed > 0;
        let transition = if wants_green {
            Some(self.store.transition(&cycle.id, Phase::Green))
        } else {
            None
        };
        let updated = self.store.record_run(&cycle.id, &result)?;
        if let Some(Err(err)) = transition {
            return Err(err);
        }

        let mut message = format!(
            "{} passed, {} failed, {} skipped ({})",
            result.passed, result.failed, result.skipped, updated.phase
        );
        if let Some(check) = &check {
            if check.expectation_met {
                message.push_str(&format!("; expected {}", check.expected.label()));
            } else {
                message.push_str(&format!(
                    "; expected {} but tests {}",
                    check.expected.label(),
                    check.actual_outcome.label()
                ));
            }
        }
        info!(
            passed = result.passed,
            failed = result.failed,
            phase = %updated.phase,
            "tests recorded"
        );
        Ok(Outcome::new(
            message,
            json!({ "result": result, "expectation": check, "phase": updated.phase }),
        ))
    }

    /// Apply a refactoring with before/after test runs.
    #[instrument(skip_all, fields(file = %req.file_path.display()))]
    pub fn refactor(&mut self, req: RefactorRequest) -> CycleResult<Outcome> {
        let cycle = self.active()?;
        let cycle = self.store.transition(&cycle.id, Phase::Refactor)?;
        let pattern = req.pattern.as_deref();

        let before = self.normalizer.run(&cycle.framework, pattern, false)?;
        self.store.record_run(&cycle.id, &before)?;
        let pre_edit = snapshot(&self.files, std::slice::from_ref(&req.file_path))?;

        self.files
            .write(&req.file_path, &req.code)
            .with_context(|| format!("write refactoring {}", req.file_path.display()))?;

        let after = if req.auto_verify {
            Some(self.normalizer.run(&cycle.framework, pattern, false)?)
        } else {
            None
        };
        let success = after.as_ref().is_some_and(|run| run.failed == 0);

        let mut reverted = false;
        if let Some(after) = &after {
            if !success && req.revert_on_failure {
                if pre_edit.is_empty() {
                    warn!("refactored file did not exist before the edit; nothing to revert");
                } else {
                    restore(&self.files, &pre_edit)?;
                    reverted = true;
                    info!("refactoring reverted after failing tests");
                }
            }
            if !reverted {
                self.store.record_run(&cycle.id, after)?;
            }
        }

        let refactoring = Refactoring {
            id: new_id(),
            cycle_id: cycle.id.clone(),
            file_path: req.file_path,
            description: req.description,
            before,
            after,
            success,
            reverted,
        };
        self.store.add_refactoring(refactoring.clone())?;

        let message = match (&refactoring.after, success, reverted) {
            (None, _, _) => "Refactoring applied without verification".to_string(),
            (Some(_), true, _) => "Refactoring applied; tests still pass".to_string(),
            (Some(_), false, true) => "Refactoring broke tests and was reverted".to_string(),
            (Some(_), false, false) => "Refactoring applied but tests fail".to_string(),
        };
        Ok(Outcome::new(
            message,
            json!({ "refactoring": refactoring, "phase": cycle.phase }),
        ))
    }

    /// Snapshot the cycle's tracked files and tests.
    #[instrument(skip_all, fields(label = %req.label))]
    pub fn checkpoint(&mut self, req: CheckpointRequest) -> CycleResult<Outcome> {
        let cycle = self.active()?;
        let paths = self.tracked_paths(&cycle, req.extra_paths);
        let files = snapshot(&self.files, &paths)?;
        let checkpoint = Checkpoint {
            id: new_id(),
            cycle_id: cycle.id.clone(),
            label: req.label,
            reason: req.reason,
            phase: cycle.phase,
            files,
            tests: copy_tests(&self.store.tests_for(&cycle.id)),
            created_at: now_rfc3339(),
        };
        self.store.add_checkpoint(checkpoint.clone())?;
        let captured: Vec<&PathBuf> = checkpoint.files.keys().collect();
        Ok(Outcome::new(
            format!(
                "Checkpoint '{}' captured {} file(s) at {}",
                checkpoint.label,
                captured.len(),
                checkpoint.phase
            ),
            json!({
                "checkpoint_id": checkpoint.id,
                "phase": checkpoint.phase,
                "files": captured,
                "tests": checkpoint.tests.len(),
            }),
        ))
    }

    /// Every file the cycle has touched plus `extra`, deduplicated in order.
    fn tracked_paths(&self, cycle: &Cycle, extra: Vec<PathBuf>) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        let candidates = self
            .store
            .tests_for(&cycle.id)
            .into_iter()
            .map(|test| test.file_path.clone())
            .chain(cycle.implementation_files.iter().cloned())
            .chain(cycle.refactoring_files.iter().cloned())
            .chain(extra);
        for path in candidates {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    /// Restore a checkpoint's files and reset the phase to the captured one.
    ///
    /// Test, implementation and refactoring records added after the
    /// checkpoint are kept.
    #[instrument(skip_all, fields(checkpoint_id = %req.checkpoint_id))]
    pub fn rollback(&mut self, req: RollbackRequest) -> CycleResult<Outcome> {
        let cycle = self.active()?;
        let checkpoint = self
            .store
            .checkpoint(&req.checkpoint_id)
            .cloned()
            .ok_or_else(|| CycleError::NotFound(format!("checkpoint '{}'", req.checkpoint_id)))?;
        if checkpoint.cycle_id != cycle.id {
            return Err(CycleError::Validation(format!(
                "checkpoint '{}' belongs to another cycle",
                checkpoint.id
            )));
        }

        let restored = restore(&self.files, &checkpoint.files)?;
        let updated = self.store.update_cycle(
            &cycle.id,
            CyclePatch {
                phase: Some(checkpoint.phase),
                ..CyclePatch::default()
            },
        )?;
        info!(from = %cycle.phase, to = %updated.phase, restored = restored.len(), "rolled back");
        Ok(Outcome::new(
            format!(
                "Rolled back to '{}': restored {} file(s), phase {}",
                checkpoint.label,
                restored.len(),
                updated.phase
            ),
            json!({
                "restored": restored,
                "phase": updated.phase,
                "tests_kept": self.store.tests_for(&cycle.id).len(),
            }),
        ))
    }

    /// Move to COMPLETE and retire the cycle.
    #[instrument(skip_all)]
    pub fn complete(&mut self) -> CycleResult<Outcome> {
        let cycle = self.active()?;
        let cycle = self.store.transition(&cycle.id, Phase::Complete)?;
        self.store.clear_active_cycle()?;

        let coverage_warning = cycle.last_coverage.and_then(|coverage| {
            let lowest = coverage.minimum();
            (lowest < self.config.min_coverage).then(|| {
                format!(
                    "coverage {lowest:.1}% is below the minimum {:.1}%",
                    self.config.min_coverage
                )
            })
        });
        let mut message = format!("Completed cycle for '{}'", cycle.feature);
        if let Some(warning) = &coverage_warning {
            warn!(%warning, "completed below coverage minimum");
            message.push_str(&format!(" (warning: {warning})"));
        }
        Ok(Outcome::new(
            message,
            json!({
                "cycle": cycle,
                "tests": self.store.tests_for(&cycle.id).len(),
                "implementations": self.store.implementations_for(&cycle.id).len(),
                "refactorings": self.store.refactorings_for(&cycle.id).len(),
                "coverage_warning": coverage_warning,
            }),
        ))
    }

    /// Active cycle with its records; checkpoints are summarized.
    pub fn status(&self) -> CycleResult<Outcome> {
        let completed = self
            .store
            .cycles()
            .iter()
            .filter(|cycle| cycle.phase == Phase::Complete)
            .count();
        let Some(cycle) = self.store.active_cycle() else {
            return Ok(Outcome::new(
                "No active cycle",
                json!({ "active": null, "completed_cycles": completed }),
            ));
        };
        let checkpoints: Vec<Value> = self
            .store
            .checkpoints_for(&cycle.id)
            .iter()
            .map(|cp| {
                json!({
                    "id": cp.id,
                    "label": cp.label,
                    "phase": cp.phase,
                    "files": cp.files.keys().collect::<Vec<_>>(),
                    "created_at": cp.created_at,
                })
            })
            .collect();
        Ok(Outcome::new(
            format!(
                "'{}' is {} ({} written, {} passing, {} failing)",
                cycle.feature,
                cycle.phase,
                cycle.tests_written,
                cycle.tests_passing,
                cycle.tests_failing
            ),
            json!({
                "active": cycle,
                "tests": self.store.tests_for(&cycle.id),
                "implementations": self.store.implementations_for(&cycle.id),
                "refactorings": self.store.refactorings_for(&cycle.id),
                "checkpoints": checkpoints,
                "completed_cycles": completed,
            }),
        ))
    }

    /// Ask the generation service for advice, with the active cycle as context.
    #[instrument(skip_all)]
    pub fn consult(&mut self, req: ConsultRequest) -> CycleResult<Outcome> {
        let prompt = self.consult_prompt(&req.question);
        let advice = self.client.generate(&prompt)?;
        Ok(Outcome::new(
            "Consultation answered",
            json!({ "advice": advice, "circuit": self.client.circuit_state() }),
        ))
    }

    fn consult_prompt(&self, question: &str) -> String {
        let Some(cycle) = self.store.active_cycle() else {
            return format!(
                "You are advising on test-driven development.\n\nQuestion: {question}\n"
            );
        };
        let mut prompt = format!(
            "You are advising on a test-driven development cycle.\n\
             Feature: {}\nDescription: {}\nPhase: {}\nFramework: {}\n\
             Tests: {} written, {} passing, {} failing\n",
            cycle.feature,
            cycle.description,
            cycle.phase,
            cycle.framework,
            cycle.tests_written,
            cycle.tests_passing,
            cycle.tests_failing
        );
        let failing: Vec<&str> = self
            .store
            .tests_for(&cycle.id)
            .into_iter()
            .filter(|test| test.status == TestStatus::Failed)
            .map(|test| test.name.as_str())
            .collect();
        if !failing.is_empty() {
            prompt.push_str(&format!("Failing tests: {}\n", failing.join(", ")));
        }
        prompt.push_str(&format!("\nQuestion: {question}\n"));
        prompt
    }
}
