//! Tagged action requests and the response payload.
//!
//! Requests arrive as JSON objects `{"action": "<snake_case>", ...fields}` and
//! are validated here before any state is touched. Every outcome, failures
//! included, leaves as a [`Response`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::types::{Expectation, TestCategory};
use crate::error::{CycleError, CycleResult};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Init(InitRequest),
    WriteTest(WriteTestRequest),
    Implement(ImplementRequest),
    RunTests(RunTestsRequest),
    Refactor(RefactorRequest),
    Checkpoint(CheckpointRequest),
    Rollback(RollbackRequest),
    Complete,
    Status,
    Consult(ConsultRequest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitRequest {
    pub feature: String,
    #[serde(default)]
    pub description: String,
    /// Overrides the configured framework for this cycle.
    #[serde(default)]
    pub framework: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteTestRequest {
    pub file_path: PathBuf,
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub category: TestCategory,
    #[serde(default = "default_true")]
    pub expect_fail: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImplementRequest {
    pub file_path: PathBuf,
    pub code: String,
    /// Names of the tests this code is meant to make pass.
    #[serde(default)]
    pub satisfies: Vec<String>,
    #[serde(default = "default_true")]
    pub minimal: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct RunTestsRequest {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub expectation: Option<Expectation>,
    #[serde(default)]
    pub coverage: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RefactorRequest {
    pub file_path: PathBuf,
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Re-run the tests after the edit.
    #[serde(default = "default_true")]
    pub auto_verify: bool,
    /// Write the pre-edit content back if the re-run fails.
    #[serde(default)]
    pub revert_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckpointRequest {
    pub label: String,
    #[serde(default)]
    pub reason: String,
    /// Paths captured in addition to the cycle's tracked files.
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RollbackRequest {
    pub checkpoint_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsultRequest {
    pub question: String,
}

fn require_text(field: &str, value: &str) -> CycleResult<()> {
    if value.trim().is_empty() {
        return Err(CycleError::Validation(format!("`{field}` must be non-empty")));
    }
    Ok(())
}

fn require_path(field: &str, path: &Path) -> CycleResult<()> {
    if path.as_os_str().is_empty() {
        return Err(CycleError::Validation(format!("`{field}` must be non-empty")));
    }
    Ok(())
}

impl Action {
    /// Parse one JSON request. Malformed input is a `Validation` error.
    pub fn parse(raw: &str) -> CycleResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| CycleError::Validation(format!("invalid request: {err}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Init(_) => "init",
            Action::WriteTest(_) => "write_test",
            Action::Implement(_) => "implement",
            Action::RunTests(_) => "run_tests",
            Action::Refactor(_) => "refactor",
            Action::Checkpoint(_) => "checkpoint",
            Action::Rollback(_) => "rollback",
            Action::Complete => "complete",
            Action::Status => "status",
            Action::Consult(_) => "consult",
        }
    }

    /// Field-level checks that need no state.
    pub fn validate(&self) -> CycleResult<()> {
        match self {
            Action::Init(req) => {
                require_text("feature", &req.feature)?;
                if let Some(framework) = &req.framework {
                    require_text("framework", framework)?;
                }
                Ok(())
            }
            Action::WriteTest(req) => {
                require_path("file_path", &req.file_path)?;
                require_text("name", &req.name)?;
                require_text("code", &req.code)
            }
            Action::Implement(req) => {
                require_path("file_path", &req.file_path)?;
                require_text("code", &req.code)
            }
            Action::RunTests(req) => match &req.pattern {
                Some(pattern) => require_text("pattern", pattern),
                None => Ok(()),
            },
            Action::Refactor(req) => {
                require_path("file_path", &req.file_path)?;
                require_text("code", &req.code)?;
                require_text("description", &req.description)?;
                if req.revert_on_failure && !req.auto_verify {
                    return Err(CycleError::Validation(
                        "`revert_on_failure` requires `auto_verify`".to_string(),
                    ));
                }
                Ok(())
            }
            Action::Checkpoint(req) => {
                require_text("label", &req.label)?;
                req.extra_paths
                    .iter()
                    .try_for_each(|path| require_path("extra_paths", path))
            }
            Action::Rollback(req) => require_text("checkpoint_id", &req.checkpoint_id),
            Action::Complete | Action::Status => Ok(()),
            Action::Consult(req) => require_text("question", &req.question),
        }
    }
}

/// Structured result of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Failure payload carrying the error kind and any structured detail.
    pub fn from_error(err: &CycleError) -> Self {
        let mut data = json!({ "kind": err.kind() });
        match err {
            CycleError::PhaseViolation { from, to, reason } => {
                data["from"] = json!(from);
                data["to"] = json!(to);
                data["reason"] = json!(reason);
            }
            CycleError::Restore(restore) => {
                data["restored"] = json!(restore.restored);
                data["failed_path"] = json!(restore.failed_path);
                data["not_attempted"] = json!(restore.not_attempted);
            }
            _ => {}
        }
        Self {
            success: false,
            message: format!("{err:#}"),
            data: Some(data),
        }
    }

    /// One JSON line for the `serve` loop.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(r#"{{"success":false,"message":"serialize response: {err}","data":null}}"#)
        })
    }
}
