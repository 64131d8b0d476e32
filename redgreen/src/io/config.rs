//! Configuration stored under `{state_dir}/config.toml`, overridden by env vars.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::backoff::RetryPolicy;

pub const ENV_STATE_DIR: &str = "STATE_DIR";
pub const ENV_FRAMEWORK: &str = "TDD_TEST_FRAMEWORK";
pub const ENV_MIN_COVERAGE: &str = "TDD_MIN_COVERAGE";
pub const ENV_STRICT: &str = "TDD_STRICT_MODE";
pub const ENV_SERVICE_URL: &str = "TDD_SERVICE_URL";
pub const ENV_MODEL: &str = "TDD_MODEL";
pub const ENV_TEST_TIMEOUT: &str = "TDD_TEST_TIMEOUT_SECS";

/// Orchestrator configuration (TOML).
///
/// Missing fields default to the values below; environment variables win
/// over the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedgreenConfig {
    /// Directory holding `state.json` and `config.toml`.
    pub state_dir: PathBuf,

    /// Framework used when a cycle does not name one.
    pub framework: String,

    /// Minimum coverage percentage expected at completion.
    pub min_coverage: f64,

    /// Enforce the phase transition table.
    pub strict: bool,

    /// Wall-clock budget for one test run in seconds.
    pub test_timeout_secs: u64,

    /// Truncate captured test output beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of the generation service (`POST {base_url}/api/generate`).
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            request_timeout_secs: 60,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl ServiceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for RedgreenConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            framework: "jest".to_string(),
            min_coverage: 80.0,
            strict: true,
            test_timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
            service: ServiceConfig::default(),
        }
    }
}

pub fn default_state_dir() -> PathBuf {
    std::env::temp_dir().join("redgreen")
}

impl RedgreenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.framework.trim().is_empty() {
            return Err(anyhow!("framework must be non-empty"));
        }
        if !(0.0..=100.0).contains(&self.min_coverage) {
            return Err(anyhow!(
                "min_coverage must be within 0..=100 (got {})",
                self.min_coverage
            ));
        }
        if self.test_timeout_secs == 0 {
            return Err(anyhow!("test_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.service.base_url.trim().is_empty() {
            return Err(anyhow!("service.base_url must be non-empty"));
        }
        if self.service.request_timeout_secs == 0 {
            return Err(anyhow!("service.request_timeout_secs must be > 0"));
        }
        if self.service.reset_timeout_ms == 0 {
            return Err(anyhow!("service.reset_timeout_ms must be > 0"));
        }
        if self.service.max_attempts == 0 {
            return Err(anyhow!("service.max_attempts must be > 0"));
        }
        if self.service.failure_threshold == 0 {
            return Err(anyhow!("service.failure_threshold must be > 0"));
        }
        if self.service.multiplier < 1.0 {
            return Err(anyhow!("service.multiplier must be >= 1.0"));
        }
        Ok(())
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.toml")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(framework) = lookup(ENV_FRAMEWORK) {
            self.framework = framework.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_MIN_COVERAGE) {
            self.min_coverage = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MIN_COVERAGE}={raw} is not a number"))?;
        }
        if let Some(raw) = lookup(ENV_STRICT) {
            self.strict = parse_bool(&raw)
                .ok_or_else(|| anyhow!("{ENV_STRICT}={raw} is not a boolean"))?;
        }
        if let Some(url) = lookup(ENV_SERVICE_URL) {
            self.service.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.service.model = model.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_TEST_TIMEOUT) {
            self.test_timeout_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_TEST_TIMEOUT}={raw} is not an integer"))?;
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RedgreenConfig::default()`.
pub fn load_config(path: &Path) -> Result<RedgreenConfig> {
    if !path.exists() {
        return Ok(RedgreenConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RedgreenConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Resolve the effective config: env `STATE_DIR` locates `config.toml`, the
/// file supplies values, then env vars override them.
pub fn resolve_config<F>(lookup: F) -> Result<RedgreenConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let state_dir = lookup(ENV_STATE_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(default_state_dir);
    let mut cfg = load_config(&state_dir.join("config.toml"))?;
    cfg.state_dir = state_dir;
    cfg.apply_env(&lookup)?;
    cfg.validate()?;
    debug!(
        state_dir = %cfg.state_dir.display(),
        framework = %cfg.framework,
        strict = cfg.strict,
        "config resolved"
    );
    Ok(cfg)
}

/// Resolve config from the process environment.
pub fn config_from_env() -> Result<RedgreenConfig> {
    resolve_config(|key| std::env::var(key).ok())
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RedgreenConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::state_store::write_atomic(path, &buf)
}
