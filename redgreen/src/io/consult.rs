//! Resilient client for the advisory generation service.
//!
//! A call is guarded by a circuit breaker; retries with exponential backoff
//! happen inside one guarded call. While the breaker is open the transport is
//! not touched and the call fails with `ServiceUnavailable`.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::{CircuitBreaker, CircuitState, RetryPolicy};
use crate::error::{CycleError, CycleResult};
use crate::io::config::ServiceConfig;

/// Body of `POST {base_url}/api/generate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
}

/// Failure of a single transport attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Connection refused or DNS failure.
    #[error("could not connect: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection dropped mid-request.
    #[error("connection reset: {0}")]
    Reset(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Response arrived but did not carry a `response` string.
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl CallError {
    /// Network failures and 5xx are transient; 4xx and bad bodies are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::Connect(_) | CallError::Timeout(_) | CallError::Reset(_) => true,
            CallError::Status { status, .. } => (500..600).contains(status),
            CallError::InvalidResponse(_) => false,
        }
    }
}

/// One outbound generation attempt.
pub trait GenerateTransport {
    fn generate(&self, request: &GenerateRequest) -> Result<String, CallError>;
}

/// Blocking HTTP transport.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_transport_error(err: &reqwest::Error) -> CallError {
    let message = err.to_string();
    if err.is_timeout() {
        CallError::Timeout(message)
    } else if err.is_connect() {
        CallError::Connect(message)
    } else if err.is_decode() {
        CallError::InvalidResponse(message)
    } else {
        CallError::Reset(message)
    }
}

impl GenerateTransport for HttpTransport {
    fn generate(&self, request: &GenerateRequest) -> Result<String, CallError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .map_err(|err| classify_transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CallError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .map_err(|err| CallError::InvalidResponse(err.to_string()))?;
        body.get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CallError::InvalidResponse("missing `response` string".to_string()))
    }
}

/// Generation client with retry and circuit breaking.
pub struct ResilientClient<T: GenerateTransport> {
    transport: T,
    model: String,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl<T: GenerateTransport> ResilientClient<T> {
    pub fn new(
        transport: T,
        model: impl Into<String>,
        policy: RetryPolicy,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            transport,
            model: model.into(),
            policy,
            breaker,
        }
    }

    pub fn from_config(transport: T, config: &ServiceConfig) -> Self {
        Self::new(
            transport,
            config.model.clone(),
            config.retry_policy(),
            CircuitBreaker::new(config.failure_threshold, config.reset_timeout()),
        )
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Send `prompt` and return the generated text.
    #[instrument(skip_all, fields(model = %self.model))]
    pub fn generate(&mut self, prompt: &str) -> CycleResult<String> {
        if !self.breaker.try_acquire(Instant::now()) {
            warn!("circuit open, refusing call");
            return Err(CycleError::ServiceUnavailable(
                "generation service circuit is open; retry later".to_string(),
            ));
        }

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
        };
        match self.call_with_retry(&request) {
            Ok(text) => {
                self.breaker.record_success();
                debug!(chars = text.len(), "generation succeeded");
                Ok(text)
            }
            Err(err) => {
                self.breaker.record_failure(Instant::now());
                if self.breaker.state() == CircuitState::Open {
                    info!(failures = self.breaker.consecutive_failures(), "circuit opened");
                }
                Err(CycleError::Service(err.to_string()))
            }
        }
    }

    fn call_with_retry(&self, request: &GenerateRequest) -> Result<String, CallError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.transport.generate(request) {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        err = %err,
                        "retrying generation call"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    debug!(attempt = attempt + 1, retryable = err.is_retryable(), "giving up");
                    return Err(err);
                }
            }
        }
    }
}
