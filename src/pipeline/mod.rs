//! # Extension Pipeline
//!
//! Orchestrates the three lifecycle phases every inbound function call
//! passes through: pre-validation, pre-execution, post-execution.
//! Registered extensions run in ascending priority order; any extension may
//! short-circuit the request with a final response, after which later
//! extensions in that phase and all later phases are skipped.
//!
//! All per-request state lives in a [`RequestContext`] value threaded
//! explicitly through the phase calls and discarded at request end —
//! extension instances hold no mutable per-request fields, so concurrent
//! requests can never race through a shared extension object.

pub mod extensions;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{ForrstError, Result};
use crate::lock::LockHandle;

/// Lifecycle phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreValidation,
    PreExecution,
    PostExecution,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreValidation => write!(f, "pre_validation"),
            Self::PreExecution => write!(f, "pre_execution"),
            Self::PostExecution => write!(f, "post_execution"),
        }
    }
}

/// Per-primitive coordination directives a client attaches to a call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinationDirectives {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<CancellationDirective>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDirective {
    pub key: String,
    pub ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDirective {
    pub ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationDirective {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// A parsed inbound function call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRequest {
    pub request_id: String,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub coordination: CoordinationDirectives,
}

/// Machine-readable error surfaced to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&ForrstError> for ProtocolError {
    fn from(err: &ForrstError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// The final response returned to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub annotations: serde_json::Map<String, serde_json::Value>,
}

impl FunctionResponse {
    pub fn success(request_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: Some(result),
            error: None,
            annotations: serde_json::Map::new(),
        }
    }

    pub fn failure(request_id: impl Into<String>, err: &ForrstError) -> Self {
        Self {
            request_id: request_id.into(),
            result: None,
            error: Some(ProtocolError::from(err)),
            annotations: serde_json::Map::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-call state threaded explicitly through the three phases.
///
/// Owned solely by the in-flight call stack; discarded at request end
/// regardless of success or failure.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    /// Lock handle opened in pre-execution; taken by the releasing phase
    pub lock_handle: Option<LockHandle>,
    /// Cache key resolved in pre-execution
    pub cache_key: Option<String>,
    /// Cancellation token registered for this request
    pub cancellation_token: Option<String>,
    /// Function body result, available to post-execution extensions
    pub result: Option<serde_json::Value>,
    /// Response annotations accumulated by extensions
    pub annotations: serde_json::Map<String, serde_json::Value>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            started_at: Utc::now(),
            lock_handle: None,
            cache_key: None,
            cancellation_token: None,
            result: None,
            annotations: serde_json::Map::new(),
        }
    }

    /// Attach a response annotation under `key`
    pub fn annotate(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.annotations.insert(key.into(), value);
    }

    /// Merge annotations nested under `key` (e.g. update one field of the
    /// lock annotation without rebuilding it)
    pub fn annotate_field(&mut self, key: &str, field: &str, value: serde_json::Value) {
        let entry = self
            .annotations
            .entry(key.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if let serde_json::Value::Object(map) = entry {
            map.insert(field.to_string(), value);
        }
    }
}

/// Outcome of one extension's phase handler
#[derive(Debug)]
pub enum PhaseResult {
    /// Pass through; later extensions and phases proceed
    Continue,
    /// Short-circuit with this final response
    Stop(FunctionResponse),
}

/// A pluggable request-lifecycle extension.
///
/// Handlers receive the request and the mutable per-request context; they
/// must keep no per-request state on `self`. `cleanup` is invoked for every
/// registered extension once the request finishes, on every path — success,
/// short-circuit, extension failure, or cancellation — and must be
/// idempotent.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Extension name for logging and error reporting
    fn name(&self) -> &'static str;

    /// Dispatch priority; lower runs earlier within each phase
    fn priority(&self) -> u32 {
        100
    }

    async fn on_pre_validate(
        &self,
        _request: &FunctionRequest,
        _ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        Ok(PhaseResult::Continue)
    }

    async fn on_pre_execute(
        &self,
        _request: &FunctionRequest,
        _ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        Ok(PhaseResult::Continue)
    }

    async fn on_post_execute(
        &self,
        _request: &FunctionRequest,
        _ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        Ok(PhaseResult::Continue)
    }

    /// Release any resource this extension opened for the request.
    /// Best-effort: failures are logged by the implementation, never raised.
    async fn cleanup(&self, _ctx: &mut RequestContext) {}
}

/// Priority-ordered extension dispatcher
pub struct ExtensionPipeline {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionPipeline {
    pub fn new() -> Self {
        Self {
            extensions: Vec::new(),
        }
    }

    /// Register an extension; dispatch order follows ascending priority
    pub fn register(&mut self, extension: Arc<dyn Extension>) {
        self.extensions.push(extension);
        self.extensions.sort_by_key(|e| e.priority());
        info!(
            count = self.extensions.len(),
            "Extension registered with pipeline"
        );
    }

    /// Run one phase across all extensions in priority order.
    ///
    /// Returns `Stop` as soon as any extension short-circuits; later
    /// extensions in the phase are not invoked.
    pub async fn run_phase(
        &self,
        phase: Phase,
        request: &FunctionRequest,
        ctx: &mut RequestContext,
    ) -> Result<PhaseResult> {
        for extension in &self.extensions {
            let outcome = match phase {
                Phase::PreValidation => extension.on_pre_validate(request, ctx).await,
                Phase::PreExecution => extension.on_pre_execute(request, ctx).await,
                Phase::PostExecution => extension.on_post_execute(request, ctx).await,
            };

            match outcome {
                Ok(PhaseResult::Continue) => {}
                Ok(PhaseResult::Stop(response)) => {
                    debug!(
                        extension = extension.name(),
                        phase = %phase,
                        request_id = %ctx.request_id,
                        "Extension stopped propagation"
                    );
                    return Ok(PhaseResult::Stop(response));
                }
                Err(err) => {
                    error!(
                        extension = extension.name(),
                        phase = %phase,
                        request_id = %ctx.request_id,
                        error = %err,
                        "Extension phase handler failed"
                    );
                    return Err(err);
                }
            }
        }
        Ok(PhaseResult::Continue)
    }

    /// Run the cleanup pass across all extensions, highest priority first
    /// (resources opened last are released first)
    async fn run_cleanup(&self, ctx: &mut RequestContext) {
        for extension in self.extensions.iter().rev() {
            extension.cleanup(ctx).await;
        }
    }

    /// Execute a full request lifecycle around `handler` (the function
    /// body). The handler only runs when every pre-phase passed; any
    /// short-circuit or failure still goes through the cleanup pass, and
    /// accumulated annotations ride on whatever response is produced.
    pub async fn execute<F, Fut>(&self, request: &FunctionRequest, handler: F) -> FunctionResponse
    where
        F: FnOnce(FunctionRequest, CancellationProbe) -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        let mut ctx = RequestContext::new(&request.request_id);

        for phase in [Phase::PreValidation, Phase::PreExecution] {
            match self.run_phase(phase, request, &mut ctx).await {
                Ok(PhaseResult::Continue) => {}
                Ok(PhaseResult::Stop(response)) => {
                    return self.finalize(response, ctx).await;
                }
                Err(err) => {
                    let response = FunctionResponse::failure(&request.request_id, &err);
                    return self.finalize(response, ctx).await;
                }
            }
        }

        let probe = CancellationProbe {
            token: ctx.cancellation_token.clone(),
        };
        match handler(request.clone(), probe).await {
            Ok(result) => {
                ctx.result = Some(result);
            }
            Err(err) => {
                let response = FunctionResponse::failure(&request.request_id, &err);
                return self.finalize(response, ctx).await;
            }
        }

        let response = match self.run_phase(Phase::PostExecution, request, &mut ctx).await {
            Ok(PhaseResult::Continue) => FunctionResponse::success(
                &request.request_id,
                ctx.result.take().unwrap_or(serde_json::Value::Null),
            ),
            Ok(PhaseResult::Stop(response)) => response,
            Err(err) => FunctionResponse::failure(&request.request_id, &err),
        };

        self.finalize(response, ctx).await
    }

    /// Run cleanup, merge context annotations into the response, and
    /// discard the context
    async fn finalize(
        &self,
        mut response: FunctionResponse,
        mut ctx: RequestContext,
    ) -> FunctionResponse {
        self.run_cleanup(&mut ctx).await;
        for (key, value) in ctx.annotations {
            response.annotations.entry(key).or_insert(value);
        }
        response
    }
}

impl Default for ExtensionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle passed into the function body so it can poll for cancellation
/// without depending on the coordinator directly
#[derive(Debug, Clone)]
pub struct CancellationProbe {
    token: Option<String>,
}

impl CancellationProbe {
    /// The request's cancellation token, when the call opted in
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}
