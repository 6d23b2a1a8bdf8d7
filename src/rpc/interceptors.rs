//! The unary request pipeline for the hub.
//!
//! Stages apply outermost to innermost:
//! Recovery -> Auth -> RateLimit -> Logging -> ErrorMapping -> Idempotency
//! -> handler. The order is load-bearing: auth runs before the rate limiter
//! so buckets can key on the principal, logging wraps error mapping so the
//! recorded code is the mapped wire code, and idempotency sits closest to
//! the handler so auth and rate-limit rejections never consume keys.

use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::db::{AgentKeyStore, AgentPrincipal, HubStore, IdempotencyStore};
use crate::error::{AppError, ErrorKind};
use crate::rpc::ratelimit::TokenBucketRateLimiter;
use crate::rpc::{self as contract, RequestMetadata, auth, idempotency};
use crate::service::HubService;
use crate::service::policy::{DeletePolicyCapRequest, SetPolicyRequest, UpsertPolicyCapRequest};
use crate::service::runs::{
    FinishRunRequest, ListPromptAttemptsRequest, ListRunEventsRequest, ListRunsRequest,
    RecordPromptAttemptRequest, RecordRunEventRequest, StartRunRequest,
};
use crate::service::telemetry::LeaderboardRequest;
use crate::service::{
    AppendChangelogRequest, CreateNoteRequest, CreateTaskRequest, DeleteTaskRequest,
    RecordBenchmarkRequest, UpdateTaskRequest,
};

/// Wire status codes. Nothing else escapes the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Unauthenticated,
    PermissionDenied,
    FailedPrecondition,
    ResourceExhausted,
    Internal,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::NotFound => "not_found",
            StatusCode::AlreadyExists => "already_exists",
            StatusCode::Unauthenticated => "unauthenticated",
            StatusCode::PermissionDenied => "permission_denied",
            StatusCode::FailedPrecondition => "failed_precondition",
            StatusCode::ResourceExhausted => "resource_exhausted",
            StatusCode::Internal => "internal",
        }
    }
}

/// Mapped error surfaced to the transport.
#[derive(Debug, Clone)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_app_error(error: &AppError) -> Self {
        let code = match error.kind {
            ErrorKind::InvalidArgument => StatusCode::InvalidArgument,
            ErrorKind::NotFound => StatusCode::NotFound,
            ErrorKind::Conflict => StatusCode::AlreadyExists,
            ErrorKind::Unauthenticated => StatusCode::Unauthenticated,
            ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            ErrorKind::FailedPrecondition => StatusCode::FailedPrecondition,
            ErrorKind::ResourceExhausted => StatusCode::ResourceExhausted,
            ErrorKind::Internal => StatusCode::Internal,
        };
        Self::new(code, error.message.clone())
    }
}

pub struct HubRpc {
    hub: Arc<HubService>,
    store: Arc<dyn HubStore>,
    limiter: TokenBucketRateLimiter,
    legacy_token: Option<String>,
    allow_legacy_token: bool,
}

impl HubRpc {
    pub fn new(
        hub: Arc<HubService>,
        store: Arc<dyn HubStore>,
        limiter: TokenBucketRateLimiter,
        legacy_token: Option<String>,
        allow_legacy_token: bool,
    ) -> Self {
        Self {
            hub,
            store,
            limiter,
            legacy_token,
            allow_legacy_token,
        }
    }

    /// Entry point for the transport.
    pub async fn handle(
        &self,
        method: &str,
        metadata: &RequestMetadata,
        payload: Value,
    ) -> Result<Value, Status> {
        recover(method, self.authenticated(method, metadata, payload)).await
    }

    async fn authenticated(
        &self,
        method: &str,
        metadata: &RequestMetadata,
        payload: Value,
    ) -> Result<Value, Status> {
        let principal = self.resolve_principal(method, metadata).await?;
        self.rate_limited(method, metadata, principal, payload).await
    }

    async fn resolve_principal(
        &self,
        method: &str,
        metadata: &RequestMetadata,
    ) -> Result<Option<AgentPrincipal>, Status> {
        if !contract::requires_authentication(method) {
            return Ok(None);
        }

        let Some(token) = auth::extract_token(metadata) else {
            return Err(Status::new(
                StatusCode::Unauthenticated,
                "missing authentication token",
            ));
        };

        let mut principal = match self.store.authenticate_agent_key(&token).await {
            Ok(found) => found,
            Err(error) => {
                // A store failure must not downgrade to Unauthenticated.
                tracing::error!(method, error = %error, "auth validation failure");
                return Err(Status::new(
                    StatusCode::Internal,
                    "authentication subsystem unavailable",
                ));
            }
        };

        if principal.is_none()
            && self.allow_legacy_token
            && let Some(expected) = self.legacy_token.as_deref()
            && !expected.is_empty()
            && auth::legacy_token_match(&token, expected)
        {
            principal = Some(auth::legacy_principal());
        }

        let Some(principal) = principal else {
            return Err(Status::new(
                StatusCode::Unauthenticated,
                "invalid authentication token",
            ));
        };

        if let Some(required) = contract::required_scope(method)
            && !auth::has_scope(&principal.scopes, required)
        {
            return Err(Status::new(
                StatusCode::PermissionDenied,
                "api key scope does not allow this method",
            ));
        }

        tracing::debug!(
            method,
            agent_id = %principal.agent_id,
            key_id = %principal.key_id,
            "authenticated"
        );
        Ok(Some(principal))
    }

    async fn rate_limited(
        &self,
        method: &str,
        metadata: &RequestMetadata,
        principal: Option<AgentPrincipal>,
        payload: Value,
    ) -> Result<Value, Status> {
        let (identifier, authenticated) = limit_identifier(principal.as_ref(), metadata);
        if !self.limiter.allow(&identifier, authenticated) {
            return Err(Status::new(
                StatusCode::ResourceExhausted,
                "rate limit exceeded",
            ));
        }
        self.logged(method, metadata, principal, payload).await
    }

    async fn logged(
        &self,
        method: &str,
        metadata: &RequestMetadata,
        principal: Option<AgentPrincipal>,
        payload: Value,
    ) -> Result<Value, Status> {
        let started = Instant::now();
        let result = self.mapped(method, metadata, principal, payload).await;
        let code = match &result {
            Ok(_) => StatusCode::Ok,
            Err(status) => status.code,
        };
        // Method, duration, and final code only; never the payloads.
        tracing::info!(
            method,
            duration_ms = started.elapsed().as_millis() as u64,
            code = code.as_str(),
            "rpc"
        );
        result
    }

    async fn mapped(
        &self,
        method: &str,
        metadata: &RequestMetadata,
        principal: Option<AgentPrincipal>,
        payload: Value,
    ) -> Result<Value, Status> {
        self.idempotent(method, metadata, principal, payload)
            .await
            .map_err(|error| Status::from_app_error(&error))
    }

    async fn idempotent(
        &self,
        method: &str,
        metadata: &RequestMetadata,
        principal: Option<AgentPrincipal>,
        payload: Value,
    ) -> Result<Value, AppError> {
        if !contract::is_write_method(method) {
            return self.dispatch(method, principal.as_ref(), payload).await;
        }
        let Some(key) = idempotency::extract_idempotency_key(&payload, metadata) else {
            return self.dispatch(method, principal.as_ref(), payload).await;
        };

        let request_hash = idempotency::canonical_request_hash(&payload)?;
        let (record, created) = self
            .store
            .reserve_idempotency_key(method, &key, &request_hash)
            .await?;
        if !created {
            if record.request_hash != request_hash {
                return Err(AppError::conflict(
                    "idempotency_key has already been used with a different request payload",
                ));
            }
            if !record.completed {
                return Err(AppError::failed_precondition(
                    "idempotency key is already in progress",
                ));
            }
            return decode_idempotent_response(&record.response_payload);
        }

        match self.dispatch(method, principal.as_ref(), payload).await {
            Ok(response) => {
                let encoded = match encode_idempotent_response(&response) {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        self.release(method, &key).await;
                        return Err(error);
                    }
                };
                self.store
                    .complete_idempotency_key(method, &key, &encoded)
                    .await?;
                Ok(response)
            }
            Err(error) => {
                self.release(method, &key).await;
                Err(error)
            }
        }
    }

    async fn release(&self, method: &str, key: &str) {
        if let Err(error) = self.store.release_idempotency_key(method, key).await {
            tracing::warn!(method, error = %error, "failed to release idempotency key");
        }
    }

    /// Routes the request to the hub operation. The principal is threaded
    /// through for request-scoped access even though handlers currently
    /// only act on payloads.
    async fn dispatch(
        &self,
        method: &str,
        _principal: Option<&AgentPrincipal>,
        payload: Value,
    ) -> Result<Value, AppError> {
        match method {
            contract::METHOD_GET_HEALTH => Ok(self.hub.health()),
            contract::METHOD_GET_SUMMARY => to_value(self.hub.summary().await?),
            contract::METHOD_EXPORT_STATE => to_value(self.hub.export_state().await?),

            contract::METHOD_CREATE_TASK => {
                to_value(self.hub.create_task(decode::<CreateTaskRequest>(payload)?).await?)
            }
            contract::METHOD_UPDATE_TASK => {
                to_value(self.hub.update_task(decode::<UpdateTaskRequest>(payload)?).await?)
            }
            contract::METHOD_DELETE_TASK => {
                self.hub.delete_task(decode::<DeleteTaskRequest>(payload)?).await?;
                Ok(json!({"ok": true}))
            }
            contract::METHOD_LIST_TASKS => to_value(self.hub.list_tasks().await?),

            contract::METHOD_CREATE_NOTE => {
                to_value(self.hub.create_note(decode::<CreateNoteRequest>(payload)?).await?)
            }
            contract::METHOD_LIST_NOTES => to_value(self.hub.list_notes().await?),

            contract::METHOD_APPEND_CHANGELOG => to_value(
                self.hub
                    .append_changelog(decode::<AppendChangelogRequest>(payload)?)
                    .await?,
            ),
            contract::METHOD_LIST_CHANGELOG => to_value(self.hub.list_changelog().await?),

            contract::METHOD_RECORD_BENCHMARK => to_value(
                self.hub
                    .record_benchmark(decode::<RecordBenchmarkRequest>(payload)?)
                    .await?,
            ),
            contract::METHOD_LIST_BENCHMARKS => to_value(self.hub.list_benchmarks().await?),

            contract::METHOD_START_RUN => {
                to_value(self.hub.start_run(decode::<StartRunRequest>(payload)?).await?)
            }
            contract::METHOD_FINISH_RUN => {
                to_value(self.hub.finish_run(decode::<FinishRunRequest>(payload)?).await?)
            }
            contract::METHOD_LIST_RUNS => {
                to_value(self.hub.list_runs(decode::<ListRunsRequest>(payload)?).await?)
            }

            contract::METHOD_RECORD_PROMPT_ATTEMPT => to_value(
                self.hub
                    .record_prompt_attempt(decode::<RecordPromptAttemptRequest>(payload)?)
                    .await?,
            ),
            contract::METHOD_LIST_PROMPT_ATTEMPTS => to_value(
                self.hub
                    .list_prompt_attempts(decode::<ListPromptAttemptsRequest>(payload)?)
                    .await?,
            ),

            contract::METHOD_RECORD_RUN_EVENT => to_value(
                self.hub
                    .record_run_event(decode::<RecordRunEventRequest>(payload)?)
                    .await?,
            ),
            contract::METHOD_LIST_RUN_EVENTS => to_value(
                self.hub
                    .list_run_events(decode::<ListRunEventsRequest>(payload)?)
                    .await?,
            ),

            contract::METHOD_GET_TELEMETRY_SUMMARY => to_value(self.hub.telemetry_summary().await?),
            contract::METHOD_GET_LEADERBOARD => {
                to_value(self.hub.leaderboard(decode::<LeaderboardRequest>(payload)?).await?)
            }

            contract::METHOD_GET_POLICY => to_value(self.hub.get_policy().await?),
            contract::METHOD_SET_POLICY => {
                to_value(self.hub.set_policy(decode::<SetPolicyRequest>(payload)?).await?)
            }
            contract::METHOD_LIST_POLICY_CAPS => to_value(self.hub.list_policy_caps().await?),
            contract::METHOD_UPSERT_POLICY_CAP => to_value(
                self.hub
                    .upsert_policy_cap(decode::<UpsertPolicyCapRequest>(payload)?)
                    .await?,
            ),
            contract::METHOD_DELETE_POLICY_CAP => {
                self.hub
                    .delete_policy_cap(decode::<DeletePolicyCapRequest>(payload)?)
                    .await?;
                Ok(json!({"ok": true}))
            }

            _ => Err(AppError::not_found(format!("unknown rpc method {method}"))),
        }
    }
}

/// Recovery stage: a panic anywhere below becomes Internal, with the stack
/// trace written to the operator log and never to the client.
async fn recover<F>(method: &str, inner: F) -> Result<Value, Status>
where
    F: Future<Output = Result<Value, Status>>,
{
    match AssertUnwindSafe(inner).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            tracing::error!(
                method,
                panic = %detail,
                backtrace = %Backtrace::force_capture(),
                "panic recovered in rpc handler"
            );
            Err(Status::new(StatusCode::Internal, "internal server error"))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Authenticated callers are limited per key, anonymous ones per host.
fn limit_identifier(
    principal: Option<&AgentPrincipal>,
    metadata: &RequestMetadata,
) -> (String, bool) {
    match principal {
        Some(principal) if !principal.key_id.trim().is_empty() => {
            (format!("key:{}", principal.key_id), true)
        }
        _ => (format!("ip:{}", metadata.remote_host()), false),
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, AppError> {
    serde_json::from_value(payload)
        .map_err(|e| AppError::invalid_argument(format!("malformed request payload: {e}")))
}

fn to_value<T: Serialize>(response: T) -> Result<Value, AppError> {
    serde_json::to_value(response)
        .map_err(|e| AppError::internal_with("failed to encode response", e))
}

fn encode_idempotent_response(response: &Value) -> Result<String, AppError> {
    if !response.is_object() {
        return Err(AppError::internal(
            "idempotency requires object responses for write RPCs",
        ));
    }
    serde_json::to_string(response)
        .map_err(|e| AppError::internal_with("failed to encode idempotent response", e))
}

fn decode_idempotent_response(raw: &str) -> Result<Value, AppError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::internal("stored idempotent response is empty"));
    }
    let decoded: Value = serde_json::from_str(raw)
        .map_err(|e| AppError::internal_with("failed to decode stored idempotent response", e))?;
    if !decoded.is_object() {
        return Err(AppError::internal(
            "stored idempotent response payload is invalid",
        ));
    }
    Ok(decoded)
}
