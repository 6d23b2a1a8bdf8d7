//! Run lifecycle engine and the policy enforcement gate.
//!
//! `record_prompt_attempt` is the critical path: every attempt is checked
//! against the effective limits resolved from global policy and the most
//! specific matching cap before it is persisted.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::db::{PolicyStore, RunStore};
use crate::domain::{
    AgentRun, AttemptFilter, AttemptOutcome, EventFilter, EventLevel, PolicyCap, PromptAttempt,
    ProviderType, RunEvent, RunFilter, RunStatus,
};
use crate::error::AppError;
use crate::service::HubService;
use crate::service::policy::{EffectiveLimits, resolve_effective_limits, select_policy_cap};

pub const EVENT_TYPE_POLICY_CAP_VIOLATION_DRY_RUN: &str = "policy_cap_violation_dry_run";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRunRequest {
    pub task_id: String,
    pub workflow: String,
    pub agent_id: String,
    pub prompt_version: String,
    pub model_policy: String,
    pub max_retries: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FinishRunRequest {
    pub run_id: String,
    pub status: String,
    pub last_error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecordPromptAttemptRequest {
    pub run_id: String,
    pub attempt_number: i64,
    pub workflow: String,
    pub agent_id: String,
    pub provider_type: String,
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    pub prompt_hash: String,
    pub outcome: String,
    pub error_type: String,
    pub error_message: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub quality_score: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecordRunEventRequest {
    pub run_id: String,
    pub event_type: String,
    pub level: String,
    pub message: String,
    pub data_payload: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListRunsRequest {
    pub run_id: String,
    pub task_id: String,
    pub workflow: String,
    pub agent_id: String,
    pub status: String,
    pub prompt_version: String,
    pub started_after: String,
    pub started_before: String,
    pub limit: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListPromptAttemptsRequest {
    pub run_id: String,
    pub workflow: String,
    pub agent_id: String,
    pub model: String,
    pub outcome: String,
    pub prompt_version: String,
    pub created_after: String,
    pub created_before: String,
    pub limit: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListRunEventsRequest {
    pub run_id: String,
    pub event_type: String,
    pub level: String,
    pub created_after: String,
    pub created_before: String,
    pub limit: i64,
}

/// Outcome of one violated cap check. A violation whose limit originated
/// from a dry-run cap is observed (recorded as a run event) and the request
/// continues; anything else blocks with ResourceExhausted.
enum CapVerdict<'a> {
    DryRun {
        cap: &'a PolicyCap,
        message: &'static str,
    },
    Blocked {
        message: String,
    },
}

fn cap_verdict<'a>(
    cap: Option<&'a PolicyCap>,
    cap_originated: bool,
    limits: &EffectiveLimits,
    dry_message: &'static str,
    block_message: &str,
) -> CapVerdict<'a> {
    match cap {
        Some(cap) if cap_originated && cap.dry_run => CapVerdict::DryRun {
            cap,
            message: dry_message,
        },
        _ => CapVerdict::Blocked {
            message: format!("{block_message} ({})", limits.source),
        },
    }
}

fn kill_switch_reason(raw: &str) -> String {
    let reason = raw.trim();
    if reason.is_empty() {
        "kill switch is enabled".to_string()
    } else {
        reason.to_string()
    }
}

fn parse_filter_ts(raw: &str, field: &str) -> Result<Option<DateTime<Utc>>, AppError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| Some(dt.with_timezone(&Utc)))
        .map_err(|_| AppError::invalid_argument(format!("{field} must be RFC3339 timestamp")))
}

impl HubService {
    pub async fn start_run(&self, request: StartRunRequest) -> Result<AgentRun, AppError> {
        let workflow = request.workflow.trim();
        let agent_id = request.agent_id.trim();
        if workflow.is_empty() || agent_id.is_empty() {
            return Err(AppError::invalid_argument(
                "workflow and agent_id are required",
            ));
        }
        if request.max_retries < 0 {
            return Err(AppError::invalid_argument("max_retries must be non-negative"));
        }

        let policy = self.store.get_policy().await?;
        if policy.kill_switch {
            return Err(AppError::failed_precondition(kill_switch_reason(
                &policy.kill_switch_reason,
            )));
        }

        let run = AgentRun {
            id: self.ids.new_id("run"),
            task_id: request.task_id.trim().to_string(),
            workflow: workflow.to_string(),
            agent_id: agent_id.to_string(),
            prompt_version: request.prompt_version.trim().to_string(),
            model_policy: request.model_policy.trim().to_string(),
            status: RunStatus::Running,
            max_retries: request.max_retries,
            total_attempts: 0,
            success_attempts: 0,
            failed_attempts: 0,
            total_tokens_in: 0,
            total_tokens_out: 0,
            total_cost_usd: 0.0,
            duration_ms: 0,
            last_error: String::new(),
            started_at: self.clock.now(),
            finished_at: None,
        };
        self.store.insert_run(&run).await?;
        Ok(run)
    }

    /// Rolling counters are recomputed from the stored attempts, never from
    /// the client-supplied attempt numbers.
    pub async fn finish_run(&self, request: FinishRunRequest) -> Result<AgentRun, AppError> {
        let run_id = request.run_id.trim();
        if run_id.is_empty() {
            return Err(AppError::invalid_argument("run_id is required"));
        }
        let status = match request.status.trim() {
            "" => RunStatus::Completed,
            raw => RunStatus::parse(raw)?,
        };
        if status == RunStatus::Running {
            return Err(AppError::invalid_argument(
                "status must be one of: completed, failed, cancelled",
            ));
        }

        let mut run = self.lookup_run(run_id).await?;

        let now = self.clock.now();
        run.status = status;
        run.finished_at = Some(now);
        run.last_error = request.last_error.trim().to_string();
        run.duration_ms = (now - run.started_at).num_milliseconds().max(0);

        run.total_attempts = 0;
        run.success_attempts = 0;
        run.failed_attempts = 0;
        run.total_tokens_in = 0;
        run.total_tokens_out = 0;
        run.total_cost_usd = 0.0;
        let attempts = self.store.list_prompt_attempts(run_id).await?;
        for attempt in &attempts {
            run.total_attempts += 1;
            run.total_tokens_in += attempt.tokens_in;
            run.total_tokens_out += attempt.tokens_out;
            run.total_cost_usd += attempt.cost_usd;
            if attempt.outcome == AttemptOutcome::Success {
                run.success_attempts += 1;
            } else {
                run.failed_attempts += 1;
            }
        }

        self.store.update_run(&run).await?;
        Ok(run)
    }

    pub async fn record_prompt_attempt(
        &self,
        request: RecordPromptAttemptRequest,
    ) -> Result<PromptAttempt, AppError> {
        let run_id = request.run_id.trim();
        let outcome = request.outcome.trim();
        let model = request.model.trim();
        let provider = request.provider.trim();
        let provider_type = match request.provider_type.trim() {
            "" => ProviderType::Api,
            raw => ProviderType::parse(raw)?,
        };
        if run_id.is_empty() || outcome.is_empty() || model.is_empty() {
            return Err(AppError::invalid_argument(
                "run_id, outcome, and model are required",
            ));
        }
        if request.attempt_number <= 0 {
            return Err(AppError::invalid_argument(
                "attempt_number must be greater than 0",
            ));
        }
        let outcome = AttemptOutcome::parse(outcome)?;
        if request.tokens_in < 0
            || request.tokens_out < 0
            || request.cost_usd < 0.0
            || request.latency_ms < 0
        {
            return Err(AppError::invalid_argument(
                "tokens, cost, and latency must be non-negative",
            ));
        }

        let policy = self.store.get_policy().await?;
        if policy.kill_switch {
            return Err(AppError::failed_precondition(kill_switch_reason(
                &policy.kill_switch_reason,
            )));
        }

        let caps = self.store.list_policy_caps().await?;
        let cap = select_policy_cap(&caps, provider_type.as_str(), provider, model);
        let limits = resolve_effective_limits(&policy, cap);

        let run = self.lookup_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(AppError::failed_precondition("run is not in running state"));
        }

        let cap_overrides_attempt_latency =
            cap.is_some_and(|cap| cap.max_latency_per_attempt_ms > 0);
        let cap_overrides_run_cost = cap.is_some_and(|cap| cap.max_cost_per_run_usd > 0.0);
        let cap_overrides_run_attempts = cap.is_some_and(|cap| cap.max_attempts_per_run > 0);
        let cap_overrides_run_tokens = cap.is_some_and(|cap| cap.max_tokens_per_run > 0);
        let attempt_tokens = request.tokens_in + request.tokens_out;

        if limits.max_latency_per_attempt_ms > 0
            && request.latency_ms > limits.max_latency_per_attempt_ms
        {
            self.apply_cap_verdict(
                run_id,
                cap_verdict(
                    cap,
                    cap_overrides_attempt_latency,
                    &limits,
                    "attempt latency exceeds cap limit",
                    "attempt latency exceeds policy cap",
                ),
            )
            .await?;
        }
        // The per-attempt cost and token limits only ever originate from the cap.
        if limits.max_cost_per_attempt_usd > 0.0 && request.cost_usd > limits.max_cost_per_attempt_usd
        {
            self.apply_cap_verdict(
                run_id,
                cap_verdict(
                    cap,
                    true,
                    &limits,
                    "attempt cost exceeds cap limit",
                    "attempt cost exceeds policy cap",
                ),
            )
            .await?;
        }
        if limits.max_tokens_per_attempt > 0 && attempt_tokens > limits.max_tokens_per_attempt {
            self.apply_cap_verdict(
                run_id,
                cap_verdict(
                    cap,
                    true,
                    &limits,
                    "attempt tokens exceed cap limit",
                    "attempt tokens exceed policy cap",
                ),
            )
            .await?;
        }

        let existing = self.store.list_prompt_attempts(run_id).await?;
        if limits.max_attempts_per_run > 0
            && existing.len() as i64 + 1 > limits.max_attempts_per_run
        {
            self.apply_cap_verdict(
                run_id,
                cap_verdict(
                    cap,
                    cap_overrides_run_attempts,
                    &limits,
                    "run exceeds max attempts cap",
                    "run exceeds max attempts cap",
                ),
            )
            .await?;
        }
        if limits.max_cost_per_run_usd > 0.0 || limits.max_tokens_per_run > 0 {
            let mut total_cost: f64 = existing.iter().map(|a| a.cost_usd).sum();
            let mut total_tokens: i64 = existing.iter().map(|a| a.tokens_in + a.tokens_out).sum();
            total_cost += request.cost_usd;
            total_tokens += attempt_tokens;

            if limits.max_cost_per_run_usd > 0.0 && total_cost > limits.max_cost_per_run_usd {
                self.apply_cap_verdict(
                    run_id,
                    cap_verdict(
                        cap,
                        cap_overrides_run_cost,
                        &limits,
                        "run exceeds max cost cap",
                        "run exceeds max cost cap",
                    ),
                )
                .await?;
            }
            if limits.max_tokens_per_run > 0 && total_tokens > limits.max_tokens_per_run {
                self.apply_cap_verdict(
                    run_id,
                    cap_verdict(
                        cap,
                        cap_overrides_run_tokens,
                        &limits,
                        "run exceeds max tokens cap",
                        "run exceeds max tokens cap",
                    ),
                )
                .await?;
            }
        }

        let attempt = PromptAttempt {
            id: self.ids.new_id("pat"),
            run_id: run_id.to_string(),
            attempt_number: request.attempt_number,
            workflow: request.workflow.trim().to_string(),
            agent_id: request.agent_id.trim().to_string(),
            provider_type,
            provider: provider.to_string(),
            model: model.to_string(),
            prompt_version: request.prompt_version.trim().to_string(),
            prompt_hash: request.prompt_hash.trim().to_string(),
            outcome,
            error_type: request.error_type.trim().to_string(),
            error_message: request.error_message.trim().to_string(),
            tokens_in: request.tokens_in,
            tokens_out: request.tokens_out,
            cost_usd: request.cost_usd,
            latency_ms: request.latency_ms,
            quality_score: request.quality_score,
            created_at: self.clock.now(),
        };
        self.store.insert_prompt_attempt(&attempt).await?;
        Ok(attempt)
    }

    /// Events are valid for terminal runs too; only existence is required.
    pub async fn record_run_event(
        &self,
        request: RecordRunEventRequest,
    ) -> Result<RunEvent, AppError> {
        let run_id = request.run_id.trim();
        let event_type = request.event_type.trim();
        if run_id.is_empty() || event_type.is_empty() {
            return Err(AppError::invalid_argument(
                "run_id and event_type are required",
            ));
        }
        let level = match request.level.trim() {
            "" => EventLevel::Info,
            raw => EventLevel::parse(raw)?,
        };

        self.lookup_run(run_id).await?;

        let event = RunEvent {
            id: self.ids.new_id("evt"),
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            level,
            message: request.message.trim().to_string(),
            data_payload: request.data_payload.trim().to_string(),
            created_at: self.clock.now(),
        };
        self.store.insert_run_event(&event).await?;
        Ok(event)
    }

    pub async fn list_runs(&self, request: ListRunsRequest) -> Result<Vec<AgentRun>, AppError> {
        if request.limit < 0 {
            return Err(AppError::invalid_argument("limit must be non-negative"));
        }
        let filter = RunFilter {
            run_id: request.run_id.trim().to_string(),
            task_id: request.task_id.trim().to_string(),
            workflow: request.workflow.trim().to_string(),
            agent_id: request.agent_id.trim().to_string(),
            status: request.status.trim().to_string(),
            prompt_version: request.prompt_version.trim().to_string(),
            started_after: parse_filter_ts(&request.started_after, "started_after")?,
            started_before: parse_filter_ts(&request.started_before, "started_before")?,
            limit: request.limit,
        };
        let mut items = self.store.list_runs_filtered(&filter).await?;
        items.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(items)
    }

    pub async fn list_prompt_attempts(
        &self,
        request: ListPromptAttemptsRequest,
    ) -> Result<Vec<PromptAttempt>, AppError> {
        if request.limit < 0 {
            return Err(AppError::invalid_argument("limit must be non-negative"));
        }
        let filter = AttemptFilter {
            run_id: request.run_id.trim().to_string(),
            workflow: request.workflow.trim().to_string(),
            agent_id: request.agent_id.trim().to_string(),
            model: request.model.trim().to_string(),
            outcome: request.outcome.trim().to_string(),
            prompt_version: request.prompt_version.trim().to_string(),
            created_after: parse_filter_ts(&request.created_after, "created_after")?,
            created_before: parse_filter_ts(&request.created_before, "created_before")?,
            limit: request.limit,
        };
        let mut items = self.store.list_prompt_attempts_filtered(&filter).await?;
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(items)
    }

    pub async fn list_run_events(
        &self,
        request: ListRunEventsRequest,
    ) -> Result<Vec<RunEvent>, AppError> {
        if request.limit < 0 {
            return Err(AppError::invalid_argument("limit must be non-negative"));
        }
        let filter = EventFilter {
            run_id: request.run_id.trim().to_string(),
            event_type: request.event_type.trim().to_string(),
            level: request.level.trim().to_string(),
            created_after: parse_filter_ts(&request.created_after, "created_after")?,
            created_before: parse_filter_ts(&request.created_before, "created_before")?,
            limit: request.limit,
        };
        let mut items = self.store.list_run_events_filtered(&filter).await?;
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(items)
    }

    async fn lookup_run(&self, run_id: &str) -> Result<AgentRun, AppError> {
        let runs = self
            .store
            .list_runs_filtered(&RunFilter {
                run_id: run_id.to_string(),
                limit: 1,
                ..RunFilter::default()
            })
            .await?;
        runs.into_iter()
            .next()
            .ok_or_else(|| AppError::not_found("run not found"))
    }

    async fn apply_cap_verdict(
        &self,
        run_id: &str,
        verdict: CapVerdict<'_>,
    ) -> Result<(), AppError> {
        match verdict {
            CapVerdict::DryRun { cap, message } => {
                self.record_dry_run_violation(run_id, cap, message).await;
                Ok(())
            }
            CapVerdict::Blocked { message } => Err(AppError::resource_exhausted(message)),
        }
    }

    /// Best-effort: a failed event insert must not block the attempt.
    async fn record_dry_run_violation(&self, run_id: &str, cap: &PolicyCap, message: &str) {
        let payload = json!({
            "cap_id": cap.id,
            "cap_name": cap.name,
            "provider_type": cap.provider_type,
            "provider": cap.provider,
            "model": cap.model,
            "priority": cap.priority,
            "dry_run": cap.dry_run,
        });
        let event = RunEvent {
            id: self.ids.new_id("evt"),
            run_id: run_id.to_string(),
            event_type: EVENT_TYPE_POLICY_CAP_VIOLATION_DRY_RUN.to_string(),
            level: EventLevel::Warn,
            message: message.to_string(),
            data_payload: payload.to_string(),
            created_at: self.clock.now(),
        };
        if let Err(error) = self.store.insert_run_event(&event).await {
            tracing::warn!(run_id, cap_id = %cap.id, error = %error, "failed to record dry-run cap violation");
        }
    }
}
