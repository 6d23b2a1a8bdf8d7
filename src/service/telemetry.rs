//! Telemetry aggregation: the fleet-wide summary and the leaderboard.

use std::collections::HashMap;

use chrono::Duration;
use serde::Deserialize;

use crate::db::RunStore;
use crate::domain::{
    AttemptFilter, AttemptOutcome, LeaderboardEntry, PromptAttempt, RunStatus, TelemetrySummary,
};
use crate::error::AppError;
use crate::service::HubService;

const DEFAULT_LEADERBOARD_LIMIT: i64 = 20;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LeaderboardRequest {
    pub workflow: String,
    pub model: String,
    pub prompt_version: String,
    /// 0 means all time.
    pub window_days: i64,
    /// Absent defaults to 20; an explicit 0 returns all groups.
    pub limit: Option<i64>,
}

#[derive(Default)]
struct LeaderboardAggregate {
    attempts: i64,
    successes: i64,
    failures: i64,
    total_cost: f64,
    total_latency: i64,
}

impl HubService {
    pub async fn telemetry_summary(&self) -> Result<TelemetrySummary, AppError> {
        let runs = self.store.list_runs().await?;
        let attempts = self.store.list_prompt_attempts("").await?;
        let events = self.store.list_run_events("").await?;

        let mut summary = TelemetrySummary::default();
        summary.counts.runs = runs.len() as i64;
        summary.counts.events = events.len() as i64;

        for run in &runs {
            match run.status {
                RunStatus::Running => summary.counts.running_runs += 1,
                RunStatus::Completed => summary.counts.completed_runs += 1,
                RunStatus::Failed => summary.counts.failed_runs += 1,
                RunStatus::Cancelled => summary.counts.cancelled_runs += 1,
            }
        }

        for attempt in &attempts {
            summary.counts.attempts += 1;
            summary.totals.tokens_in += attempt.tokens_in;
            summary.totals.tokens_out += attempt.tokens_out;
            summary.totals.cost_usd += attempt.cost_usd;
            summary.totals.latency_ms += attempt.latency_ms;

            if attempt.outcome == AttemptOutcome::Success {
                summary.counts.success_attempts += 1;
            } else {
                summary.counts.failed_attempts += 1;
            }
            if attempt.attempt_number > 1 {
                summary.counts.retries += 1;
            }
        }

        if summary.counts.attempts > 0 {
            let attempts = summary.counts.attempts as f64;
            summary.averages.attempt_latency_ms = summary.totals.latency_ms as f64 / attempts;
            summary.averages.cost_per_attempt = summary.totals.cost_usd / attempts;
            summary.averages.success_rate = summary.counts.success_attempts as f64 / attempts;
        }

        Ok(summary)
    }

    pub async fn leaderboard(
        &self,
        request: LeaderboardRequest,
    ) -> Result<Vec<LeaderboardEntry>, AppError> {
        let limit = request.limit.unwrap_or(DEFAULT_LEADERBOARD_LIMIT);
        if limit < 0 {
            return Err(AppError::invalid_argument("limit must be non-negative"));
        }
        if request.window_days < 0 {
            return Err(AppError::invalid_argument("window_days must be non-negative"));
        }

        let mut filter = AttemptFilter {
            workflow: request.workflow.trim().to_string(),
            model: request.model.trim().to_string(),
            prompt_version: request.prompt_version.trim().to_string(),
            ..AttemptFilter::default()
        };
        if request.window_days > 0 {
            filter.created_after = Some(self.clock.now() - Duration::days(request.window_days));
        }
        let attempts = self.store.list_prompt_attempts_filtered(&filter).await?;

        Ok(rank_leaderboard(&attempts, limit))
    }
}

/// Groups attempts by (workflow, prompt_version, model) and ranks them by
/// `score = success_rate*100 - average_cost*100 - average_latency/1000`,
/// descending; ties break on higher success rate, then prompt_version
/// ascending. A limit of 0 returns all groups.
fn rank_leaderboard(attempts: &[PromptAttempt], limit: i64) -> Vec<LeaderboardEntry> {
    let mut grouped: HashMap<(String, String, String), LeaderboardAggregate> = HashMap::new();
    for attempt in attempts {
        let key = (
            attempt.workflow.clone(),
            attempt.prompt_version.clone(),
            attempt.model.clone(),
        );
        let entry = grouped.entry(key).or_default();
        entry.attempts += 1;
        entry.total_cost += attempt.cost_usd;
        entry.total_latency += attempt.latency_ms;
        if attempt.outcome == AttemptOutcome::Success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }

    let mut out: Vec<LeaderboardEntry> = grouped
        .into_iter()
        .filter(|(_, aggregate)| aggregate.attempts > 0)
        .map(|((workflow, prompt_version, model), aggregate)| {
            let attempts = aggregate.attempts as f64;
            let success_rate = aggregate.successes as f64 / attempts;
            let average_cost_usd = aggregate.total_cost / attempts;
            let average_latency_ms = aggregate.total_latency as f64 / attempts;
            let score = success_rate * 100.0 - average_cost_usd * 100.0 - average_latency_ms / 1000.0;
            LeaderboardEntry {
                workflow,
                prompt_version,
                model,
                attempts: aggregate.attempts,
                success_attempts: aggregate.successes,
                failed_attempts: aggregate.failures,
                success_rate,
                average_cost_usd,
                average_latency_ms,
                score,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.success_rate.total_cmp(&a.success_rate))
            .then_with(|| a.prompt_version.cmp(&b.prompt_version))
    });

    if limit > 0 && out.len() as i64 > limit {
        out.truncate(limit as usize);
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::ProviderType;
    use crate::error::ErrorKind;
    use crate::service::runs::{FinishRunRequest, RecordPromptAttemptRequest, StartRunRequest};
    use crate::service::testutil::memory_hub;

    fn attempt(prompt_version: &str, outcome: AttemptOutcome, cost: f64, latency: i64) -> PromptAttempt {
        PromptAttempt {
            id: format!("pat_{prompt_version}_{latency}_{cost}"),
            run_id: "run_x".to_string(),
            attempt_number: 1,
            workflow: "w".to_string(),
            agent_id: "a".to_string(),
            provider_type: ProviderType::Api,
            provider: String::new(),
            model: "m".to_string(),
            prompt_version: prompt_version.to_string(),
            prompt_hash: String::new(),
            outcome,
            error_type: String::new(),
            error_message: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: cost,
            latency_ms: latency,
            quality_score: 0.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_rank_orders_by_score_then_success_rate_then_version() {
        // v1 and v2 tie on every metric; v3 scores lower.
        let attempts = vec![
            attempt("v1", AttemptOutcome::Success, 0.01, 100),
            attempt("v2", AttemptOutcome::Success, 0.01, 100),
            attempt("v3", AttemptOutcome::Success, 0.01, 100),
            attempt("v3", AttemptOutcome::Failed, 0.01, 100),
        ];
        let ranked = rank_leaderboard(&attempts, 0);
        let versions: Vec<&str> = ranked.iter().map(|e| e.prompt_version.as_str()).collect();
        assert_eq!(versions, vec!["v1", "v2", "v3"]);
        assert_eq!(ranked[2].success_rate, 0.5);
    }

    #[test]
    fn test_rank_score_formula() {
        let attempts = vec![
            attempt("v1", AttemptOutcome::Success, 0.02, 400),
            attempt("v1", AttemptOutcome::Failed, 0.04, 200),
        ];
        let ranked = rank_leaderboard(&attempts, 0);
        assert_eq!(ranked.len(), 1);
        let entry = &ranked[0];
        assert_eq!(entry.attempts, 2);
        assert!((entry.success_rate - 0.5).abs() < 1e-9);
        assert!((entry.average_cost_usd - 0.03).abs() < 1e-9);
        assert!((entry.average_latency_ms - 300.0).abs() < 1e-9);
        let expected = 0.5 * 100.0 - 0.03 * 100.0 - 300.0 / 1000.0;
        assert!((entry.score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rank_limit_truncates_and_zero_means_all() {
        let attempts: Vec<PromptAttempt> = (0..30)
            .map(|i| attempt(&format!("v{i:02}"), AttemptOutcome::Success, 0.0, i))
            .collect();
        assert_eq!(rank_leaderboard(&attempts, 5).len(), 5);
        assert_eq!(rank_leaderboard(&attempts, 0).len(), 30);
    }

    #[tokio::test]
    async fn test_leaderboard_defaults_limit_to_twenty() {
        let (hub, _) = memory_hub().await;
        let run = hub
            .start_run(StartRunRequest {
                workflow: "w".to_string(),
                agent_id: "a1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        for i in 0..25 {
            hub.record_prompt_attempt(RecordPromptAttemptRequest {
                run_id: run.id.clone(),
                attempt_number: 1,
                model: "m".to_string(),
                outcome: "success".to_string(),
                prompt_version: format!("v{i:02}"),
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let defaulted = hub.leaderboard(LeaderboardRequest::default()).await.unwrap();
        assert_eq!(defaulted.len(), 20);

        let all = hub
            .leaderboard(LeaderboardRequest {
                limit: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 25);

        let err = hub
            .leaderboard(LeaderboardRequest {
                limit: Some(-1),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = hub
            .leaderboard(LeaderboardRequest {
                window_days: -1,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_leaderboard_filters_by_workflow() {
        let (hub, _) = memory_hub().await;
        for workflow in ["alpha", "beta"] {
            let run = hub
                .start_run(StartRunRequest {
                    workflow: workflow.to_string(),
                    agent_id: "a1".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
            hub.record_prompt_attempt(RecordPromptAttemptRequest {
                run_id: run.id.clone(),
                attempt_number: 1,
                workflow: workflow.to_string(),
                model: "m".to_string(),
                outcome: "success".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let entries = hub
            .leaderboard(LeaderboardRequest {
                workflow: "alpha".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].workflow, "alpha");
    }

    #[tokio::test]
    async fn test_telemetry_summary_counts_totals_and_averages() {
        let (hub, _) = memory_hub().await;

        // Averages are zero with no attempts.
        let empty = hub.telemetry_summary().await.unwrap();
        assert_eq!(empty.averages.success_rate, 0.0);
        assert_eq!(empty.averages.attempt_latency_ms, 0.0);

        let run = hub
            .start_run(StartRunRequest {
                workflow: "w".to_string(),
                agent_id: "a1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        hub.record_prompt_attempt(RecordPromptAttemptRequest {
            run_id: run.id.clone(),
            attempt_number: 1,
            model: "m".to_string(),
            outcome: "success".to_string(),
            tokens_in: 10,
            tokens_out: 20,
            cost_usd: 0.02,
            latency_ms: 100,
            ..Default::default()
        })
        .await
        .unwrap();
        hub.record_prompt_attempt(RecordPromptAttemptRequest {
            run_id: run.id.clone(),
            attempt_number: 2,
            model: "m".to_string(),
            outcome: "failed".to_string(),
            tokens_in: 5,
            tokens_out: 5,
            cost_usd: 0.04,
            latency_ms: 300,
            ..Default::default()
        })
        .await
        .unwrap();
        hub.finish_run(FinishRunRequest {
            run_id: run.id.clone(),
            status: "failed".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let summary = hub.telemetry_summary().await.unwrap();
        assert_eq!(summary.counts.runs, 1);
        assert_eq!(summary.counts.failed_runs, 1);
        assert_eq!(summary.counts.attempts, 2);
        assert_eq!(summary.counts.success_attempts, 1);
        assert_eq!(summary.counts.failed_attempts, 1);
        assert_eq!(summary.counts.retries, 1);
        assert_eq!(summary.totals.tokens_in, 15);
        assert_eq!(summary.totals.latency_ms, 400);
        assert!((summary.averages.attempt_latency_ms - 200.0).abs() < 1e-9);
        assert!((summary.averages.cost_per_attempt - 0.03).abs() < 1e-9);
        assert!((summary.averages.success_rate - 0.5).abs() < 1e-9);
    }
}
