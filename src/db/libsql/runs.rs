//! RunStore implementation for LibSqlBackend.
//!
//! Filtered lists build their WHERE clause dynamically; string-typed
//! timestamp comparisons are chronological because storage uses a
//! fixed-width RFC 3339 format.

use async_trait::async_trait;
use libsql::params;

use super::{
    LibSqlBackend, fmt_ts, get_f64, get_i64, get_opt_ts, get_text, get_ts, opt_ts_value, text,
};
use crate::db::RunStore;
use crate::domain::{
    AgentRun, AttemptFilter, AttemptOutcome, EventFilter, EventLevel, PromptAttempt, ProviderType,
    RunEvent, RunFilter, RunStatus,
};
use crate::error::AppError;

const RUN_COLUMNS: &str = "\
    id, task_id, workflow, agent_id, prompt_version, model_policy, status, \
    max_retries, total_attempts, success_attempts, failed_attempts, \
    total_tokens_in, total_tokens_out, total_cost_usd, duration_ms, \
    last_error, started_at, finished_at";

const ATTEMPT_COLUMNS: &str = "\
    id, run_id, attempt_number, workflow, agent_id, provider_type, provider, \
    model, prompt_version, prompt_hash, outcome, error_type, error_message, \
    tokens_in, tokens_out, cost_usd, latency_ms, quality_score, created_at";

const EVENT_COLUMNS: &str = "id, run_id, event_type, level, message, data_payload, created_at";

fn row_to_run(row: &libsql::Row) -> AgentRun {
    AgentRun {
        id: get_text(row, 0),
        task_id: get_text(row, 1),
        workflow: get_text(row, 2),
        agent_id: get_text(row, 3),
        prompt_version: get_text(row, 4),
        model_policy: get_text(row, 5),
        status: RunStatus::parse(&get_text(row, 6)).unwrap_or_default(),
        max_retries: get_i64(row, 7),
        total_attempts: get_i64(row, 8),
        success_attempts: get_i64(row, 9),
        failed_attempts: get_i64(row, 10),
        total_tokens_in: get_i64(row, 11),
        total_tokens_out: get_i64(row, 12),
        total_cost_usd: get_f64(row, 13),
        duration_ms: get_i64(row, 14),
        last_error: get_text(row, 15),
        started_at: get_ts(row, 16),
        finished_at: get_opt_ts(row, 17),
    }
}

fn row_to_attempt(row: &libsql::Row) -> PromptAttempt {
    PromptAttempt {
        id: get_text(row, 0),
        run_id: get_text(row, 1),
        attempt_number: get_i64(row, 2),
        workflow: get_text(row, 3),
        agent_id: get_text(row, 4),
        provider_type: ProviderType::parse(&get_text(row, 5)).unwrap_or_default(),
        provider: get_text(row, 6),
        model: get_text(row, 7),
        prompt_version: get_text(row, 8),
        prompt_hash: get_text(row, 9),
        outcome: AttemptOutcome::parse(&get_text(row, 10)).unwrap_or_default(),
        error_type: get_text(row, 11),
        error_message: get_text(row, 12),
        tokens_in: get_i64(row, 13),
        tokens_out: get_i64(row, 14),
        cost_usd: get_f64(row, 15),
        latency_ms: get_i64(row, 16),
        quality_score: get_f64(row, 17),
        created_at: get_ts(row, 18),
    }
}

fn row_to_event(row: &libsql::Row) -> RunEvent {
    RunEvent {
        id: get_text(row, 0),
        run_id: get_text(row, 1),
        event_type: get_text(row, 2),
        level: EventLevel::parse(&get_text(row, 3)).unwrap_or_default(),
        message: get_text(row, 4),
        data_payload: get_text(row, 5),
        created_at: get_ts(row, 6),
    }
}

/// Accumulates `column op ?N` clauses with their bound values.
struct QueryFilter {
    clauses: Vec<String>,
    values: Vec<libsql::Value>,
}

impl QueryFilter {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            values: Vec::new(),
        }
    }

    fn eq(&mut self, column: &str, value: &str) {
        if !value.is_empty() {
            self.values.push(text(value));
            self.clauses.push(format!("{column} = ?{}", self.values.len()));
        }
    }

    fn after(&mut self, column: &str, value: &Option<chrono::DateTime<chrono::Utc>>) {
        if let Some(dt) = value {
            self.values.push(text(fmt_ts(dt)));
            self.clauses.push(format!("{column} > ?{}", self.values.len()));
        }
    }

    fn before(&mut self, column: &str, value: &Option<chrono::DateTime<chrono::Utc>>) {
        if let Some(dt) = value {
            self.values.push(text(fmt_ts(dt)));
            self.clauses.push(format!("{column} < ?{}", self.values.len()));
        }
    }

    fn apply(self, mut sql: String, order_column: &str, limit: i64) -> (String, Vec<libsql::Value>) {
        if !self.clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {order_column} DESC, id DESC"));
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        (sql, self.values)
    }
}

impl LibSqlBackend {
    async fn query_runs(
        &self,
        sql: String,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<AgentRun>, AppError> {
        let conn = self.conn();
        let mut rows = conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| AppError::internal_with("failed to query runs", e))?;
        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to iterate run rows", e))?
        {
            items.push(row_to_run(&row));
        }
        Ok(items)
    }

    async fn query_attempts(
        &self,
        sql: String,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<PromptAttempt>, AppError> {
        let conn = self.conn();
        let mut rows = conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| AppError::internal_with("failed to query prompt attempts", e))?;
        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to iterate attempt rows", e))?
        {
            items.push(row_to_attempt(&row));
        }
        Ok(items)
    }

    async fn query_events(
        &self,
        sql: String,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<RunEvent>, AppError> {
        let conn = self.conn();
        let mut rows = conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| AppError::internal_with("failed to query run events", e))?;
        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to iterate event rows", e))?
        {
            items.push(row_to_event(&row));
        }
        Ok(items)
    }
}

#[async_trait]
impl RunStore for LibSqlBackend {
    async fn list_runs(&self) -> Result<Vec<AgentRun>, AppError> {
        self.list_runs_filtered(&RunFilter::default()).await
    }

    async fn list_runs_filtered(&self, filter: &RunFilter) -> Result<Vec<AgentRun>, AppError> {
        let mut q = QueryFilter::new();
        q.eq("id", &filter.run_id);
        q.eq("task_id", &filter.task_id);
        q.eq("workflow", &filter.workflow);
        q.eq("agent_id", &filter.agent_id);
        q.eq("status", &filter.status);
        q.eq("prompt_version", &filter.prompt_version);
        q.after("started_at", &filter.started_after);
        q.before("started_at", &filter.started_before);
        let (sql, values) = q.apply(
            format!("SELECT {RUN_COLUMNS} FROM agent_runs"),
            "started_at",
            filter.limit,
        );
        self.query_runs(sql, values).await
    }

    async fn insert_run(&self, run: &AgentRun) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                r#"INSERT INTO agent_runs ({RUN_COLUMNS})
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"#
            ),
            params![
                run.id.as_str(),
                run.task_id.as_str(),
                run.workflow.as_str(),
                run.agent_id.as_str(),
                run.prompt_version.as_str(),
                run.model_policy.as_str(),
                run.status.as_str(),
                run.max_retries,
                run.total_attempts,
                run.success_attempts,
                run.failed_attempts,
                run.total_tokens_in,
                run.total_tokens_out,
                run.total_cost_usd,
                run.duration_ms,
                run.last_error.as_str(),
                fmt_ts(&run.started_at),
                opt_ts_value(&run.finished_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to insert run", e))?;
        Ok(())
    }

    async fn update_run(&self, run: &AgentRun) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            r#"UPDATE agent_runs SET
                   task_id = ?2, workflow = ?3, agent_id = ?4, prompt_version = ?5,
                   model_policy = ?6, status = ?7, max_retries = ?8,
                   total_attempts = ?9, success_attempts = ?10, failed_attempts = ?11,
                   total_tokens_in = ?12, total_tokens_out = ?13, total_cost_usd = ?14,
                   duration_ms = ?15, last_error = ?16, started_at = ?17, finished_at = ?18
               WHERE id = ?1"#,
            params![
                run.id.as_str(),
                run.task_id.as_str(),
                run.workflow.as_str(),
                run.agent_id.as_str(),
                run.prompt_version.as_str(),
                run.model_policy.as_str(),
                run.status.as_str(),
                run.max_retries,
                run.total_attempts,
                run.success_attempts,
                run.failed_attempts,
                run.total_tokens_in,
                run.total_tokens_out,
                run.total_cost_usd,
                run.duration_ms,
                run.last_error.as_str(),
                fmt_ts(&run.started_at),
                opt_ts_value(&run.finished_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to update run", e))?;
        Ok(())
    }

    async fn list_prompt_attempts(&self, run_id: &str) -> Result<Vec<PromptAttempt>, AppError> {
        self.list_prompt_attempts_filtered(&AttemptFilter {
            run_id: run_id.to_string(),
            ..AttemptFilter::default()
        })
        .await
    }

    async fn list_prompt_attempts_filtered(
        &self,
        filter: &AttemptFilter,
    ) -> Result<Vec<PromptAttempt>, AppError> {
        let mut q = QueryFilter::new();
        q.eq("run_id", &filter.run_id);
        q.eq("workflow", &filter.workflow);
        q.eq("agent_id", &filter.agent_id);
        q.eq("model", &filter.model);
        q.eq("outcome", &filter.outcome);
        q.eq("prompt_version", &filter.prompt_version);
        q.after("created_at", &filter.created_after);
        q.before("created_at", &filter.created_before);
        let (sql, values) = q.apply(
            format!("SELECT {ATTEMPT_COLUMNS} FROM prompt_attempts"),
            "created_at",
            filter.limit,
        );
        self.query_attempts(sql, values).await
    }

    async fn insert_prompt_attempt(&self, attempt: &PromptAttempt) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                r#"INSERT INTO prompt_attempts ({ATTEMPT_COLUMNS})
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"#
            ),
            params![
                attempt.id.as_str(),
                attempt.run_id.as_str(),
                attempt.attempt_number,
                attempt.workflow.as_str(),
                attempt.agent_id.as_str(),
                attempt.provider_type.as_str(),
                attempt.provider.as_str(),
                attempt.model.as_str(),
                attempt.prompt_version.as_str(),
                attempt.prompt_hash.as_str(),
                attempt.outcome.as_str(),
                attempt.error_type.as_str(),
                attempt.error_message.as_str(),
                attempt.tokens_in,
                attempt.tokens_out,
                attempt.cost_usd,
                attempt.latency_ms,
                attempt.quality_score,
                fmt_ts(&attempt.created_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to insert prompt attempt", e))?;
        Ok(())
    }

    async fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>, AppError> {
        self.list_run_events_filtered(&EventFilter {
            run_id: run_id.to_string(),
            ..EventFilter::default()
        })
        .await
    }

    async fn list_run_events_filtered(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<RunEvent>, AppError> {
        let mut q = QueryFilter::new();
        q.eq("run_id", &filter.run_id);
        q.eq("event_type", &filter.event_type);
        q.eq("level", &filter.level);
        q.after("created_at", &filter.created_after);
        q.before("created_at", &filter.created_before);
        let (sql, values) = q.apply(
            format!("SELECT {EVENT_COLUMNS} FROM run_events"),
            "created_at",
            filter.limit,
        );
        self.query_events(sql, values).await
    }

    async fn insert_run_event(&self, event: &RunEvent) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                r#"INSERT INTO run_events ({EVENT_COLUMNS})
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#
            ),
            params![
                event.id.as_str(),
                event.run_id.as_str(),
                event.event_type.as_str(),
                event.level.as_str(),
                event.message.as_str(),
                event.data_payload.as_str(),
                fmt_ts(&event.created_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to insert run event", e))?;
        Ok(())
    }
}
