//! Persistence contracts consumed by the hub service and the RPC chain.
//!
//! The store is a capability surface: the core never assumes which backend
//! sits behind it. [`LibSqlBackend`](libsql::LibSqlBackend) is the shipped
//! implementation; tests use its in-memory mode as the store double.

pub mod libsql;
pub mod libsql_migrations;

use async_trait::async_trait;

use crate::domain::{
    AgentRun, AttemptFilter, Benchmark, ChangelogEntry, EventFilter, Note, OrchestrationPolicy,
    PolicyCap, PromptAttempt, RunEvent, RunFilter, State, Task,
};
use crate::error::AppError;

/// Caller identity resolved from an agent API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPrincipal {
    pub agent_id: String,
    pub key_id: String,
    pub scopes: Vec<String>,
}

/// Stored reservation for a (method, idempotency_key) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub request_hash: String,
    pub response_payload: String,
    pub completed: bool,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<Task>, AppError>;
    async fn upsert_task(&self, task: &Task) -> Result<(), AppError>;
    /// Returns false when no task with the id existed.
    async fn delete_task(&self, id: &str) -> Result<bool, AppError>;

    async fn list_notes(&self) -> Result<Vec<Note>, AppError>;
    async fn insert_note(&self, note: &Note) -> Result<(), AppError>;

    async fn list_changelog(&self) -> Result<Vec<ChangelogEntry>, AppError>;
    async fn insert_changelog(&self, entry: &ChangelogEntry) -> Result<(), AppError>;

    async fn list_benchmarks(&self) -> Result<Vec<Benchmark>, AppError>;
    async fn insert_benchmark(&self, record: &Benchmark) -> Result<(), AppError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn list_runs(&self) -> Result<Vec<AgentRun>, AppError>;
    async fn list_runs_filtered(&self, filter: &RunFilter) -> Result<Vec<AgentRun>, AppError>;
    async fn insert_run(&self, run: &AgentRun) -> Result<(), AppError>;
    async fn update_run(&self, run: &AgentRun) -> Result<(), AppError>;

    /// An empty `run_id` lists attempts across all runs.
    async fn list_prompt_attempts(&self, run_id: &str) -> Result<Vec<PromptAttempt>, AppError>;
    async fn list_prompt_attempts_filtered(
        &self,
        filter: &AttemptFilter,
    ) -> Result<Vec<PromptAttempt>, AppError>;
    async fn insert_prompt_attempt(&self, attempt: &PromptAttempt) -> Result<(), AppError>;

    /// An empty `run_id` lists events across all runs.
    async fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>, AppError>;
    async fn list_run_events_filtered(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<RunEvent>, AppError>;
    async fn insert_run_event(&self, event: &RunEvent) -> Result<(), AppError>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(&self) -> Result<OrchestrationPolicy, AppError>;
    async fn set_policy(&self, policy: &OrchestrationPolicy) -> Result<(), AppError>;
    async fn list_policy_caps(&self) -> Result<Vec<PolicyCap>, AppError>;
    async fn upsert_policy_cap(&self, cap: &PolicyCap) -> Result<(), AppError>;
    /// Returns false when no cap with the id existed.
    async fn delete_policy_cap(&self, id: &str) -> Result<bool, AppError>;
}

/// Validates agent API keys and seeds them at bootstrap.
#[async_trait]
pub trait AgentKeyStore: Send + Sync {
    /// Resolves the principal for a raw key, touching `last_used_at` on
    /// success. `Ok(None)` means the key does not match any usable row.
    async fn authenticate_agent_key(
        &self,
        raw_key: &str,
    ) -> Result<Option<AgentPrincipal>, AppError>;

    /// Idempotent by key hash: returns `(key_id, created)`.
    async fn ensure_agent_key(
        &self,
        agent_id: &str,
        raw_key: &str,
    ) -> Result<(String, bool), AppError>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically inserts a pending record, or returns the existing one.
    /// The boolean is true when this call created the reservation.
    async fn reserve_idempotency_key(
        &self,
        method: &str,
        idempotency_key: &str,
        request_hash: &str,
    ) -> Result<(IdempotencyRecord, bool), AppError>;

    /// Marks the reservation completed with the stored response. Completing
    /// an already-completed record is a no-op.
    async fn complete_idempotency_key(
        &self,
        method: &str,
        idempotency_key: &str,
        response_payload: &str,
    ) -> Result<(), AppError>;

    /// Deletes the reservation only while it is still pending.
    async fn release_idempotency_key(
        &self,
        method: &str,
        idempotency_key: &str,
    ) -> Result<(), AppError>;
}

/// Unified persistence surface; see the member traits for the operations.
#[async_trait]
pub trait HubStore:
    CatalogStore + RunStore + PolicyStore + AgentKeyStore + IdempotencyStore
{
    async fn run_migrations(&self) -> Result<(), AppError>;

    /// Startup precheck: fails FailedPrecondition when required entity
    /// storage is missing.
    async fn verify_schema_ready(&self) -> Result<(), AppError>;

    async fn export_state(&self) -> Result<State, AppError>;
}
