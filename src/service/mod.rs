//! Hub service: validation and orchestration between the RPC chain and the
//! store.
//!
//! Catalog CRUD lives here; the run engine, policy resolution, and telemetry
//! aggregation live in the sibling modules and extend [`HubService`] with
//! further impl blocks.

pub mod policy;
pub mod runs;
pub mod telemetry;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::clock::{Clock, IdGen};
use crate::db::{CatalogStore, HubStore, RunStore};
use crate::domain::{
    self, Benchmark, ChangelogCategory, ChangelogEntry, Note, ProviderType, State, Summary, Task,
    TaskStatus,
};
use crate::error::AppError;

pub struct HubService {
    store: Arc<dyn HubStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    data_source: String,
}

// ==================== Request payloads ====================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateTaskRequest {
    pub title: String,
    pub details: String,
    pub status: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateTaskRequest {
    pub id: String,
    pub title: String,
    pub details: String,
    pub status: String,
    /// None leaves tags untouched; Some replaces them.
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeleteTaskRequest {
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateNoteRequest {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppendChangelogRequest {
    pub category: String,
    pub summary: String,
    pub details: String,
    pub actor: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecordBenchmarkRequest {
    pub workflow: String,
    pub provider_type: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub quality_score: f64,
    pub notes: String,
}

impl HubService {
    pub fn new(
        store: Arc<dyn HubStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        data_source: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            data_source: data_source.into(),
        }
    }

    pub fn health(&self) -> serde_json::Value {
        json!({
            "status": "ok",
            "data_source": self.data_source,
            "time_utc": domain::ts::to_string(&self.clock.now()),
        })
    }

    pub async fn export_state(&self) -> Result<State, AppError> {
        self.store.export_state().await
    }

    pub async fn summary(&self) -> Result<Summary, AppError> {
        let tasks = self.store.list_tasks().await?;
        let notes = self.store.list_notes().await?;
        let changelog = self.store.list_changelog().await?;
        let benchmarks = self.store.list_benchmarks().await?;
        let runs = self.store.list_runs().await?;
        let attempts = self.store.list_prompt_attempts("").await?;
        let events = self.store.list_run_events("").await?;

        let mut summary = Summary::default();
        summary.counts.tasks = tasks.len() as i64;
        summary.counts.notes = notes.len() as i64;
        summary.counts.changelog = changelog.len() as i64;
        summary.counts.benchmarks = benchmarks.len() as i64;
        summary.counts.runs = runs.len() as i64;
        summary.counts.attempts = attempts.len() as i64;
        summary.counts.run_events = events.len() as i64;

        for provider_type in [
            ProviderType::Api,
            ProviderType::Subscription,
            ProviderType::Opensource,
        ] {
            summary
                .totals
                .by_provider
                .insert(provider_type.as_str().to_string(), Default::default());
        }
        for benchmark in &benchmarks {
            summary.totals.tokens_in += benchmark.tokens_in;
            summary.totals.tokens_out += benchmark.tokens_out;
            summary.totals.cost_usd += benchmark.cost_usd;
            let entry = summary
                .totals
                .by_provider
                .entry(benchmark.provider_type.as_str().to_string())
                .or_default();
            entry.count += 1;
            entry.cost_usd += benchmark.cost_usd;
        }
        Ok(summary)
    }

    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, AppError> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(AppError::invalid_argument("title is required"));
        }

        let status = match request.status.trim() {
            "" => TaskStatus::Todo,
            raw => TaskStatus::parse(raw)?,
        };

        let now = self.clock.now();
        let task = Task {
            id: self.ids.new_id("task"),
            title: title.to_string(),
            details: request.details.trim().to_string(),
            status,
            tags: normalize_tags(&request.tags),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_task(&task).await?;
        Ok(task)
    }

    pub async fn update_task(&self, request: UpdateTaskRequest) -> Result<Task, AppError> {
        let id = request.id.trim();
        if id.is_empty() {
            return Err(AppError::invalid_argument("id is required"));
        }

        let tasks = self.store.list_tasks().await?;
        let Some(mut task) = tasks.into_iter().find(|task| task.id == id) else {
            return Err(AppError::not_found("task not found"));
        };

        let title = request.title.trim();
        if !title.is_empty() {
            task.title = title.to_string();
        }
        if !request.details.is_empty() {
            task.details = request.details.trim().to_string();
        }
        if !request.status.is_empty() {
            task.status = TaskStatus::parse(request.status.trim())?;
        }
        if let Some(tags) = &request.tags {
            task.tags = normalize_tags(tags);
        }
        task.updated_at = self.clock.now();
        self.store.upsert_task(&task).await?;
        Ok(task)
    }

    pub async fn delete_task(&self, request: DeleteTaskRequest) -> Result<(), AppError> {
        let id = request.id.trim();
        if id.is_empty() {
            return Err(AppError::invalid_argument("id is required"));
        }
        if !self.store.delete_task(id).await? {
            return Err(AppError::not_found("task not found"));
        }
        Ok(())
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, AppError> {
        let mut items = self.store.list_tasks().await?;
        items.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(items)
    }

    pub async fn create_note(&self, request: CreateNoteRequest) -> Result<Note, AppError> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(AppError::invalid_argument("title is required"));
        }

        let note = Note {
            id: self.ids.new_id("note"),
            title: title.to_string(),
            body: request.body.trim().to_string(),
            tags: normalize_tags(&request.tags),
            created_at: self.clock.now(),
        };
        self.store.insert_note(&note).await?;
        Ok(note)
    }

    pub async fn list_notes(&self) -> Result<Vec<Note>, AppError> {
        let mut items = self.store.list_notes().await?;
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(items)
    }

    pub async fn append_changelog(
        &self,
        request: AppendChangelogRequest,
    ) -> Result<ChangelogEntry, AppError> {
        let summary = request.summary.trim();
        if summary.is_empty() {
            return Err(AppError::invalid_argument("summary is required"));
        }

        let category = match request.category.trim() {
            "" => ChangelogCategory::Ops,
            raw => ChangelogCategory::parse(raw)?,
        };

        let entry = ChangelogEntry {
            id: self.ids.new_id("chg"),
            category,
            summary: summary.to_string(),
            details: request.details.trim().to_string(),
            actor: request.actor.trim().to_string(),
            created_at: self.clock.now(),
        };
        self.store.insert_changelog(&entry).await?;
        Ok(entry)
    }

    pub async fn list_changelog(&self) -> Result<Vec<ChangelogEntry>, AppError> {
        let mut items = self.store.list_changelog().await?;
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(items)
    }

    pub async fn record_benchmark(
        &self,
        request: RecordBenchmarkRequest,
    ) -> Result<Benchmark, AppError> {
        let workflow = request.workflow.trim();
        let provider_type = request.provider_type.trim();
        let model = request.model.trim();
        if workflow.is_empty() || provider_type.is_empty() || model.is_empty() {
            return Err(AppError::invalid_argument(
                "workflow, provider_type, and model are required",
            ));
        }
        let provider_type = ProviderType::parse(provider_type)?;
        if request.tokens_in < 0
            || request.tokens_out < 0
            || request.cost_usd < 0.0
            || request.latency_ms < 0
        {
            return Err(AppError::invalid_argument(
                "tokens, cost, and latency must be non-negative",
            ));
        }

        let record = Benchmark {
            id: self.ids.new_id("bm"),
            workflow: workflow.to_string(),
            provider_type,
            provider: request.provider.trim().to_string(),
            model: model.to_string(),
            tokens_in: request.tokens_in,
            tokens_out: request.tokens_out,
            cost_usd: request.cost_usd,
            latency_ms: request.latency_ms,
            quality_score: request.quality_score,
            notes: request.notes.trim().to_string(),
            created_at: self.clock.now(),
        };
        self.store.insert_benchmark(&record).await?;
        Ok(record)
    }

    pub async fn list_benchmarks(&self) -> Result<Vec<Benchmark>, AppError> {
        let mut items = self.store.list_benchmarks().await?;
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(items)
    }
}

/// Tags are trimmed, lowercased, deduped, and sorted lexicographically;
/// input order is not preserved.
fn normalize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testutil::memory_hub;
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_normalize_tags_lowercases_dedupes_and_sorts() {
        let tags = vec![
            "  Beta ".to_string(),
            "alpha".to_string(),
            "BETA".to_string(),
            String::new(),
            "  ".to_string(),
        ];
        assert_eq!(normalize_tags(&tags), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_create_task_validates_and_normalizes() {
        let (hub, _) = memory_hub().await;

        let err = hub
            .create_task(CreateTaskRequest {
                title: "   ".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = hub
            .create_task(CreateTaskRequest {
                title: "t".to_string(),
                status: "paused".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let task = hub
            .create_task(CreateTaskRequest {
                title: " ship it ".to_string(),
                details: " do the thing ".to_string(),
                status: String::new(),
                tags: vec!["Urgent".to_string(), "urgent".to_string(), "api".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(task.title, "ship it");
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.tags, vec!["api", "urgent"]);
    }

    #[tokio::test]
    async fn test_task_tags_round_trip_through_list() {
        let (hub, _) = memory_hub().await;
        hub.create_task(CreateTaskRequest {
            title: "t".to_string(),
            tags: vec!["Zeta".to_string(), " alpha ".to_string(), "zeta".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

        let tasks = hub.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].tags, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_update_task_partial_fields() {
        let (hub, _) = memory_hub().await;
        let task = hub
            .create_task(CreateTaskRequest {
                title: "original".to_string(),
                details: "details".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let updated = hub
            .update_task(UpdateTaskRequest {
                id: task.id.clone(),
                status: "in_progress".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.title, "original");
        assert_eq!(updated.details, "details");
        assert_eq!(updated.status, TaskStatus::InProgress);

        let err = hub
            .update_task(UpdateTaskRequest {
                id: "task_missing".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_task_not_found() {
        let (hub, _) = memory_hub().await;
        let err = hub
            .delete_task(DeleteTaskRequest {
                id: "task_missing".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_changelog_defaults_category_to_ops() {
        let (hub, _) = memory_hub().await;
        let entry = hub
            .append_changelog(AppendChangelogRequest {
                summary: "rotated keys".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entry.category, ChangelogCategory::Ops);

        let err = hub
            .append_changelog(AppendChangelogRequest {
                summary: "x".to_string(),
                category: "bogus".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_record_benchmark_validation() {
        let (hub, _) = memory_hub().await;

        let err = hub
            .record_benchmark(RecordBenchmarkRequest {
                workflow: "w".to_string(),
                provider_type: "api".to_string(),
                model: "m".to_string(),
                tokens_in: -1,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = hub
            .record_benchmark(RecordBenchmarkRequest {
                workflow: "w".to_string(),
                provider_type: String::new(),
                model: "m".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let record = hub
            .record_benchmark(RecordBenchmarkRequest {
                workflow: "w".to_string(),
                provider_type: "opensource".to_string(),
                model: "m".to_string(),
                tokens_in: 5,
                tokens_out: 7,
                cost_usd: 0.0,
                latency_ms: 12,
                quality_score: 0.9,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(record.provider_type, ProviderType::Opensource);
    }

    #[tokio::test]
    async fn test_summary_counts_and_provider_totals() {
        let (hub, _) = memory_hub().await;
        hub.create_task(CreateTaskRequest {
            title: "t".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        hub.record_benchmark(RecordBenchmarkRequest {
            workflow: "w".to_string(),
            provider_type: "api".to_string(),
            model: "m".to_string(),
            tokens_in: 10,
            tokens_out: 20,
            cost_usd: 0.5,
            ..Default::default()
        })
        .await
        .unwrap();

        let summary = hub.summary().await.unwrap();
        assert_eq!(summary.counts.tasks, 1);
        assert_eq!(summary.counts.benchmarks, 1);
        assert_eq!(summary.totals.tokens_in, 10);
        assert_eq!(summary.totals.by_provider["api"].count, 1);
        assert_eq!(summary.totals.by_provider["subscription"].count, 0);
    }

    #[tokio::test]
    async fn test_health_shape() {
        let (hub, _) = memory_hub().await;
        let health = hub.health();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["data_source"], "libsql::memory:");
        assert!(health["time_utc"].as_str().unwrap().ends_with('Z'));
    }
}
