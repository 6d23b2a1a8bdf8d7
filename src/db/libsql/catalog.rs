//! CatalogStore implementation for LibSqlBackend.

use async_trait::async_trait;
use libsql::params;

use super::{
    LibSqlBackend, fmt_ts, get_f64, get_i64, get_json_string_array, get_text, get_ts,
    json_string_array,
};
use crate::db::CatalogStore;
use crate::domain::{
    Benchmark, ChangelogCategory, ChangelogEntry, Note, ProviderType, Task, TaskStatus,
};
use crate::error::AppError;

/// Explicit column lists matching positional access in the row converters.
const TASK_COLUMNS: &str = "id, title, details, status, tags, created_at, updated_at";
const NOTE_COLUMNS: &str = "id, title, body, tags, created_at";
const CHANGELOG_COLUMNS: &str = "id, category, summary, details, actor, created_at";
const BENCHMARK_COLUMNS: &str = "\
    id, workflow, provider_type, provider, model, tokens_in, tokens_out, \
    cost_usd, latency_ms, quality_score, notes, created_at";

fn row_to_task(row: &libsql::Row) -> Task {
    Task {
        id: get_text(row, 0),
        title: get_text(row, 1),
        details: get_text(row, 2),
        status: TaskStatus::parse(&get_text(row, 3)).unwrap_or_default(),
        tags: get_json_string_array(row, 4),
        created_at: get_ts(row, 5),
        updated_at: get_ts(row, 6),
    }
}

fn row_to_note(row: &libsql::Row) -> Note {
    Note {
        id: get_text(row, 0),
        title: get_text(row, 1),
        body: get_text(row, 2),
        tags: get_json_string_array(row, 3),
        created_at: get_ts(row, 4),
    }
}

fn row_to_changelog(row: &libsql::Row) -> ChangelogEntry {
    ChangelogEntry {
        id: get_text(row, 0),
        category: ChangelogCategory::parse(&get_text(row, 1)).unwrap_or_default(),
        summary: get_text(row, 2),
        details: get_text(row, 3),
        actor: get_text(row, 4),
        created_at: get_ts(row, 5),
    }
}

fn row_to_benchmark(row: &libsql::Row) -> Benchmark {
    Benchmark {
        id: get_text(row, 0),
        workflow: get_text(row, 1),
        provider_type: ProviderType::parse(&get_text(row, 2)).unwrap_or_default(),
        provider: get_text(row, 3),
        model: get_text(row, 4),
        tokens_in: get_i64(row, 5),
        tokens_out: get_i64(row, 6),
        cost_usd: get_f64(row, 7),
        latency_ms: get_i64(row, 8),
        quality_score: get_f64(row, 9),
        notes: get_text(row, 10),
        created_at: get_ts(row, 11),
    }
}

#[async_trait]
impl CatalogStore for LibSqlBackend {
    async fn list_tasks(&self) -> Result<Vec<Task>, AppError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY updated_at DESC, id DESC"),
                (),
            )
            .await
            .map_err(|e| AppError::internal_with("failed to query tasks", e))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to iterate task rows", e))?
        {
            items.push(row_to_task(&row));
        }
        Ok(items)
    }

    async fn upsert_task(&self, task: &Task) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            r#"INSERT OR REPLACE INTO tasks
               (id, title, details, status, tags, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                task.id.as_str(),
                task.title.as_str(),
                task.details.as_str(),
                task.status.as_str(),
                json_string_array(&task.tags),
                fmt_ts(&task.created_at),
                fmt_ts(&task.updated_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to upsert task", e))?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool, AppError> {
        let conn = self.conn();
        let affected = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| AppError::internal_with("failed to delete task", e))?;
        Ok(affected > 0)
    }

    async fn list_notes(&self) -> Result<Vec<Note>, AppError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {NOTE_COLUMNS} FROM notes ORDER BY created_at DESC, id DESC"),
                (),
            )
            .await
            .map_err(|e| AppError::internal_with("failed to query notes", e))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to iterate note rows", e))?
        {
            items.push(row_to_note(&row));
        }
        Ok(items)
    }

    async fn insert_note(&self, note: &Note) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO notes (id, title, body, tags, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                note.id.as_str(),
                note.title.as_str(),
                note.body.as_str(),
                json_string_array(&note.tags),
                fmt_ts(&note.created_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to insert note", e))?;
        Ok(())
    }

    async fn list_changelog(&self) -> Result<Vec<ChangelogEntry>, AppError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CHANGELOG_COLUMNS} FROM changelog ORDER BY created_at DESC, id DESC"
                ),
                (),
            )
            .await
            .map_err(|e| AppError::internal_with("failed to query changelog", e))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to iterate changelog rows", e))?
        {
            items.push(row_to_changelog(&row));
        }
        Ok(items)
    }

    async fn insert_changelog(&self, entry: &ChangelogEntry) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            r#"INSERT INTO changelog (id, category, summary, details, actor, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                entry.id.as_str(),
                entry.category.as_str(),
                entry.summary.as_str(),
                entry.details.as_str(),
                entry.actor.as_str(),
                fmt_ts(&entry.created_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to insert changelog entry", e))?;
        Ok(())
    }

    async fn list_benchmarks(&self) -> Result<Vec<Benchmark>, AppError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {BENCHMARK_COLUMNS} FROM benchmarks ORDER BY created_at DESC, id DESC"
                ),
                (),
            )
            .await
            .map_err(|e| AppError::internal_with("failed to query benchmarks", e))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to iterate benchmark rows", e))?
        {
            items.push(row_to_benchmark(&row));
        }
        Ok(items)
    }

    async fn insert_benchmark(&self, record: &Benchmark) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                r#"INSERT INTO benchmarks ({BENCHMARK_COLUMNS})
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#
            ),
            params![
                record.id.as_str(),
                record.workflow.as_str(),
                record.provider_type.as_str(),
                record.provider.as_str(),
                record.model.as_str(),
                record.tokens_in,
                record.tokens_out,
                record.cost_usd,
                record.latency_ms,
                record.quality_score,
                record.notes.as_str(),
                fmt_ts(&record.created_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to insert benchmark", e))?;
        Ok(())
    }
}
