//! PolicyStore implementation for LibSqlBackend.
//!
//! The global policy is a single row keyed by a constant id; callers
//! read-before-update to preserve unspecified fields.

use async_trait::async_trait;
use libsql::params;

use super::{LibSqlBackend, fmt_ts, get_bool, get_f64, get_i64, get_text, get_ts};
use crate::db::PolicyStore;
use crate::domain::{OrchestrationPolicy, PolicyCap};
use crate::error::AppError;

const CAP_COLUMNS: &str = "\
    id, name, provider_type, provider, model, max_cost_per_run_usd, \
    max_attempts_per_run, max_tokens_per_run, max_cost_per_attempt_usd, \
    max_tokens_per_attempt, max_latency_per_attempt_ms, priority, dry_run, \
    is_active, updated_at";

fn row_to_cap(row: &libsql::Row) -> PolicyCap {
    PolicyCap {
        id: get_text(row, 0),
        name: get_text(row, 1),
        provider_type: get_text(row, 2),
        provider: get_text(row, 3),
        model: get_text(row, 4),
        max_cost_per_run_usd: get_f64(row, 5),
        max_attempts_per_run: get_i64(row, 6),
        max_tokens_per_run: get_i64(row, 7),
        max_cost_per_attempt_usd: get_f64(row, 8),
        max_tokens_per_attempt: get_i64(row, 9),
        max_latency_per_attempt_ms: get_i64(row, 10),
        priority: get_i64(row, 11),
        dry_run: get_bool(row, 12),
        is_active: get_bool(row, 13),
        updated_at: get_ts(row, 14),
    }
}

#[async_trait]
impl PolicyStore for LibSqlBackend {
    async fn get_policy(&self) -> Result<OrchestrationPolicy, AppError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                r#"SELECT kill_switch, kill_switch_reason, max_cost_per_run_usd,
                          max_attempts_per_run, max_tokens_per_run,
                          max_latency_per_attempt_ms, updated_at
                   FROM orchestration_policy WHERE id = 1"#,
                (),
            )
            .await
            .map_err(|e| AppError::internal_with("failed to query policy", e))?;

        match rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to read policy row", e))?
        {
            Some(row) => Ok(OrchestrationPolicy {
                kill_switch: get_bool(&row, 0),
                kill_switch_reason: get_text(&row, 1),
                max_cost_per_run_usd: get_f64(&row, 2),
                max_attempts_per_run: get_i64(&row, 3),
                max_tokens_per_run: get_i64(&row, 4),
                max_latency_per_attempt_ms: get_i64(&row, 5),
                updated_at: get_ts(&row, 6),
            }),
            None => Ok(OrchestrationPolicy::default()),
        }
    }

    async fn set_policy(&self, policy: &OrchestrationPolicy) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            r#"INSERT OR REPLACE INTO orchestration_policy
               (id, kill_switch, kill_switch_reason, max_cost_per_run_usd,
                max_attempts_per_run, max_tokens_per_run,
                max_latency_per_attempt_ms, updated_at)
               VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                policy.kill_switch as i64,
                policy.kill_switch_reason.as_str(),
                policy.max_cost_per_run_usd,
                policy.max_attempts_per_run,
                policy.max_tokens_per_run,
                policy.max_latency_per_attempt_ms,
                fmt_ts(&policy.updated_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to store policy", e))?;
        Ok(())
    }

    async fn list_policy_caps(&self) -> Result<Vec<PolicyCap>, AppError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {CAP_COLUMNS} FROM policy_caps ORDER BY priority DESC, id ASC"),
                (),
            )
            .await
            .map_err(|e| AppError::internal_with("failed to query policy caps", e))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to iterate policy cap rows", e))?
        {
            items.push(row_to_cap(&row));
        }
        Ok(items)
    }

    async fn upsert_policy_cap(&self, cap: &PolicyCap) -> Result<(), AppError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                r#"INSERT OR REPLACE INTO policy_caps ({CAP_COLUMNS})
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#
            ),
            params![
                cap.id.as_str(),
                cap.name.as_str(),
                cap.provider_type.as_str(),
                cap.provider.as_str(),
                cap.model.as_str(),
                cap.max_cost_per_run_usd,
                cap.max_attempts_per_run,
                cap.max_tokens_per_run,
                cap.max_cost_per_attempt_usd,
                cap.max_tokens_per_attempt,
                cap.max_latency_per_attempt_ms,
                cap.priority,
                cap.dry_run as i64,
                cap.is_active as i64,
                fmt_ts(&cap.updated_at),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to upsert policy cap", e))?;
        Ok(())
    }

    async fn delete_policy_cap(&self, id: &str) -> Result<bool, AppError> {
        let conn = self.conn();
        let affected = conn
            .execute("DELETE FROM policy_caps WHERE id = ?1", params![id])
            .await
            .map_err(|e| AppError::internal_with("failed to delete policy cap", e))?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::db::libsql::LibSqlBackend;
    use crate::db::{HubStore, PolicyStore};
    use crate::domain::{OrchestrationPolicy, PolicyCap};

    #[tokio::test]
    async fn test_policy_singleton_round_trip() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.run_migrations().await.unwrap();

        // Seeded default row.
        let initial = backend.get_policy().await.unwrap();
        assert!(!initial.kill_switch);
        assert_eq!(initial.max_attempts_per_run, 0);

        let updated = OrchestrationPolicy {
            kill_switch: true,
            kill_switch_reason: "maintenance".to_string(),
            max_cost_per_run_usd: 1.5,
            max_attempts_per_run: 3,
            max_tokens_per_run: 1000,
            max_latency_per_attempt_ms: 2000,
            updated_at: Utc::now(),
        };
        backend.set_policy(&updated).await.unwrap();

        let fetched = backend.get_policy().await.unwrap();
        assert!(fetched.kill_switch);
        assert_eq!(fetched.kill_switch_reason, "maintenance");
        assert_eq!(fetched.max_attempts_per_run, 3);
    }

    #[tokio::test]
    async fn test_cap_upsert_and_delete() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.run_migrations().await.unwrap();

        let cap = PolicyCap {
            id: "cap_1".to_string(),
            name: "api models".to_string(),
            provider_type: "api".to_string(),
            provider: String::new(),
            model: "m".to_string(),
            max_cost_per_run_usd: 0.05,
            max_attempts_per_run: 0,
            max_tokens_per_run: 0,
            max_cost_per_attempt_usd: 0.0,
            max_tokens_per_attempt: 0,
            max_latency_per_attempt_ms: 0,
            priority: 10,
            dry_run: false,
            is_active: true,
            updated_at: Utc::now(),
        };
        backend.upsert_policy_cap(&cap).await.unwrap();

        let listed = backend.list_policy_caps().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].model, "m");

        assert!(backend.delete_policy_cap("cap_1").await.unwrap());
        assert!(!backend.delete_policy_cap("cap_1").await.unwrap());
    }
}
