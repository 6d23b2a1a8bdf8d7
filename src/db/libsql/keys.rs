//! AgentKeyStore and IdempotencyStore implementations for LibSqlBackend.

use async_trait::async_trait;
use chrono::Utc;
use libsql::params;
use sha2::{Digest, Sha256};

use super::{LibSqlBackend, fmt_ts, get_json_string_array, get_opt_ts, get_text};
use crate::db::{AgentKeyStore, AgentPrincipal, IdempotencyRecord, IdempotencyStore};
use crate::error::AppError;
use crate::rpc::DEFAULT_AGENT_KEY_SCOPES;

/// SHA-256 hex digest of a trimmed raw key; empty input yields None.
/// The raw key is never stored.
fn hash_api_key(raw_key: &str) -> Option<String> {
    let clean = raw_key.trim();
    if clean.is_empty() {
        return None;
    }
    let digest = Sha256::digest(clean.as_bytes());
    Some(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn new_key_id(agent_id: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("ak_{}_{}", agent_id.to_lowercase(), nanos)
}

#[async_trait]
impl AgentKeyStore for LibSqlBackend {
    async fn authenticate_agent_key(
        &self,
        raw_key: &str,
    ) -> Result<Option<AgentPrincipal>, AppError> {
        let Some(hash) = hash_api_key(raw_key) else {
            return Ok(None);
        };

        let conn = self.conn();
        let now = fmt_ts(&Utc::now());
        let mut rows = conn
            .query(
                r#"SELECT agent_id, key_id, scopes
                   FROM agent_api_keys
                   WHERE key_hash = ?1
                     AND is_active = 1
                     AND revoked_at IS NULL
                     AND (expires_at IS NULL OR expires_at > ?2)"#,
                params![hash, now.as_str()],
            )
            .await
            .map_err(|e| AppError::internal_with("failed to validate api key", e))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to read api key row", e))?
        else {
            return Ok(None);
        };

        let principal = AgentPrincipal {
            agent_id: get_text(&row, 0),
            key_id: get_text(&row, 1),
            scopes: get_json_string_array(&row, 2),
        };

        // A failed touch is surfaced rather than authenticating silently.
        conn.execute(
            "UPDATE agent_api_keys SET last_used_at = ?1 WHERE key_id = ?2",
            params![now, principal.key_id.as_str()],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to update api key last_used_at", e))?;

        Ok(Some(principal))
    }

    async fn ensure_agent_key(
        &self,
        agent_id: &str,
        raw_key: &str,
    ) -> Result<(String, bool), AppError> {
        let clean_agent_id = agent_id.trim();
        if clean_agent_id.is_empty() {
            return Err(AppError::invalid_argument("agent_id is required"));
        }
        let Some(hash) = hash_api_key(raw_key) else {
            return Err(AppError::invalid_argument("raw agent key is required"));
        };

        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT key_id FROM agent_api_keys WHERE key_hash = ?1",
                params![hash.as_str()],
            )
            .await
            .map_err(|e| AppError::internal_with("failed to query existing api key", e))?;
        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to read api key row", e))?
        {
            return Ok((get_text(&row, 0), false));
        }

        let key_id = new_key_id(clean_agent_id);
        let scopes: Vec<String> = DEFAULT_AGENT_KEY_SCOPES
            .iter()
            .map(|s| s.to_string())
            .collect();
        conn.execute(
            r#"INSERT INTO agent_api_keys
               (key_id, agent_id, key_hash, scopes, is_active, created_at)
               VALUES (?1, ?2, ?3, ?4, 1, ?5)"#,
            params![
                key_id.as_str(),
                clean_agent_id,
                hash,
                super::json_string_array(&scopes),
                fmt_ts(&Utc::now()),
            ],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to insert api key", e))?;
        Ok((key_id, true))
    }
}

#[async_trait]
impl IdempotencyStore for LibSqlBackend {
    async fn reserve_idempotency_key(
        &self,
        method: &str,
        idempotency_key: &str,
        request_hash: &str,
    ) -> Result<(IdempotencyRecord, bool), AppError> {
        let method = method.trim();
        let idempotency_key = idempotency_key.trim();
        let request_hash = request_hash.trim();
        if method.is_empty() || idempotency_key.is_empty() || request_hash.is_empty() {
            return Err(AppError::invalid_argument(
                "method, idempotency_key, and request_hash are required",
            ));
        }

        let conn = self.conn();
        // INSERT OR IGNORE is the atomicity boundary: exactly one caller
        // creates the reservation.
        let affected = conn
            .execute(
                r#"INSERT OR IGNORE INTO idempotency_keys
                   (method, idempotency_key, request_hash, response_payload, created_at)
                   VALUES (?1, ?2, ?3, '', ?4)"#,
                params![method, idempotency_key, request_hash, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| AppError::internal_with("failed to reserve idempotency key", e))?;
        if affected > 0 {
            return Ok((IdempotencyRecord::default(), true));
        }

        let mut rows = conn
            .query(
                r#"SELECT request_hash, response_payload, completed_at
                   FROM idempotency_keys
                   WHERE method = ?1 AND idempotency_key = ?2"#,
                params![method, idempotency_key],
            )
            .await
            .map_err(|e| AppError::internal_with("failed to read existing idempotency key", e))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to read idempotency key row", e))?
        else {
            return Err(AppError::not_found(
                "idempotency key was not found after reserve conflict",
            ));
        };

        let record = IdempotencyRecord {
            request_hash: get_text(&row, 0),
            response_payload: get_text(&row, 1),
            completed: get_opt_ts(&row, 2).is_some(),
        };
        Ok((record, false))
    }

    async fn complete_idempotency_key(
        &self,
        method: &str,
        idempotency_key: &str,
        response_payload: &str,
    ) -> Result<(), AppError> {
        let method = method.trim();
        let idempotency_key = idempotency_key.trim();
        if method.is_empty() || idempotency_key.is_empty() {
            return Err(AppError::invalid_argument(
                "method and idempotency_key are required",
            ));
        }

        let conn = self.conn();
        let affected = conn
            .execute(
                r#"UPDATE idempotency_keys
                   SET response_payload = ?3, completed_at = ?4
                   WHERE method = ?1 AND idempotency_key = ?2 AND completed_at IS NULL"#,
                params![method, idempotency_key, response_payload, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| AppError::internal_with("failed to complete idempotency key", e))?;
        if affected > 0 {
            return Ok(());
        }

        // Completing an already-completed record is a no-op; a missing one
        // is a defect worth surfacing.
        let mut rows = conn
            .query(
                r#"SELECT completed_at FROM idempotency_keys
                   WHERE method = ?1 AND idempotency_key = ?2"#,
                params![method, idempotency_key],
            )
            .await
            .map_err(|e| AppError::internal_with("failed to verify idempotency completion", e))?;
        match rows
            .next()
            .await
            .map_err(|e| AppError::internal_with("failed to read idempotency key row", e))?
        {
            Some(row) if get_opt_ts(&row, 0).is_some() => Ok(()),
            Some(_) => Err(AppError::internal(
                "idempotency key completion did not apply",
            )),
            None => Err(AppError::not_found("idempotency key not found")),
        }
    }

    async fn release_idempotency_key(
        &self,
        method: &str,
        idempotency_key: &str,
    ) -> Result<(), AppError> {
        let method = method.trim();
        let idempotency_key = idempotency_key.trim();
        if method.is_empty() || idempotency_key.is_empty() {
            return Ok(());
        }

        let conn = self.conn();
        conn.execute(
            r#"DELETE FROM idempotency_keys
               WHERE method = ?1 AND idempotency_key = ?2 AND completed_at IS NULL"#,
            params![method, idempotency_key],
        )
        .await
        .map_err(|e| AppError::internal_with("failed to release idempotency key", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use libsql::params;

    use crate::db::libsql::LibSqlBackend;
    use crate::db::{AgentKeyStore, HubStore, IdempotencyStore};

    async fn backend() -> LibSqlBackend {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.run_migrations().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_ensure_agent_key_is_idempotent_by_hash() {
        let backend = backend().await;
        let (key_id, created) = backend.ensure_agent_key("orchestrator", "raw-key").await.unwrap();
        assert!(created);
        assert!(key_id.starts_with("ak_orchestrator_"));

        let (again, created_again) =
            backend.ensure_agent_key("orchestrator", "raw-key").await.unwrap();
        assert!(!created_again);
        assert_eq!(again, key_id);
    }

    #[tokio::test]
    async fn test_authenticate_returns_principal_with_default_scopes() {
        let backend = backend().await;
        let (key_id, _) = backend.ensure_agent_key("a1", "raw-key").await.unwrap();

        let principal = backend
            .authenticate_agent_key("raw-key")
            .await
            .unwrap()
            .expect("key should authenticate");
        assert_eq!(principal.agent_id, "a1");
        assert_eq!(principal.key_id, key_id);
        assert!(principal.scopes.contains(&"telemetry:write".to_string()));

        assert!(backend.authenticate_agent_key("wrong").await.unwrap().is_none());
        assert!(backend.authenticate_agent_key("   ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_rejects_revoked_inactive_and_expired() {
        let backend = backend().await;
        let (key_id, _) = backend.ensure_agent_key("a1", "raw-key").await.unwrap();
        let conn = backend.conn();

        conn.execute(
            "UPDATE agent_api_keys SET revoked_at = '2026-01-01T00:00:00.000000000Z' WHERE key_id = ?1",
            params![key_id.as_str()],
        )
        .await
        .unwrap();
        assert!(backend.authenticate_agent_key("raw-key").await.unwrap().is_none());

        conn.execute(
            "UPDATE agent_api_keys SET revoked_at = NULL, is_active = 0 WHERE key_id = ?1",
            params![key_id.as_str()],
        )
        .await
        .unwrap();
        assert!(backend.authenticate_agent_key("raw-key").await.unwrap().is_none());

        conn.execute(
            "UPDATE agent_api_keys SET is_active = 1, expires_at = '2020-01-01T00:00:00.000000000Z' WHERE key_id = ?1",
            params![key_id.as_str()],
        )
        .await
        .unwrap();
        assert!(backend.authenticate_agent_key("raw-key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_touches_last_used_at() {
        let backend = backend().await;
        let (key_id, _) = backend.ensure_agent_key("a1", "raw-key").await.unwrap();
        backend.authenticate_agent_key("raw-key").await.unwrap().unwrap();

        let conn = backend.conn();
        let mut rows = conn
            .query(
                "SELECT last_used_at FROM agent_api_keys WHERE key_id = ?1",
                params![key_id.as_str()],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert!(row.get::<String>(0).is_ok());
    }

    #[tokio::test]
    async fn test_reserve_complete_release_lifecycle() {
        let backend = backend().await;

        let (_, created) = backend
            .reserve_idempotency_key("/svc/CreateTask", "k", "h1")
            .await
            .unwrap();
        assert!(created);

        // Second reserve returns the pending record.
        let (record, created) = backend
            .reserve_idempotency_key("/svc/CreateTask", "k", "h1")
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(record.request_hash, "h1");
        assert!(!record.completed);

        backend
            .complete_idempotency_key("/svc/CreateTask", "k", "{\"ok\":true}")
            .await
            .unwrap();
        // Completing again is a no-op.
        backend
            .complete_idempotency_key("/svc/CreateTask", "k", "ignored")
            .await
            .unwrap();

        let (record, created) = backend
            .reserve_idempotency_key("/svc/CreateTask", "k", "h1")
            .await
            .unwrap();
        assert!(!created);
        assert!(record.completed);
        assert_eq!(record.response_payload, "{\"ok\":true}");

        // Release does not delete completed rows.
        backend
            .release_idempotency_key("/svc/CreateTask", "k")
            .await
            .unwrap();
        let (record, created) = backend
            .reserve_idempotency_key("/svc/CreateTask", "k", "h1")
            .await
            .unwrap();
        assert!(!created);
        assert!(record.completed);
    }

    #[tokio::test]
    async fn test_release_deletes_pending_reservation() {
        let backend = backend().await;
        backend
            .reserve_idempotency_key("/svc/CreateTask", "k", "h1")
            .await
            .unwrap();
        backend
            .release_idempotency_key("/svc/CreateTask", "k")
            .await
            .unwrap();

        let (_, created) = backend
            .reserve_idempotency_key("/svc/CreateTask", "k", "h2")
            .await
            .unwrap();
        assert!(created, "released key should be reservable again");
    }

    #[tokio::test]
    async fn test_reserve_keys_are_scoped_per_method() {
        let backend = backend().await;
        let (_, created_a) = backend
            .reserve_idempotency_key("/svc/CreateTask", "k", "h1")
            .await
            .unwrap();
        let (_, created_b) = backend
            .reserve_idempotency_key("/svc/CreateNote", "k", "h1")
            .await
            .unwrap();
        assert!(created_a);
        assert!(created_b);
    }
}
