//! Credential extraction and the legacy shared-token fallback.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::db::AgentPrincipal;
use crate::rpc::{DEFAULT_AGENT_KEY_SCOPES, RequestMetadata};

/// Sentinel key id attached to principals minted by the legacy fallback.
pub const LEGACY_KEY_ID: &str = "legacy_shared_token";
pub const LEGACY_AGENT_ID: &str = "legacy-shared-token";

/// Extraction order: `x-modeloman-token`, then `authorization: Bearer`.
pub fn extract_token(metadata: &RequestMetadata) -> Option<String> {
    if let Some(token) = metadata.get("x-modeloman-token") {
        return Some(token.to_string());
    }

    let auth_header = metadata.get("authorization")?;
    auth_header
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Constant-time comparison of the SHA-256 digests of the supplied and
/// expected tokens, resisting timing oracles on the shared secret.
pub fn legacy_token_match(request_token: &str, expected_token: &str) -> bool {
    let request_hash = Sha256::digest(request_token.as_bytes());
    let expected_hash = Sha256::digest(expected_token.as_bytes());
    bool::from(request_hash.as_slice().ct_eq(expected_hash.as_slice()))
}

/// Synthetic principal for callers authenticated via the legacy token; it
/// carries the full default scope set.
pub fn legacy_principal() -> AgentPrincipal {
    AgentPrincipal {
        agent_id: LEGACY_AGENT_ID.to_string(),
        key_id: LEGACY_KEY_ID.to_string(),
        scopes: DEFAULT_AGENT_KEY_SCOPES
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

pub fn has_scope(scopes: &[String], required: &str) -> bool {
    scopes.iter().any(|scope| scope.trim() == required)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> RequestMetadata {
        let headers: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RequestMetadata::new(headers, "127.0.0.1")
    }

    #[test]
    fn test_extract_token_prefers_dedicated_header() {
        let md = metadata(&[
            ("x-modeloman-token", "primary"),
            ("authorization", "Bearer fallback"),
        ]);
        assert_eq!(extract_token(&md), Some("primary".to_string()));
    }

    #[test]
    fn test_extract_token_falls_back_to_bearer() {
        let md = metadata(&[("authorization", "Bearer  spaced-token ")]);
        assert_eq!(extract_token(&md), Some("spaced-token".to_string()));
    }

    #[test]
    fn test_extract_token_rejects_non_bearer_and_empty() {
        assert_eq!(extract_token(&metadata(&[("authorization", "Basic abc")])), None);
        assert_eq!(extract_token(&metadata(&[("authorization", "Bearer ")])), None);
        assert_eq!(extract_token(&metadata(&[])), None);
    }

    #[test]
    fn test_legacy_token_match() {
        assert!(legacy_token_match("shared", "shared"));
        assert!(!legacy_token_match("shared", "other"));
        assert!(!legacy_token_match("", "other"));
    }

    #[test]
    fn test_legacy_principal_has_full_default_scopes() {
        let principal = legacy_principal();
        assert_eq!(principal.key_id, LEGACY_KEY_ID);
        for scope in DEFAULT_AGENT_KEY_SCOPES {
            assert!(has_scope(&principal.scopes, scope), "missing {scope}");
        }
    }

    #[test]
    fn test_has_scope_trims_stored_scopes() {
        let scopes = vec![" tasks:write ".to_string()];
        assert!(has_scope(&scopes, "tasks:write"));
        assert!(!has_scope(&scopes, "policy:write"));
    }
}
