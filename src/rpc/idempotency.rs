//! Idempotency key extraction and the canonical request hash.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::rpc::RequestMetadata;

/// The caller-chosen key binding one (method, payload) to one side effect.
/// A key in the payload wins over the `x-idempotency-key` header.
pub fn extract_idempotency_key(payload: &Value, metadata: &RequestMetadata) -> Option<String> {
    if let Some(Value::String(raw)) = payload.get("idempotency_key") {
        let key = raw.trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    metadata.get("x-idempotency-key").map(str::to_string)
}

/// SHA-256 (hex) over the canonical JSON serialization of the payload with
/// the top-level `idempotency_key` field removed.
///
/// `serde_json` maps are BTreeMap-backed, so serialization emits keys in
/// lexicographic order at every nesting level; scalars pass through
/// verbatim. That makes the serialization itself the canonical form.
pub fn canonical_request_hash(payload: &Value) -> Result<String, AppError> {
    let Value::Object(fields) = payload else {
        return Err(AppError::invalid_argument(
            "idempotency is only supported for object request payloads",
        ));
    };

    let mut sanitized = fields.clone();
    sanitized.remove("idempotency_key");
    let serialized = serde_json::to_string(&sanitized)
        .map_err(|e| AppError::internal_with("failed to encode idempotency request payload", e))?;
    let digest = Sha256::digest(serialized.as_bytes());
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> RequestMetadata {
        let headers: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RequestMetadata::new(headers, "127.0.0.1")
    }

    #[test]
    fn test_payload_key_wins_over_header() {
        let payload = json!({"idempotency_key": " k-payload ", "title": "t"});
        let md = metadata(&[("x-idempotency-key", "k-header")]);
        assert_eq!(
            extract_idempotency_key(&payload, &md),
            Some("k-payload".to_string())
        );
    }

    #[test]
    fn test_header_used_when_payload_key_absent_or_blank() {
        let md = metadata(&[("x-idempotency-key", "k-header")]);
        assert_eq!(
            extract_idempotency_key(&json!({"title": "t"}), &md),
            Some("k-header".to_string())
        );
        assert_eq!(
            extract_idempotency_key(&json!({"idempotency_key": "  "}), &md),
            Some("k-header".to_string())
        );
        assert_eq!(extract_idempotency_key(&json!({}), &metadata(&[])), None);
    }

    #[test]
    fn test_hash_excludes_idempotency_key() {
        let with_key = json!({"title": "t", "idempotency_key": "k1"});
        let other_key = json!({"title": "t", "idempotency_key": "k2"});
        let without_key = json!({"title": "t"});
        assert_eq!(
            canonical_request_hash(&with_key).unwrap(),
            canonical_request_hash(&other_key).unwrap()
        );
        assert_eq!(
            canonical_request_hash(&with_key).unwrap(),
            canonical_request_hash(&without_key).unwrap()
        );
    }

    #[test]
    fn test_hash_is_insensitive_to_input_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(
            canonical_request_hash(&a).unwrap(),
            canonical_request_hash(&b).unwrap()
        );
    }

    #[test]
    fn test_hash_differs_on_payload_change() {
        let a = json!({"title": "t1"});
        let b = json!({"title": "t2"});
        assert_ne!(
            canonical_request_hash(&a).unwrap(),
            canonical_request_hash(&b).unwrap()
        );
    }

    #[test]
    fn test_hash_rejects_non_object_payloads() {
        let err = canonical_request_hash(&json!([1, 2, 3])).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }
}
