//! Policy administration and cap resolution.
//!
//! [`select_policy_cap`] and [`resolve_effective_limits`] are pure functions;
//! the run engine consults them on every gated write.

use serde::Deserialize;

use crate::db::PolicyStore;
use crate::domain::{OrchestrationPolicy, PolicyCap, ProviderType};
use crate::error::AppError;
use crate::service::HubService;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SetPolicyRequest {
    pub kill_switch: Option<bool>,
    pub kill_switch_reason: Option<String>,
    pub max_cost_per_run_usd: Option<f64>,
    pub max_attempts_per_run: Option<i64>,
    pub max_tokens_per_run: Option<i64>,
    pub max_latency_per_attempt_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpsertPolicyCapRequest {
    pub id: String,
    pub name: String,
    pub provider_type: String,
    pub provider: String,
    pub model: String,
    pub max_cost_per_run_usd: Option<f64>,
    pub max_attempts_per_run: Option<i64>,
    pub max_tokens_per_run: Option<i64>,
    pub max_cost_per_attempt_usd: Option<f64>,
    pub max_tokens_per_attempt: Option<i64>,
    pub max_latency_per_attempt_ms: Option<i64>,
    pub priority: Option<i64>,
    pub dry_run: Option<bool>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeletePolicyCapRequest {
    pub id: String,
}

/// Limits in force for one attempt: global policy overlaid with any
/// non-zero fields of the selected cap. The attempt-level limits originate
/// from the cap only. `source` names what a violation message blames.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveLimits {
    pub max_cost_per_run_usd: f64,
    pub max_attempts_per_run: i64,
    pub max_tokens_per_run: i64,
    pub max_latency_per_attempt_ms: i64,
    pub max_cost_per_attempt_usd: f64,
    pub max_tokens_per_attempt: i64,
    pub source: String,
}

/// Selects the most specific active cap for the request triple.
///
/// Selector semantics: empty matches everything. Ties break on specificity
/// (count of non-empty selectors), then priority (higher wins), then id
/// (lexicographically lowest), so the result is deterministic for any
/// permutation of `caps`.
pub fn select_policy_cap<'a>(
    caps: &'a [PolicyCap],
    provider_type: &str,
    provider: &str,
    model: &str,
) -> Option<&'a PolicyCap> {
    let mut selected: Option<(&PolicyCap, i64)> = None;
    for cap in caps {
        if !cap.is_active {
            continue;
        }
        if !cap.provider_type.is_empty() && cap.provider_type != provider_type {
            continue;
        }
        if !cap.provider.is_empty() && cap.provider != provider {
            continue;
        }
        if !cap.model.is_empty() && cap.model != model {
            continue;
        }

        let specificity = [&cap.provider_type, &cap.provider, &cap.model]
            .iter()
            .filter(|selector| !selector.is_empty())
            .count() as i64;

        let better = match selected {
            None => true,
            Some((best, best_specificity)) => {
                specificity > best_specificity
                    || (specificity == best_specificity && cap.priority > best.priority)
                    || (specificity == best_specificity
                        && cap.priority == best.priority
                        && cap.id < best.id)
            }
        };
        if better {
            selected = Some((cap, specificity));
        }
    }
    selected.map(|(cap, _)| cap)
}

pub fn resolve_effective_limits(
    policy: &OrchestrationPolicy,
    cap: Option<&PolicyCap>,
) -> EffectiveLimits {
    let mut limits = EffectiveLimits {
        max_cost_per_run_usd: policy.max_cost_per_run_usd,
        max_attempts_per_run: policy.max_attempts_per_run,
        max_tokens_per_run: policy.max_tokens_per_run,
        max_latency_per_attempt_ms: policy.max_latency_per_attempt_ms,
        max_cost_per_attempt_usd: 0.0,
        max_tokens_per_attempt: 0,
        source: "global-policy".to_string(),
    };
    let Some(cap) = cap else {
        return limits;
    };

    limits.source = format!("policy-cap:{}", cap.id);
    if cap.max_cost_per_run_usd > 0.0 {
        limits.max_cost_per_run_usd = cap.max_cost_per_run_usd;
    }
    if cap.max_attempts_per_run > 0 {
        limits.max_attempts_per_run = cap.max_attempts_per_run;
    }
    if cap.max_tokens_per_run > 0 {
        limits.max_tokens_per_run = cap.max_tokens_per_run;
    }
    if cap.max_latency_per_attempt_ms > 0 {
        limits.max_latency_per_attempt_ms = cap.max_latency_per_attempt_ms;
    }
    if cap.max_cost_per_attempt_usd > 0.0 {
        limits.max_cost_per_attempt_usd = cap.max_cost_per_attempt_usd;
    }
    if cap.max_tokens_per_attempt > 0 {
        limits.max_tokens_per_attempt = cap.max_tokens_per_attempt;
    }
    limits
}

impl HubService {
    pub async fn get_policy(&self) -> Result<OrchestrationPolicy, AppError> {
        self.store.get_policy().await
    }

    /// Read-before-update so unspecified fields survive.
    pub async fn set_policy(
        &self,
        request: SetPolicyRequest,
    ) -> Result<OrchestrationPolicy, AppError> {
        let mut policy = self.store.get_policy().await?;

        if let Some(kill_switch) = request.kill_switch {
            policy.kill_switch = kill_switch;
        }
        if let Some(reason) = &request.kill_switch_reason {
            policy.kill_switch_reason = reason.trim().to_string();
        }
        if let Some(value) = request.max_cost_per_run_usd {
            if value < 0.0 {
                return Err(AppError::invalid_argument(
                    "max_cost_per_run_usd must be non-negative",
                ));
            }
            policy.max_cost_per_run_usd = value;
        }
        if let Some(value) = request.max_attempts_per_run {
            if value < 0 {
                return Err(AppError::invalid_argument(
                    "max_attempts_per_run must be non-negative",
                ));
            }
            policy.max_attempts_per_run = value;
        }
        if let Some(value) = request.max_tokens_per_run {
            if value < 0 {
                return Err(AppError::invalid_argument(
                    "max_tokens_per_run must be non-negative",
                ));
            }
            policy.max_tokens_per_run = value;
        }
        if let Some(value) = request.max_latency_per_attempt_ms {
            if value < 0 {
                return Err(AppError::invalid_argument(
                    "max_latency_per_attempt_ms must be non-negative",
                ));
            }
            policy.max_latency_per_attempt_ms = value;
        }

        policy.updated_at = self.clock.now();
        self.store.set_policy(&policy).await?;
        self.store.get_policy().await
    }

    pub async fn list_policy_caps(&self) -> Result<Vec<PolicyCap>, AppError> {
        let mut items = self.store.list_policy_caps().await?;
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    pub async fn upsert_policy_cap(
        &self,
        request: UpsertPolicyCapRequest,
    ) -> Result<PolicyCap, AppError> {
        let id = match request.id.trim() {
            "" => self.ids.new_id("cap"),
            raw => raw.to_string(),
        };
        let provider_type = request.provider_type.trim();
        if !provider_type.is_empty() {
            ProviderType::parse(provider_type)?;
        }

        let mut cap = PolicyCap {
            id: id.clone(),
            name: request.name.trim().to_string(),
            provider_type: provider_type.to_string(),
            provider: request.provider.trim().to_string(),
            model: request.model.trim().to_string(),
            max_cost_per_run_usd: 0.0,
            max_attempts_per_run: 0,
            max_tokens_per_run: 0,
            max_cost_per_attempt_usd: 0.0,
            max_tokens_per_attempt: 0,
            max_latency_per_attempt_ms: 0,
            priority: 0,
            dry_run: false,
            is_active: true,
            updated_at: self.clock.now(),
        };

        let existing = self.store.list_policy_caps().await?;
        if let Some(current) = existing.into_iter().find(|item| item.id == id) {
            cap = current;
        }

        if !request.name.is_empty() {
            cap.name = request.name.trim().to_string();
        }
        if !request.provider_type.is_empty() {
            cap.provider_type = provider_type.to_string();
        }
        if !request.provider.is_empty() {
            cap.provider = request.provider.trim().to_string();
        }
        if !request.model.is_empty() {
            cap.model = request.model.trim().to_string();
        }
        if let Some(value) = request.max_cost_per_run_usd {
            if value < 0.0 {
                return Err(AppError::invalid_argument(
                    "max_cost_per_run_usd must be non-negative",
                ));
            }
            cap.max_cost_per_run_usd = value;
        }
        if let Some(value) = request.max_attempts_per_run {
            if value < 0 {
                return Err(AppError::invalid_argument(
                    "max_attempts_per_run must be non-negative",
                ));
            }
            cap.max_attempts_per_run = value;
        }
        if let Some(value) = request.max_tokens_per_run {
            if value < 0 {
                return Err(AppError::invalid_argument(
                    "max_tokens_per_run must be non-negative",
                ));
            }
            cap.max_tokens_per_run = value;
        }
        if let Some(value) = request.max_cost_per_attempt_usd {
            if value < 0.0 {
                return Err(AppError::invalid_argument(
                    "max_cost_per_attempt_usd must be non-negative",
                ));
            }
            cap.max_cost_per_attempt_usd = value;
        }
        if let Some(value) = request.max_tokens_per_attempt {
            if value < 0 {
                return Err(AppError::invalid_argument(
                    "max_tokens_per_attempt must be non-negative",
                ));
            }
            cap.max_tokens_per_attempt = value;
        }
        if let Some(value) = request.max_latency_per_attempt_ms {
            if value < 0 {
                return Err(AppError::invalid_argument(
                    "max_latency_per_attempt_ms must be non-negative",
                ));
            }
            cap.max_latency_per_attempt_ms = value;
        }
        if let Some(priority) = request.priority {
            cap.priority = priority;
        }
        if let Some(dry_run) = request.dry_run {
            cap.dry_run = dry_run;
        }
        if let Some(is_active) = request.is_active {
            cap.is_active = is_active;
        }
        cap.updated_at = self.clock.now();

        self.store.upsert_policy_cap(&cap).await?;
        Ok(cap)
    }

    pub async fn delete_policy_cap(&self, request: DeletePolicyCapRequest) -> Result<(), AppError> {
        let id = request.id.trim();
        if id.is_empty() {
            return Err(AppError::invalid_argument("id is required"));
        }
        if !self.store.delete_policy_cap(id).await? {
            return Err(AppError::not_found("policy cap not found"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::service::testutil::memory_hub;

    fn cap(id: &str, provider_type: &str, provider: &str, model: &str, priority: i64) -> PolicyCap {
        PolicyCap {
            id: id.to_string(),
            name: id.to_string(),
            provider_type: provider_type.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            max_cost_per_run_usd: 0.0,
            max_attempts_per_run: 0,
            max_tokens_per_run: 0,
            max_cost_per_attempt_usd: 0.0,
            max_tokens_per_attempt: 0,
            max_latency_per_attempt_ms: 0,
            priority,
            dry_run: false,
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_select_prefers_higher_specificity_over_priority() {
        let caps = vec![
            cap("cap_wide", "", "", "", 100),
            cap("cap_narrow", "api", "openai", "m", 1),
        ];
        let selected = select_policy_cap(&caps, "api", "openai", "m").unwrap();
        assert_eq!(selected.id, "cap_narrow");
    }

    #[test]
    fn test_select_breaks_specificity_tie_on_priority_then_id() {
        let caps = vec![
            cap("cap_b", "api", "", "", 5),
            cap("cap_a", "", "", "m", 5),
            cap("cap_c", "api", "", "", 9),
        ];
        let selected = select_policy_cap(&caps, "api", "p", "m").unwrap();
        assert_eq!(selected.id, "cap_c", "priority should win at equal specificity");

        let caps = vec![cap("cap_b", "api", "", "", 5), cap("cap_a", "api", "", "", 5)];
        let selected = select_policy_cap(&caps, "api", "p", "m").unwrap();
        assert_eq!(selected.id, "cap_a", "lowest id should win at equal priority");
    }

    #[test]
    fn test_select_is_deterministic_under_permutation() {
        let base = vec![
            cap("cap_1", "api", "", "", 3),
            cap("cap_2", "", "openai", "", 3),
            cap("cap_3", "", "", "m", 3),
            cap("cap_4", "api", "openai", "", 2),
            cap("cap_5", "", "", "", 50),
        ];
        let expected = select_policy_cap(&base, "api", "openai", "m").unwrap().id.clone();

        let mut rotated = base.clone();
        for _ in 0..base.len() {
            rotated.rotate_left(1);
            let got = select_policy_cap(&rotated, "api", "openai", "m").unwrap();
            assert_eq!(got.id, expected);
        }

        let mut reversed = base.clone();
        reversed.reverse();
        assert_eq!(
            select_policy_cap(&reversed, "api", "openai", "m").unwrap().id,
            expected
        );
    }

    #[test]
    fn test_select_skips_inactive_and_mismatched() {
        let mut inactive = cap("cap_off", "api", "", "", 99);
        inactive.is_active = false;
        let caps = vec![inactive, cap("cap_other_model", "", "", "other", 50)];
        assert!(select_policy_cap(&caps, "api", "p", "m").is_none());
    }

    #[test]
    fn test_resolve_overlays_only_nonzero_cap_fields() {
        let policy = OrchestrationPolicy {
            max_cost_per_run_usd: 1.0,
            max_attempts_per_run: 10,
            max_tokens_per_run: 1000,
            max_latency_per_attempt_ms: 500,
            ..Default::default()
        };

        let limits = resolve_effective_limits(&policy, None);
        assert_eq!(limits.source, "global-policy");
        assert_eq!(limits.max_attempts_per_run, 10);
        assert_eq!(limits.max_cost_per_attempt_usd, 0.0);

        let mut override_cap = cap("cap_x", "api", "", "", 1);
        override_cap.max_attempts_per_run = 2;
        override_cap.max_cost_per_attempt_usd = 0.25;
        let limits = resolve_effective_limits(&policy, Some(&override_cap));
        assert_eq!(limits.source, "policy-cap:cap_x");
        assert_eq!(limits.max_attempts_per_run, 2);
        assert_eq!(limits.max_cost_per_run_usd, 1.0, "zero cap field inherits global");
        assert_eq!(limits.max_cost_per_attempt_usd, 0.25);
    }

    #[tokio::test]
    async fn test_set_policy_preserves_unspecified_fields() {
        let (hub, _) = memory_hub().await;
        hub.set_policy(SetPolicyRequest {
            max_attempts_per_run: Some(5),
            max_cost_per_run_usd: Some(2.0),
            ..Default::default()
        })
        .await
        .unwrap();

        let updated = hub
            .set_policy(SetPolicyRequest {
                kill_switch: Some(true),
                kill_switch_reason: Some(" budget freeze ".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(updated.kill_switch);
        assert_eq!(updated.kill_switch_reason, "budget freeze");
        assert_eq!(updated.max_attempts_per_run, 5);
        assert_eq!(updated.max_cost_per_run_usd, 2.0);
    }

    #[tokio::test]
    async fn test_set_policy_rejects_negative_limits() {
        let (hub, _) = memory_hub().await;
        for request in [
            SetPolicyRequest {
                max_cost_per_run_usd: Some(-0.1),
                ..Default::default()
            },
            SetPolicyRequest {
                max_attempts_per_run: Some(-1),
                ..Default::default()
            },
            SetPolicyRequest {
                max_tokens_per_run: Some(-1),
                ..Default::default()
            },
            SetPolicyRequest {
                max_latency_per_attempt_ms: Some(-1),
                ..Default::default()
            },
        ] {
            let err = hub.set_policy(request).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn test_upsert_cap_generates_id_and_merges_existing() {
        let (hub, _) = memory_hub().await;
        let created = hub
            .upsert_policy_cap(UpsertPolicyCapRequest {
                name: "api cap".to_string(),
                provider_type: "api".to_string(),
                max_cost_per_run_usd: Some(0.05),
                priority: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(created.id.starts_with("cap_"));
        assert!(created.is_active);
        assert!(!created.dry_run);

        // Partial update keeps earlier fields.
        let updated = hub
            .upsert_policy_cap(UpsertPolicyCapRequest {
                id: created.id.clone(),
                dry_run: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(updated.dry_run);
        assert_eq!(updated.max_cost_per_run_usd, 0.05);
        assert_eq!(updated.priority, 10);
        assert_eq!(updated.provider_type, "api");
    }

    #[tokio::test]
    async fn test_upsert_cap_validates_provider_type_and_negatives() {
        let (hub, _) = memory_hub().await;
        let err = hub
            .upsert_policy_cap(UpsertPolicyCapRequest {
                provider_type: "cloud".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = hub
            .upsert_policy_cap(UpsertPolicyCapRequest {
                max_tokens_per_attempt: Some(-2),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_list_caps_sorted_priority_desc_then_id_asc() {
        let (hub, _) = memory_hub().await;
        for (id, priority) in [("cap_b", 5), ("cap_a", 5), ("cap_c", 9)] {
            hub.upsert_policy_cap(UpsertPolicyCapRequest {
                id: id.to_string(),
                priority: Some(priority),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let caps = hub.list_policy_caps().await.unwrap();
        let ids: Vec<&str> = caps.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cap_c", "cap_a", "cap_b"]);
    }

    #[tokio::test]
    async fn test_delete_cap_not_found() {
        let (hub, _) = memory_hub().await;
        let err = hub
            .delete_policy_cap(DeletePolicyCapRequest {
                id: "cap_missing".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
