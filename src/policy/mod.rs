pub mod merge;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use self::merge::{deep_merge, empty_config};

/// Which versioned registry a row belongs to. Both registries share the
/// same activation discipline: at most one active row at a time, flipped
/// inside a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionedKind {
    Policy,
    SelfPrompt,
}

impl VersionedKind {
    pub fn table(self) -> &'static str {
        match self {
            VersionedKind::Policy => "policy_versions",
            VersionedKind::SelfPrompt => "self_prompts",
        }
    }
}

/// An immutable snapshot of the global behavioral configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVersion {
    pub id: String,
    pub created_by: String,
    pub label: Option<String>,
    pub routing: Value,
    pub tool_use: Value,
    pub safety_overrides: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// An immutable snapshot of the agent's self-instruction payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfPrompt {
    pub id: String,
    pub merged: Value,
    pub editable: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-user delta applied on top of the active policy version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPolicyOverlay {
    pub id: String,
    pub user_id: String,
    pub base_policy_id: String,
    pub routing_override: Value,
    pub tool_use_override: Value,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

/// The policy a single request actually runs under: base policy with the
/// user's overlay folded into `routing` and `tool_use`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub policy_version_id: Option<String>,
    pub routing: Value,
    pub tool_use: Value,
    pub safety_overrides: Value,
}

impl EffectivePolicy {
    /// Safe fallback when no policy version has ever been activated.
    pub fn defaults() -> Self {
        Self {
            policy_version_id: None,
            routing: empty_config(),
            tool_use: empty_config(),
            safety_overrides: empty_config(),
        }
    }

    pub fn from_version(version: &PolicyVersion) -> Self {
        Self {
            policy_version_id: Some(version.id.clone()),
            routing: version.routing.clone(),
            tool_use: version.tool_use.clone(),
            safety_overrides: version.safety_overrides.clone(),
        }
    }
}

/// Fold a user overlay into a base policy version.
///
/// Only `routing` and `tool_use` pass through the merge;
/// `safety_overrides` is carried over untouched so an overlay can never
/// weaken safety settings. With no overlay the base passes through
/// unmodified.
pub fn apply_overlay(
    version: &PolicyVersion,
    overlay: Option<&UserPolicyOverlay>,
) -> EffectivePolicy {
    let mut effective = EffectivePolicy::from_version(version);

    if let Some(overlay) = overlay {
        effective.routing = deep_merge(&version.routing, &overlay.routing_override);
        effective.tool_use = deep_merge(&version.tool_use, &overlay.tool_use_override);
    }

    effective
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_version() -> PolicyVersion {
        PolicyVersion {
            id: "pv-1".to_string(),
            created_by: "meta_agent".to_string(),
            label: Some("baseline".to_string()),
            routing: json!({"style": {"directness": "high"}, "model": "large"}),
            tool_use: json!({"allowed": ["search"]}),
            safety_overrides: json!({"blocklist": ["exec"]}),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn no_overlay_passes_base_through() {
        let version = sample_version();
        let effective = apply_overlay(&version, None);
        assert_eq!(effective.policy_version_id.as_deref(), Some("pv-1"));
        assert_eq!(effective.routing, version.routing);
        assert_eq!(effective.tool_use, version.tool_use);
    }

    #[test]
    fn overlay_merges_routing_but_never_safety() {
        let version = sample_version();
        let overlay = UserPolicyOverlay {
            id: "ov-1".to_string(),
            user_id: "u-1".to_string(),
            base_policy_id: "pv-1".to_string(),
            routing_override: json!({"style": {"directness": "low"}}),
            tool_use_override: json!({"allowed": ["search", "calculator"]}),
            is_active: true,
            updated_at: Utc::now(),
        };

        let effective = apply_overlay(&version, Some(&overlay));
        assert_eq!(effective.routing["style"]["directness"], "low");
        assert_eq!(effective.routing["model"], "large");
        assert_eq!(effective.tool_use["allowed"], json!(["search", "calculator"]));
        assert_eq!(effective.safety_overrides, version.safety_overrides);
    }
}
