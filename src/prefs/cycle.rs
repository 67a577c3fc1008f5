use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{infer_preferences, routing_override_for, FeedbackSignal};
use crate::database::PolicyStore;
use crate::policy::merge::empty_config;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSettings {
    /// How far back to look for interaction history.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    /// Minimum traces inside the window before a user is considered.
    #[serde(default = "default_min_trace_count")]
    pub min_trace_count: u32,
    /// Cap on traces fetched per user per pass.
    #[serde(default = "default_max_traces_per_user")]
    pub max_traces_per_user: usize,
}

fn default_lookback_hours() -> i64 {
    72
}

fn default_min_trace_count() -> u32 {
    10
}

fn default_max_traces_per_user() -> usize {
    200
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
            min_trace_count: default_min_trace_count(),
            max_traces_per_user: default_max_traces_per_user(),
        }
    }
}

/// What one personalization pass did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub eligible_users: usize,
    pub profiles_patched: usize,
    pub overlays_updated: usize,
    pub skipped_no_signal: usize,
    pub failures: usize,
    pub aborted_no_active_policy: bool,
}

/// Scheduled batch pass: infer preferences from each eligible user's
/// recent traces, patch their profile, and upsert their policy overlay
/// against the currently active policy version.
///
/// Aborts entirely when no policy version is active - overlays must not
/// be attached to an undefined base. One user failing is logged and
/// skipped; the rest of the batch proceeds.
pub fn run_personalization_cycle(
    store: &PolicyStore,
    settings: &CycleSettings,
) -> Result<CycleReport> {
    let mut report = CycleReport::default();

    let user_ids = store
        .eligible_user_ids(settings.lookback_hours, settings.min_trace_count)
        .context("Failed to select eligible users")?;
    report.eligible_users = user_ids.len();

    if user_ids.is_empty() {
        tracing::info!("Personalization cycle: no users with enough traces");
        return Ok(report);
    }

    let Some(active_policy) = store.get_active_policy()? else {
        tracing::warn!("Personalization cycle: no active policy version, skipping pass");
        report.aborted_no_active_policy = true;
        return Ok(report);
    };

    for user_id in &user_ids {
        match personalize_user(store, settings, user_id, &active_policy.id) {
            Ok(UserOutcome::Updated) => {
                report.profiles_patched += 1;
                report.overlays_updated += 1;
            }
            Ok(UserOutcome::NoSignal) => report.skipped_no_signal += 1,
            Err(e) => {
                report.failures += 1;
                tracing::warn!("Personalization failed for user {}: {:#}", user_id, e);
            }
        }
    }

    tracing::info!(
        "Personalization cycle: {} eligible, {} overlays updated, {} without signal, {} failures",
        report.eligible_users,
        report.overlays_updated,
        report.skipped_no_signal,
        report.failures
    );
    Ok(report)
}

enum UserOutcome {
    Updated,
    NoSignal,
}

fn personalize_user(
    store: &PolicyStore,
    settings: &CycleSettings,
    user_id: &str,
    active_policy_id: &str,
) -> Result<UserOutcome> {
    let traces = store
        .traces_for_user(user_id, settings.lookback_hours, settings.max_traces_per_user)
        .context("Failed to fetch traces")?;

    let signals: Vec<FeedbackSignal> = traces
        .iter()
        .map(|trace| FeedbackSignal::from_value(&trace.user_feedback))
        .collect();

    let prefs = infer_preferences(&signals);
    if prefs.is_empty() {
        return Ok(UserOutcome::NoSignal);
    }

    store
        .patch_user_preferences(user_id, &prefs.as_profile_patch())
        .context("Failed to patch profile preferences")?;
    tracing::debug!("Updated preferences for user {}: {:?}", user_id, prefs);

    let routing_override = routing_override_for(&prefs);
    if routing_override
        .as_object()
        .map_or(false, |map| !map.is_empty())
    {
        store
            .upsert_user_policy_overlay(
                user_id,
                active_policy_id,
                &routing_override,
                &empty_config(),
            )
            .context("Failed to upsert policy overlay")?;
        tracing::debug!("Updated policy overlay for user {}", user_id);
    }

    Ok(UserOutcome::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::NewTrace;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("overseer_{}_{}.db", name, Uuid::new_v4()));
        path
    }

    fn settings() -> CycleSettings {
        CycleSettings {
            lookback_hours: 72,
            min_trace_count: 2,
            max_traces_per_user: 50,
        }
    }

    fn trace_with_feedback(user_id: &str, feedback: Value) -> NewTrace {
        NewTrace {
            session_id: "s".to_string(),
            task_id: Uuid::new_v4().to_string(),
            task_type: "chat".to_string(),
            domain: "general".to_string(),
            input_text: "question".to_string(),
            output_text: "answer".to_string(),
            metadata: json!({}),
            policy_version_id: "pv".to_string(),
            self_prompt_id: "sp".to_string(),
            experiment_run_id: None,
            user_feedback: feedback,
            user_id: Some(user_id.to_string()),
        }
    }

    #[test]
    fn cycle_with_no_eligible_users_performs_no_writes() {
        let path = temp_db_path("cycle_empty");
        let store = PolicyStore::new(&path).expect("store");

        let report = run_personalization_cycle(&store, &settings()).expect("cycle");
        assert_eq!(report.eligible_users, 0);
        assert_eq!(report.overlays_updated, 0);
        assert!(!report.aborted_no_active_policy);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cycle_aborts_when_no_policy_is_active() {
        let path = temp_db_path("cycle_no_policy");
        let store = PolicyStore::new(&path).expect("store");

        let user = store
            .get_or_create_user("ext-1", &json!({"preferences": {}}))
            .expect("user");
        for _ in 0..2 {
            store
                .insert_trace(&trace_with_feedback(
                    &user.id,
                    json!({"tag": "too_blunt", "thumbs_down": true}),
                ))
                .expect("trace");
        }

        let report = run_personalization_cycle(&store, &settings()).expect("cycle");
        assert!(report.aborted_no_active_policy);
        assert_eq!(report.overlays_updated, 0);
        assert!(store.get_active_overlay(&user.id).expect("lookup").is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cycle_builds_overlay_and_patches_profile_from_feedback() {
        let path = temp_db_path("cycle_end_to_end");
        let store = PolicyStore::new(&path).expect("store");

        let policy = store
            .insert_policy_version(
                "meta_agent",
                &json!({"style": {"directness": "high"}}),
                &json!({}),
                &json!({}),
                None,
                false,
            )
            .expect("policy");
        store
            .set_active(crate::policy::VersionedKind::Policy, &policy)
            .expect("activate");

        let user = store
            .get_or_create_user("ext-1", &json!({"preferences": {"language": "en"}}))
            .expect("user");
        for _ in 0..2 {
            store
                .insert_trace(&trace_with_feedback(
                    &user.id,
                    json!({"tag": "too_blunt", "thumbs_down": true}),
                ))
                .expect("trace");
        }

        let report = run_personalization_cycle(&store, &settings()).expect("cycle");
        assert_eq!(report.eligible_users, 1);
        assert_eq!(report.overlays_updated, 1);
        assert_eq!(report.failures, 0);

        let overlay = store
            .get_active_overlay(&user.id)
            .expect("lookup")
            .expect("overlay exists");
        assert_eq!(overlay.base_policy_id, policy);
        assert_eq!(overlay.routing_override["style"]["directness"], "low");

        let profile = store
            .get_user_profile(&user.id)
            .expect("profile")
            .expect("exists");
        assert_eq!(profile["preferences"]["tone"], "gentle");
        assert_eq!(profile["preferences"]["language"], "en");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn users_without_usable_feedback_are_skipped_not_failed() {
        let path = temp_db_path("cycle_no_signal");
        let store = PolicyStore::new(&path).expect("store");

        let policy = store
            .insert_policy_version("meta_agent", &json!({}), &json!({}), &json!({}), None, true)
            .expect("policy");
        store
            .set_active(crate::policy::VersionedKind::Policy, &policy)
            .expect("activate");

        let user = store
            .get_or_create_user("ext-quiet", &json!({"preferences": {}}))
            .expect("user");
        for _ in 0..2 {
            store
                .insert_trace(&trace_with_feedback(&user.id, json!({})))
                .expect("trace");
        }

        let report = run_personalization_cycle(&store, &settings()).expect("cycle");
        assert_eq!(report.eligible_users, 1);
        assert_eq!(report.skipped_no_signal, 1);
        assert_eq!(report.overlays_updated, 0);

        let _ = std::fs::remove_file(&path);
    }
}
