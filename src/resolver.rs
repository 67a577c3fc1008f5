use anyhow::{Context, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::database::PolicyStore;
use crate::policy::{apply_overlay, EffectivePolicy, SelfPrompt};
use crate::trace::NewTrace;

/// Everything a request needs from the control plane before the
/// generative backend is invoked.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub policy: EffectivePolicy,
    pub self_prompt: Option<SelfPrompt>,
    pub overlay_applied: bool,
}

impl Resolution {
    /// The instruction payload to hand the prompt builder: the merged
    /// payload when present, otherwise the editable one.
    pub fn prompt_payload(&self) -> Value {
        match &self.self_prompt {
            Some(prompt) => {
                if prompt.merged.as_object().map_or(false, |m| !m.is_empty()) {
                    prompt.merged.clone()
                } else {
                    prompt.editable.clone()
                }
            }
            None => Value::Object(serde_json::Map::new()),
        }
    }
}

/// Fields handed back by the request resolver after generation.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub domain: Option<String>,
    pub input_text: String,
    pub output_text: String,
    pub metadata: Value,
    pub user_feedback: Option<Value>,
    pub experiment_run_id: Option<String>,
    pub user_id: Option<String>,
}

/// Resolve the effective policy for one request: active base policy with
/// the user's overlay folded in. Absence anywhere is a defined default,
/// never an error - no active policy yields empty configs, an unknown or
/// anonymous user gets the base policy unmodified.
pub fn resolve_effective_policy(
    store: &PolicyStore,
    user_id: Option<&str>,
) -> Result<Resolution> {
    let self_prompt = store
        .get_active_self_prompt()
        .context("Failed to load active self-prompt")?;

    let Some(base) = store
        .get_active_policy()
        .context("Failed to load active policy")?
    else {
        tracing::debug!("No active policy version, resolving with defaults");
        return Ok(Resolution {
            policy: EffectivePolicy::defaults(),
            self_prompt,
            overlay_applied: false,
        });
    };

    let overlay = match user_id {
        Some(user_id) => store
            .get_active_overlay(user_id)
            .context("Failed to load user overlay")?,
        None => None,
    };

    let overlay_applied = overlay.is_some();
    let policy = apply_overlay(&base, overlay.as_ref());

    Ok(Resolution {
        policy,
        self_prompt,
        overlay_applied,
    })
}

/// Append the trace for a completed exchange. Skipped (returning `None`)
/// when the request ran on fallback defaults, since there is no concrete
/// policy or self-prompt version to attribute the exchange to.
pub fn record_exchange(
    store: &PolicyStore,
    resolution: &Resolution,
    exchange: Exchange,
) -> Result<Option<String>> {
    let (Some(policy_version_id), Some(self_prompt)) = (
        resolution.policy.policy_version_id.as_ref(),
        resolution.self_prompt.as_ref(),
    ) else {
        tracing::debug!("Exchange ran on defaults, not recording a trace");
        return Ok(None);
    };

    let trace_id = store
        .insert_trace(&NewTrace {
            session_id: exchange
                .session_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            task_id: exchange
                .task_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            task_type: exchange.task_type.unwrap_or_else(|| "chat".to_string()),
            domain: exchange.domain.unwrap_or_else(|| "general".to_string()),
            input_text: exchange.input_text,
            output_text: exchange.output_text,
            metadata: exchange.metadata,
            policy_version_id: policy_version_id.clone(),
            self_prompt_id: self_prompt.id.clone(),
            experiment_run_id: exchange.experiment_run_id,
            user_feedback: exchange
                .user_feedback
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            user_id: exchange.user_id,
        })
        .context("Failed to insert trace")?;

    Ok(Some(trace_id))
}
