use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A logged input/output exchange. Append-only; the control plane reads
/// traces to infer preferences but never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub session_id: String,
    pub task_id: String,
    pub task_type: String,
    pub domain: String,
    pub input_text: String,
    pub output_text: String,
    pub metadata: Value,
    pub policy_version_id: String,
    pub self_prompt_id: String,
    pub experiment_run_id: Option<String>,
    pub user_feedback: Value,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the request resolver when appending a trace.
#[derive(Debug, Clone, Default)]
pub struct NewTrace {
    pub session_id: String,
    pub task_id: String,
    pub task_type: String,
    pub domain: String,
    pub input_text: String,
    pub output_text: String,
    pub metadata: Value,
    pub policy_version_id: String,
    pub self_prompt_id: String,
    pub experiment_run_id: Option<String>,
    pub user_feedback: Value,
    pub user_id: Option<String>,
}
