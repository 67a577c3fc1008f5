use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a proposal wants to change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    PolicyChange,
    SelfPromptChange,
}

impl ProposalType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ProposalType::PolicyChange => "policy_change",
            ProposalType::SelfPromptChange => "self_prompt_change",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "self_prompt_change" => ProposalType::SelfPromptChange,
            _ => ProposalType::PolicyChange,
        }
    }
}

/// Proposal lifecycle states. Transitions are monotonic:
/// pending -> in_experiment -> accepted | rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    InExperiment,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::InExperiment => "in_experiment",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in_experiment" => ProposalStatus::InExperiment,
            "accepted" => ProposalStatus::Accepted,
            "rejected" => ProposalStatus::Rejected,
            _ => ProposalStatus::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProposalStatus::Accepted | ProposalStatus::Rejected)
    }
}

/// A suggested change to the policy or self-prompt, with justification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub created_by: String,
    pub proposal_type: ProposalType,
    pub payload: Value,
    pub current_policy_version: Option<String>,
    pub current_self_prompt_id: Option<String>,
    pub reason: String,
    pub status: ProposalStatus,
    pub final_policy_version: Option<String>,
    pub final_self_prompt_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_db_strings() {
        for status in [
            ProposalStatus::Pending,
            ProposalStatus::InExperiment,
            ProposalStatus::Accepted,
            ProposalStatus::Rejected,
        ] {
            assert_eq!(ProposalStatus::from_db(status.as_db_str()), status);
        }
    }

    #[test]
    fn unknown_status_falls_back_to_pending() {
        assert_eq!(ProposalStatus::from_db("garbage"), ProposalStatus::Pending);
    }

    #[test]
    fn terminal_states_are_accepted_and_rejected() {
        assert!(ProposalStatus::Accepted.is_terminal());
        assert!(ProposalStatus::Rejected.is_terminal());
        assert!(!ProposalStatus::Pending.is_terminal());
        assert!(!ProposalStatus::InExperiment.is_terminal());
    }
}
