use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Experiment, ExperimentRun, ExperimentStatus, RunStatus};

/// Replaceable decision rule for finalizing an experiment. The
/// orchestrator persists whatever the verdict says; changing acceptance
/// criteria is a data change here, not orchestrator control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationPolicy {
    /// Baseline score to beat when the experiment config carries none.
    pub default_baseline_score: f64,
    /// Mean candidate score must exceed the baseline by at least this much.
    pub min_score_margin: f64,
    /// Every completed run must report safety_ok.
    pub require_all_safety_ok: bool,
    /// Minimum completed runs needed to decide at all.
    pub min_completed_runs: usize,
    /// A failed run fails the whole experiment instead of being ignored.
    pub fail_on_failed_run: bool,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            default_baseline_score: 0.5,
            min_score_margin: 0.0,
            require_all_safety_ok: true,
            min_completed_runs: 1,
            fail_on_failed_run: true,
        }
    }
}

/// The terminal aggregate for one experiment: which status to persist,
/// whether the proposal should be accepted, and the summary to store.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub status: ExperimentStatus,
    pub accepted: bool,
    pub rationale: String,
    pub result_summary: Value,
}

/// Deterministic gate evaluation over an experiment's terminal runs.
///
/// The baseline score comes from the experiment config's
/// `baseline_score` when present, else the policy fallback. Accepts only
/// when every gate passes; failed runs either fail the experiment
/// outright or are excluded from the mean, per policy.
pub fn evaluate_experiment(
    experiment: &Experiment,
    runs: &[ExperimentRun],
    policy: &AggregationPolicy,
) -> Verdict {
    let completed: Vec<&ExperimentRun> = runs
        .iter()
        .filter(|run| run.status == RunStatus::Completed)
        .collect();
    let failed_runs = runs
        .iter()
        .filter(|run| run.status == RunStatus::Failed)
        .count();

    let baseline_score = experiment
        .config
        .get("baseline_score")
        .and_then(Value::as_f64)
        .unwrap_or(policy.default_baseline_score);

    let mean_candidate_score = if completed.is_empty() {
        0.0
    } else {
        completed
            .iter()
            .map(|run| run.score.unwrap_or(0.0))
            .sum::<f64>()
            / completed.len() as f64
    };
    let all_safety_ok = completed.iter().all(|run| run.safety_ok.unwrap_or(false));

    let mut gate_failures = Vec::new();

    if policy.fail_on_failed_run && failed_runs > 0 {
        gate_failures.push(format!("{} run(s) failed in execution", failed_runs));
    }

    if completed.len() < policy.min_completed_runs {
        gate_failures.push(format!(
            "only {} completed run(s), need {}",
            completed.len(),
            policy.min_completed_runs
        ));
    }

    // An experiment that never produced enough evidence is failed, not
    // rejected on the merits.
    let undecidable = !gate_failures.is_empty();

    if mean_candidate_score <= baseline_score + policy.min_score_margin {
        gate_failures.push(format!(
            "mean candidate score {:.4} did not beat baseline {:.4} by margin {:.4}",
            mean_candidate_score, baseline_score, policy.min_score_margin
        ));
    }

    if policy.require_all_safety_ok && !all_safety_ok {
        gate_failures.push("not every completed run reported safety_ok".to_string());
    }

    let accepted = gate_failures.is_empty();
    let status = if undecidable {
        ExperimentStatus::Failed
    } else {
        ExperimentStatus::Completed
    };

    let rationale = if accepted {
        format!(
            "Accept candidate '{}' over baseline '{}' (mean score {:.4} > baseline {:.4}, {} run(s), all safety_ok)",
            experiment.candidate_policy_id,
            experiment.baseline_policy_id,
            mean_candidate_score,
            baseline_score,
            completed.len()
        )
    } else {
        format!(
            "Reject candidate '{}': {}",
            experiment.candidate_policy_id,
            gate_failures.join("; ")
        )
    };

    let result_summary = json!({
        "accepted": accepted,
        "mean_candidate_score": mean_candidate_score,
        "baseline_score": baseline_score,
        "completed_runs": completed.len(),
        "failed_runs": failed_runs,
        "all_safety_ok": all_safety_ok,
        "gate_failures": gate_failures,
        "rationale": rationale,
    });

    Verdict {
        status,
        accepted,
        rationale,
        result_summary,
    }
}
