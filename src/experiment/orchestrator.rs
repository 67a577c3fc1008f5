use anyhow::{Context, Result};
use serde_json::Value;

use super::aggregation::{evaluate_experiment, AggregationPolicy};
use super::Experiment;
use crate::database::PolicyStore;
use crate::policy::VersionedKind;
use crate::proposal::ProposalStatus;

/// Outcome counters for one orchestrator pass.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub examined: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub lost_races: usize,
    pub failures: usize,
}

/// Create an experiment with `run_count` trial runs for a proposal and
/// move the proposal to in_experiment. Returns the experiment id.
pub fn spawn_experiment(
    store: &PolicyStore,
    proposal_id: &str,
    baseline_policy_id: &str,
    candidate_policy_id: &str,
    config: &Value,
    run_count: u32,
) -> Result<String> {
    let experiment_id = store
        .create_experiment(proposal_id, baseline_policy_id, candidate_policy_id, config)
        .context("Failed to create experiment")?;

    for run_index in 0..run_count {
        store
            .create_experiment_run(&experiment_id, i64::from(run_index), candidate_policy_id)
            .with_context(|| format!("Failed to create run {run_index}"))?;
    }

    store
        .mark_proposal_in_experiment(proposal_id)
        .context("Failed to mark proposal in experiment")?;

    tracing::info!(
        "Spawned experiment {} for proposal {} ({} runs, candidate {})",
        experiment_id,
        proposal_id,
        run_count,
        candidate_policy_id
    );
    Ok(experiment_id)
}

/// One scheduler pass: finalize every experiment whose runs have all
/// reached a terminal state, then resolve the owning proposal and, on
/// acceptance, activate the candidate policy.
///
/// Safe under at-least-once scheduling: finalization is conditional, a
/// lost race is counted and skipped, and one experiment's failure never
/// aborts the rest of the pass.
pub fn run_orchestrator_tick(
    store: &PolicyStore,
    policy: &AggregationPolicy,
    failed_runs_block_finalize: bool,
) -> Result<TickReport> {
    let ready = store
        .experiments_ready_to_finalize(failed_runs_block_finalize)
        .context("Failed to list experiments ready to finalize")?;

    let mut report = TickReport {
        examined: ready.len(),
        ..TickReport::default()
    };

    for experiment in &ready {
        match finalize_one(store, policy, experiment) {
            Ok(FinalizeOutcome::Accepted) => report.accepted += 1,
            Ok(FinalizeOutcome::Rejected) => report.rejected += 1,
            Ok(FinalizeOutcome::LostRace) => report.lost_races += 1,
            Err(e) => {
                report.failures += 1;
                tracing::warn!("Failed to finalize experiment {}: {:#}", experiment.id, e);
            }
        }
    }

    if report.examined > 0 {
        tracing::info!(
            "Orchestrator tick: {} ready, {} accepted, {} rejected, {} lost races, {} failures",
            report.examined,
            report.accepted,
            report.rejected,
            report.lost_races,
            report.failures
        );
    }
    Ok(report)
}

enum FinalizeOutcome {
    Accepted,
    Rejected,
    LostRace,
}

fn finalize_one(
    store: &PolicyStore,
    policy: &AggregationPolicy,
    experiment: &Experiment,
) -> Result<FinalizeOutcome> {
    let runs = store
        .runs_for_experiment(&experiment.id)
        .context("Failed to load runs")?;

    let verdict = evaluate_experiment(experiment, &runs, policy);

    let finalized = store
        .finalize_experiment(&experiment.id, verdict.status, &verdict.result_summary)
        .context("Failed to persist finalization")?;
    if !finalized {
        // Another worker got here first; its verdict stands.
        tracing::debug!("Experiment {} already finalized elsewhere", experiment.id);
        return Ok(FinalizeOutcome::LostRace);
    }

    if verdict.accepted {
        store
            .resolve_proposal(
                &experiment.proposal_id,
                ProposalStatus::Accepted,
                Some(&experiment.candidate_policy_id),
                None,
                Some(&verdict.rationale),
            )
            .context("Failed to resolve proposal as accepted")?;
        store
            .set_active(VersionedKind::Policy, &experiment.candidate_policy_id)
            .context("Failed to activate candidate policy")?;
        tracing::info!(
            "Experiment {}: accepted, activated candidate policy {}",
            experiment.id,
            experiment.candidate_policy_id
        );
        Ok(FinalizeOutcome::Accepted)
    } else {
        store
            .resolve_proposal(
                &experiment.proposal_id,
                ProposalStatus::Rejected,
                None,
                None,
                Some(&verdict.rationale),
            )
            .context("Failed to resolve proposal as rejected")?;
        tracing::info!("Experiment {}: rejected ({})", experiment.id, verdict.rationale);
        Ok(FinalizeOutcome::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExperimentStatus;
    use crate::proposal::ProposalType;
    use serde_json::json;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("overseer_{}_{}.db", name, Uuid::new_v4()));
        path
    }

    struct Fixture {
        store: PolicyStore,
        path: PathBuf,
        baseline: String,
        candidate: String,
        proposal: String,
        experiment: String,
        runs: Vec<String>,
    }

    fn fixture(name: &str, run_count: u32) -> Fixture {
        let path = temp_db_path(name);
        let store = PolicyStore::new(&path).expect("store init");

        let baseline = store
            .insert_policy_version(
                "meta_agent",
                &json!({"model": "medium"}),
                &json!({}),
                &json!({}),
                Some("baseline"),
                false,
            )
            .expect("baseline");
        store
            .set_active(VersionedKind::Policy, &baseline)
            .expect("activate baseline");

        let candidate = store
            .insert_policy_version(
                "meta_agent",
                &json!({"model": "large"}),
                &json!({}),
                &json!({}),
                Some("candidate"),
                false,
            )
            .expect("candidate");

        let proposal = store
            .insert_proposal(
                "meta_agent",
                ProposalType::PolicyChange,
                &json!({"routing": {"model": "large"}}),
                Some(&baseline),
                None,
                "scores trending down",
            )
            .expect("proposal");

        let experiment = spawn_experiment(
            &store,
            &proposal,
            &baseline,
            &candidate,
            &json!({"baseline_score": 0.6}),
            run_count,
        )
        .expect("spawn");

        let runs = store
            .runs_for_experiment(&experiment)
            .expect("runs")
            .into_iter()
            .map(|run| run.id)
            .collect();

        Fixture {
            store,
            path,
            baseline,
            candidate,
            proposal,
            experiment,
            runs,
        }
    }

    #[test]
    fn spawn_experiment_creates_runs_and_marks_proposal() {
        let f = fixture("spawn", 3);

        assert_eq!(f.runs.len(), 3);
        let proposal = f
            .store
            .get_proposal(&f.proposal)
            .expect("get")
            .expect("exists");
        assert_eq!(proposal.status, ProposalStatus::InExperiment);

        let runs = f.store.runs_for_experiment(&f.experiment).expect("runs");
        let indexes: Vec<_> = runs.iter().map(|run| run.run_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);

        let _ = std::fs::remove_file(&f.path);
    }

    #[test]
    fn tick_ignores_experiments_with_outstanding_runs() {
        let f = fixture("outstanding", 2);
        f.store
            .record_run_result(&f.runs[0], 0.9, true, &json!({}))
            .expect("record");

        let report = run_orchestrator_tick(&f.store, &AggregationPolicy::default(), false)
            .expect("tick");
        assert_eq!(report.examined, 0);

        let _ = std::fs::remove_file(&f.path);
    }

    #[test]
    fn winning_experiment_promotes_and_activates_candidate() {
        let f = fixture("promote", 2);
        for run_id in &f.runs {
            f.store
                .record_run_result(run_id, 0.85, true, &json!({"latency_ms": 120}))
                .expect("record");
        }

        let report = run_orchestrator_tick(&f.store, &AggregationPolicy::default(), false)
            .expect("tick");
        assert_eq!(report.examined, 1);
        assert_eq!(report.accepted, 1);

        let experiment = f
            .store
            .get_experiment(&f.experiment)
            .expect("get")
            .expect("exists");
        assert_eq!(experiment.status, ExperimentStatus::Completed);

        let proposal = f
            .store
            .get_proposal(&f.proposal)
            .expect("get")
            .expect("exists");
        assert_eq!(proposal.status, ProposalStatus::Accepted);
        assert_eq!(
            proposal.final_policy_version.as_deref(),
            Some(f.candidate.as_str())
        );

        let active = f.store.get_active_policy().expect("active");
        assert_eq!(active.map(|p| p.id), Some(f.candidate.clone()));

        let _ = std::fs::remove_file(&f.path);
    }

    #[test]
    fn losing_experiment_rejects_and_keeps_baseline_active() {
        let f = fixture("reject", 2);
        for run_id in &f.runs {
            f.store
                .record_run_result(run_id, 0.4, true, &json!({}))
                .expect("record");
        }

        let report = run_orchestrator_tick(&f.store, &AggregationPolicy::default(), false)
            .expect("tick");
        assert_eq!(report.rejected, 1);

        let proposal = f
            .store
            .get_proposal(&f.proposal)
            .expect("get")
            .expect("exists");
        assert_eq!(proposal.status, ProposalStatus::Rejected);
        assert!(proposal.reason.contains("did not beat baseline"));

        let active = f.store.get_active_policy().expect("active");
        assert_eq!(active.map(|p| p.id), Some(f.baseline.clone()));

        let _ = std::fs::remove_file(&f.path);
    }

    #[test]
    fn second_tick_finds_nothing_left_to_do() {
        let f = fixture("idempotent", 1);
        f.store
            .record_run_result(&f.runs[0], 0.9, true, &json!({}))
            .expect("record");

        let first = run_orchestrator_tick(&f.store, &AggregationPolicy::default(), false)
            .expect("first tick");
        assert_eq!(first.accepted, 1);

        let second = run_orchestrator_tick(&f.store, &AggregationPolicy::default(), false)
            .expect("second tick");
        assert_eq!(second.examined, 0);

        let _ = std::fs::remove_file(&f.path);
    }

    #[test]
    fn failed_run_leads_to_failed_experiment_and_rejected_proposal() {
        let f = fixture("failed_run", 2);
        f.store
            .record_run_result(&f.runs[0], 0.9, true, &json!({}))
            .expect("record");
        f.store
            .mark_run_failed(&f.runs[1], None)
            .expect("mark failed");

        let report = run_orchestrator_tick(&f.store, &AggregationPolicy::default(), false)
            .expect("tick");
        assert_eq!(report.rejected, 1);

        let experiment = f
            .store
            .get_experiment(&f.experiment)
            .expect("get")
            .expect("exists");
        assert_eq!(experiment.status, ExperimentStatus::Failed);

        let proposal = f
            .store
            .get_proposal(&f.proposal)
            .expect("get")
            .expect("exists");
        assert_eq!(proposal.status, ProposalStatus::Rejected);

        let _ = std::fs::remove_file(&f.path);
    }
}
