use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::experiment::{Experiment, ExperimentRun, ExperimentStatus, RunStatus};
use crate::policy::{PolicyVersion, SelfPrompt, UserPolicyOverlay, VersionedKind};
use crate::proposal::{Proposal, ProposalStatus, ProposalType};
use crate::trace::{NewTrace, Trace};

/// A user row as seen by the control plane: identity plus the profile
/// JSON whose `preferences` map this core patches.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub external_id: String,
    pub profile: Value,
    pub created_at: DateTime<Utc>,
}

pub struct PolicyStore {
    conn: Mutex<Connection>,
}

impl PolicyStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS policy_versions (
                id TEXT PRIMARY KEY,
                created_by TEXT NOT NULL,
                label TEXT,
                routing TEXT NOT NULL,
                tool_use TEXT NOT NULL,
                safety_overrides TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS self_prompts (
                id TEXT PRIMARY KEY,
                merged TEXT NOT NULL,
                editable TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS user_policy_overlays (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                base_policy_id TEXT NOT NULL,
                routing_override TEXT NOT NULL,
                tool_use_override TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                profile TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS proposals (
                id TEXT PRIMARY KEY,
                created_by TEXT NOT NULL,
                proposal_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                current_policy_version TEXT,
                current_self_prompt_id TEXT,
                reason TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                final_policy_version TEXT,
                final_self_prompt_id TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS experiments (
                id TEXT PRIMARY KEY,
                proposal_id TEXT NOT NULL,
                baseline_policy_id TEXT NOT NULL,
                candidate_policy_id TEXT NOT NULL,
                config TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                result_summary TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(proposal_id) REFERENCES proposals(id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS experiment_runs (
                id TEXT PRIMARY KEY,
                experiment_id TEXT NOT NULL,
                run_index INTEGER NOT NULL,
                candidate_policy_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                score REAL,
                safety_ok INTEGER,
                metrics TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(experiment_id) REFERENCES experiments(id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS traces (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                domain TEXT NOT NULL,
                input_text TEXT NOT NULL,
                output_text TEXT NOT NULL,
                metadata TEXT NOT NULL,
                policy_version_id TEXT NOT NULL,
                self_prompt_id TEXT NOT NULL,
                experiment_run_id TEXT,
                user_feedback TEXT NOT NULL,
                user_id TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_policy_versions_active ON policy_versions(is_active, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_self_prompts_active ON self_prompts(is_active, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_overlays_user ON user_policy_overlays(user_id, is_active, updated_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_experiment_runs_experiment ON experiment_runs(experiment_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_experiment_runs_status ON experiment_runs(status, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_traces_user_created ON traces(user_id, created_at DESC)",
            [],
        )?;

        Ok(())
    }

    // ---------- Versioned registry ----------

    /// Insert a new policy version. Inactive unless asked; activation is
    /// a separate, transactional step.
    pub fn insert_policy_version(
        &self,
        created_by: &str,
        routing: &Value,
        tool_use: &Value,
        safety_overrides: &Value,
        label: Option<&str>,
        is_active: bool,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO policy_versions (id, created_by, label, routing, tool_use, safety_overrides, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                created_by,
                label,
                routing.to_string(),
                tool_use.to_string(),
                safety_overrides.to_string(),
                is_active,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    pub fn insert_self_prompt(
        &self,
        merged: &Value,
        editable: &Value,
        is_active: bool,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO self_prompts (id, merged, editable, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                merged.to_string(),
                editable.to_string(),
                is_active,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Flip the active pointer of a registry to `id`.
    ///
    /// Deactivate-then-activate runs inside one immediate transaction,
    /// so a concurrent reader never observes two active rows. Bails and
    /// rolls back if the target row does not exist.
    pub fn set_active(&self, kind: VersionedKind, id: &str) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            &format!("UPDATE {} SET is_active = 0 WHERE is_active = 1", kind.table()),
            [],
        )?;
        let activated = tx.execute(
            &format!("UPDATE {} SET is_active = 1 WHERE id = ?1", kind.table()),
            [id],
        )?;
        if activated == 0 {
            bail!("No row '{}' in {} to activate", id, kind.table());
        }

        tx.commit()?;
        Ok(())
    }

    /// Newest active policy version, or `None` when nothing has been
    /// activated yet. The ordering tolerates a transient multi-active
    /// state left by a non-atomic writer without hiding it.
    pub fn get_active_policy(&self) -> Result<Option<PolicyVersion>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, created_by, label, routing, tool_use, safety_overrides, is_active, created_at
             FROM policy_versions
             WHERE is_active = 1
             ORDER BY created_at DESC
             LIMIT 1",
            [],
            policy_version_from_row,
        );

        match result {
            Ok(version) => Ok(Some(version)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_policy_version(&self, id: &str) -> Result<Option<PolicyVersion>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, created_by, label, routing, tool_use, safety_overrides, is_active, created_at
             FROM policy_versions
             WHERE id = ?1",
            [id],
            policy_version_from_row,
        );

        match result {
            Ok(version) => Ok(Some(version)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_active_self_prompt(&self) -> Result<Option<SelfPrompt>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, merged, editable, is_active, created_at
             FROM self_prompts
             WHERE is_active = 1
             ORDER BY created_at DESC
             LIMIT 1",
            [],
            self_prompt_from_row,
        );

        match result {
            Ok(prompt) => Ok(Some(prompt)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ---------- User policy overlays ----------

    /// Most-recently-updated active overlay for a user, if any.
    pub fn get_active_overlay(&self, user_id: &str) -> Result<Option<UserPolicyOverlay>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, user_id, base_policy_id, routing_override, tool_use_override, is_active, updated_at
             FROM user_policy_overlays
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY updated_at DESC
             LIMIT 1",
            [user_id],
            overlay_from_row,
        );

        match result {
            Ok(overlay) => Ok(Some(overlay)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Update the user's active overlay in place, or insert one if none
    /// exists. The read and the write share an immediate transaction so
    /// two concurrent personalization passes cannot both insert.
    pub fn upsert_user_policy_overlay(
        &self,
        user_id: &str,
        base_policy_id: &str,
        routing_override: &Value,
        tool_use_override: &Value,
    ) -> Result<String> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = match tx.query_row(
            "SELECT id FROM user_policy_overlays
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY updated_at DESC
             LIMIT 1",
            [user_id],
            |row| row.get(0),
        ) {
            Ok(id) => Some(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now().to_rfc3339();
        let overlay_id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE user_policy_overlays
                     SET routing_override = ?1,
                         tool_use_override = ?2,
                         base_policy_id = ?3,
                         updated_at = ?4
                     WHERE id = ?5",
                    params![
                        routing_override.to_string(),
                        tool_use_override.to_string(),
                        base_policy_id,
                        now,
                        id,
                    ],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO user_policy_overlays
                     (id, user_id, base_policy_id, routing_override, tool_use_override, is_active, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                    params![
                        id,
                        user_id,
                        base_policy_id,
                        routing_override.to_string(),
                        tool_use_override.to_string(),
                        now,
                    ],
                )?;
                id
            }
        };

        tx.commit()?;
        Ok(overlay_id)
    }

    // ---------- Users ----------

    pub fn get_or_create_user(&self, external_id: &str, default_profile: &Value) -> Result<UserRecord> {
        let conn = self.lock_conn()?;

        conn.execute(
            "INSERT OR IGNORE INTO users (id, external_id, profile, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                external_id,
                default_profile.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        let user = conn.query_row(
            "SELECT id, external_id, profile, created_at FROM users WHERE external_id = ?1",
            [external_id],
            user_from_row,
        )?;
        Ok(user)
    }

    pub fn get_user_profile(&self, user_id: &str) -> Result<Option<Value>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT profile FROM users WHERE id = ?1",
            [user_id],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(raw) => {
                let profile = serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid profile JSON for user {}", user_id))?;
                Ok(Some(profile))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Shallow-merge `patch` into the profile's `preferences` map.
    /// Keys the patch does not mention are preserved. The read and the
    /// write share an immediate transaction so concurrent patches do not
    /// lose updates. Returns false when the user does not exist.
    pub fn patch_user_preferences(&self, user_id: &str, patch: &Value) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let raw: Option<String> = match tx.query_row(
            "SELECT profile FROM users WHERE id = ?1",
            [user_id],
            |row| row.get(0),
        ) {
            Ok(raw) => Some(raw),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        let Some(raw) = raw else {
            return Ok(false);
        };

        let mut profile: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid profile JSON for user {}", user_id))?;
        if !profile.is_object() {
            profile = Value::Object(serde_json::Map::new());
        }

        let preferences = profile
            .as_object_mut()
            .and_then(|p| {
                if !p.get("preferences").map_or(false, Value::is_object) {
                    p.insert(
                        "preferences".to_string(),
                        Value::Object(serde_json::Map::new()),
                    );
                }
                p.get_mut("preferences")
            })
            .and_then(Value::as_object_mut)
            .context("Profile preferences map unavailable")?;

        if let Some(patch_map) = patch.as_object() {
            for (key, value) in patch_map {
                preferences.insert(key.clone(), value.clone());
            }
        }

        tx.execute(
            "UPDATE users SET profile = ?1 WHERE id = ?2",
            params![profile.to_string(), user_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ---------- Traces ----------

    pub fn insert_trace(&self, trace: &NewTrace) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO traces (
                id, session_id, task_id, task_type, domain,
                input_text, output_text, metadata,
                policy_version_id, self_prompt_id, experiment_run_id,
                user_feedback, user_id, created_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                id,
                trace.session_id,
                trace.task_id,
                trace.task_type,
                trace.domain,
                trace.input_text,
                trace.output_text,
                trace.metadata.to_string(),
                trace.policy_version_id,
                trace.self_prompt_id,
                trace.experiment_run_id,
                trace.user_feedback.to_string(),
                trace.user_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Recent traces for one user within the lookback window, newest first.
    pub fn traces_for_user(
        &self,
        user_id: &str,
        window_hours: i64,
        limit: usize,
    ) -> Result<Vec<Trace>> {
        let cutoff = window_cutoff(window_hours);
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, task_id, task_type, domain,
                    input_text, output_text, metadata,
                    policy_version_id, self_prompt_id, experiment_run_id,
                    user_feedback, user_id, created_at
             FROM traces
             WHERE user_id = ?1 AND created_at > ?2
             ORDER BY created_at DESC
             LIMIT ?3",
        )?;

        let traces = stmt
            .query_map(params![user_id, cutoff, limit as i64], trace_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(traces)
    }

    /// Users with at least `min_traces` traces inside the lookback window.
    pub fn eligible_user_ids(&self, window_hours: i64, min_traces: u32) -> Result<Vec<String>> {
        let cutoff = window_cutoff(window_hours);
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id
             FROM traces
             WHERE user_id IS NOT NULL AND created_at > ?1
             GROUP BY user_id
             HAVING COUNT(*) >= ?2
             ORDER BY user_id",
        )?;

        let users = stmt
            .query_map(params![cutoff, min_traces], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Traces flagged as hallucinations or thumbed down, newest first.
    pub fn problematic_traces(&self, window_hours: i64, limit: usize) -> Result<Vec<Trace>> {
        let cutoff = window_cutoff(window_hours);
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, task_id, task_type, domain,
                    input_text, output_text, metadata,
                    policy_version_id, self_prompt_id, experiment_run_id,
                    user_feedback, user_id, created_at
             FROM traces
             WHERE created_at > ?1
               AND (
                 json_extract(metadata, '$.hallucination_flag') = 1
                 OR json_extract(user_feedback, '$.thumbs_down') = 1
               )
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;

        let traces = stmt
            .query_map(params![cutoff, limit as i64], trace_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(traces)
    }

    // ---------- Proposals ----------

    pub fn insert_proposal(
        &self,
        created_by: &str,
        proposal_type: ProposalType,
        payload: &Value,
        current_policy_version: Option<&str>,
        current_self_prompt_id: Option<&str>,
        reason: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO proposals (
                id, created_by, proposal_type, payload,
                current_policy_version, current_self_prompt_id,
                reason, status, created_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                id,
                created_by,
                proposal_type.as_db_str(),
                payload.to_string(),
                current_policy_version,
                current_self_prompt_id,
                reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    pub fn get_proposal(&self, id: &str) -> Result<Option<Proposal>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, created_by, proposal_type, payload,
                    current_policy_version, current_self_prompt_id,
                    reason, status, final_policy_version, final_self_prompt_id, created_at
             FROM proposals
             WHERE id = ?1",
            [id],
            proposal_from_row,
        );

        match result {
            Ok(proposal) => Ok(Some(proposal)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Pending proposals oldest-first, for fair processing order.
    pub fn pending_proposals(&self, limit: usize) -> Result<Vec<Proposal>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_by, proposal_type, payload,
                    current_policy_version, current_self_prompt_id,
                    reason, status, final_policy_version, final_self_prompt_id, created_at
             FROM proposals
             WHERE status = 'pending'
             ORDER BY created_at ASC
             LIMIT ?1",
        )?;

        let proposals = stmt
            .query_map([limit as i64], proposal_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(proposals)
    }

    /// Unconditional overwrite to in_experiment. The caller is expected
    /// to have created the experiment referencing this proposal first.
    pub fn mark_proposal_in_experiment(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE proposals SET status = 'in_experiment' WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    /// Resolve a proposal to a terminal status. Optional fields left as
    /// `None` keep their prior value (coalesce semantics). Conditional on
    /// the proposal not already being terminal; a zero-row effect means
    /// another worker resolved it first and is reported as `false`, never
    /// as a regression.
    pub fn resolve_proposal(
        &self,
        id: &str,
        status: ProposalStatus,
        final_policy_version: Option<&str>,
        final_self_prompt_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            bail!(
                "Proposal resolution requires a terminal status, got '{}'",
                status.as_db_str()
            );
        }

        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE proposals
             SET status = ?1,
                 final_policy_version = COALESCE(?2, final_policy_version),
                 final_self_prompt_id = COALESCE(?3, final_self_prompt_id),
                 reason = COALESCE(?4, reason)
             WHERE id = ?5 AND status IN ('pending', 'in_experiment')",
            params![
                status.as_db_str(),
                final_policy_version,
                final_self_prompt_id,
                reason,
                id,
            ],
        )?;
        Ok(updated > 0)
    }

    // ---------- Experiments ----------

    pub fn create_experiment(
        &self,
        proposal_id: &str,
        baseline_policy_id: &str,
        candidate_policy_id: &str,
        config: &Value,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO experiments (
                id, proposal_id, baseline_policy_id, candidate_policy_id,
                config, status, created_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
            params![
                id,
                proposal_id,
                baseline_policy_id,
                candidate_policy_id,
                config.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    pub fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, proposal_id, baseline_policy_id, candidate_policy_id,
                    config, status, result_summary, created_at
             FROM experiments
             WHERE id = ?1",
            [id],
            experiment_from_row,
        );

        match result {
            Ok(experiment) => Ok(Some(experiment)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_experiment_run(
        &self,
        experiment_id: &str,
        run_index: i64,
        candidate_policy_id: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO experiment_runs (
                id, experiment_id, run_index, candidate_policy_id, status, created_at
             )
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                id,
                experiment_id,
                run_index,
                candidate_policy_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Runs waiting to be claimed by an external executor, oldest first.
    pub fn pending_experiment_runs(&self, limit: usize) -> Result<Vec<ExperimentRun>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, experiment_id, run_index, candidate_policy_id,
                    status, score, safety_ok, metrics, created_at
             FROM experiment_runs
             WHERE status = 'pending'
             ORDER BY created_at ASC
             LIMIT ?1",
        )?;

        let runs = stmt
            .query_map([limit as i64], run_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Write a run's result and move it to completed. A second call
    /// overwrites; callers treat that as a bug, this layer does not guard
    /// against it.
    pub fn record_run_result(
        &self,
        run_id: &str,
        score: f64,
        safety_ok: bool,
        metrics: &Value,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE experiment_runs
             SET status = 'completed', score = ?1, safety_ok = ?2, metrics = ?3
             WHERE id = ?4",
            params![score, safety_ok, metrics.to_string(), run_id],
        )?;
        if updated == 0 {
            bail!("No experiment run '{}' to record a result for", run_id);
        }
        Ok(())
    }

    /// Mark a run that errored out in its external executor. Whether a
    /// failed run blocks finalize-readiness is the caller's policy.
    pub fn mark_run_failed(&self, run_id: &str, metrics: Option<&Value>) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE experiment_runs
             SET status = 'failed', metrics = COALESCE(?1, metrics)
             WHERE id = ?2",
            params![metrics.map(Value::to_string), run_id],
        )?;
        if updated == 0 {
            bail!("No experiment run '{}' to mark failed", run_id);
        }
        Ok(())
    }

    pub fn runs_for_experiment(&self, experiment_id: &str) -> Result<Vec<ExperimentRun>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, experiment_id, run_index, candidate_policy_id,
                    status, score, safety_ok, metrics, created_at
             FROM experiment_runs
             WHERE experiment_id = ?1
             ORDER BY run_index ASC",
        )?;

        let runs = stmt
            .query_map([experiment_id], run_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Experiments still open whose runs have all reached a terminal
    /// state. `failed_runs_block` keeps experiments with failed runs out
    /// of the list for deployments that treat failure as non-terminal.
    pub fn experiments_ready_to_finalize(&self, failed_runs_block: bool) -> Result<Vec<Experiment>> {
        let blocking = if failed_runs_block {
            "('pending', 'running', 'failed')"
        } else {
            "('pending', 'running')"
        };

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT e.id, e.proposal_id, e.baseline_policy_id, e.candidate_policy_id,
                    e.config, e.status, e.result_summary, e.created_at
             FROM experiments e
             WHERE e.status IN ('pending', 'running')
               AND NOT EXISTS (
                 SELECT 1
                 FROM experiment_runs r
                 WHERE r.experiment_id = e.id
                   AND r.status IN {blocking}
               )
             ORDER BY e.created_at ASC"
        ))?;

        let experiments = stmt
            .query_map([], experiment_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(experiments)
    }

    /// Record the terminal aggregate for an experiment. Conditional on
    /// the experiment still being open; a zero-row effect means another
    /// worker finalized it first and is reported as `false`.
    pub fn finalize_experiment(
        &self,
        experiment_id: &str,
        status: ExperimentStatus,
        result_summary: &Value,
    ) -> Result<bool> {
        if !matches!(status, ExperimentStatus::Completed | ExperimentStatus::Failed) {
            bail!(
                "Experiment finalization requires a terminal status, got '{}'",
                status.as_db_str()
            );
        }

        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE experiments
             SET status = ?1, result_summary = ?2
             WHERE id = ?3 AND status IN ('pending', 'running')",
            params![status.as_db_str(), result_summary.to_string(), experiment_id],
        )?;
        Ok(updated > 0)
    }
}

fn window_cutoff(window_hours: i64) -> String {
    (Utc::now() - Duration::hours(window_hours)).to_rfc3339()
}

fn parse_rfc3339(
    value: String,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json(value: String, column: usize) -> std::result::Result<Value, rusqlite::Error> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json_opt(
    value: Option<String>,
    column: usize,
) -> std::result::Result<Option<Value>, rusqlite::Error> {
    value.map(|raw| parse_json(raw, column)).transpose()
}

fn policy_version_from_row(row: &Row<'_>) -> std::result::Result<PolicyVersion, rusqlite::Error> {
    Ok(PolicyVersion {
        id: row.get(0)?,
        created_by: row.get(1)?,
        label: row.get(2)?,
        routing: parse_json(row.get::<_, String>(3)?, 3)?,
        tool_use: parse_json(row.get::<_, String>(4)?, 4)?,
        safety_overrides: parse_json(row.get::<_, String>(5)?, 5)?,
        is_active: row.get(6)?,
        created_at: parse_rfc3339(row.get::<_, String>(7)?, 7)?,
    })
}

fn self_prompt_from_row(row: &Row<'_>) -> std::result::Result<SelfPrompt, rusqlite::Error> {
    Ok(SelfPrompt {
        id: row.get(0)?,
        merged: parse_json(row.get::<_, String>(1)?, 1)?,
        editable: parse_json(row.get::<_, String>(2)?, 2)?,
        is_active: row.get(3)?,
        created_at: parse_rfc3339(row.get::<_, String>(4)?, 4)?,
    })
}

fn overlay_from_row(row: &Row<'_>) -> std::result::Result<UserPolicyOverlay, rusqlite::Error> {
    Ok(UserPolicyOverlay {
        id: row.get(0)?,
        user_id: row.get(1)?,
        base_policy_id: row.get(2)?,
        routing_override: parse_json(row.get::<_, String>(3)?, 3)?,
        tool_use_override: parse_json(row.get::<_, String>(4)?, 4)?,
        is_active: row.get(5)?,
        updated_at: parse_rfc3339(row.get::<_, String>(6)?, 6)?,
    })
}

fn user_from_row(row: &Row<'_>) -> std::result::Result<UserRecord, rusqlite::Error> {
    Ok(UserRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        profile: parse_json(row.get::<_, String>(2)?, 2)?,
        created_at: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
    })
}

fn proposal_from_row(row: &Row<'_>) -> std::result::Result<Proposal, rusqlite::Error> {
    Ok(Proposal {
        id: row.get(0)?,
        created_by: row.get(1)?,
        proposal_type: ProposalType::from_db(&row.get::<_, String>(2)?),
        payload: parse_json(row.get::<_, String>(3)?, 3)?,
        current_policy_version: row.get(4)?,
        current_self_prompt_id: row.get(5)?,
        reason: row.get(6)?,
        status: ProposalStatus::from_db(&row.get::<_, String>(7)?),
        final_policy_version: row.get(8)?,
        final_self_prompt_id: row.get(9)?,
        created_at: parse_rfc3339(row.get::<_, String>(10)?, 10)?,
    })
}

fn experiment_from_row(row: &Row<'_>) -> std::result::Result<Experiment, rusqlite::Error> {
    Ok(Experiment {
        id: row.get(0)?,
        proposal_id: row.get(1)?,
        baseline_policy_id: row.get(2)?,
        candidate_policy_id: row.get(3)?,
        config: parse_json(row.get::<_, String>(4)?, 4)?,
        status: ExperimentStatus::from_db(&row.get::<_, String>(5)?),
        result_summary: parse_json_opt(row.get::<_, Option<String>>(6)?, 6)?,
        created_at: parse_rfc3339(row.get::<_, String>(7)?, 7)?,
    })
}

fn run_from_row(row: &Row<'_>) -> std::result::Result<ExperimentRun, rusqlite::Error> {
    Ok(ExperimentRun {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        run_index: row.get(2)?,
        candidate_policy_id: row.get(3)?,
        status: RunStatus::from_db(&row.get::<_, String>(4)?),
        score: row.get(5)?,
        safety_ok: row.get(6)?,
        metrics: parse_json_opt(row.get::<_, Option<String>>(7)?, 7)?,
        created_at: parse_rfc3339(row.get::<_, String>(8)?, 8)?,
    })
}

fn trace_from_row(row: &Row<'_>) -> std::result::Result<Trace, rusqlite::Error> {
    Ok(Trace {
        id: row.get(0)?,
        session_id: row.get(1)?,
        task_id: row.get(2)?,
        task_type: row.get(3)?,
        domain: row.get(4)?,
        input_text: row.get(5)?,
        output_text: row.get(6)?,
        metadata: parse_json(row.get::<_, String>(7)?, 7)?,
        policy_version_id: row.get(8)?,
        self_prompt_id: row.get(9)?,
        experiment_run_id: row.get(10)?,
        user_feedback: parse_json(row.get::<_, String>(11)?, 11)?,
        user_id: row.get(12)?,
        created_at: parse_rfc3339(row.get::<_, String>(13)?, 13)?,
    })
}
