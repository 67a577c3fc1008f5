use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::experiment::aggregation::AggregationPolicy;
use crate::prefs::cycle::CycleSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_orchestrator_tick_secs")]
    pub orchestrator_tick_secs: u64,
    #[serde(default = "default_personalization_tick_secs")]
    pub personalization_tick_secs: u64,
}

fn default_orchestrator_tick_secs() -> u64 {
    30
}

fn default_personalization_tick_secs() -> u64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            orchestrator_tick_secs: default_orchestrator_tick_secs(),
            personalization_tick_secs: default_personalization_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSettings {
    /// Trial runs created per spawned experiment.
    #[serde(default = "default_run_count")]
    pub default_run_count: u32,
    /// When true, a failed run keeps its experiment out of the
    /// ready-to-finalize list instead of counting as terminal.
    #[serde(default)]
    pub failed_runs_block_finalize: bool,
}

fn default_run_count() -> u32 {
    3
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            default_run_count: default_run_count(),
            failed_runs_block_finalize: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverseerConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub personalization: CycleSettings,
    #[serde(default)]
    pub aggregation: AggregationPolicy,
    #[serde(default)]
    pub experiments: ExperimentSettings,
}

fn default_database_path() -> String {
    "overseer.db".to_string()
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            personalization: CycleSettings::default(),
            aggregation: AggregationPolicy::default(),
            experiments: ExperimentSettings::default(),
        }
    }
}

impl OverseerConfig {
    pub fn config_path() -> PathBuf {
        env::var("OVERSEER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("overseer.toml"))
    }

    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<OverseerConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("OVERSEER_DATABASE_PATH") {
            config.database_path = path;
        }

        if let Ok(interval) = env::var("OVERSEER_ORCHESTRATOR_TICK_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.scheduler.orchestrator_tick_secs = seconds;
            }
        }

        if let Ok(interval) = env::var("OVERSEER_PERSONALIZATION_TICK_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.scheduler.personalization_tick_secs = seconds;
            }
        }

        if let Ok(hours) = env::var("OVERSEER_LOOKBACK_HOURS") {
            if let Ok(hours) = hours.parse() {
                config.personalization.lookback_hours = hours;
            }
        }

        if let Ok(count) = env::var("OVERSEER_MIN_TRACE_COUNT") {
            if let Ok(count) = count.parse() {
                config.personalization.min_trace_count = count;
            }
        }

        config
    }
}
