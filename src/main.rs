use std::time::Duration;

use tracing_subscriber::EnvFilter;

use overseer::config::OverseerConfig;
use overseer::database::PolicyStore;
use overseer::experiment::orchestrator::run_orchestrator_tick;
use overseer::prefs::cycle::run_personalization_cycle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,overseer=debug")),
        )
        .init();

    tracing::info!("Overseer control plane starting...");

    let config = OverseerConfig::load();
    let store = PolicyStore::new(&config.database_path)?;
    tracing::info!("Opened policy store at {}", config.database_path);

    let mut orchestrator_tick =
        tokio::time::interval(Duration::from_secs(config.scheduler.orchestrator_tick_secs));
    let mut personalization_tick = tokio::time::interval(Duration::from_secs(
        config.scheduler.personalization_tick_secs,
    ));

    loop {
        tokio::select! {
            _ = orchestrator_tick.tick() => {
                if let Err(e) = run_orchestrator_tick(
                    &store,
                    &config.aggregation,
                    config.experiments.failed_runs_block_finalize,
                ) {
                    tracing::error!("Orchestrator tick failed: {:#}", e);
                }
            }
            _ = personalization_tick.tick() => {
                if let Err(e) = run_personalization_cycle(&store, &config.personalization) {
                    tracing::error!("Personalization cycle failed: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, stopping");
                break;
            }
        }
    }

    Ok(())
}
