use anyhow::Context;
use hs_optimizer::{AshaConfig, AshaSearchMethod, SearchSpace};
use hs_runner::{local_runner, ExperimentConfig, RunnerConfig, SimulatedExperimentService};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn default_asha_config() -> AshaConfig {
    let space = SearchSpace::new()
        .add_log_uniform("learning_rate", 1e-4, 1e-1)
        .add_int("hidden_layers", 1, 4)
        .add_float("dropout", 0.0, 0.5);
    AshaConfig::new(2400, space)
        .with_max_trials(16)
        .with_max_concurrent_trials(4)
        .with_rungs(3, 4)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let asha_config = match std::env::var("HS_ASHA_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_slice(&raw).with_context(|| format!("parsing {path}"))?
        }
        Err(_) => default_asha_config(),
    };
    // The simulated service lives only as long as this process, so each run
    // gets its own state directory unless one is given.
    let state_dir = std::env::var("HS_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::temp_dir().join(format!("search-sandbox-{}", uuid::Uuid::new_v4()))
        });

    let config = RunnerConfig::from_env()?.with_experiment(
        ExperimentConfig::new("asha-sandbox").with_description("ASHA against a simulated service"),
    );
    let method = AshaSearchMethod::new(asha_config)?;
    let service = SimulatedExperimentService::default();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            let _ = stop_tx.send(true);
        }
    });

    let mut runner =
        local_runner(service.clone(), method, &state_dir, config)?.with_stop_signal(stop_rx);
    let outcome = runner.run().await?;

    info!(
        state_dir = %state_dir.display(),
        trials = service.trial_count(),
        max_batches = service.max_batches_processed(),
        "sandbox search finished"
    );
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
