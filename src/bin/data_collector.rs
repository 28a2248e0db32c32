//! `data-collector`: standalone process running the source adapter
//! framework (C4) on the periodic collection scheduler (C5).

use std::process::ExitCode;
use std::sync::Arc;

use challenge_core::config::{init_tracing, CollectorConfig};
use challenge_core::db::RepositoryFactory;
use challenge_core::services::adapters::config::load_adapters;
use challenge_core::services::adapters::AdapterRegistry;
use challenge_core::services::collector::CollectorRuntime;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match CollectorConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("data-collector: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.log_level);

    let repo = match RepositoryFactory::from_env().await {
        Ok(repo) => repo,
        Err(e) => {
            error!(error = %e, "failed to initialize repository");
            return ExitCode::FAILURE;
        }
    };

    let adapters_yaml = match std::fs::read_to_string(&config.adapters_path) {
        Ok(s) => s,
        Err(e) => {
            error!(path = %config.adapters_path.display(), error = %e, "failed to read adapters file");
            return ExitCode::FAILURE;
        }
    };

    let registry = AdapterRegistry::with_defaults();
    let (single, multi) = match load_adapters(&adapters_yaml, &registry) {
        Ok(adapters) => adapters,
        Err(e) => {
            error!(error = %e, "failed to parse adapters file");
            return ExitCode::FAILURE;
        }
    };

    let single: Vec<Arc<dyn challenge_core::services::adapters::SingleSeriesAdapter>> =
        single.into_iter().map(Arc::from).collect();
    let multi: Vec<Arc<dyn challenge_core::services::adapters::MultiSeriesAdapter>> =
        multi.into_iter().map(Arc::from).collect();

    info!(single = single.len(), multi = multi.len(), "loaded adapters, starting collector");

    let runtime = Arc::new(CollectorRuntime::new(repo, config.max_concurrent_jobs));
    runtime.run_initial_fetch(&single, &multi).await;

    let mut handles = Vec::new();
    for adapter in &single {
        let frequency = match challenge_core::Duration::parse(&adapter.metadata().frequency) {
            Ok(f) => f.derived_update_frequency(),
            Err(e) => {
                error!(unique_id = adapter.unique_id(), error = %e, "skipping adapter with invalid frequency");
                continue;
            }
        };
        handles.push(runtime.spawn_periodic_single(Arc::clone(adapter), frequency));
    }
    for adapter in &multi {
        handles.push(runtime.spawn_periodic_multi(Arc::clone(adapter), adapter.schedule()));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }
    for handle in handles {
        handle.abort();
    }

    ExitCode::SUCCESS
}
