//! `challenge-scheduler`: standalone process running the supervisor (C10)
//! that drives the challenge definition registry (C6), round materializer
//! (C7), score evaluator (C8), and ELO engine (C9) on cron and one-shot
//! triggers.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use challenge_core::config::{init_tracing, SupervisorConfig};
use challenge_core::db::repository::FullRepository;
use challenge_core::db::RepositoryFactory;
use challenge_core::services::registry;
use challenge_core::services::rounds;
use challenge_core::services::supervisor::{self, job, RestartPolicy, Supervisor, SupervisorHandle};
use challenge_core::services::{elo, evaluator};
use chrono::Utc;
use tracing::{error, info, warn};

const TRIGGER_PERIODIC_EVALUATION: &str = "periodic_challenge_scores_evaluation";
const TRIGGER_PERIODIC_ELO: &str = "periodic_elo_ranking_calculation";
const EVALUATION_CRON: &str = "*/10 * * * *";
const ELO_CRON: &str = "0 0,6,12,18 * * *";

/// Build one freshly-wired scheduler instance: reload the definitions file,
/// reconcile it into storage, and register the fixed periodic jobs plus one
/// cron trigger per active definition. Called both at initial startup and by
/// the supervisor's restart protocol, since a crashed instance's in-memory
/// job set is presumed corrupt and must be rebuilt from the durable
/// definitions file and repository state rather than resumed.
async fn build_scheduler(
    repo: Arc<dyn FullRepository>,
    definitions_yaml: Arc<String>,
) -> challenge_core::error::CoreResult<Arc<SupervisorHandle>> {
    let handle = supervisor::new_handle();

    let definition_ids = registry::load_schedules(repo.as_ref(), &definitions_yaml).await?;

    for definition_id in definition_ids {
        let definition = repo.get_definition(definition_id).await?;
        if !definition.is_active {
            continue;
        }

        let schedule_id = definition.schedule_id.clone();
        let cron_expression = definition.cron_expression.clone();
        let run_on_startup = definition.run_on_startup;

        let create_round_repo = Arc::clone(&repo);
        let create_round_handle = Arc::clone(&handle);
        let create_round_job = job(move || {
            let repo = Arc::clone(&create_round_repo);
            let handle = Arc::clone(&create_round_handle);
            async move { fire_create_round(repo, handle, definition_id).await }
        });

        handle.register_cron(schedule_id.clone(), &cron_expression, create_round_job.clone())?;

        if run_on_startup {
            handle.register_one_shot(format!("{schedule_id}_startup"), Utc::now(), create_round_job);
        }
    }

    let eval_repo = Arc::clone(&repo);
    handle.register_cron(
        TRIGGER_PERIODIC_EVALUATION,
        EVALUATION_CRON,
        job(move || {
            let repo = Arc::clone(&eval_repo);
            async move {
                let now = Utc::now();
                let evaluated = evaluator::evaluate_pending_rounds(repo.as_ref(), repo.as_ref(), repo.as_ref(), now).await?;
                info!(evaluated, "periodic score evaluation complete");
                Ok(())
            }
        }),
    )?;

    let elo_repo = Arc::clone(&repo);
    handle.register_cron(
        TRIGGER_PERIODIC_ELO,
        ELO_CRON,
        job(move || {
            let repo = Arc::clone(&elo_repo);
            async move {
                let now = Utc::now();
                let updated = elo::calculate_elo_ratings(repo.as_ref(), repo.as_ref(), now).await?;
                info!(updated, "periodic elo calculation complete");
                Ok(())
            }
        }),
    )?;

    let startup_elo_repo = Arc::clone(&repo);
    handle.register_one_shot(
        "elo_startup_backcheck",
        Utc::now(),
        job(move || {
            let repo = Arc::clone(&startup_elo_repo);
            async move {
                let now = Utc::now();
                let updated = elo::calculate_elo_ratings(repo.as_ref(), repo.as_ref(), now).await?;
                info!(updated, "startup elo back-check complete");
                Ok(())
            }
        }),
    );

    Ok(handle)
}

/// The create-round job body: materialize the round, then — unless it was
/// already prepared by an earlier firing — register its one-shot
/// preparation job at `registration_start` on the same handle, so that the
/// `createRoundFromDefinition -> prepareRoundContextData` happens-before
/// chain is established purely by trigger times.
async fn fire_create_round(
    repo: Arc<dyn FullRepository>,
    handle: Arc<SupervisorHandle>,
    definition_id: i64,
) -> challenge_core::error::CoreResult<()> {
    let now = Utc::now();
    let definition = repo.get_definition(definition_id).await?;
    let round = rounds::create_round_from_definition(repo.as_ref(), &definition, now).await?;

    let prep_repo = Arc::clone(&repo);
    let round_id = round.round_id;
    handle.register_one_shot(
        format!("prepare_challenge_{round_id}"),
        round.registration_start,
        job(move || {
            let repo = Arc::clone(&prep_repo);
            async move {
                rounds::prepare_round_context_data(repo.as_ref(), repo.as_ref(), round_id).await
            }
        }),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match SupervisorConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("challenge-scheduler: configuration error: {e}");
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

    let definitions_yaml = match std::fs::read_to_string(&config.definitions_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(path = %config.definitions_path.display(), error = %e, "failed to read definitions file");
            return ExitCode::FAILURE;
        }
    };

    // Parse eagerly so a malformed file aborts startup with a non-zero exit
    // code rather than surfacing only once the first cron tick fires.
    if let Err(e) = registry::parse_schedules(&definitions_yaml) {
        error!(error = %e, "invalid challenge definitions file");
        return ExitCode::FAILURE;
    }

    let restart_policy = RestartPolicy {
        max_restart_attempts: config.max_restart_attempts,
        restart_delay: StdDuration::from_secs(config.restart_delay_sec),
    };

    let factory_repo = Arc::clone(&repo);
    let factory_yaml = Arc::clone(&definitions_yaml);
    let supervisor = Supervisor::new(
        Arc::new(move || {
            let repo = Arc::clone(&factory_repo);
            let yaml = Arc::clone(&factory_yaml);
            Box::pin(build_scheduler(repo, yaml))
        }),
        restart_policy,
    );

    let shutdown = supervisor.shutdown_notifier();
    let supervisor = Arc::new(supervisor);
    let run_supervisor = Arc::clone(&supervisor);
    let run_handle = tokio::task::spawn(async move { run_supervisor.run().await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }
    shutdown.notify_waiters();

    match run_handle.await {
        Ok(Ok(())) => {
            info!("supervisor exited cleanly");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!(error = %e, "supervisor exhausted restart attempts");
            ExitCode::FAILURE
        }
        Err(e) => {
            warn!(error = %e, "supervisor task panicked");
            ExitCode::FAILURE
        }
    }
}
