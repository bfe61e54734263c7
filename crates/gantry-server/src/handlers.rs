//! Command handlers.

use crate::commands::DispatchArgs;
use crate::config::ServerConfig;
use gantry_core::task::{Runner, RunnerScope};
use gantry_core::{JobId, RunId};
use gantry_db::Database;
use gantry_scheduler::{
    CommitStatusReporter, JobEmitter, MatrixParser, RunService, TaskDispatcher, TracingSink,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Services wired against the configured database.
pub struct Services {
    db: Database,
    runs: RunService,
    emitter: Arc<JobEmitter>,
    dispatcher: TaskDispatcher,
}

impl Services {
    pub async fn connect(config: &ServerConfig) -> anyhow::Result<Self> {
        let db = Database::connect(&config.database_url, config.max_connections).await?;
        let store = Arc::new(db.clone());
        let parser = Arc::new(MatrixParser::new());
        let reporter = Arc::new(CommitStatusReporter::new(
            Arc::new(TracingSink),
            config.scheduler.status_cache_size,
        ));

        Ok(Self {
            runs: RunService::new(store.clone(), parser.clone(), reporter.clone()),
            emitter: Arc::new(JobEmitter::new(
                store.clone(),
                parser,
                reporter.clone(),
                config.scheduler.clone(),
            )),
            dispatcher: TaskDispatcher::new(store, reporter, config.scheduler.clone()),
            db,
        })
    }
}

pub async fn serve(config: &ServerConfig) -> anyhow::Result<()> {
    let services = Services::connect(config).await?;
    services.db.migrate().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = services.emitter.spawn_workers(shutdown_rx.clone());
    let sweeper = tokio::spawn(sweep(
        services.emitter.clone(),
        config.sweep_interval_secs,
        shutdown_rx,
    ));

    info!("Gantry started");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_tx.send_replace(true);

    for result in futures::future::join_all(workers).await {
        result?;
    }
    sweeper.await?;
    Ok(())
}

/// Queue every unfinished run now and then every `interval_secs`.
async fn sweep(emitter: Arc<JobEmitter>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
    loop {
        if let Err(e) = emitter.enqueue_unfinished().await {
            warn!(error = %e, "Sweep failed");
        }
        if interval_secs == 0 {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
        }
    }
}

pub async fn migrate(config: &ServerConfig) -> anyhow::Result<()> {
    let db = Database::connect(&config.database_url, config.max_connections).await?;
    db.migrate().await?;
    println!("Migrations applied");
    Ok(())
}

pub async fn reconcile(config: &ServerConfig, run_id: RunId) -> anyhow::Result<()> {
    let services = Services::connect(config).await?;
    let transitions = services.emitter.check_jobs_of_run(run_id).await?;
    println!("{run_id}: {transitions} job(s) changed");
    Ok(())
}

pub async fn dispatch(config: &ServerConfig, args: DispatchArgs) -> anyhow::Result<()> {
    let services = Services::connect(config).await?;
    let runner = runner_from_args(args);

    let Some(assigned) = services.dispatcher.create_task_for_runner(&runner).await? else {
        println!("No job available for {}", runner.name);
        return Ok(());
    };

    let task = &assigned.task;
    let out = json!({
        "task_id": task.id,
        "job_id": assigned.job.id,
        "job": assigned.job.name,
        "attempt": task.attempt,
        "token": task.token,
        "log_filename": task.log_filename,
        "steps": assigned.steps.iter().map(|s| &s.name).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

pub async fn cancel(config: &ServerConfig, run_id: RunId) -> anyhow::Result<()> {
    let services = Services::connect(config).await?;
    services.runs.cancel_run(run_id).await?;
    services.emitter.push(run_id).await;
    services.emitter.drain().await?;
    println!("Cancelled {run_id}");
    Ok(())
}

pub async fn rerun(config: &ServerConfig, run_id: RunId, job: Option<JobId>) -> anyhow::Result<()> {
    let services = Services::connect(config).await?;
    services.runs.rerun(run_id, job).await?;
    services.emitter.push(run_id).await;
    services.emitter.drain().await?;
    match job {
        Some(job) => println!("Rerunning {job} of {run_id}"),
        None => println!("Rerunning {run_id}"),
    }
    Ok(())
}

fn runner_from_args(args: DispatchArgs) -> Runner {
    let scope = match (args.repo, args.owner) {
        (Some(repo), _) => RunnerScope::Repository(repo),
        (None, Some(owner)) => RunnerScope::Owner(owner),
        (None, None) => RunnerScope::Global,
    };
    Runner {
        id: args.runner_id,
        name: args.name,
        scope,
        labels: args.labels,
    }
}
