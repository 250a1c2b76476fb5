//! Command handlers

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use swarm_core::{
    ConsoleOutput, JsonOutput, LocalRunner, MasterConfig, MasterRunner, Output, Profile, State,
    TaskPayload, WorkerConfig, WorkerRunner,
};

use super::{Commands, LocalArgs, MasterArgs, OutputArgs, WorkerArgs};
use crate::demo::{DemoTaskFactory, DEFAULT_TASKS};

/// How often the master command checks whether its run has finished
const RUN_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Run a parsed command to completion
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Master(args) => master(args).await,
        Commands::Worker(args) => worker(args).await,
        Commands::Local(args) => local(args).await,
    }
}

async fn master(args: MasterArgs) -> Result<()> {
    let profile = args.profile.resolve()?;
    let payload = load_tasks(args.profile.tasks.as_deref())?;
    let config = MasterConfig {
        bind: args.bind,
        token: args.token,
        expect_workers: Some(args.expect_workers.max(1)),
        expect_workers_max_wait: Duration::from_secs(args.expect_workers_max_wait),
    };

    let mut master = MasterRunner::new(config, profile.clone());
    for output in outputs(&args.output, &profile).await? {
        master = master.with_output(output);
    }
    let master = Arc::new(master);

    let mut requests = master
        .take_task_requests()
        .context("task requests already taken")?;
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            request.respond(payload.clone());
        }
    });

    let addr = master.bind().await.context("failed to bind master")?;
    tracing::info!(
        addr = %addr,
        expect_workers = args.expect_workers,
        "Master ready, waiting for workers"
    );

    // Quit once a run has started and come back to Stopped, or on Ctrl+C.
    let watcher = Arc::clone(&master);
    let shutdown = master.shutdown_token();
    tokio::spawn(async move {
        let mut started = false;
        let mut ticker = tokio::time::interval(RUN_WATCH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    } else {
                        tracing::info!("Received Ctrl+C, shutting down workers...");
                    }
                    break;
                }
                _ = ticker.tick() => match watcher.state() {
                    State::Spawning | State::Running | State::Stopping => started = true,
                    State::Stopped if started => {
                        tracing::info!("Run finished");
                        break;
                    }
                    _ => {}
                },
            }
        }
        watcher.quit();
    });

    master.run().await.context("master failed")?;
    Ok(())
}

async fn worker(args: WorkerArgs) -> Result<()> {
    let config = WorkerConfig {
        master: args.master,
        token: args.token,
        node_id: args.node_id,
        ignore_quit: args.ignore_quit,
    };
    let worker = WorkerRunner::new(config, Arc::new(DemoTaskFactory));
    tracing::info!(node_id = %worker.node_id(), master = %args.master, "Worker starting");

    let shutdown = worker.shutdown_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    tracing::info!("Received Ctrl+C, leaving the swarm...");
                }
                shutdown.cancel();
            }
        }
    });

    worker.run().await.context("worker failed")?;
    Ok(())
}

async fn local(args: LocalArgs) -> Result<()> {
    let profile = args.profile.resolve()?;
    let payload = load_tasks(args.profile.tasks.as_deref())?;

    let mut builder = LocalRunner::builder()
        .profile(profile.clone())
        .task_factory(Arc::new(DemoTaskFactory), payload);
    for output in outputs(&args.output, &profile).await? {
        builder = builder.output(output);
    }
    let runner = builder.build().context("failed to build runner")?;

    runner
        .run_with_signal_handling()
        .await
        .context("run failed")?;
    Ok(())
}

fn load_tasks(path: Option<&Path>) -> Result<TaskPayload> {
    match path {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read tasks {}", path.display()))?;
            Ok(TaskPayload::new(bytes))
        }
        None => Ok(TaskPayload::new(DEFAULT_TASKS)),
    }
}

async fn outputs(args: &OutputArgs, profile: &Profile) -> Result<Vec<Arc<dyn Output>>> {
    let mut outputs: Vec<Arc<dyn Output>> = Vec::new();
    if !args.no_console && !profile.disable_console_output {
        outputs.push(Arc::new(ConsoleOutput::new()));
    }
    if let Some(path) = &args.json_output {
        let output = JsonOutput::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        outputs.push(Arc::new(output));
    }
    Ok(outputs)
}
