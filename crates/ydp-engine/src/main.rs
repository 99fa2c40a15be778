//! YDP - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

use ydp_common::logging::{init_logging, LogConfig, LogOutput};
use ydp_common::model::Ecosystem;
use ydp_engine::config::EngineConfig;
use ydp_engine::connector::{EnvCredentialStore, PostgresSnapshotConnector};
use ydp_engine::cqrs::queries::list_batches::{ListBatchesQuery, ListBatchesResponse};
use ydp_engine::cqrs::queries::stream_state::{StreamStateQuery, StreamStateResponse};
use ydp_engine::cqrs::{build_mediator, dispatch};
use ydp_engine::merge::{MergeStore, PgMergeStore};
use ydp_engine::pipeline::Pipeline;
use ydp_engine::replication::{DatabaseTargetProvider, ReplicateOutcome};
use ydp_engine::scheduler::FireOutcome;
use ydp_engine::transformer::{TransformOutcome, TransformerRegistry};
use ydp_engine::{Cli, Commands, StreamRun};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .output(LogOutput::Console)
        .log_file_prefix("ydp")
        .filter_directives("sqlx=warn")
        .build();

    // Environment takes precedence
    let log_config = log_config.with_env_overrides().unwrap_or_else(|_| LogConfig::default());
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {:#}", e);
            None
        },
    };

    if let Err(e) = execute(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = EngineConfig::load()?;
    if let Some(model) = cli.model {
        config.model_path = model;
    }

    let ecosystem = Arc::new(
        Ecosystem::from_yaml_file(&config.model_path)
            .with_context(|| format!("Failed to load model {}", config.model_path.display()))?,
    );
    info!(ecosystem = %ecosystem.name, model = %config.model_path.display(), "Model loaded");

    if matches!(cli.command, Commands::Validate | Commands::Routes) {
        return offline(&cli.command, ecosystem);
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to the merge database")?;
    info!("Merge database connection pool established");

    let merge_store = PgMergeStore::new(pool);
    merge_store.migrate().await?;
    info!("Merge database migrations completed");
    let store: Arc<dyn MergeStore> = Arc::new(merge_store);

    let credentials = Arc::new(EnvCredentialStore);
    let connect_timeout = Duration::from_secs(config.database.connect_timeout_secs);
    let pipeline = Arc::new(
        Pipeline::builder(ecosystem, store.clone())
            .connector(Arc::new(PostgresSnapshotConnector::new(credentials.clone(), connect_timeout)))
            .targets(Arc::new(DatabaseTargetProvider::new(credentials, connect_timeout)))
            .registry(TransformerRegistry::new())
            .timeouts(config.timeouts)
            .build()?,
    );

    match cli.command {
        Commands::Run => run(pipeline, &config).await,
        Commands::Fire { datastore } => {
            match pipeline.fire(&datastore).await? {
                FireOutcome::Completed(runs) => print_runs(&runs),
                FireOutcome::Skipped(reason) => println!("skipped: {:?}", reason),
            }
            Ok(())
        },
        Commands::Replicate { group } => {
            match pipeline.replicate(&group).await? {
                ReplicateOutcome::Completed(reports) => {
                    for report in reports {
                        match report.result {
                            Ok(views) => {
                                for view in views {
                                    println!(
                                        "{:<16} {:<40} {:>6} -> {:<6} ({} applied)",
                                        report.target, view.table, view.from, view.to, view.applied
                                    );
                                }
                            },
                            Err(e) => println!("{:<16} FAILED {}", report.target, e),
                        }
                    }
                },
                ReplicateOutcome::Skipped => println!("skipped: replication still running"),
            }
            Ok(())
        },
        Commands::Transform { workspace } => {
            match pipeline.transform(&workspace).await? {
                TransformOutcome::Completed(runs) => print_runs(&runs),
                TransformOutcome::Skipped => println!("skipped: transformer still running"),
            }
            Ok(())
        },
        Commands::Status {
            platform,
            status,
            limit,
        } => {
            let mut mediator = build_mediator(store);
            let streams: StreamStateResponse = dispatch(
                &mut mediator,
                StreamStateQuery {
                    platform: platform.clone(),
                },
            )
            .await?;
            println!("{:<16} {:<32} {:>8}  updated", "platform", "stream", "last");
            for s in streams.streams {
                println!(
                    "{:<16} {:<32} {:>8}  {}",
                    s.platform, s.stream, s.last_committed, s.updated_at
                );
            }

            let batches: ListBatchesResponse = dispatch(
                &mut mediator,
                ListBatchesQuery {
                    platform,
                    stream: None,
                    status,
                    limit: Some(limit),
                },
            )
            .await?;
            println!();
            println!("{:<16} {:<32} {:>6} {:<10} {:>8}  error", "platform", "stream", "seq", "status", "attempts");
            for b in batches.batches {
                println!(
                    "{:<16} {:<32} {:>6} {:<10} {:>8}  {}",
                    b.platform,
                    b.stream,
                    b.sequence,
                    b.status,
                    b.attempts,
                    b.error.unwrap_or_default()
                );
            }
            Ok(())
        },
        Commands::Validate | Commands::Routes => Ok(()),
    }
}

/// Commands that need only the model
fn offline(command: &Commands, ecosystem: Arc<Ecosystem>) -> Result<()> {
    let router = ydp_engine::router::DatasetRouter::new(ecosystem.clone());

    if let Commands::Routes = command {
        for resolution in router.resolve_all() {
            match resolution {
                Ok(r) => {
                    for sink in &r.sinks {
                        println!(
                            "{:<16} {:<16} {:<16} {:<9} {}",
                            r.workspace, r.group, r.platform, r.view, sink.table
                        );
                    }
                },
                Err(e) => println!("UNROUTED {}", e),
            }
        }
        return Ok(());
    }

    let mut problems: Vec<String> = Vec::new();
    if let Err(e) = ecosystem.lint() {
        problems.push(e.to_string());
    }
    problems.extend(router.validate_all().iter().map(|e| e.to_string()));

    if problems.is_empty() {
        println!("{} is valid", ecosystem.name);
        Ok(())
    } else {
        for problem in &problems {
            println!("- {}", problem);
        }
        anyhow::bail!("{} problem(s) found", problems.len())
    }
}

fn print_runs(runs: &[StreamRun]) {
    for run in runs {
        match &run.result {
            Ok(result) => {
                let t = result.totals();
                println!(
                    "{:<16} {:<32} batch {:<6} COMMITTED +{} ~{} x{} ={} -{}",
                    run.platform, run.stream, run.sequence, t.inserted, t.updated, t.closed, t.unchanged, t.deleted
                );
            },
            Err(e) => println!(
                "{:<16} {:<32} batch {:<6} FAILED [{}] {}",
                run.platform,
                run.stream,
                run.sequence,
                e.kind(),
                e
            ),
        }
    }
}

async fn run(pipeline: Arc<Pipeline>, config: &EngineConfig) -> Result<()> {
    let problems = pipeline.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!(kind = problem.kind(), error = %problem, "Configuration problem");
        }
        anyhow::bail!("refusing to start with {} configuration problem(s)", problems.len());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = pipeline.start(config.scheduler, shutdown_rx);
    info!(loops = loops.len(), "YDP engine running");

    shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        warn!("No cron loop was listening for shutdown");
    }

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    info!("Waiting up to {} seconds for cron loops to stop", grace.as_secs());
    if tokio::time::timeout(grace, futures::future::join_all(loops)).await.is_err() {
        warn!("Shutdown grace period elapsed with loops still running");
    }

    info!("YDP engine shut down gracefully");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
