use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pitwall_core::CalendarEvent;
use pitwall_sync::{
    reference_source, resolve_most_recent, resolve_upcoming, EntityKind, SyncConfig, SyncError,
    SyncPipeline, SyncRunSummary, Upcoming,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pitwall")]
#[command(about = "Synchronize motorsport reference data into MongoDB")]
struct Cli {
    /// MongoDB connection string
    #[arg(long, env = "MONGODB_URI", global = true, hide_env_values = true)]
    mongodb_uri: Option<String>,

    #[arg(long, env = "MONGODB_DB", global = true)]
    mongodb_db: Option<String>,

    /// Read provider data from an Ergast-shaped fixture tree instead of HTTP
    #[arg(long, env = "PITWALL_FIXTURES_DIR", global = true)]
    fixtures: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "PITWALL_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run entity jobs once
    Sync {
        /// Entities to run; every enabled entity when omitted
        #[arg(long = "entity", value_name = "ENTITY")]
        entities: Vec<EntityKind>,
        /// Season to sync instead of the current one; upcoming_gp always looks ahead of now
        #[arg(long)]
        season: Option<i32>,
        /// Write into an in-memory store instead of MongoDB
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run every enabled entity on the SYNC_CRON schedule until interrupted
    Schedule,
    /// Show the most recent event that has started
    LatestEvent,
    /// Show the next event weekend
    NextEvent,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,pitwall=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn exit_code(err: &SyncError) -> ExitCode {
    match err {
        SyncError::Configuration(_) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = SyncConfig::from_env();
    if let Some(uri) = cli.mongodb_uri.clone() {
        config.mongodb_uri = Some(uri);
    }
    if let Some(db) = cli.mongodb_db.clone() {
        config.database = db;
    }
    if let Some(dir) = cli.fixtures.clone() {
        config.fixtures_dir = Some(dir);
    }

    let command = cli.command.unwrap_or(Commands::Sync {
        entities: Vec::new(),
        season: None,
        dry_run: false,
        json: false,
    });

    match run(command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<SyncError>() {
            Some(sync_err) => {
                error!("{sync_err}");
                exit_code(sync_err)
            }
            None => {
                error!("{err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(command: Commands, mut config: SyncConfig) -> Result<()> {
    match command {
        Commands::Sync {
            entities,
            season,
            dry_run,
            json,
        } => {
            config.season = season.or(config.season);
            config.dry_run = dry_run;
            let pipeline = SyncPipeline::from_config(config).await?;
            let entities = if entities.is_empty() {
                pipeline.registry().enabled()
            } else {
                entities
            };
            let summary = pipeline.run_entities(&entities, Utc::now()).await?;
            print_summary(&summary, json)?;
            if !summary.failures.is_empty() {
                anyhow::bail!(
                    "{} of {} entities failed before reaching the store",
                    summary.failures.len(),
                    entities.len()
                );
            }
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::LatestEvent => {
            let source = reference_source(&config)?;
            let (event, season) =
                resolve_most_recent(source.as_ref(), Utc::now(), config.lookback_seasons).await?;
            info!(season, "resolved most recent event");
            print_event(&event)?;
        }
        Commands::NextEvent => {
            let source = reference_source(&config)?;
            let upcoming = resolve_upcoming(source.as_ref(), Utc::now())
                .await
                .map_err(SyncError::from)?;
            match upcoming {
                Upcoming::Scheduled(event) => print_event(&event)?,
                Upcoming::Placeholder { season } => {
                    println!("round 1 of the {season} season (calendar not published)")
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: &CalendarEvent) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(event)?);
    Ok(())
}

fn print_summary(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "sync complete: run_id={} source={} store={}",
        summary.run_id, summary.source, summary.store
    );
    for run in &summary.runs {
        let report = &run.report;
        println!(
            "  {:<17} {:<17} submitted={} created={} matched={} modified={} superseded={} failed={}",
            run.entity.as_str(),
            run.collection,
            report.submitted,
            report.created,
            report.matched,
            report.modified,
            report.superseded,
            report.failures.len()
        );
    }
    for failure in &summary.failures {
        println!("  {:<17} error: {}", failure.entity.as_str(), failure.error);
    }
    Ok(())
}
