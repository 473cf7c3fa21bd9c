use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evsync_storage::{PgStore, Store};
use evsync_sync::{build_engine, load_metros, maybe_build_scheduler, RunRequest, SyncConfig, SyncEngine};
use evsync_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evsync-cli")]
#[command(about = "Metro events sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull events for the selected (default: all enabled) metros.
    SyncEvents {
        #[arg(long = "metro")]
        metros: Vec<String>,
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Discover venues for the selected metros.
    DiscoverVenues {
        #[arg(long = "metro")]
        metros: Vec<String>,
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    CheckLinks,
    Migrate,
    Serve,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evsync=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url)
        .await
        .with_context(|| "connecting to DATABASE_URL".to_string())
}

async fn engine(config: &SyncConfig) -> Result<Arc<SyncEngine>> {
    let store: Arc<dyn Store> = Arc::new(connect(config).await?);
    Ok(Arc::new(build_engine(config, store).await?))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::SyncEvents {
        metros: Vec::new(),
        sources: Vec::new(),
    }) {
        Commands::SyncEvents { metros, sources } => {
            let engine = engine(&config).await?;
            let metro_set = load_metros(&config.workspace_root).await?;
            let request = RunRequest::for_metros(metros).with_sources(sources);
            let report = engine.run_event_sync(&metro_set, &request).await?;
            print_json(&report)?;
        }
        Commands::DiscoverVenues { metros, sources } => {
            let engine = engine(&config).await?;
            let metro_set = load_metros(&config.workspace_root).await?;
            let request = RunRequest::for_metros(metros).with_sources(sources);
            let report = engine.run_venue_discovery(&metro_set, &request).await?;
            print_json(&report)?;
        }
        Commands::CheckLinks => {
            let engine = engine(&config).await?;
            let report = engine.check_links().await?;
            print_json(&report)?;
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let engine = engine(&config).await?;
            let metro_set = load_metros(&config.workspace_root).await?;
            let scheduler = maybe_build_scheduler(&config, engine.clone(), metro_set.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            evsync_web::serve(AppState::new(engine, metro_set), config.web_port).await?;
        }
        Commands::Schedule => {
            let engine = engine(&config).await?;
            let metro_set = load_metros(&config.workspace_root).await?;
            let scheduling = SyncConfig {
                scheduler_enabled: true,
                ..config.clone()
            };
            let sched = maybe_build_scheduler(&scheduling, engine, metro_set)
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(
                event_sync = %scheduling.event_sync_cron,
                venue_discovery = %scheduling.venue_discovery_cron,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
