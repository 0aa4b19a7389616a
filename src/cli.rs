use anyhow::Context;
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    api::router,
    config::EngineConfig,
    logging::init_tracing,
    state::AppState,
    store::{DurableStore, ParityStore},
    team::TeamsFile,
    utils::shutdown_token,
};

/// Trading venue server and admin tools
#[derive(Parser)]
#[command(name = "exchange_engine")]
#[command(version, about = "Matching engine and session server for the trading venue")]
struct Cli {
    /// YAML config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket/HTTP server
    Serve {
        /// Address to listen on, overrides `listen_addr`
        #[arg(long)]
        addr: Option<String>,

        /// Database directory, overrides `data_dir`
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Load teams from a YAML file into the store
    Seed {
        /// File with a top-level `teams:` list
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::load(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn serve(
    mut config: EngineConfig,
    addr: Option<String>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(addr) = addr {
        config.listen_addr = addr;
    }
    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(&config.data_dir));
    let listen_addr = config.listen_addr.clone();
    let sweep_every = config.offer_sweep_interval();
    let ticker_every = config.ticker_interval();

    let state = AppState::open(&data_dir, config)
        .await
        .with_context(|| format!("opening exchange state in {}", data_dir.display()))?;

    let token = shutdown_token();
    tokio::spawn(Arc::clone(state.exchange.negotiator()).run_sweeper(sweep_every, token.clone()));
    tokio::spawn(Arc::clone(&state.exchange).run_ticker(ticker_every, token.clone()));

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(addr = %listen_addr, data_dir = %data_dir.display(), "exchange listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    info!("server stopped");
    Ok(())
}

async fn seed(config: EngineConfig, file: PathBuf, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(&config.data_dir));
    let raw = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let teams: TeamsFile = serde_yaml::from_str(&raw).context("parsing teams file")?;
    let store = ParityStore::open(&data_dir)?;
    for team in teams.teams {
        info!(team = %team.name, "seeding team");
        store.put_team(team).await?;
    }
    Ok(())
}

pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.log_level);
    match cli.command {
        Commands::Serve { addr, data_dir } => serve(config, addr, data_dir).await,
        Commands::Seed { file, data_dir } => seed(config, file, data_dir).await,
    }
}
