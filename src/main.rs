use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{io::Write, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

use regime_gate::cache;
use regime_gate::config::EngineConfig;
use regime_gate::regime_core::SessionPreset;
use regime_gate::replay;
use regime_gate::runtime::EngineRegistry;
use regime_gate::server;
use regime_gate::types::{AppState, RecordLog};

#[derive(Parser, Debug)]
#[command(name = "regime-gate")]
#[command(author, version, about = "Regime & execution-permission engine")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file (missing fields take defaults)
    #[arg(short, long, global = true, env = "REGIME_GATE_CONFIG")]
    config: Option<PathBuf>,

    /// Named preset: default, conservative, equity
    #[arg(long, global = true, env = "REGIME_GATE_PRESET")]
    preset: Option<String>,

    /// Session whose open is the daily reset (ny-futures, ny-equity, london, tokyo)
    #[arg(long, global = true, env = "REGIME_GATE_SESSION")]
    session: Option<SessionPreset>,

    /// Closes back across a trigger that confirm a reclaim
    #[arg(long, global = true, env = "REGIME_GATE_RECLAIM_CLOSES")]
    reclaim_closes: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP/WebSocket server
    Serve {
        /// Port to run the web server on
        #[arg(short, long, default_value = "3000", env = "PORT")]
        port: u16,

        /// Bind on all interfaces instead of localhost
        #[arg(long)]
        public: bool,

        /// Transition records kept for the records endpoint
        #[arg(long, default_value = "5000")]
        history: usize,
    },

    /// Replay a candle CSV against recorded level sets
    Replay {
        /// Candle CSV (.csv or .csv.zst)
        #[arg(long)]
        candles: PathBuf,

        /// Level sets (.json or .json.zst)
        #[arg(long)]
        levels: PathBuf,

        /// Write JSON-line records here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match (&args.config, &args.preset) {
        (Some(path), _) => EngineConfig::load(path)?,
        (None, Some(name)) => EngineConfig::preset(name).with_context(|| format!("Unknown preset: {}", name))?,
        (None, None) => EngineConfig::default(),
    };
    if let Some(session) = args.session {
        config.session_preset = session;
    }
    if let Some(n) = args.reclaim_closes {
        config.reclaim_closes = n;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("regime_gate=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Commands::Serve { port, public, history } => serve(config, port, public, history).await,
        Commands::Replay { candles, levels, output } => run_replay(config, candles, levels, output),
    }
}

async fn serve(config: EngineConfig, port: u16, public: bool, history: usize) -> Result<()> {
    info!("Starting regime-gate server");
    info!("Session: {}", config.session_preset);
    info!("Reclaim closes: {}", config.reclaim_closes);

    let state = Arc::new(AppState {
        registry: EngineRegistry::new(config, 1000),
        history: RwLock::new(RecordLog::new(history)),
    });

    tokio::spawn(server::record_history(state.clone()));

    let app = server::router(state);

    let ip = if public { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
    let addr = SocketAddr::from((ip, port));
    info!("Server running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn run_replay(config: EngineConfig, candles: PathBuf, levels: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let rows = cache::load_candles(&candles)?;
    let level_sets = cache::load_levels(&levels)?;

    let reports = replay::replay_all(rows, level_sets, &config);

    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path).with_context(|| format!("Failed to create {:?}", path))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };

    for report in &reports {
        for record in &report.records {
            writeln!(out, "{}", serde_json::to_string(record)?)?;
        }
    }
    out.flush()?;

    for report in &reports {
        info!(
            "{}: final {} / {} / {:?} ({} forced exits, {} alarms, {} rejected)",
            report.instrument,
            report.final_output.session_state,
            report.final_output.regime,
            report.final_output.permitted_strategy,
            report.force_exits.len(),
            report.alarms.len(),
            report.rejected
        );
    }
    Ok(())
}
