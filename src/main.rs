use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use iterforge::config::{LogFormat, ServiceConfig};
use iterforge::consumer::{self, ActiveGenerations, ConnectionPhase, ConsumerSnapshot};
use iterforge::store::SqliteStore;
use iterforge::{logging, server};

#[derive(Parser)]
#[command(name = "iterforge")]
#[command(version, about = "Iterative code-generation backend: intent, context and live progress")]
pub struct Cli {
    /// Path to iterforge.toml (defaults to ./iterforge.toml, then the user config dir)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to serve on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Database path
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Enable dev mode (CORS permissive for a local UI dev server)
    #[arg(long)]
    pub dev: bool,

    /// Initialize the database only (don't start server)
    #[arg(long)]
    pub init: bool,

    /// Follow a project's progress on a running server instead of serving
    #[arg(long, value_name = "PROJECT_ID", conflicts_with = "init")]
    pub watch: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(db_path) = &self.db_path {
            config.server.db_path = Some(db_path.clone());
        }
        if self.dev {
            config.server.dev = true;
        }
        if self.json_logs {
            config.logging.format = LogFormat::Json;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, source) = ServiceConfig::discover(cli.config.as_deref())?;
    config.apply_env()?;
    cli.apply(&mut config);

    let _log_guard = logging::init_logging(&config.logging)?;

    match &source {
        Some(path) => info!(config = %path.display(), "loaded configuration"),
        None => info!("no configuration file found; using defaults"),
    }
    for warning in config.validate() {
        warn!("{}", warning);
    }

    if cli.init {
        let db_path = config.server.resolved_db_path();
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
        println!("Database initialized at {}", db_path.display());
        return Ok(());
    }

    if let Some(project_id) = &cli.watch {
        return watch_project(&config, project_id).await;
    }

    server::start_server(config).await
}

/// Print each state change as it arrives, then the final snapshot as JSON.
async fn watch_project(config: &ServiceConfig, project_id: &str) -> Result<()> {
    let mut consumer = consumer::remote_consumer(config, project_id, ActiveGenerations::new());
    let mut updates = consumer.watch();
    let reporter = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            info!(
                phase = ?snapshot.phase,
                status = ?snapshot.state.status,
                step = snapshot.state.current_step.as_deref().unwrap_or(""),
                files = snapshot.state.files.len(),
                "progress"
            );
        }
    });

    let phase = consumer.run().await;
    let state = consumer.into_state();
    let _ = reporter.await;

    println!(
        "{}",
        serde_json::to_string_pretty(&ConsumerSnapshot { phase, state })?
    );
    if phase == ConnectionPhase::Disconnected {
        anyhow::bail!(
            "Lost the event stream for {} at {}",
            project_id,
            config.server.callback_base()
        );
    }
    Ok(())
}
