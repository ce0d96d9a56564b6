mod server;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use limbic_core::{Config, TurnContext, parse_transcript};
use limbic_engine::{CaptureOutcome, MemoryEngine, RecallOptions};
use limbic_store::{DataLayout, load_config};
use rmcp::{ServiceExt, transport::stdio};

#[derive(Parser)]
#[command(name = "limbic", about = "Emotionally weighted conversational memory")]
struct Cli {
    /// Data directory (defaults to ~/.limbic)
    #[arg(long, global = true, env = "LIMBIC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to <data-dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent identity that owns the affect state
    #[arg(long, global = true, env = "LIMBIC_IDENTITY", default_value = "default")]
    identity: String,

    /// Conversation the command acts in
    #[arg(long, global = true)]
    conversation: Option<String>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start MCP server on stdio transport
    Serve,

    /// Capture the latest exchange of a transcript (.json array or .jsonl)
    Capture {
        /// Transcript file
        file: PathBuf,
    },

    /// Recall memories relevant to a query
    Recall {
        /// Text to recall against
        query: String,

        /// Maximum number of turns to surface
        #[arg(long)]
        max_results: Option<usize>,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show store statistics
    Health {
        /// Print pipeline counters in Prometheus text format instead
        #[arg(long)]
        prometheus: bool,
    },

    /// Show the current affect state
    Affect {
        /// Reset to the configured baseline
        #[arg(long)]
        reset: bool,
    },

    /// Print the effective configuration
    Config {
        /// Print the JSON schema instead
        #[arg(long)]
        schema: bool,
    },

    /// Move turns from the fallback log into the store
    Replay,
}

impl Cli {
    fn layout(&self) -> DataLayout {
        DataLayout::resolve(self.data_dir.clone())
    }

    fn context(&self) -> TurnContext {
        TurnContext {
            identity: self.identity.clone(),
            conversation_id: self.conversation.clone(),
            session_id: None,
        }
    }

    fn load_config(&self) -> Config {
        let path = self
            .config
            .clone()
            .unwrap_or_else(|| self.layout().config_file());
        let (config, warnings) = load_config(&path);
        for warning in &warnings {
            tracing::warn!("config: {warning}");
        }
        config
    }
}

async fn open_engine(cli: &Cli) -> Result<MemoryEngine> {
    let layout = cli.layout();
    MemoryEngine::open(&layout, cli.load_config())
        .await
        .with_context(|| format!("failed to open memory store in {}", layout.base().display()))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve => cmd_serve(&cli).await,
        Commands::Capture { file } => cmd_capture(&cli, file).await,
        Commands::Recall {
            query,
            max_results,
            json,
        } => cmd_recall(&cli, query, *max_results, *json).await,
        Commands::Health { prometheus } => cmd_health(&cli, *prometheus).await,
        Commands::Affect { reset } => cmd_affect(&cli, *reset).await,
        Commands::Config { schema } => cmd_config(&cli, *schema),
        Commands::Replay => cmd_replay(&cli).await,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn cmd_serve(cli: &Cli) -> Result<()> {
    let engine = open_engine(cli).await?;
    tracing::info!("starting MCP server for identity '{}'", cli.identity);

    let server = server::LimbicServer::new(engine, cli.identity.clone());
    let signalled = match server.clone().serve(stdio()).await {
        Ok(service) => {
            tokio::select! {
                quit = service.waiting() => {
                    let reason = quit.context("MCP server task failed")?;
                    tracing::info!("MCP session ended: {reason:?}");
                    false
                }
                _ = shutdown_signal() => {
                    tracing::info!("shutdown signal received");
                    true
                }
            }
        }
        Err(e) => {
            tracing::info!("client went away before initialization: {e}");
            false
        }
    };

    server.shutdown().await;
    if signalled {
        // The blocking stdin reader keeps runtime teardown waiting until the
        // client writes or closes the pipe.
        std::process::exit(0);
    }
    Ok(())
}

async fn cmd_capture(cli: &Cli, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let messages =
        parse_transcript(&raw).with_context(|| format!("failed to parse {}", file.display()))?;

    let engine = open_engine(cli).await?;
    let outcome = engine.capture(&messages, &cli.context()).await;
    engine.shutdown().await.context("failed to flush writes")?;

    print_json(&outcome)?;
    if let CaptureOutcome::Lost { error, .. } = &outcome {
        anyhow::bail!("turn was not persisted: {error}");
    }
    Ok(())
}

async fn cmd_recall(cli: &Cli, query: &str, max_results: Option<usize>, json: bool) -> Result<()> {
    let engine = open_engine(cli).await?;
    let ctx = cli.context();
    let mut session = engine.new_session(ctx.conversation_id.clone());
    let opts = RecallOptions {
        max_results,
        ..RecallOptions::default()
    };
    let outcome = engine.recall(query, &ctx, &mut session, &opts).await;

    if json {
        print_json(&outcome)?;
    } else {
        match &outcome.context {
            Some(context) => println!("{context}"),
            None => println!("(no memories found)"),
        }
    }

    if cli.verbose {
        eprintln!(
            "--- scanned={}, candidates={}, surfaced={}, tokens={} ---",
            outcome.scanned,
            outcome.candidate_count,
            outcome.memories.len(),
            outcome.tokens
        );
    }

    engine.shutdown().await.context("failed to close store")?;
    Ok(())
}

async fn cmd_health(cli: &Cli, prometheus: bool) -> Result<()> {
    let engine = open_engine(cli).await?;
    if prometheus {
        print!("{}", engine.metrics().render().context("failed to render metrics")?);
    } else {
        let health = engine.health().await.context("failed to read store health")?;
        print_json(&health)?;
    }
    engine.shutdown().await.context("failed to close store")?;
    Ok(())
}

async fn cmd_affect(cli: &Cli, reset: bool) -> Result<()> {
    let engine = open_engine(cli).await?;
    let ctx = cli.context();
    let state = if reset {
        let update = engine
            .reset_affect(&ctx)
            .await
            .context("failed to reset affect")?;
        if !update.is_applied() {
            tracing::warn!("affect reset lost a version race; showing the latest state");
        }
        update.into_state()
    } else {
        engine
            .affect_state(&ctx)
            .await
            .context("failed to read affect")?
    };
    print_json(&server::affect_json(&state))?;
    engine.shutdown().await.context("failed to close store")?;
    Ok(())
}

fn cmd_config(cli: &Cli, schema: bool) -> Result<()> {
    if schema {
        return print_json(&schemars::schema_for!(Config));
    }
    let config = cli.load_config();
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    print!("{rendered}");
    Ok(())
}

async fn cmd_replay(cli: &Cli) -> Result<()> {
    let engine = open_engine(cli).await?;
    let report = engine
        .replay_fallback()
        .await
        .context("failed to replay fallback log")?;
    engine.shutdown().await.context("failed to flush writes")?;

    println!(
        "replayed {}, already stored {}, remaining {}",
        report.replayed, report.already_stored, report.remaining
    );
    Ok(())
}
