//! `deckwright` command-line front end.

use anyhow::Context;
use clap::{Parser, Subcommand};
use deckwright_agent::{CostLedger, RecoveryConfig, StructuredOutputOrchestrator, StructuredRequest};
use deckwright_repair::{RepairPipeline, ShapeHints};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "deckwright.toml";

#[derive(Parser)]
#[command(
    name = "deckwright",
    version,
    about = "Deckwright: structured-output recovery for LLM responses"
)]
struct Cli {
    /// Path to config file (defaults to ./deckwright.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Human-readable logs instead of JSON
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify why a text fails to parse as JSON
    Classify {
        /// Input file, or `-` for stdin
        input: PathBuf,
    },
    /// Run the local repair pipeline on a text
    Repair {
        /// Input file, or `-` for stdin
        input: PathBuf,
        /// Shape hints as a JSON object
        #[arg(long, conflicts_with = "schema")]
        shape: Option<String>,
        /// Derive shape hints from a JSON schema file
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Generate structured output against the configured provider
    Generate {
        /// Prompt text
        #[arg(short, long)]
        prompt: String,
        /// JSON schema file for the response
        #[arg(long)]
        schema: Option<PathBuf>,
        /// System instruction
        #[arg(long)]
        system: Option<String>,
        /// Override the routine model
        #[arg(long)]
        model: Option<String>,
        /// Use the escalated model tier
        #[arg(long, conflicts_with = "model")]
        escalated: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Classify { input } => {
            let text = read_input(&input).await?;
            let pipeline = RepairPipeline::new(config.repair.max_repair_bytes);
            print_json(&serde_json::to_value(pipeline.classify(&text))?)?;
        }
        Commands::Repair {
            input,
            shape,
            schema,
        } => {
            let text = read_input(&input).await?;
            let shape = match (shape, schema) {
                (Some(raw), _) => {
                    serde_json::from_str::<ShapeHints>(&raw).context("Invalid --shape JSON")?
                }
                (None, Some(path)) => ShapeHints::from_schema(&read_json(&path).await?),
                (None, None) => ShapeHints::any(),
            };
            let pipeline = RepairPipeline::new(config.repair.max_repair_bytes);
            let report = pipeline.recover(&text, &shape);
            info!(outcome = ?report.outcome, kind = %report.kind(), "Repair finished");
            print_json(&serde_json::to_value(&report)?)?;
            if !report.is_recovered() {
                anyhow::bail!("All local repair layers failed ({})", report.kind());
            }
        }
        Commands::Generate {
            prompt,
            schema,
            system,
            model,
            escalated,
        } => {
            let mut request = StructuredRequest::new(prompt);
            if let Some(path) = schema {
                request = request.with_schema(read_json(&path).await?);
            }
            if let Some(system) = system {
                request = request.with_system(system);
            }
            if let Some(model) = model {
                request = request.with_model(model);
            } else if escalated {
                request = request.with_model(config.models.escalated.clone());
            }

            let ledger = Arc::new(CostLedger::new(config.pricing.clone()));
            let orchestrator = StructuredOutputOrchestrator::from_config(Arc::new(config))?
                .with_ledger(ledger.clone());

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling request");
                    on_ctrl_c.cancel();
                }
            });

            let out = orchestrator.generate_value(&request, &cancel).await?;
            let snapshot = ledger.snapshot();
            info!(
                calls = snapshot.total_calls,
                cost_usd = snapshot.total_cost_usd,
                "Generation finished"
            );
            print_json(&json!({
                "value": out.value,
                "provenance": out.provenance,
                "model": out.model,
                "repair": out.report,
                "cost": snapshot,
            }))?;
        }
    }

    Ok(())
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if pretty {
        builder.init();
    } else {
        builder.json().init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RecoveryConfig> {
    match path {
        Some(path) => RecoveryConfig::load(path)
            .with_context(|| format!("Failed to load config file '{}'", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => RecoveryConfig::load(DEFAULT_CONFIG)
            .with_context(|| format!("Failed to load config file '{DEFAULT_CONFIG}'")),
        None => Ok(RecoveryConfig::default()),
    }
}

async fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let text = tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin()))
            .await??;
        return Ok(text);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read '{}'", path.display()))
}

async fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = read_input(path).await?;
    serde_json::from_str(&raw).with_context(|| format!("'{}' is not valid JSON", path.display()))
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
