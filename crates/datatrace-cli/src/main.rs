//! DataTrace - label propagation filter tools
//!
//! Validates filter configuration, evaluates policies by hand and replays
//! recorded exchanges through the filter.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use datatrace_core::config::{example_config, ConfigError, ConfigLoader, FilterConfig};
use datatrace_core::{ConcurrentStore, CorrelationStore, Phase, PolicyEvaluator};
use datatrace_correlate::{spawn_sweeper, DataTracingFilter, ExchangeReplay};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "datatrace")]
#[command(author = "Netsys")]
#[command(version)]
#[command(about = "Trace correlation and label propagation filter", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "DATATRACE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print the effective policy
    Check,

    /// Evaluate a label payload once
    Eval {
        /// Label payload, e.g. "pii;internal"
        #[arg(short, long, default_value = "")]
        labels: String,

        /// Phase (inbound, outbound)
        #[arg(short, long)]
        phase: Phase,

        /// Override actions, e.g. "ADD(x);REMOVE(y)"
        #[arg(short, long)]
        overrides: Option<String>,
    },

    /// Replay a JSONL script of exchanges through a fresh filter
    Replay {
        /// Input file (JSONL)
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Print an example configuration
    ExampleConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, load_error) = load_config(cli.config.clone())?;

    // CLI verbose flag takes precedence, then RUST_LOG, then config
    let level = match cli.verbose {
        0 => config.filter.log_level.to_lowercase(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let env_filter = if cli.verbose > 0 {
        EnvFilter::new(&level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match cli.format {
        OutputFormat::Json => builder.json().try_init(),
        OutputFormat::Text => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    if let Some(e) = load_error {
        warn!("Failed to load configuration: {}, using defaults", e);
    }

    match cli.command {
        Commands::Check => check_command(&config, cli.format),
        Commands::Eval {
            labels,
            phase,
            overrides,
        } => eval_command(&config, &labels, phase, overrides.as_deref(), cli.format),
        Commands::Replay { input } => replay_command(&config, &input).await,
        Commands::ExampleConfig => example_config_command(),
    }
}

/// Load configuration. An explicit path that fails to load is an error;
/// a broken discovered file falls back to defaults, returning the error so
/// it can be logged once logging is up.
fn load_config(cli_path: Option<PathBuf>) -> anyhow::Result<(FilterConfig, Option<ConfigError>)> {
    let explicit = cli_path.is_some();
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => Ok((config, None)),
        Err(e) if explicit => Err(e).context("Failed to load configuration"),
        Err(e) => Ok((FilterConfig::default(), Some(e))),
    }
}

#[derive(Serialize)]
struct CheckReport<'a> {
    policy_source: String,
    malformed_overrides: datatrace_core::OverrideMode,
    expiry: &'a datatrace_core::config::ExpirySettings,
    actions: Vec<String>,
}

fn check_command(config: &FilterConfig, format: OutputFormat) -> anyhow::Result<()> {
    let evaluator = config.evaluator().context("Invalid policy")?;

    let policy_source = match &config.filter.policy_file {
        Some(path) => path.display().to_string(),
        None => "inline".to_string(),
    };
    let actions: Vec<String> = evaluator
        .policy()
        .actions()
        .iter()
        .map(ToString::to_string)
        .collect();

    match format {
        OutputFormat::Json => {
            let report = CheckReport {
                policy_source,
                malformed_overrides: evaluator.override_mode(),
                expiry: &config.expiry,
                actions,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!();
            println!("DataTrace v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Configuration OK");
            println!("  Policy source:       {}", policy_source);
            println!("  Malformed overrides: {:?}", evaluator.override_mode());
            if config.expiry.enabled {
                println!(
                    "  Expiry:              {}s (sweep every {}s)",
                    config.expiry.max_age_secs, config.expiry.sweep_interval_secs
                );
            } else {
                println!("  Expiry:              disabled");
            }
            println!();
            println!("Policy ({} actions):", actions.len());
            for (i, action) in actions.iter().enumerate() {
                println!("  {:>3}. {}", i + 1, action);
            }
            println!();
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct EvalReport<'a> {
    phase: Phase,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejected: Option<String>,
    dropped_overrides: usize,
}

fn eval_command(
    config: &FilterConfig,
    labels: &str,
    phase: Phase,
    overrides: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let evaluator: PolicyEvaluator = config.evaluator().context("Invalid policy")?;
    let result = evaluator.evaluate(labels, phase, overrides);

    let report = match &result {
        Ok(evaluation) => EvalReport {
            phase,
            input: labels,
            labels: Some(evaluation.labels.clone()),
            rejected: None,
            dropped_overrides: evaluation.dropped_overrides,
        },
        Err(err) => EvalReport {
            phase,
            input: labels,
            labels: None,
            rejected: Some(err.to_string()),
            dropped_overrides: 0,
        },
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
        OutputFormat::Text => match (&report.labels, &report.rejected) {
            (Some(out), _) => {
                println!("{}", out);
                if report.dropped_overrides > 0 {
                    eprintln!("({} malformed override(s) dropped)", report.dropped_overrides);
                }
            }
            (None, Some(reason)) => println!("REJECTED: {}", reason),
            (None, None) => {}
        },
    }

    if result.is_err() {
        std::process::exit(2);
    }
    Ok(())
}

#[derive(Serialize)]
struct ReplaySummary {
    events: usize,
    resets: usize,
    open_streams: usize,
    store_entries: usize,
    metrics: datatrace_core::MetricsSnapshot,
}

async fn replay_command(config: &FilterConfig, input: &Path) -> anyhow::Result<()> {
    let store: Arc<dyn CorrelationStore> = Arc::new(ConcurrentStore::new());
    let filter = Arc::new(
        DataTracingFilter::from_config(config, Arc::clone(&store))
            .context("Failed to build filter")?,
    );

    let sweeper = config
        .expiry
        .enabled
        .then(|| spawn_sweeper(Arc::clone(&filter), &config.expiry));

    let mut replay = ExchangeReplay::new(Arc::clone(&filter));
    let outcomes = replay
        .run_file(input)
        .await
        .with_context(|| format!("Failed to replay {}", input.display()))?;

    if let Some(handle) = sweeper {
        handle.abort();
    }

    for outcome in &outcomes {
        println!("{}", serde_json::to_string(outcome)?);
    }

    let summary = ReplaySummary {
        events: outcomes.len(),
        resets: outcomes.iter().filter(|o| o.status == "reset").count(),
        open_streams: replay.open_streams(),
        store_entries: store.len(),
        metrics: filter.metrics().snapshot(),
    };
    info!(
        events = summary.events,
        resets = summary.resets,
        store_entries = summary.store_entries,
        "Replay finished"
    );
    println!("{}", serde_json::to_string(&summary)?);

    Ok(())
}

fn example_config_command() -> anyhow::Result<()> {
    let config = example_config();
    let text = toml::to_string_pretty(&config).context("Failed to render example config")?;
    println!("# DataTrace filter configuration");
    println!("#");
    println!("# Looked up in order: --config, $DATATRACE_CONFIG,");
    println!("# ~/.config/datatrace/config.toml, /etc/datatrace/config.toml");
    println!();
    print!("{}", text);
    Ok(())
}
