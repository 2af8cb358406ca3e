//! strata - incremental policy and IP set calculation for a node-local dataplane

mod replay;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;

use strata_calc::async_graph::{AsyncCalcGraph, DEFAULT_BATCH_CAPACITY};
use strata_calc::labels::PassiveLabelIndex;
use strata_calc::{CalcGraph, GraphConfig};
use strata_common::config::Config;
use strata_common::selector::NormalizingParser;
use strata_common::telemetry::{init_telemetry, TelemetryConfig};

/// strata - turns datastore updates into ordered dataplane messages
#[derive(Parser, Debug)]
#[command(name = "strata", version, about, long_about = None)]
struct Cli {
    /// Human-readable logs instead of JSON
    #[arg(long, global = true)]
    text_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay JSON-lines updates and print dataplane messages
    ///
    /// Configuration parameters are read from STRATA_* environment
    /// variables and merged with datastore configuration updates.
    /// Match events must be supplied in the input.
    Replay(ReplayArgs),

    /// Print the configuration resolved from STRATA_* environment variables
    Config,
}

/// Replay arguments
#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Input file, `-` for stdin
    #[arg(long, short, default_value = "-")]
    input: String,

    /// Node to compute dataplane state for
    #[arg(long, env = "STRATA_HOSTNAME")]
    hostname: String,

    /// Input lines per graph batch
    #[arg(long, default_value_t = 100)]
    batch_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("invalid STRATA_* configuration")?;

    let filter = std::env::var("RUST_LOG")
        .is_err()
        .then(|| config.params().log_severity_screen.as_filter_level().to_string());
    init_telemetry(TelemetryConfig {
        filter,
        json: !cli.text_logs,
        ..Default::default()
    })?;

    match cli.command {
        Commands::Replay(args) => run_replay(args, config).await,
        Commands::Config => {
            let out = serde_json::json!({
                "params": config.params(),
                "raw": config.raw_values(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    }
}

async fn run_replay(args: ReplayArgs, config: Config) -> anyhow::Result<()> {
    let graph_config = GraphConfig {
        hostname: args.hostname.clone(),
        params: config.params().clone(),
    };
    let graph = CalcGraph::with_config(
        graph_config,
        Box::new(PassiveLabelIndex),
        Arc::new(NormalizingParser),
        config,
    )?;

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(replay::write_messages(rx, tokio::io::stdout()));
    let graph = AsyncCalcGraph::spawn(graph, tx, DEFAULT_BATCH_CAPACITY);

    let read = if args.input == "-" {
        replay::read_inputs(BufReader::new(tokio::io::stdin()), args.batch_size, &graph).await
    } else {
        let file = tokio::fs::File::open(&args.input)
            .await
            .with_context(|| format!("failed to open {}", args.input))?;
        replay::read_inputs(BufReader::new(file), args.batch_size, &graph).await
    };

    // A graph failure closes its input, so report it ahead of read errors.
    graph.shutdown().await.context("calculation graph failed")?;
    let inputs = read?;
    let messages = writer.await??;

    info!(hostname = %args.hostname, inputs, messages, "replay complete");
    Ok(())
}
