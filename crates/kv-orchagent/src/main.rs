//! kv-orchagent entry point.
//!
//! Loads the configuration, assembles the agent over the in-memory device
//! and runs it until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use kv_orchagent::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use kv_orchagent::daemon::AgentBuilder;
use kv_orchagent::device::MockDevice;
use kv_orchagent::logging::{self, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Dependency-aware configuration reconciliation agent
#[derive(Parser, Debug)]
#[command(name = "kv-orchagent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Initial configuration file (YAML), overrides the config file
    #[arg(short = 'i', long)]
    init_file: Option<PathBuf>,

    /// Plan every transaction on a copy of the graph before executing it
    #[arg(long)]
    simulate: bool,

    /// Print the device state as JSON on exit
    #[arg(long)]
    dump_on_exit: bool,

    /// Write the dependency graph (Graphviz DOT) to this file on exit
    #[arg(long)]
    graph_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_format, &args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = format!("{:#}", err), "kv-orchagent failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("====================================================================");
    info!(version = env!("CARGO_PKG_VERSION"), "starting kv-orchagent");
    info!("====================================================================");

    let mut config = AgentConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(init_file) = args.init_file {
        config.orchestrator.init_file = Some(init_file);
    }
    if args.simulate {
        config.scheduler.enable_txn_simulation = true;
    }
    config.validate().context("invalid configuration")?;
    info!(
        default_source = %config.orchestrator.default_data_source,
        init_file = ?config.orchestrator.init_file,
        simulation = config.scheduler.enable_txn_simulation,
        "configuration loaded"
    );

    let mut agent = AgentBuilder::new(config, MockDevice::new())
        .build()
        .context("assembling agent")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => warn!("received SIGINT, shutting down"),
            Err(err) => error!(error = %err, "failed to listen for ctrl-c"),
        }
        signal.cancel();
    });

    agent.run(shutdown).await.context("running agent")?;

    if args.dump_on_exit {
        let dump = agent
            .configurator()
            .dump_state()
            .map_err(|status| anyhow::anyhow!("dump state: {}", status.message()))?;
        println!("{}", serde_json::to_string_pretty(&dump)?);
    }
    if let Some(path) = &args.graph_file {
        std::fs::write(path, agent.scheduler().graph_dot())
            .with_context(|| format!("writing graph to {}", path.display()))?;
        info!(path = %path.display(), "dependency graph written");
    }
    agent.shutdown();

    info!("kv-orchagent shutdown complete");
    Ok(())
}
