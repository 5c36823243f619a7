use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use kubetools_sync::{IngestConfig, IngestPipeline};
use kubetools_web::WebConfig;
use tracing::{error, info};

/// Target prefix shared by the binary and every `kubetools_*` library crate.
const LOG_TARGET_PREFIX: &str = "kubetools";

#[derive(Debug, Parser)]
#[command(name = "kubetools")]
#[command(about = "Kubetools catalog: ingest the tools README and serve the dataset")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Overrides KUBETOOLS_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, parse and enrich the source document, then write tools.json.
    Sync,
    /// Serve the dataset and vote API.
    Serve {
        /// Overrides KUBETOOLS_WEB_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn default_directive(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("{LOG_TARGET_PREFIX}={level}")
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(cli.verbose)));

    match cli.log_format {
        LogFormat::Text => fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        None | Some(Commands::Sync) => {
            let mut config = IngestConfig::from_env();
            if let Some(dir) = cli.data_dir {
                config.data_dir = dir;
            }
            let summary = IngestPipeline::new(config)?.run_once().await?;
            info!(
                run_id = %summary.run_id,
                parsed = summary.parsed_tools,
                with_stars = summary.tools_with_stars,
                raw = summary.raw_artifact_path.as_deref().unwrap_or("<not stored>"),
                "ingestion complete"
            );
        }
        Some(Commands::Serve { port }) => {
            let mut config = WebConfig::from_env();
            if let Some(dir) = cli.data_dir {
                if std::env::var_os("KUBETOOLS_VOTES_DIR").is_none() {
                    config.votes_dir = dir.join("votes");
                }
                config.data_dir = dir;
            }
            if let Some(port) = port {
                config.port = port;
            }
            kubetools_web::serve(config).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(err) = run(cli).await {
        error!(error = %format!("{err:#}"), "kubetools failed");
        std::process::exit(1);
    }
}
