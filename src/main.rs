use clap::{Args, Parser, Subcommand};
use convoflow::{
    commands::{config_entries, delete_config, replay_file, run, set_config, validate_bundle_file, write_schema},
    config::{ConfigManager, EnvConfigManager, OrchestratorConfig},
    logger::{LogConfig, init_tracing},
};
use std::{path::PathBuf, process, time::Duration};
use tracing::error;

#[derive(Parser, Debug)]
#[command(
    name = "convoflow",
    about = "Tenant-aware conversation flows with live-agent handoff",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Log level or filter directive (e.g. error, warn, info, debug, convoflow=trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Write rolling logs and JSON cycle events to this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// OpenTelemetry collector endpoint (e.g. http://localhost:4317)
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    /// .env file with CONVOFLOW_* settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a tenant bundle file
    Validate { file: PathBuf },

    /// Emit JSON-Schema for bundle, scenario and inbound message files
    Schema {
        #[arg(long, default_value = "schemas")]
        out: PathBuf,
    },

    /// Replay a scenario file and print every reply as JSON
    Replay { scenario: PathBuf },

    /// Serve bundles from a directory, reading inbound JSON lines from stdin
    Run(RunArgs),

    /// Inspect or change CONVOFLOW_* settings stored in the env file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show every CONVOFLOW_* setting currently visible
    List,
    Set { key: String, value: String },
    Delete { key: String },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = "bundles")]
    bundles: PathBuf,

    /// How often the bundle directory is polled for changes
    #[arg(long, default_value = "2000")]
    poll_ms: u64,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = init_tracing(&LogConfig {
        log_level: cli.global.log_level.clone(),
        log_dir: cli.global.log_dir.clone(),
        otel_endpoint: cli.global.otel_endpoint.clone(),
    })?;
    let config_manager = ConfigManager(EnvConfigManager::new(cli.global.env_file.clone()));
    let config = OrchestratorConfig::load(&config_manager).await;

    let result = match cli.command {
        Commands::Validate { file } => validate_bundle_file(&file).map(|warnings| {
            println!("{} is valid ({} warnings)", file.display(), warnings.len());
        }),
        Commands::Schema { out } => write_schema(&out).map(|_| {
            println!("Schemas written to {}", out.display());
        }),
        Commands::Replay { scenario } => match replay_file(&scenario, config).await {
            Ok(report) => serde_json::to_string_pretty(&report)
                .map(|json| println!("{json}"))
                .map_err(Into::into),
            Err(e) => Err(e),
        },
        Commands::Run(args) => run(args.bundles, config, Duration::from_millis(args.poll_ms.max(100))).await,
        Commands::Config { command } => match command {
            ConfigCommands::List => {
                for (key, value) in config_entries(&config_manager).await {
                    println!("{key}={value}");
                }
                Ok(())
            }
            ConfigCommands::Set { key, value } => set_config(&config_manager, &key, &value)
                .await
                .map(|_| println!("✅ {key} stored in {}", cli.global.env_file.display())),
            ConfigCommands::Delete { key } => delete_config(&config_manager, &key)
                .await
                .map(|_| println!("✅ {key} removed")),
        },
    };

    telemetry.shutdown();
    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
    Ok(())
}
