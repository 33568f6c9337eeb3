use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use umdt::{setup_logging, AppConfig, Bridge, MockServer, ScriptRegistry, UmdtError};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "/etc/umdt/config.yaml")]
    config: PathBuf,

    /// Dump default config and exit
    #[arg(long = "dump-default-config")]
    dump_default: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the mock server engine
    Server,
    /// Run the bridge engine
    Bridge,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run() -> Result<(), UmdtError> {
    let cli = Cli::parse();

    if cli.dump_default {
        let config = AppConfig::default();
        println!(
            "{}",
            serde_yaml::to_string(&config)
                .map_err(|e| UmdtError::invalid_argument(e.to_string()))?
        );
        return Ok(());
    }

    let config = AppConfig::from_file(cli.config)?;
    setup_logging(&config.logging)?;

    // Front-ends register their scripts here; the stock binary ships none.
    let registry = ScriptRegistry::new();

    match cli.command {
        Some(Command::Server) => {
            let server_config = config.server.ok_or_else(|| {
                UmdtError::invalid_argument("config has no `server` section")
            })?;
            run_server(server_config, &registry).await
        }
        Some(Command::Bridge) => {
            let bridge_config = config.bridge.ok_or_else(|| {
                UmdtError::invalid_argument("config has no `bridge` section")
            })?;
            run_bridge(bridge_config, &registry).await
        }
        None => {
            // No subcommand: run whichever engine the config describes.
            match (config.server, config.bridge) {
                (Some(server), None) => run_server(server, &registry).await,
                (None, Some(bridge)) => run_bridge(bridge, &registry).await,
                (Some(_), Some(_)) => Err(UmdtError::invalid_argument(
                    "config has both engines; pick one with `umdt server` or `umdt bridge`",
                )),
                (None, None) => Err(UmdtError::invalid_argument(
                    "config describes neither a server nor a bridge",
                )),
            }
        }
    }
}

async fn run_server(
    config: umdt::MockServerConfig,
    registry: &ScriptRegistry,
) -> Result<(), UmdtError> {
    let server = MockServer::new(config, registry)?;

    let runner = Arc::clone(&server);
    let handle = tokio::spawn(async move { runner.run().await });

    wait_for_ctrl_c().await;
    info!("Interrupt received");
    server.shutdown().await?;
    handle.abort();
    Ok(())
}

async fn run_bridge(
    config: umdt::BridgeConfig,
    registry: &ScriptRegistry,
) -> Result<(), UmdtError> {
    let bridge = Bridge::new(config, registry).await?;

    let runner = Arc::clone(&bridge);
    let handle = tokio::spawn(async move { runner.run().await });

    wait_for_ctrl_c().await;
    info!("Interrupt received");
    bridge.shutdown().await?;
    handle.abort();
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for interrupt: {}", e);
    }
}
