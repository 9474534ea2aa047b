use anyhow::Context;
use clap::Parser;
use fleetwatch::config::Config;
use fleetwatch::engine::{EngineClient, TcpEngineClient};
use fleetwatch::error::ConfigError;
use fleetwatch::local_services::LocalServiceController;
use fleetwatch::publish::{MessageBus, MqttBus};
use fleetwatch::remote::{OpenSshConnector, SessionConnector};
use fleetwatch::Coordinator;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Capacity of the inbound bus message queue
const INBOUND_CAPACITY: usize = 64;

/// Command-line arguments for the fleet coordinator
#[derive(Parser)]
#[command(
    name = "fleetwatch",
    about = "Fleet health monitor and plan coordinator for the sculpture installation",
    long_about = "Follows the service logs of every sculpture node over SSH, detects audio \
                  underruns and encoder overruns, restarts failing encoders with a \
                  rate-limited tiered strategy and keeps the audio plan in sync between \
                  the message bus and the mixing engine."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// Missing config files are accepted; they fall back to defaults.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }
                if config_path.extension().map(|e| e != "toml").unwrap_or(true) {
                    warn!(
                        "Configuration file does not have .toml extension: {}",
                        config_path.display()
                    );
                }
            }
        }
        Ok(())
    }
}

/// Load the configuration, falling back to defaults when the file is missing
/// or invalid
fn load_config(config_path: Option<&Path>) -> Config {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Config::from_file(path) {
                Ok(config) => config,
                Err(ConfigError::ReadError(_)) => {
                    warn!(
                        "Configuration file '{}' not found or unreadable, using defaults",
                        path.display()
                    );
                    Config::default()
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path.display(), e);
                    warn!("Using default configuration due to invalid config file");
                    Config::default()
                }
            }
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    };
    config.apply_env_overrides();
    config
}

async fn run(config: Config) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        shutdown_tx.send_replace(true);
    })
    .context("Error setting SIGINT handler for graceful shutdown")?;

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (bus, bus_task) = MqttBus::connect(
        &config.bus,
        config.bus.topics.inbound(),
        inbound_tx,
        shutdown_rx.clone(),
    );
    let bus = Arc::new(bus);

    let connector: Arc<dyn SessionConnector> =
        Arc::new(OpenSshConnector::from_config(&config.connection));
    let engine: Arc<dyn EngineClient> = Arc::new(TcpEngineClient::from_config(&config.engine));
    let local =
        LocalServiceController::from_config(&config.local_services, config.restart.use_sudo);

    let coordinator = Coordinator::new(
        config,
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        connector,
        engine,
        local,
        shutdown_rx,
    )
    .context("Failed to initialize coordinator")?;

    info!("Coordinator is running. Press Ctrl+C to stop.");
    Arc::new(coordinator).run(inbound_rx).await;

    bus.disconnect().await;
    if let Err(e) = bus_task.await {
        warn!("Bus event loop ended abnormally: {}", e);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting fleetwatch coordinator");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config = load_config(cli.config.as_deref());

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Coordinator shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_validation_with_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleetwatch.toml");
        std::fs::write(&path, "[bus]\nport = 1884\n").unwrap();

        let cli = Cli {
            config: Some(path),
            verbose: false,
        };
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_missing_file() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/fleetwatch.toml")),
            verbose: false,
        };
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_directory() {
        let dir = TempDir::new().unwrap();
        let cli = Cli {
            config: Some(dir.path().to_path_buf()),
            verbose: false,
        };
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_load_config_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_eq!(load_config(Some(&missing)).fleet.nodes.len(), 3);

        let invalid = dir.path().join("invalid.toml");
        std::fs::write(&invalid, "[restart]\nmax_attempts = 0\n").unwrap();
        assert_eq!(load_config(Some(&invalid)).restart.max_attempts, 5);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleetwatch.toml");
        std::fs::write(&path, "[engine]\nport = 4321\n").unwrap();

        assert_eq!(load_config(Some(&path)).engine.port, 4321);
    }
}
