use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared by all commands
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands that inspect the configuration without touching the store
#[derive(Subcommand, Debug, Clone)]
pub enum CommonCommands {
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::{Configuration, LogFormat, StoreBackend};
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Default log level for the given CLI flags; `RUST_LOG` wins when set.
    pub fn log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments and the configured format
    pub fn init_logging(args: &CommonArgs, format: LogFormat) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stdout);

        let result = match format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
        if let Err(e) = result {
            eprintln!("Logging already initialized: {e}");
        }
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            let registration = &config.registration;
            println!("memento configuration:");
            println!("======================");
            println!("Store backend: {}", config.store.backend);
            println!("Store endpoints: {}", config.store.endpoints.join(", "));
            println!("Dial timeout: {:?}", config.store.dial_timeout);
            println!("Base path: {}", registration.base_path);
            println!("Service name: {}", registration.service_name);
            println!("Service port: {}", registration.service_port);
            match &registration.advertise_address {
                Some(address) => println!("Advertise address: {address}"),
                None => println!("Advertise address: auto-detect"),
            }
            println!("Lease TTL: {:?}", registration.ttl);
            println!("Store call timeout: {:?}", registration.default_timeout);
            println!("Log format: {:?}", config.logging.format);
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        tracing::info!("Validating configuration...");

        let registration = &config.registration;
        if registration.base_path.is_empty() {
            anyhow::bail!("Base path cannot be empty");
        }

        if registration.ttl.as_secs() < 1 {
            anyhow::bail!("Lease TTL must be at least one second");
        }

        if registration.default_timeout.is_zero() {
            anyhow::bail!("Store call timeout must be greater than zero");
        }

        if config.store.backend == StoreBackend::Etcd && config.store.endpoints.is_empty() {
            anyhow::bail!("At least one etcd endpoint is required");
        }

        tracing::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle commands that don't require contacting the store
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<()> {
        match command {
            CommonCommands::Config { json } => display_config(config, *json),
            CommonCommands::Validate => validate_config(config),
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(())
            }
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
