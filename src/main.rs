use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::{Configuration, StoreBackend, StoreConfig};
use register::{
    CoordinationStore, EtcdStore, LeaseEnd, LeaseRegister, MemoryStore, RegisterSettings,
};

#[derive(Parser)]
#[command(name = "memento")]
#[command(about = "memento - lease-based service registration")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this instance and keep the registration alive
    Register(RegisterArgs),
    #[command(flatten)]
    Common(CommonCommands),
}

/// Overrides for the `[registration]` and `[store]` configuration sections
#[derive(Args, Debug, Default)]
struct RegisterArgs {
    #[arg(short = 'b', long, help = "Discovery base path")]
    base_path: Option<String>,

    #[arg(short = 's', long, help = "Service name")]
    service_name: Option<String>,

    #[arg(short = 'p', long, help = "Service port")]
    service_port: Option<u16>,

    #[arg(long, value_name = "SECONDS", help = "Lease time-to-live")]
    ttl: Option<u64>,

    #[arg(long, help = "Address to advertise instead of the detected local IP")]
    advertise_address: Option<String>,

    #[arg(long)]
    locality: Option<String>,

    #[arg(long)]
    stage: Option<String>,

    #[arg(long = "metadata", value_name = "TAG", help = "Endpoint metadata (repeatable)")]
    metadata: Vec<String>,

    #[arg(long, value_enum, help = "Coordination store backend")]
    store: Option<StoreBackend>,

    #[arg(long, value_delimiter = ',', help = "Coordination store endpoints")]
    endpoints: Vec<String>,
}

impl RegisterArgs {
    fn apply(self, config: &mut Configuration) {
        let registration = &mut config.registration;
        if let Some(base_path) = self.base_path {
            registration.base_path = base_path;
        }
        if let Some(service_name) = self.service_name {
            registration.service_name = service_name;
        }
        if let Some(service_port) = self.service_port {
            registration.service_port = service_port;
        }
        if let Some(ttl) = self.ttl {
            registration.ttl = std::time::Duration::from_secs(ttl);
        }
        if self.advertise_address.is_some() {
            registration.advertise_address = self.advertise_address;
        }
        if self.locality.is_some() {
            registration.locality = self.locality;
        }
        if self.stage.is_some() {
            registration.stage = self.stage;
        }
        if !self.metadata.is_empty() {
            registration.metadata = self.metadata;
        }
        if let Some(backend) = self.store {
            config.store.backend = backend;
        }
        if !self.endpoints.is_empty() {
            config.store.endpoints = self.endpoints;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = utils::load_config(cli.common.config.as_ref())?;
    let command = match cli.command {
        Commands::Register(args) => {
            args.apply(&mut config);
            None
        }
        Commands::Common(command) => Some(command),
    };

    utils::init_logging(&cli.common, config.logging.format);

    match command {
        Some(command) => utils::handle_common_command(&command, &config),
        None => run_register(config).await,
    }
}

async fn run_register(config: Configuration) -> Result<()> {
    utils::validate_config(&config)?;
    let registration = &config.registration;
    if registration.service_name.is_empty() {
        anyhow::bail!("A service name is required (--service-name or registration.service_name)");
    }

    let endpoint = registration
        .endpoint()
        .context("Could not determine local IP")?;
    tracing::info!(
        base_path = %registration.base_path,
        service = %registration.service_name,
        endpoint = %endpoint,
        ttl = ?registration.ttl,
        "Starting registration"
    );

    let store = connect_store(&config.store).await?;
    let mut register =
        LeaseRegister::new(store, RegisterSettings::from(registration), Some(endpoint));
    register.register().await.context("Registration failed")?;
    let mut listener = register.spawn_listener()?;

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("Shutdown signal received, deregistering");
                break;
            }
            end = &mut listener => {
                let end = end.context("Renewal listener failed")?;
                if registration.reregister_on_loss {
                    tracing::warn!(?end, "Lease lost, registering again");
                    register.register().await.context("Re-registration failed")?;
                    listener = register.spawn_listener()?;
                    continue;
                }
                if let Err(e) = register.close().await {
                    tracing::error!(error = %e, "Cleanup after lease loss failed");
                }
                anyhow::bail!("Lease lost: {}", describe(end));
            }
        }
    }

    register.close().await.context("Deregistration failed")?;
    match listener.await {
        Ok(end) => tracing::debug!(?end, "Renewal listener stopped"),
        Err(e) => tracing::warn!(error = %e, "Renewal listener did not stop cleanly"),
    }
    tracing::info!("Deregistered");
    Ok(())
}

async fn connect_store(config: &StoreConfig) -> Result<Box<dyn CoordinationStore>> {
    match config.backend {
        StoreBackend::Etcd => {
            let store = EtcdStore::connect(config)
                .await
                .context("Failed to connect to etcd")?;
            Ok(Box::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-process store; the registration is only visible locally");
            Ok(Box::new(MemoryStore::new()))
        }
    }
}

fn describe(end: LeaseEnd) -> &'static str {
    match end {
        LeaseEnd::Revoked => "revoked",
        LeaseEnd::Expired => "expired",
        LeaseEnd::ConnectionLost => "renewals stopped",
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
