//! Registry Control
//!
//! Command-line client for a Redis-backed cluster registry: announce or
//! withdraw an address, resolve a lookup key to its members, or follow a
//! cluster's membership as it changes.
//!
//! ```text
//! registryctl --config registry.yaml register 10.0.0.1:8091
//! registryctl --config registry.yaml lookup my_test_tx_group
//! registryctl --config registry.yaml watch my_test_tx_group
//! ```

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_registry::{
    Address, EventListener, EventListenerRef, MapConfig, RegistryClient, RegistryEvent,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Registry Control - register, look up and watch cluster members
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file with the registry.redis.* and service.vgroup_mapping.* keys
    #[arg(long, env = "REGISTRY_CONFIG", default_value = "registry.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Announce an address in the configured cluster
    Register {
        /// Address as ip:port
        #[arg(value_parser = parse_address)]
        address: Address,
    },
    /// Withdraw an address from the configured cluster
    Unregister {
        /// Address as ip:port
        #[arg(value_parser = parse_address)]
        address: Address,
    },
    /// Print the members of the cluster a key maps to
    Lookup {
        /// Lookup key (service.vgroup_mapping.<key>)
        key: String,
    },
    /// Print the membership on every change until interrupted
    Watch {
        /// Lookup key (service.vgroup_mapping.<key>)
        key: String,
    },
}

/// Command-line addresses may carry stray whitespace; the wire form may not
fn parse_address(raw: &str) -> Result<Address, String> {
    raw.trim().parse().map_err(|e: cluster_registry::Error| e.to_string())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Registry Control");
    info!("  Version: {}", cluster_registry::VERSION);
    info!("  Config: {}", args.config.display());

    let source = MapConfig::from_yaml_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let client = RegistryClient::connect(Arc::new(source)).context("invalid registry configuration")?;
    info!("  Cluster: {}", client.config().cluster);
    info!("  Server: {}", client.config().server_addr());

    let outcome = run(&client, args.command).await;
    client.shutdown().await;
    outcome
}

async fn run(client: &RegistryClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Register { address } => {
            client
                .register(&address)
                .await
                .with_context(|| format!("failed to register {}", address))?;
            println!("registered {} in {}", address, client.config().cluster);
        }
        Command::Unregister { address } => {
            client
                .unregister(&address)
                .await
                .with_context(|| format!("failed to unregister {}", address))?;
            println!("unregistered {} from {}", address, client.config().cluster);
        }
        Command::Lookup { key } => {
            let view = client
                .lookup_view(&key)
                .await
                .with_context(|| format!("lookup of '{}' failed", key))?;
            print!("{}", serde_yaml::to_string(&view)?);
        }
        Command::Watch { key } => watch(client, &key).await?,
    }
    Ok(())
}

// =============================================================================
// Watch
// =============================================================================

/// Forwards each event to the watch loop
struct ChangeNotifier {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl EventListener for ChangeNotifier {
    async fn on_event(&self, message: &str) -> cluster_registry::Result<()> {
        let _ = self.tx.send(message.to_string());
        Ok(())
    }
}

async fn watch(client: &RegistryClient, key: &str) -> anyhow::Result<()> {
    let view = client
        .lookup_view(key)
        .await
        .with_context(|| format!("lookup of '{}' failed", key))?;
    print!("{}", serde_yaml::to_string(&view)?);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let notifier: EventListenerRef = Arc::new(ChangeNotifier { tx });
    client.subscribe(&view.cluster, notifier.clone())?;
    info!(cluster = %view.cluster, "Watching membership, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            message = rx.recv() => {
                let Some(message) = message else { break };
                match RegistryEvent::decode(&message) {
                    Ok(event) => println!("# {}", event),
                    Err(e) => warn!(error = %e, "Ignoring undecodable event"),
                }
                let view = client.lookup_view(key).await?;
                print!("{}", serde_yaml::to_string(&view)?);
            }
        }
    }

    client.unsubscribe(&view.cluster, &notifier).await?;
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
