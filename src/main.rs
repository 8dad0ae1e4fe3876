//! Constrained Device Agent - Main Entry Point

use cda_agent::coap::client::DEFAULT_TIMEOUT;
use cda_agent::coap::{create_client, CoapServerAdapter};
use cda_agent::common::{DataMessageListener, DefaultDataMessageListener, ResourceName};
use cda_agent::config::CdaConfig;
use cda_agent::mqtt::MqttClientConnector;
use cda_agent::observability::init_default_logging;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{signal, time::Duration};
use tracing::{error, info, warn};

/// Constrained device agent: CoAP server and client plus MQTT pub/sub
#[derive(Parser)]
#[command(name = "cda-agent")]
#[command(about = "Constrained device agent connection layer")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CDA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve device resources over CoAP and connect to the MQTT broker
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Ask the configured CoAP gateway which resources it offers
    Discover,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting constrained device agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Discover => discover_resources(config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<CdaConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(CdaConfig::load_from_file(path)?);
    }

    for path_str in ["cda.toml", "config/cda.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(CdaConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(CdaConfig::default())
}

async fn run_agent(config: CdaConfig) -> Result<(), Box<dyn std::error::Error>> {
    let listener = Arc::new(DefaultDataMessageListener::new());

    let server = Arc::new(CoapServerAdapter::new(&config, Some(listener.clone()))?);
    let mut mqtt = MqttClientConnector::new(&config.mqtt_gateway)?;
    mqtt.set_data_message_listener(listener.clone() as Arc<dyn DataMessageListener>);

    let starter = server.clone();
    if !tokio::task::spawn_blocking(move || starter.start_server()).await? {
        return Err("CoAP server failed to start".into());
    }

    if mqtt.connect_client().await {
        mqtt.subscribe_to_topic(Some(ResourceName::CdaActuatorCmd), config.mqtt_gateway.default_qos)
            .await;
    } else {
        warn!("MQTT broker unavailable, continuing with CoAP only");
    }

    info!("Agent is running, press Ctrl-C to stop");

    let listen_timeout = config.coap_gateway.listen_timeout_secs;
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
        _ = tokio::time::sleep(Duration::from_secs(listen_timeout)), if listen_timeout > 0 => {
            info!(listen_timeout_secs = listen_timeout, "Listen timeout elapsed, shutting down");
        }
    }

    if mqtt.is_connected() {
        mqtt.disconnect_client().await;
    }
    tokio::task::spawn_blocking(move || server.stop_server()).await?;
    Ok(())
}

fn handle_config_command(config: &CdaConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", config.to_toml_string()?);
    }
    Ok(())
}

async fn discover_resources(config: CdaConfig) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = config.coap_gateway;

    let links = tokio::task::spawn_blocking(move || {
        create_client(gateway.client_runtime, &gateway, None).map(|client| client.discover(DEFAULT_TIMEOUT))
    })
    .await??;

    match links {
        Some(links) => {
            for link in links {
                let marker = if link.observable { " (observable)" } else { "" };
                println!("/{}{}", link.path, marker);
            }
            Ok(())
        }
        None => Err("No discovery response from the gateway".into()),
    }
}
