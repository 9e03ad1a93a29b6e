use clap::Parser;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zigbee_state_bridge::config::{Config, load_dotenv};
use zigbee_state_bridge::error::Result;
use zigbee_state_bridge::input::{KnownDevices, MqttIntegration, Topics};
use zigbee_state_bridge::instance_lock::InstanceLock;
use zigbee_state_bridge::options::DeviceOptions;
use zigbee_state_bridge::pipeline::Orchestrator;
use zigbee_state_bridge::publish::{ConfiguredPrecision, PublishSink};
use zigbee_state_bridge::state::StateCache;
use zigbee_state_bridge::transport::{MqttClient, MqttTransport, OFFLINE};

/// How long the MQTT event loop gets to send the last messages on exit.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "zigbee-state-bridge")]
#[command(about = "Coalescing, rate-limited Zigbee state publisher for MQTT")]
struct Cli {
    /// JSON file with `defaults` and per-entity options
    #[arg(long, env = "BRIDGE_DEVICE_OPTIONS")]
    device_options: Option<PathBuf>,

    /// Directory for the state snapshot and the instance lock
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep state in memory only
    #[arg(long)]
    no_persist: bool,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    // Before the runtime starts any threads
    load_dotenv();
    init_logger();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.cache.data_dir = dir;
    }
    if cli.no_persist {
        config.cache.persistent = false;
    }

    info!("Starting Zigbee state bridge");
    info!("Configuration loaded:");
    info!(
        "  Broker: {}:{}",
        config.mqtt.broker_host, config.mqtt.broker_port
    );
    info!("  Base topic: {}", config.bridge.base_topic);
    info!("  Ingest topic: {}", config.bridge.ingest_topic);
    info!(
        "  State file: {:?} (persistent: {})",
        config.cache.state_path(),
        config.cache.persistent
    );

    let _lock = InstanceLock::acquire(&config.cache.data_dir)?;

    let options = Arc::new(match &cli.device_options {
        Some(path) => {
            info!("  Device options: {:?}", path);
            DeviceOptions::from_file(path)?
        }
        None => DeviceOptions::default(),
    });

    let state = Arc::new(StateCache::new(&config.cache, options.clone()));
    state.load();

    let topics = Topics::new(&config.bridge);
    let mqtt = MqttClient::new(&config.mqtt, &topics.availability());
    let client = mqtt.client();
    let (event_tx, event_rx) = mpsc::channel(64);
    let mqtt_loop = tokio::spawn(mqtt.run(event_tx));
    let mqtt_abort = mqtt_loop.abort_handle();

    let (sink, queue) = PublishSink::new(
        config.bridge.base_topic.clone(),
        options.clone(),
        Arc::new(ConfiguredPrecision),
    );
    let sink = Arc::new(sink);
    let _delivery = queue.spawn(Arc::new(MqttTransport::new(client.clone())));

    let bridge = Arc::new(Orchestrator::new(
        &config.bridge,
        options.clone(),
        state.clone(),
        sink.clone(),
    ));
    let devices = Arc::new(KnownDevices::new());

    let cancel = CancellationToken::new();
    let autosave = state.start_autosave(cancel.clone());
    let integration = MqttIntegration::new(&config.bridge, bridge.clone(), options, devices.clone())
        .start(client.clone(), event_rx, cancel.clone());

    info!("Zigbee state bridge is running");
    info!("  - Press Ctrl+C to exit");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    // Stop intake first so nothing new enters the pipeline
    cancel.cancel();
    let _ = integration.await;
    if let Some(autosave) = autosave {
        let _ = autosave.await;
    }

    bridge
        .shutdown(devices.as_ref(), config.bridge.drain_timeout())
        .await;

    sink.publish_raw(topics.availability(), OFFLINE, 1, true);
    sink.flush(config.bridge.drain_timeout()).await;
    if let Err(e) = client.disconnect().await {
        warn!("[MQTT] Disconnect failed: {:?}", e);
    }
    if tokio::time::timeout(DISCONNECT_GRACE, mqtt_loop).await.is_err() {
        debug!("[MQTT] Event loop still running, stopping it");
        mqtt_abort.abort();
    }

    info!("Zigbee state bridge stopped");
    Ok(())
}
