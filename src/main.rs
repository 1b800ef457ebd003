use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use zigbee_capability_gateway::config::{self, Config};
use zigbee_capability_gateway::error::Result;
use zigbee_capability_gateway::input::{mqtt, simulation};
use zigbee_capability_gateway::{
    ClusterBindingManager, DiagnosticLog, NodeLifecycleSupervisor, RadioEvent, RadioStack,
    Registry, RegistryHandle,
};

#[derive(Parser)]
#[command(name = "zigbee-capability-gateway")]
#[command(about = "Resolves Zigbee devices to capability profiles and keeps their bindings alive")]
struct Cli {
    /// Capability profile table (JSON)
    #[arg(long, env = "REGISTRY_PATH")]
    registry: Option<PathBuf>,

    /// Where unknown fingerprints and binding problems are recorded
    #[arg(long, env = "DIAGNOSTICS_PATH")]
    diagnostics: Option<PathBuf>,

    /// Run against simulated devices instead of the MQTT coordinator
    #[arg(long)]
    simulate: bool,

    /// Seconds between simulated reports
    #[arg(long, default_value_t = 30)]
    sim_interval: u64,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    // Load .env file before anything else
    config::load_dotenv();
    init_logger();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("Starting Zigbee capability gateway");

    let mut config = Config::from_env();
    if let Some(path) = cli.registry {
        config.storage.registry_path = path;
    }
    if let Some(path) = cli.diagnostics {
        config.storage.diagnostics_path = path;
    }
    config.validate()?;

    info!("Configuration loaded:");
    info!("  Registry: {}", config.storage.registry_path.display());
    info!("  Diagnostics: {}", config.storage.diagnostics_path.display());
    info!(
        "  Binding: timeout {} ms, {} attempt(s), backoff {}..{} ms, {} concurrent",
        config.binding.timeout_ms,
        config.binding.max_attempts,
        config.binding.backoff_base_ms,
        config.binding.backoff_max_ms,
        config.binding.max_concurrent
    );

    // An inconsistent profile table is the one thing that stops startup
    let registry = Arc::new(RegistryHandle::new(Registry::from_path(
        &config.storage.registry_path,
    )?));
    let diagnostics = Arc::new(DiagnosticLog::load(&config.storage.diagnostics_path));

    let (radio, events, link): (Arc<dyn RadioStack>, mpsc::Receiver<RadioEvent>, JoinHandle<()>) =
        if cli.simulate {
            info!("Running with simulated devices");
            let (tx, rx) = mpsc::channel(256);
            let sim = Arc::new(simulation::SimulatedRadio::with_events(tx.clone()));
            let task = simulation::run_device_simulation(
                sim.clone(),
                tx,
                Duration::from_secs(cli.sim_interval.max(1)),
            );
            let radio: Arc<dyn RadioStack> = sim;
            (radio, rx, task)
        } else {
            let (radio, rx, task) = mqtt::connect(&config.mqtt).await?;
            let radio: Arc<dyn RadioStack> = radio;
            (radio, rx, task)
        };

    let binder = Arc::new(ClusterBindingManager::new(
        radio,
        diagnostics.clone(),
        config.binding.retry_policy(),
        config.binding.call_timeout(),
        config.binding.max_concurrent,
    ));
    let supervisor = Arc::new(NodeLifecycleSupervisor::new(
        registry.clone(),
        binder,
        diagnostics.clone(),
        config.poll_tick(),
    ));

    let change_logger = spawn_change_logger(supervisor.subscribe());
    let reloader = spawn_reload_on_sighup(
        registry.clone(),
        supervisor.clone(),
        config.storage.registry_path.clone(),
    );

    let runner = supervisor.clone();
    let supervisor_task = tokio::spawn(async move { runner.run(events).await });

    info!("Gateway is running");
    info!("  - Press Ctrl+C to exit");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    link.abort();
    supervisor_task.abort();
    reloader.abort();
    supervisor.shutdown().await;
    change_logger.abort();

    match diagnostics.save(&config.storage.diagnostics_path) {
        Ok(()) => info!(
            "Saved {} diagnostic record(s) to {}",
            diagnostics.len(),
            config.storage.diagnostics_path.display()
        ),
        Err(e) => error!("Failed to save diagnostics: {}", e),
    }

    info!("Zigbee capability gateway stopped");
    Ok(())
}

fn spawn_change_logger(
    mut changes: broadcast::Receiver<zigbee_capability_gateway::CapabilityEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(event) => info!(
                    "[Capability] {} {} = {}",
                    event.node, event.capability, event.value
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("[Capability] Missed {} change(s)", missed)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(unix)]
fn spawn_reload_on_sighup(
    registry: Arc<RegistryHandle>,
    supervisor: Arc<NodeLifecycleSupervisor>,
    path: PathBuf,
) -> JoinHandle<()> {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("[Registry] SIGHUP reload unavailable: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("[Registry] SIGHUP received, reloading {}", path.display());
            if registry.reload_from(&path).is_ok() {
                supervisor.registry_reloaded();
            }
        }
    })
}

#[cfg(not(unix))]
fn spawn_reload_on_sighup(
    _registry: Arc<RegistryHandle>,
    _supervisor: Arc<NodeLifecycleSupervisor>,
    _path: PathBuf,
) -> JoinHandle<()> {
    tokio::spawn(async {})
}
