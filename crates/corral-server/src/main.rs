use clap::Parser;
use corral_core::{
    install_signal_handler, wait_for_shutdown, ResourceRegistry, StorageLayout, StorageLock,
};
use corral_discovery::{advertised_addresses, Announcer, AnnouncerConfig, Browser, Cancel, PeerRecord};
use corral_federation::{FederationAggregator, HttpConnector};
use corral_runtime::{select_runtime, SandboxRuntime};
use corral_server::{normalize_endpoint, Dispatcher, HttpServer, ServerConfig, ServerError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(
    name = "corral",
    version,
    about = "Sandbox registry and process supervisor with LAN peer federation"
)]
struct Cli {
    /// TOML configuration file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to serve on, e.g. 0.0.0.0:8080.
    #[arg(long)]
    addr: Option<String>,

    /// Path prefix of the peer protocol routes.
    #[arg(long)]
    endpoint: Option<String>,

    /// Storage root for bases and environments.
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Sandbox runtime: host or mock.
    #[arg(long)]
    runtime: Option<String>,

    /// Instance name advertised over mDNS (default: host name).
    #[arg(long)]
    instance_name: Option<String>,

    /// Free-text description advertised to peers.
    #[arg(long)]
    note: Option<String>,

    /// Advertise the endpoint as HTTPS.
    #[arg(long, default_value_t = false)]
    tls: bool,

    /// Do not advertise this instance.
    #[arg(long, default_value_t = false)]
    no_announce: bool,

    /// Do not look for peers.
    #[arg(long, default_value_t = false)]
    no_discover: bool,

    /// Seconds to collect discovery responses.
    #[arg(long)]
    discover_timeout: Option<u64>,

    /// Seconds between peer pruning and rediscovery; 0 disables.
    #[arg(long)]
    rediscover_interval: Option<u64>,

    /// Seconds a remote invocation may take; 0 means no limit.
    #[arg(long)]
    call_timeout: Option<u64>,

    /// HTTP worker threads.
    #[arg(long)]
    workers: Option<usize>,

    /// Output lines kept per captured process.
    #[arg(long)]
    capture_lines: Option<usize>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn load_config(cli: Cli) -> Result<ServerConfig, ServerError> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = cli.addr {
        config.addr = addr;
    }
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(storage) = cli.storage {
        config.storage = Some(storage);
    }
    if let Some(runtime) = cli.runtime {
        config.runtime = runtime;
    }
    if let Some(name) = cli.instance_name {
        config.instance_name = Some(name);
    }
    if let Some(note) = cli.note {
        config.note = note;
    }
    if let Some(secs) = cli.discover_timeout {
        config.discover_timeout_secs = secs;
    }
    if let Some(secs) = cli.rediscover_interval {
        config.rediscover_interval_secs = secs;
    }
    if let Some(secs) = cli.call_timeout {
        config.call_timeout_secs = secs;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(lines) = cli.capture_lines {
        config.capture_lines = lines;
    }
    config.tls |= cli.tls;
    config.announce &= !cli.no_announce;
    config.discover &= !cli.no_discover;
    config.endpoint = normalize_endpoint(&config.endpoint);
    config.validate()?;
    Ok(config)
}

fn start_announcer(config: &ServerConfig, instance: &str, port: u16) -> Option<Announcer> {
    let host = advertised_addresses()
        .first()
        .map(ToString::to_string)
        .unwrap_or_default();
    let mut record = PeerRecord::new(instance, host, port);
    record.endpoint.clone_from(&config.endpoint);
    record.tls = config.tls;
    record.note.clone_from(&config.note);

    let announcer = Announcer::new(record, AnnouncerConfig::default());
    match announcer.start() {
        Ok(_) => {
            info!("mDNS: announcing as '{instance}' on port {port}");
            Some(announcer)
        }
        Err(e) => {
            warn!("failed to start mDNS announcer, continuing without: {e}");
            None
        }
    }
}

fn federate_discovered(
    federation: &FederationAggregator,
    own_instance: &str,
    timeout: Duration,
    cancel: &Cancel,
) {
    let peers = match Browser::default().discover(timeout, cancel) {
        Ok(peers) => peers,
        Err(e) => {
            warn!("mDNS discovery failed, continuing local-only: {e}");
            return;
        }
    };
    for peer in peers {
        if peer.instance == own_instance || federation.has_peer(&peer.instance) {
            continue;
        }
        info!("discovered '{}' at {}", peer.instance, peer.url());
        if let Err(e) = federation.add_peer(&peer) {
            warn!("failed to federate with '{}': {e}", peer.instance);
        }
    }
}

/// Initial discovery, then periodic pruning and rediscovery until cancelled.
fn spawn_federation_loop(
    federation: Arc<FederationAggregator>,
    config: &ServerConfig,
    own_instance: String,
    cancel: Cancel,
) -> Result<JoinHandle<()>, ServerError> {
    let timeout = config.discover_timeout();
    let interval = config.rediscover_interval();
    let handle = std::thread::Builder::new()
        .name("corral-federation".into())
        .spawn(move || {
            federate_discovered(&federation, &own_instance, timeout, &cancel);
            let Some(interval) = interval else {
                return;
            };
            loop {
                let wake = Instant::now() + interval;
                while Instant::now() < wake {
                    if cancel.is_cancelled() {
                        return;
                    }
                    std::thread::sleep(SHUTDOWN_POLL);
                }
                let pruned = federation.prune_disconnected();
                if !pruned.is_empty() {
                    info!("pruned {} unreachable peer(s)", pruned.len());
                }
                federate_discovered(&federation, &own_instance, timeout, &cancel);
            }
        })?;
    Ok(handle)
}

fn run(config: &ServerConfig) -> Result<(), ServerError> {
    install_signal_handler()?;

    let layout = StorageLayout::new(config.storage_root());
    layout.initialize()?;
    let _lock = StorageLock::acquire(&layout.lock_file())?;
    info!("storage root: {}", layout.root().display());

    let runtime: Arc<dyn SandboxRuntime> = Arc::from(select_runtime(&config.runtime)?);
    info!("sandbox runtime: {}", runtime.name());
    let registry = Arc::new(
        ResourceRegistry::new(layout, runtime)?.with_output_capacity(config.capture_lines),
    );

    let instance = config.instance_name();
    let federation = config.discover.then(|| {
        let connector =
            HttpConnector::new(config.peer_timeout()).with_call_timeout(config.call_timeout());
        Arc::new(FederationAggregator::new(Arc::new(connector)))
    });
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        federation.clone(),
    ));
    let http = HttpServer::bind(&config.addr, &config.endpoint, config.workers, dispatcher)?;
    let scheme = if config.tls { "https" } else { "http" };
    info!(
        "corral '{instance}' serving {scheme}://{}{}",
        config.addr, config.endpoint
    );

    let announcer = config
        .announce
        .then(|| start_announcer(config, &instance, http.port()))
        .flatten();

    let cancel = Cancel::new();
    let federation_loop = match &federation {
        Some(f) => Some(spawn_federation_loop(
            Arc::clone(f),
            config,
            instance.clone(),
            cancel.clone(),
        )?),
        None => None,
    };

    wait_for_shutdown(SHUTDOWN_POLL);
    info!("shutting down");

    cancel.cancel();
    if let Some(announcer) = announcer {
        announcer.stop();
    }
    http.shutdown();
    if let Some(handle) = federation_loop {
        if handle.join().is_err() {
            warn!("federation thread panicked");
        }
    }
    if let Some(federation) = &federation {
        federation.close();
    }
    registry.shutdown();
    info!("shutdown complete");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
