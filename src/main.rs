//! fragpull service binary
//!
//! `fragpull start` wires the storage, event bus, metrics and registry
//! together behind the REST listener; `fragpull config` dumps the effective
//! merged configuration.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fragpull::api::{self, ApiContext};
use fragpull::events::EventKind;
use fragpull::{
    DownloadRegistry, Event, EventBus, EventSink, HttpClient, HttpClientConfig, LocalStore,
    Metrics, ServiceConfig, StorageService,
};

#[derive(Parser)]
#[command(name = "fragpull", about = "artefact download service")]
struct Cli {
    /// Config file or directory (default searches $HOME, ./config, .)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Comma-separated configuration profiles
    #[arg(long, env = "ACTIVE_PROFILES", value_delimiter = ',', global = true)]
    profiles: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the download service
    Start(StartArgs),
    /// Dump the effective configuration
    Config,
}

#[derive(Args)]
struct StartArgs {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// IP address to listen on
    #[arg(long)]
    ip: Option<String>,

    /// Directory to store downloads
    #[arg(long)]
    download_directory: Option<PathBuf>,

    /// Max concurrent downloads
    #[arg(long)]
    max_concurrent_downloads: Option<usize>,

    /// Directory holding the local store
    #[arg(long)]
    storage_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match ServiceConfig::load(cli.config.as_deref(), &cli.profiles) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "error while reading configuration");
            std::process::exit(1);
        }
    };

    match cli.command {
        Command::Config => {
            match serde_yaml::to_string(&config) {
                Ok(rendered) => print!("{}", rendered),
                Err(e) => {
                    tracing::error!(error = %e, "failed to render configuration");
                    std::process::exit(1);
                }
            }
        }
        Command::Start(args) => {
            let code = start(apply_overrides(config, args)).await;
            std::process::exit(code);
        }
    }
}

fn apply_overrides(mut config: ServiceConfig, args: StartArgs) -> ServiceConfig {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(ip) = args.ip {
        config.server.ip = ip;
    }
    if let Some(directory) = args.download_directory {
        config.download.directory = directory;
    }
    if let Some(max_concurrent) = args.max_concurrent_downloads {
        config.download.max_concurrent = max_concurrent;
    }
    if let Some(path) = args.storage_path {
        config.storage.path = path;
    }
    config
}

async fn start(config: ServiceConfig) -> i32 {
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return 1;
    }

    // init the event bus; the broker producer hangs off the subscription side
    let events = Arc::new(EventBus::new());

    // init the local storage
    let store = match LocalStore::open(&config.storage).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to init the local storage");
            return 1;
        }
    };
    let storage = Arc::new(StorageService::new(store));

    let metrics = match Metrics::new(&config.metrics) {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            tracing::error!(error = %e, "failed to init metrics");
            return 1;
        }
    };
    metrics.expose(&config.metrics);
    spawn_event_watcher(&events, &metrics);

    let client = match HttpClient::new(&HttpClientConfig {
        timeout: Duration::from_secs(config.download.timeout),
        redirects: config.download.redirects,
    }) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!(error = %e, "failed to init the transport client");
            return 1;
        }
    };

    let registry = Arc::new(DownloadRegistry::new(config.download.max_concurrent));
    let ctx = Arc::new(ApiContext {
        registry: Arc::clone(&registry),
        download: config.download.clone(),
        client,
        events: events.clone(),
        storage: Arc::clone(&storage),
        metrics,
    });

    let addr = format!("{}:{}", config.server.ip, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = events.notify(Event::service("start failed"));
            tracing::error!(error = %e, addr = %addr, "failed to start server");
            return 1;
        }
    };

    tracing::info!(addr = %addr, "server starting");
    let _ = events.notify(Event::service("started"));

    let serve_result = axum::serve(listener, api::router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // stop intake, cancel live downloads, then release the store lock
    registry.shutdown().await;
    storage.close().await;
    let _ = events.notify(Event::service("stopped"));

    match serve_result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            1
        }
    }
}

/// Feed download lifecycle events into the metrics counters
fn spawn_event_watcher(events: &Arc<EventBus>, metrics: &Arc<Metrics>) {
    let mut rx = events.subscribe();
    let metrics = Arc::clone(metrics);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.kind == EventKind::Download => match event.name.as_str() {
                    "complete" => metrics.download_completed(),
                    "error" | "init_error" => metrics.download_failed(),
                    _ => {}
                },
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("shutdown on interrupt"),
        _ = terminate => tracing::info!("shutdown on terminate"),
    }
}
