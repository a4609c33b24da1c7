//! Gridsim Server
//!
//! Runs the simulation engine, the protocol relay and its control plane.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gridsim::bridge::Bridge;
use gridsim::config::{DEFAULT_CONFIG_FILE, GridsimConfig};
use gridsim::engine::{Engine, SharedEngine};
use gridsim::project::{ProjectLoader, ProjectWatcher};
use gridsim::relay::RelayState;
use gridsim::server::{AppState, Protocol, create_router};

/// Substation device simulator
#[derive(Parser, Debug)]
#[command(name = "gridsim")]
#[command(about = "Substation device simulator with Modbus and IEC 61850 relay", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Path to the project directory
    #[arg(short, long)]
    project: Option<PathBuf>,

    /// Control-plane host address
    #[arg(long)]
    host: Option<String>,

    /// Control-plane port
    #[arg(long)]
    port: Option<u16>,

    /// Run the engine only, without listeners or control plane
    #[arg(long)]
    no_relay: bool,

    /// Don't start the file watcher
    #[arg(long)]
    no_watch: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Bind conventional ports for protocols the project leaves unconfigured
    #[arg(long)]
    allow_default_listeners: bool,

    /// Drop every listener when a control client connects
    #[arg(long)]
    reset_on_connect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting gridsim v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GridsimConfig::load(&args.config)?;
    if let Some(project) = args.project {
        config.project = project;
    }
    if let Some(host) = args.host {
        config.relay.control_host = host;
    }
    if let Some(port) = args.port {
        config.relay.control_port = port;
    }
    if args.allow_default_listeners {
        config.relay.allow_default_listeners = true;
    }
    if args.reset_on_connect {
        config.relay.reset_on_connect = true;
    }
    debug!(?config, "Effective configuration");

    let engine: SharedEngine = Arc::new(Mutex::new(Engine::with_system_clock(
        config.engine.clone(),
    )));

    let project = match ProjectLoader::load(&config.project).await {
        Ok(project) => {
            info!(
                "Loaded project: {} ({})",
                project.manifest.project.name, project.manifest.project.id
            );
            for failure in project.apply(&mut engine.lock()) {
                error!("{}", failure);
            }
            project
        }
        Err(e) => {
            error!(
                "Failed to load project from {}: {}",
                config.project.display(),
                e
            );
            std::process::exit(1);
        }
    };
    engine.lock().start();

    let relay = (!args.no_relay).then(|| RelayState::new(config.relay.clone()));
    tokio::spawn(run_engine(
        engine.clone(),
        config.engine.tick_period_ms,
        relay.clone(),
    ));

    if !args.no_watch {
        match ProjectWatcher::new(project.clone(), engine.clone()) {
            Ok(watcher) => {
                tokio::spawn(watcher.run());
                info!("File watcher started");
            }
            Err(e) => {
                error!("Failed to start file watcher: {}", e);
            }
        }
    }

    let Some(relay) = relay else {
        info!("Relay disabled; engine only");
        shutdown_signal().await;
        return Ok(());
    };
    relay.spawn_sweeper();

    let endpoints = Protocol::ALL
        .into_iter()
        .map(|protocol| (protocol, project.endpoints(protocol)))
        .collect();
    let ied_model = project.ied_model().cloned();
    Bridge::new(engine.clone(), relay.clone(), ied_model)
        .start(endpoints)
        .await;

    if relay.settings().reset_on_connect {
        info!("Control clients reset the endpoint set on connect");
    }
    let state = AppState::new(relay);
    let app = create_router(state);

    let addr: SocketAddr =
        format!("{}:{}", config.relay.control_host, config.relay.control_port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Control plane listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gridsim=info,st_runtime=info,tower_http=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Drive the engine at its fixed tick period, forwarding operates to the relay
async fn run_engine(engine: SharedEngine, period_ms: u64, relay: Option<RelayState>) {
    let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = engine.lock().tick();
        if let Some(paused) = report.paused_at {
            info!(device_id = %paused.device_id, line = paused.line, "Paused");
        }
        if let Some(relay) = &relay {
            for update in report.control_updates {
                relay.publish_control_update(update);
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
