// gateway: terminates charging-pile TCP connections and serves the
// control API.

use clap::Parser;
use gateway::control_api::AppState;
use gateway::net::DeviceListener;
use gateway::sinks::SinkDispatcher;
use gateway::Gateway;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "gateway", version, about = "DNY charging-pile gateway")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "/etc/charge-gateway/gateway.toml")]
    config: PathBuf,
    /// Override the device TCP bind address.
    #[arg(long)]
    tcp_bind: Option<String>,
    /// Override the control API bind address.
    #[arg(long)]
    http_bind: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    let mut config = match gateway::load_config_from_path(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.tcp_bind {
        config.tcp.bind = bind;
    }
    if let Some(bind) = args.http_bind {
        config.http.bind = bind;
    }
    info!(
        tcp = %config.tcp.bind,
        http = %config.http.bind,
        endpoints = config.endpoints.len(),
        "config loaded"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (gateway, sink_rx) = Gateway::new(config.clone());
    let sinks = Arc::new(SinkDispatcher::new(&config));
    let sink_stats = sinks.stats();
    let sink_task = tokio::spawn(sinks.run(sink_rx, shutdown_rx.clone()));
    tokio::spawn(gateway.acks.clone().run(shutdown_rx.clone()));
    tokio::spawn(gateway::supervisor::run(gateway.clone(), shutdown_rx.clone()));

    let listener = match DeviceListener::start(gateway.clone(), &config.tcp.bind, shutdown_rx.clone()).await
    {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind device listener on {}: {}", config.tcp.bind, e);
            std::process::exit(1);
        }
    };
    info!(addr = %listener.local_addr(), "accepting device connections");

    let http_listener = match tokio::net::TcpListener::bind(&config.http.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind control api on {}: {}", config.http.bind, e);
            std::process::exit(1);
        }
    };
    info!(addr = %config.http.bind, "control api listening");
    let state = AppState::new(gateway.clone(), sink_stats);
    let http = tokio::spawn(gateway::control_api::serve(
        state,
        http_listener,
        shutdown_rx.clone(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("FATAL: signal handler failed: {}", e);
    }
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
    let _ = http.await;
    // The sink dispatcher drains its queue with its own bounded deadline.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(12), sink_task).await;
    info!("gateway stopped");
}
