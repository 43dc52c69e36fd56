use anyhow::{Context, Result};
use gateway_core::{Config, LogFormat, LogOutput, LoggingConfig};
use gateway_proxy::{ConnectionInfo, Gateway};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

const DEFAULT_CONFIG_PATH: &str = "configs/gateway.yaml";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let log_level = init_tracing(&config.logging);
    info!("Starting api-gateway with configuration {}", config_path);
    for warning in &config.warnings {
        warn!("Configuration warning: {}", warning);
    }

    let port = config.server.port;
    let shutdown_timeout = config.server.shutdown_timeout();
    let gateway = Arc::new(Gateway::new(config)?);
    let _sweeper = gateway.limiter().spawn_sweeper(SWEEP_INTERVAL);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut reloads = ReloadSignal::new()?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(stream, peer, gateway.clone(), shutdown_rx.clone()));
                }
                Err(e) => warn!("Error accepting connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            Some(()) = reloads.recv() => reload_config(&config_path, &gateway, &log_level),
            _ = &mut shutdown => break,
        }
    }

    info!("Shutdown signal received, draining {} connections", connections.len());
    drop(listener);
    let _ = shutdown_tx.send(true);

    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        warn!(
            "Connections still open after {:?}, aborting {}",
            shutdown_timeout,
            connections.len()
        );
        connections.abort_all();
    }

    info!("api-gateway stopped");
    Ok(())
}

/// Swaps the active log filter on reload; RUST_LOG, when set, wins over the file
struct LogLevel {
    handle: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl LogLevel {
    fn apply(&self, level: &str) -> Result<()> {
        if self.from_env {
            debug!("RUST_LOG is set, ignoring logging.level {:?}", level);
            return Ok(());
        }
        apply_log_level(&self.handle, level)
    }
}

fn apply_log_level(handle: &reload::Handle<EnvFilter, Registry>, level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).with_context(|| format!("Invalid log level {:?}", level))?;
    handle.reload(filter).context("Failed to swap log filter")?;
    Ok(())
}

fn init_tracing(config: &LoggingConfig) -> LogLevel {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(&config.level), false),
    };
    let (filter, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);
    match (config.format, config.output) {
        (LogFormat::Json, LogOutput::Stdout) => registry.with(fmt::layer().json().with_writer(std::io::stdout)).init(),
        (LogFormat::Json, LogOutput::Stderr) => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
        (LogFormat::Text, LogOutput::Stdout) => registry.with(fmt::layer().with_writer(std::io::stdout)).init(),
        (LogFormat::Text, LogOutput::Stderr) => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
    }
    LogLevel { handle, from_env }
}

/// Re-read the configuration file. A file that fails to load leaves the running config in place.
fn reload_config(path: &str, gateway: &Gateway, log_level: &LogLevel) {
    info!("SIGHUP received, reloading configuration from {}", path);
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to reload configuration, keeping the current one: {:#}", e);
            return;
        }
    };
    for warning in &config.warnings {
        warn!("Configuration warning: {}", warning);
    }

    let current = gateway.config();
    if current.logging.format != config.logging.format || current.logging.output != config.logging.output {
        warn!("logging.format and logging.output changes need a restart");
    }
    if current.server.port != config.server.port {
        warn!(
            old = current.server.port,
            new = config.server.port,
            "server.port changes need a restart"
        );
    }
    let level = config.logging.level.clone();
    let level_changed = current.logging.level != level;

    if let Err(e) = gateway.reload(config) {
        error!("Failed to apply reloaded configuration: {:#}", e);
        return;
    }
    if level_changed {
        match log_level.apply(&level) {
            Ok(()) => info!(level = %level, "Log level changed"),
            Err(e) => error!("Failed to change log level: {:#}", e),
        }
    }
}

/// SIGHUP stream on unix; never fires elsewhere
#[cfg(unix)]
struct ReloadSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        let hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
        Ok(Self(hangup))
    }

    async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
) {
    let info = ConnectionInfo { peer, is_tls: false };
    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = gateway.clone();
        async move { Ok::<_, Infallible>(gateway.handle(req, info).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!("Error serving HTTP connection from {}: {}", peer, e);
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
