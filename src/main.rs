//! Binary entry point: resolve settings, bind a listener (retrying nearby
//! ports on `EADDRINUSE`), serve the gateway's router, and shut every live
//! kernel down cleanly on SIGINT/SIGTERM.

use std::io::IsTerminal;
use std::process::ExitCode;
use std::time::Duration;

use kernel_gateway::app::GatewayApp;
use kernel_gateway::config::Settings;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::resolve();

    let app = match GatewayApp::build(settings.clone()).await {
        Ok(app) => app,
        Err(err) => {
            error!(%err, "failed to start gateway");
            return ExitCode::FAILURE;
        }
    };

    let Some(listener) = bind_with_retries(&settings).await else {
        error!(
            port = settings.port,
            retries = settings.port_retries,
            "no free port found after exhausting port_retries"
        );
        return ExitCode::FAILURE;
    };

    let local_addr = listener.local_addr().expect("bound listener has a local address");
    info!(addr = %local_addr, api = ?settings.api, "kernel gateway listening");

    let manager = app.manager.clone();
    if let Err(err) = axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(%err, "server error");
    }

    info!("shutting down all kernels");
    manager.shutdown_all().await;

    ExitCode::SUCCESS
}

/// Bind `settings.ip:settings.port`, trying up to `port_retries` additional
/// ports in sequence on `EADDRINUSE`.
async fn bind_with_retries(settings: &Settings) -> Option<TcpListener> {
    for attempt in 0..=settings.port_retries {
        let port = settings.port + attempt;
        let addr = format!("{}:{port}", settings.ip);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                if attempt > 0 {
                    warn!(
                        configured_port = settings.port,
                        bound_port = port,
                        "configured port was in use, bound a fallback port"
                    );
                }
                return Some(listener);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(err) => {
                error!(%err, addr, "failed to bind listener");
                return None;
            }
        }
    }
    None
}

/// Wait for a shutdown signal. SIGTERM and a non-interactive SIGINT stop
/// immediately; an interactive SIGINT offers a 5-second window to send a
/// second Ctrl-C to confirm, otherwise shutdown is cancelled and the server
/// keeps running.
async fn shutdown_signal() {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    loop {
        #[cfg(unix)]
        let terminated = terminate.recv();
        #[cfg(not(unix))]
        let terminated = &mut terminate;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if !std::io::stdin().is_terminal() {
                    return;
                }
                warn!("received SIGINT; press Ctrl-C again within 5 seconds to confirm shutdown");
                let confirmed = tokio::select! {
                    _ = tokio::signal::ctrl_c() => true,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => false,
                };
                if confirmed {
                    return;
                }
                info!("shutdown not confirmed, continuing to serve");
            }
            _ = terminated => return,
        }
    }
}
