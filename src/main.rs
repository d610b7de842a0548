//! scrapegate - entry point
//!
//! Starts the proxy fleet bring-up, the scheduler and the front-end
//! listeners, then waits for a shutdown signal.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scrapegate::api::{RpcServer, WebServer};
use scrapegate::fleet::{self, ProxyManager};
use scrapegate::proxy::ProxyServer;
use scrapegate::{scheduler, Config, Gateway};

#[tokio::main]
async fn main() -> scrapegate::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scrapegate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting scrapegate");

    let config = Config::from_env()?;
    info!("Configuration loaded");

    let gateway = Gateway::new(config.clone())?;

    // A gateway without a proxy list is useless: failure here is fatal.
    let endpoints = fleet::fetch_proxy_list(&config.proxy_list_url).await?;
    info!("Fetched {} proxy endpoints", endpoints.len());

    let (shutdown_tx, _) = watch::channel(false);

    let manager = ProxyManager::new(gateway.clone());
    let manager_task = tokio::spawn(async move {
        if let Err(e) = manager.run(endpoints).await {
            error!("Proxy bring-up error: {}", e);
        }
    });

    let scheduler_gateway = gateway.clone();
    let scheduler_shutdown = shutdown_tx.subscribe();
    let scheduler_task = tokio::spawn(async move {
        scheduler::run(scheduler_gateway, scheduler_shutdown).await;
    });

    let proxy_server = ProxyServer::new(config.clone(), gateway.clone())?;
    let proxy_shutdown = shutdown_tx.subscribe();
    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(proxy_shutdown).await {
            error!("HTTP proxy error: {}", e);
        }
    });

    let rpc_server = RpcServer::new(config.clone(), gateway.clone());
    let rpc_shutdown = shutdown_tx.subscribe();
    let rpc_task = tokio::spawn(async move {
        if let Err(e) = rpc_server.run(rpc_shutdown).await {
            error!("RPC server error: {}", e);
        }
    });

    let web_task = if config.enable_web {
        let web_server = WebServer::new(config.clone(), Arc::clone(&gateway));
        let web_shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = web_server.run(web_shutdown).await {
                error!("Dashboard error: {}", e);
            }
        }))
    } else {
        None
    };

    info!(
        "Listening - proxy: {}, rpc: {}{}",
        config.http_proxy_addr(),
        config.rpc_addr(),
        if config.enable_web {
            format!(", web: {}", config.web_addr())
        } else {
            String::new()
        }
    );

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(manager_task, scheduler_task, proxy_task, rpc_task);
    if let Some(task) = web_task {
        let _ = task.await;
    }

    info!("scrapegate stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
