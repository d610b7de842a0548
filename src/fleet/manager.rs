//! Fleet bring-up: turn a list of SOCKS5 endpoints into ready clients.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::gateway::Gateway;

use super::client::ProxyClient;
use super::list::ProxyEndpoint;

/// How many endpoints may be connecting at once.
const BRING_UP_CONCURRENCY: usize = 20;

/// Brings proxy endpoints up into the gateway's ready-set.
pub struct ProxyManager {
    gateway: Arc<Gateway>,
}

impl ProxyManager {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Bring up every endpoint, bounded by a semaphore. Individual failures
    /// are logged and dropped; they are never fatal. An empty ready-set is a
    /// valid steady state.
    pub async fn run(&self, endpoints: Vec<ProxyEndpoint>) -> Result<()> {
        info!("Bringing up {} proxy endpoints", endpoints.len());

        let semaphore = Arc::new(Semaphore::new(BRING_UP_CONCURRENCY));

        for endpoint in endpoints {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed while we hold it.
                Err(_) => break,
            };

            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match bring_up(&endpoint, gateway.config()).await {
                    Ok(client) => {
                        info!("Proxy {} ready", client.id());
                        gateway.add_ready_proxy(Arc::new(client));
                    }
                    Err(e) => {
                        warn!("Abandoning proxy {}: {}", endpoint, e);
                    }
                }
            });
        }

        Ok(())
    }
}

/// Construct the transports and probe the exit's external IP, which becomes
/// the client's stable id.
async fn bring_up(endpoint: &ProxyEndpoint, config: &Config) -> Result<ProxyClient> {
    info!("Connecting to proxy {}", endpoint);

    let client = ProxyClient::new(endpoint, config)?;
    let ip = client
        .probe_external_ip(&config.ip_echo_url, config.initial_ip_info_timeout)
        .await?;

    Ok(client.with_id(ip))
}
