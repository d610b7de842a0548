//! Process-wide shared state: the proxy ready-set, the pub/sub topics, the
//! host cache and the request counter, tied together behind one value
//! constructed at startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::fleet::ProxyClient;
use crate::hosts::HostInfoCache;
use crate::models::{ActiveRequest, GatewayResponse};

/// Topic buffer depth. Publishing never blocks; a subscriber that falls this
/// far behind observes a lag and re-checks state on its next wake.
const BROADCAST_CAPACITY: usize = 1024;

pub struct Gateway {
    config: Config,
    clients: Mutex<Vec<Arc<ProxyClient>>>,
    new_requests: broadcast::Sender<Arc<ActiveRequest>>,
    request_finished: broadcast::Sender<Arc<ActiveRequest>>,
    proxy_set_changed: broadcast::Sender<Vec<Arc<ProxyClient>>>,
    host_cache: HostInfoCache,
    request_counter: AtomicU64,
}

impl Gateway {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let host_cache = HostInfoCache::new(&config)?;
        let (new_requests, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (request_finished, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (proxy_set_changed, _) = broadcast::channel(BROADCAST_CAPACITY);

        Ok(Arc::new(Self {
            config,
            clients: Mutex::new(Vec::new()),
            new_requests,
            request_finished,
            proxy_set_changed,
            host_cache,
            request_counter: AtomicU64::new(0),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Submit a logical request. The host is resolved and capability-checked
    /// synchronously; an offline host is rejected here and never enters the
    /// queue. On success the caller holds the reply end of the single-shot
    /// channel.
    pub async fn submit(
        &self,
        url: Url,
        priority: i64,
        retry_on_codes: Vec<u16>,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<GatewayResponse>> {
        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::InvalidUrl(url.to_string()))?
            .to_string();

        let host_info = self.host_cache.get(&host).await;
        if !host_info.is_online() {
            return Err(GatewayError::HostUnreachable);
        }

        let id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        let request = Arc::new(ActiveRequest::new(
            id,
            url,
            priority,
            host_info,
            retry_on_codes,
            cancel,
            reply_tx,
        ));

        self.publish_new_request(request);

        Ok(reply_rx)
    }

    /// Append a ready client and publish a snapshot copy of the ready-set;
    /// consumers read snapshots without touching the lock.
    pub fn add_ready_proxy(&self, client: Arc<ProxyClient>) {
        let snapshot = {
            let mut clients = self.clients.lock();
            clients.push(client);
            clients.clone()
        };
        let _ = self.proxy_set_changed.send(snapshot);
    }

    pub fn ready_proxies(&self) -> Vec<Arc<ProxyClient>> {
        self.clients.lock().clone()
    }

    pub fn publish_new_request(&self, request: Arc<ActiveRequest>) {
        let _ = self.new_requests.send(request);
    }

    pub fn publish_request_finished(&self, request: Arc<ActiveRequest>) {
        let _ = self.request_finished.send(request);
    }

    pub fn subscribe_new_requests(&self) -> broadcast::Receiver<Arc<ActiveRequest>> {
        self.new_requests.subscribe()
    }

    pub fn subscribe_request_finished(&self) -> broadcast::Receiver<Arc<ActiveRequest>> {
        self.request_finished.subscribe()
    }

    pub fn subscribe_proxy_set(&self) -> broadcast::Receiver<Vec<Arc<ProxyClient>>> {
        self.proxy_set_changed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::ProxyEndpoint;

    fn test_gateway() -> Arc<Gateway> {
        Gateway::new(Config::for_tests()).unwrap()
    }

    fn test_client(host: &str) -> Arc<ProxyClient> {
        let endpoint = ProxyEndpoint {
            host: host.to_string(),
            port: 1080,
            username: "u".to_string(),
            password: "p".to_string(),
        };
        Arc::new(ProxyClient::new(&endpoint, &Config::for_tests()).unwrap())
    }

    #[tokio::test]
    async fn test_ready_set_snapshots_are_published() {
        let gateway = test_gateway();
        let mut changes = gateway.subscribe_proxy_set();

        gateway.add_ready_proxy(test_client("10.0.0.1"));
        gateway.add_ready_proxy(test_client("10.0.0.2"));

        let first = changes.recv().await.unwrap();
        assert_eq!(first.len(), 1);

        let second = changes.recv().await.unwrap();
        assert_eq!(second.len(), 2);

        assert_eq!(gateway.ready_proxies().len(), 2);
    }

    #[tokio::test]
    async fn test_submit_rejects_offline_host() {
        let gateway = test_gateway();
        let mut new_requests = gateway.subscribe_new_requests();

        // RFC 2606 reserves .invalid, so resolution always fails.
        let err = gateway
            .submit(
                Url::parse("https://host.invalid/page").unwrap(),
                0,
                Vec::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::HostUnreachable));
        assert!(new_requests.try_recv().is_err());
    }

    #[test]
    fn test_request_ids_are_unique_and_increasing() {
        let gateway = test_gateway();
        let a = gateway.request_counter.fetch_add(1, Ordering::Relaxed);
        let b = gateway.request_counter.fetch_add(1, Ordering::Relaxed);
        assert!(b > a);
    }
}
