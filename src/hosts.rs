//! Target host capability probing and caching.
//!
//! Probes characterise the target itself, so they always go out directly,
//! never through the proxy fleet.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::header::LOCATION;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::models::HostInfo;

/// Transient failures should self-heal quickly; healthy hosts rarely change.
const ONLINE_TTL: Duration = Duration::from_secs(60 * 60);
const OFFLINE_TTL: Duration = Duration::from_secs(10);

struct CachedHost {
    info: HostInfo,
    expires_at: Instant,
}

/// Read-through TTL cache of host capabilities.
///
/// Concurrent misses on the same host may both probe; the cost is one extra
/// probe and the results converge.
pub struct HostInfoCache {
    entries: DashMap<String, CachedHost>,
    /// Plain client for the HTTP/HTTPS probes. Redirects are not followed so
    /// the port-80 `Location` redirect rule stays observable.
    probe_client: reqwest::Client,
    /// HTTP/2-only client for the h2 probe.
    h2_client: reqwest::Client,
    probe_timeout: Duration,
}

impl HostInfoCache {
    pub fn new(config: &Config) -> Result<Self> {
        let probe_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.host_info_request_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("host probe client: {}", e)))?;

        let h2_client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .timeout(config.host_info_request_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("h2 probe client: {}", e)))?;

        Ok(Self {
            entries: DashMap::new(),
            probe_client,
            h2_client,
            probe_timeout: config.host_info_request_timeout,
        })
    }

    /// Return the cached capabilities for `host`, probing synchronously on a
    /// miss or an expired entry.
    pub async fn get(&self, host: &str) -> HostInfo {
        if let Some(info) = self.cached(host) {
            return info;
        }

        let info = self.probe(host).await;
        let ttl = if info.is_online() {
            ONLINE_TTL
        } else {
            OFFLINE_TTL
        };

        self.entries.insert(
            host.to_string(),
            CachedHost {
                info: info.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        info
    }

    fn cached(&self, host: &str) -> Option<HostInfo> {
        let entry = self.entries.get(host)?;
        if entry.expires_at > Instant::now() {
            Some(entry.info.clone())
        } else {
            None
        }
    }

    async fn probe(&self, host: &str) -> HostInfo {
        let mut info = HostInfo::unreachable(host);

        match timeout(self.probe_timeout, tokio::net::lookup_host((host, 0u16))).await {
            Ok(Ok(addresses)) => {
                for address in addresses {
                    match address.ip() {
                        IpAddr::V4(_) => info.supports_ipv4 = true,
                        IpAddr::V6(_) => info.supports_ipv6 = true,
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("DNS lookup for {} failed: {}", host, e);
                return info;
            }
            Err(_) => {
                debug!("DNS lookup for {} timed out", host);
                return info;
            }
        }

        if !info.supports_ipv4 && !info.supports_ipv6 {
            return info;
        }

        match self
            .probe_client
            .get(format!("http://{}", host))
            .send()
            .await
        {
            Ok(response) => {
                // 426 Upgrade Required means plain HTTP is refused.
                info.supports_http = response.status().as_u16() != 426;

                // A redirect-only endpoint on port 80 does not count as
                // HTTP support.
                if let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    if location.contains("https://") {
                        info.supports_http = false;
                    }
                }
            }
            Err(_) => return info,
        }

        info.supports_https = self
            .probe_client
            .get(format!("https://{}", host))
            .send()
            .await
            .is_ok();

        let h2_url = if info.supports_https {
            format!("https://{}", host)
        } else {
            format!("http://{}", host)
        };
        info.supports_h2 = self.h2_client.get(h2_url).send().await.is_ok();

        info
    }

    #[cfg(test)]
    fn insert_for_tests(&self, host: &str, info: HostInfo, ttl: Duration) {
        self.entries.insert(
            host.to_string(),
            CachedHost {
                info,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}
