//! SOCKS5-backed upstream HTTP clients.

use std::time::{Duration, Instant};

use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::HeaderMap;
use parking_lot::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::models::{ActiveRequest, GatewayResponse};

use super::limiter::{GcraLimiter, RateLimitOutcome};
use super::list::ProxyEndpoint;

/// Transport-level cap on any single roundtrip, below the per-attempt
/// deadlines applied by the executor.
const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(60);
const H2_POOL_PER_HOST: usize = 12;
const H1_POOL_PER_HOST: usize = 6;

/// Outcome of one upstream attempt, already classified by error kind.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The target answered; status and buffered body inside.
    Response(GatewayResponse),
    /// The request's cancellation token fired mid-flight.
    Cancelled,
    /// Attempt deadline or transport timeout elapsed.
    Timeout,
    /// The SOCKS tunnel could not be established.
    ProxyUnreachable,
    /// The connection died mid-body; worth retrying without classification.
    Truncated,
    /// Any other transport failure.
    Failed,
}

/// A ready worker: one SOCKS5 exit with an HTTP/1.1 and an HTTP/2 client
/// dialing through it, a fixed spoofed header set baked into both, and
/// per-host admission state.
///
/// Clients are never torn down while the process lives; a dead exit is
/// soft-state (`last_unreachable_at`) that expires after the configured
/// cool-down.
pub struct ProxyClient {
    id: String,
    http1: reqwest::Client,
    http2: reqwest::Client,
    limiter: GcraLimiter,
    last_unreachable_at: Mutex<Option<Instant>>,
    unreachable_retry: Duration,
}

impl ProxyClient {
    /// Build both transports for an endpoint. The id starts as the
    /// endpoint's address and is replaced by the observed external IP once
    /// the identity probe succeeds.
    pub fn new(endpoint: &ProxyEndpoint, config: &Config) -> Result<Self> {
        let proxy = socks_proxy(endpoint)?;
        let headers = super::headers::spoofed_headers();

        let http2 = reqwest::Client::builder()
            .proxy(proxy.clone())
            .default_headers(headers.clone())
            .pool_max_idle_per_host(H2_POOL_PER_HOST)
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::ProxyClientSetup(e.to_string()))?;

        let http1 = reqwest::Client::builder()
            .proxy(proxy)
            .default_headers(headers)
            .http1_only()
            .pool_max_idle_per_host(H1_POOL_PER_HOST)
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::ProxyClientSetup(e.to_string()))?;

        Ok(Self {
            id: endpoint.host.clone(),
            http1,
            http2,
            limiter: GcraLimiter::new(
                config.throttle_requests_per_min,
                config.throttle_requests_burst,
            ),
            last_unreachable_at: Mutex::new(None),
            unreachable_retry: config.unreachable_client_retry,
        })
    }

    /// Replace the id with the probed external IP.
    pub fn with_id(mut self, id: String) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ask the IP-echo service which address this exit appears as.
    pub async fn probe_external_ip(&self, echo_url: &str, timeout: Duration) -> Result<String> {
        let response = self
            .http1
            .get(echo_url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| GatewayError::ProxyClientSetup(e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::ProxyClientSetup(e.to_string()))?;

        Ok(body.trim().to_string())
    }

    /// Admission protocol for `host` on this proxy: the unreachable
    /// cool-down counts as rate limiting, then a zero-cost probe, then the
    /// actual consumption once the probe passes. The probe lets the
    /// scheduler compare candidates without perturbing their buckets.
    pub fn admit(&self, host: &str) -> RateLimitOutcome {
        if let Some(marked_at) = *self.last_unreachable_at.lock() {
            let until = marked_at + self.unreachable_retry;
            let now = Instant::now();
            if now < until {
                return RateLimitOutcome::limited_for(until - now);
            }
        }

        let probe = self.limiter.check(host, 0);
        if probe.limited {
            return probe;
        }

        self.limiter.check(host, 1)
    }

    /// Back off this (proxy, host) pairing.
    pub fn penalize(&self, host: &str, cost: u32) {
        debug!("Penalizing {} for {} with cost {}", self.id, host, cost);
        self.limiter.penalize(host, cost);
    }

    pub fn mark_unreachable(&self) {
        info!("Marking proxy {} unreachable", self.id);
        *self.last_unreachable_at.lock() = Some(Instant::now());
    }

    /// Perform one upstream attempt for `request`, bounded by `deadline` and
    /// the request's cancellation token. The body is fully buffered;
    /// `Transfer-Encoding` and `Content-Length` are dropped from the
    /// propagated headers since they no longer describe the buffered body.
    pub async fn fetch(&self, request: &ActiveRequest, deadline: Duration) -> FetchOutcome {
        let started = Instant::now();

        let mut url = request.url.clone();
        let scheme = if request.host.supports_https {
            "https"
        } else {
            "http"
        };
        if url.set_scheme(scheme).is_err() {
            return FetchOutcome::Failed;
        }

        let client = if request.host.supports_h2 {
            &self.http2
        } else {
            &self.http1
        };

        let roundtrip = async {
            let response = client
                .request(request.method.clone(), url.clone())
                .send()
                .await?;
            let code = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((code, headers, body))
        };

        let attempt = tokio::select! {
            _ = request.cancel.cancelled() => return FetchOutcome::Cancelled,
            attempt = tokio::time::timeout(deadline, roundtrip) => attempt,
        };

        let (code, headers, body) = match attempt {
            Err(_) => return FetchOutcome::Timeout,
            Ok(Err(error)) => return self.classify_error(request, &url, error),
            Ok(Ok(parts)) => parts,
        };

        info!(
            "{}p {} {} {} {} {}B, {}ms",
            request.priority,
            self.id,
            request.method,
            url,
            code,
            body.len(),
            started.elapsed().as_millis()
        );

        FetchOutcome::Response(GatewayResponse::ok(
            code,
            body,
            propagated_headers(&headers),
        ))
    }

    fn classify_error(&self, request: &ActiveRequest, url: &Url, error: reqwest::Error) -> FetchOutcome {
        if error.is_timeout() {
            return FetchOutcome::Timeout;
        }

        // Every connect in this process dials through the SOCKS tunnel, so a
        // connect-phase failure means the exit (or its path to the target)
        // is down.
        if error.is_connect() {
            debug!("{} {} {} proxy unreachable", self.id, request.method, url);
            return FetchOutcome::ProxyUnreachable;
        }

        if is_truncation(&error) {
            return FetchOutcome::Truncated;
        }

        debug!("{} {} {} failed: {}", self.id, request.method, url, error);
        FetchOutcome::Failed
    }
}

/// Connection died mid-message: the peer closed after the request was sent
/// but before a complete response arrived.
fn is_truncation(error: &reqwest::Error) -> bool {
    if let Some(hyper_error) = find_source::<hyper::Error>(error) {
        if hyper_error.is_incomplete_message() {
            return true;
        }
    }
    matches!(
        find_source::<std::io::Error>(error).map(std::io::Error::kind),
        Some(std::io::ErrorKind::UnexpectedEof)
    )
}

/// Walk an error's source chain looking for a `T`.
fn find_source<T: std::error::Error + 'static>(error: &dyn std::error::Error) -> Option<&T> {
    let mut source = error.source();
    while let Some(inner) = source {
        if let Some(found) = inner.downcast_ref::<T>() {
            return Some(found);
        }
        source = inner.source();
    }
    None
}

/// Strip the framing headers that would mis-describe the buffered body.
fn propagated_headers(headers: &HeaderMap) -> HeaderMap {
    let mut propagated = headers.clone();
    propagated.remove(TRANSFER_ENCODING);
    propagated.remove(CONTENT_LENGTH);
    propagated
}

fn socks_proxy(endpoint: &ProxyEndpoint) -> Result<reqwest::Proxy> {
    // socks5h: the exit resolves target hostnames, not this process.
    let mut url = Url::parse(&format!("socks5h://{}:{}", endpoint.host, endpoint.port))?;
    url.set_username(&endpoint.username)
        .map_err(|_| GatewayError::ProxyClientSetup("invalid proxy username".into()))?;
    url.set_password(Some(&endpoint.password))
        .map_err(|_| GatewayError::ProxyClientSetup("invalid proxy password".into()))?;

    reqwest::Proxy::all(url).map_err(|e| GatewayError::ProxyClientSetup(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::HeaderValue;

    fn test_endpoint() -> ProxyEndpoint {
        ProxyEndpoint {
            host: "10.0.0.1".to_string(),
            port: 1080,
            username: "alice".to_string(),
            password: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_client_builds_with_endpoint_address_as_initial_id() {
        let client = ProxyClient::new(&test_endpoint(), &Config::for_tests()).unwrap();
        assert_eq!(client.id(), "10.0.0.1");

        let client = client.with_id("203.0.113.9".to_string());
        assert_eq!(client.id(), "203.0.113.9");
    }

    #[test]
    fn test_admission_consumes_burst_then_limits() {
        let client = ProxyClient::new(&test_endpoint(), &Config::for_tests()).unwrap();

        for _ in 0..6 {
            assert!(!client.admit("example.com").limited);
        }
        assert!(client.admit("example.com").limited);

        // A different host has an untouched bucket.
        assert!(!client.admit("other.example").limited);
    }

    #[test]
    fn test_unreachable_cooldown_counts_as_rate_limited() {
        let client = ProxyClient::new(&test_endpoint(), &Config::for_tests()).unwrap();

        client.mark_unreachable();
        let outcome = client.admit("example.com");
        assert!(outcome.limited);
        assert!(outcome.retry_after <= Duration::from_secs(60));
        assert!(outcome.retry_after > Duration::from_secs(58));
    }

    #[test]
    fn test_penalty_reflects_in_admission() {
        let client = ProxyClient::new(&test_endpoint(), &Config::for_tests()).unwrap();

        client.penalize("example.com", 100);
        let outcome = client.admit("example.com");
        assert!(outcome.limited);
        assert!(outcome.retry_after > Duration::from_secs(60));
    }

    #[test]
    fn test_propagated_headers_drop_framing() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("123"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));

        let propagated = propagated_headers(&headers);
        assert!(propagated.get(TRANSFER_ENCODING).is_none());
        assert!(propagated.get(CONTENT_LENGTH).is_none());
        assert_eq!(
            propagated.get("content-type"),
            Some(&HeaderValue::from_static("text/html"))
        );
    }

    #[test]
    fn test_socks_proxy_encodes_credentials() {
        let endpoint = ProxyEndpoint {
            host: "10.0.0.1".to_string(),
            port: 1080,
            username: "al ice".to_string(),
            password: "p@ss:word".to_string(),
        };
        // Credentials with reserved characters must not break the proxy URL.
        assert!(socks_proxy(&endpoint).is_ok());
    }

    #[test]
    fn test_response_outcome_keeps_body() {
        let response = GatewayResponse::ok(200, Bytes::from_static(b"hello"), HeaderMap::new());
        match FetchOutcome::Response(response) {
            FetchOutcome::Response(r) => {
                assert_eq!(r.code, 200);
                assert_eq!(r.body, Bytes::from_static(b"hello"));
            }
            _ => unreachable!(),
        }
    }
}
