//! The HTTP forward-proxy front-end.
//!
//! Accepts plain absolute-form HTTP requests and CONNECT tunnels. CONNECT is
//! always intercepted: the tunnel is TLS-terminated with a minted
//! certificate and the decrypted requests are scheduled like any other. A
//! client-supplied `x-priority` header carries the scheduling priority.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::models::ResponseStatus;

use super::mitm::CertificateAuthority;

const PRIORITY_HEADER: &str = "x-priority";

/// Forward-proxy server
pub struct ProxyServer {
    config: Config,
    gateway: Arc<Gateway>,
    authority: Arc<CertificateAuthority>,
}

impl ProxyServer {
    pub fn new(config: Config, gateway: Arc<Gateway>) -> Result<Self> {
        Ok(Self {
            config,
            gateway,
            authority: Arc::new(CertificateAuthority::new()?),
        })
    }

    /// Run the proxy server
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.config.http_proxy_addr()).await?;
        info!("HTTP proxy listening on {}", self.config.http_proxy_addr());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            let gateway = self.gateway.clone();
                            let authority = self.authority.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, gateway, authority).await
                                {
                                    debug!("Connection from {} ended: {}", client_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("HTTP proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    gateway: Arc<Gateway>,
    authority: Arc<CertificateAuthority>,
) -> Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = gateway.clone();
        let authority = authority.clone();

        async move {
            if req.method() == Method::CONNECT {
                handle_connect(req, gateway, authority)
            } else {
                handle_gateway_request(req, gateway, None).await
            }
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| GatewayError::Http(e.to_string()))?;

    Ok(())
}

/// Accept the CONNECT, then intercept the tunnel once the client upgrades.
fn handle_connect(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    authority: Arc<CertificateAuthority>,
) -> std::result::Result<Response<Full<Bytes>>, GatewayError> {
    let Some(target) = req.uri().authority().cloned() else {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "CONNECT requires an authority",
        ));
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let host = target.host().to_string();
                if let Err(e) = serve_intercepted(upgraded, host, gateway, authority).await {
                    debug!("Intercepted tunnel to {} ended: {}", target, e);
                }
            }
            Err(e) => debug!("CONNECT upgrade failed: {}", e),
        }
    });

    Ok(Response::new(Full::new(Bytes::new())))
}

/// TLS-terminate the upgraded tunnel with a minted leaf and serve the
/// decrypted requests against the gateway.
async fn serve_intercepted(
    upgraded: Upgraded,
    host: String,
    gateway: Arc<Gateway>,
    authority: Arc<CertificateAuthority>,
) -> Result<()> {
    let tls_config = authority.server_config_for(&host)?;
    let acceptor = TlsAcceptor::from(tls_config);
    let tls_stream = acceptor.accept(TokioIo::new(upgraded)).await?;

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = gateway.clone();
        let host = host.clone();
        async move { handle_gateway_request(req, gateway, Some(host)).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
        .map_err(|e| GatewayError::Http(e.to_string()))?;

    Ok(())
}

/// Translate one front-end request into a gateway submission and map the
/// terminal response back onto the wire. Dropping this future (client gone)
/// cancels the submission through the token's drop guard.
async fn handle_gateway_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    intercepted_host: Option<String>,
) -> std::result::Result<Response<Full<Bytes>>, GatewayError> {
    let priority = take_priority(&req);

    let url_text = match &intercepted_host {
        // Inside an intercepted tunnel requests arrive in origin form.
        Some(host) => format!(
            "https://{}{}",
            host,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        ),
        None => req.uri().to_string(),
    };

    let Ok(url) = Url::parse(&url_text) else {
        return Ok(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Proxy error",
        ));
    };

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let reply = match gateway.submit(url, priority, Vec::new(), cancel).await {
        Ok(reply) => reply,
        Err(GatewayError::HostUnreachable) => {
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "Remote host unreachable",
            ));
        }
        Err(e) => {
            error!("Submission failed: {}", e);
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Proxy error",
            ));
        }
    };

    let response = match reply.await {
        Ok(response) => response,
        Err(_) => {
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Proxy error",
            ));
        }
    };

    match response.status {
        // Cancelled requests get no response; the connection just drops.
        ResponseStatus::RequestCancelled => Err(GatewayError::RequestCancelled),
        ResponseStatus::Timeout => Ok(text_response(
            StatusCode::BAD_GATEWAY,
            "Remote host timed out",
        )),
        ResponseStatus::HostUnreachable => Ok(text_response(
            StatusCode::BAD_GATEWAY,
            "Remote host unreachable",
        )),
        ResponseStatus::Ok => {
            let status = StatusCode::from_u16(response.code).unwrap_or(StatusCode::BAD_GATEWAY);

            let mut builder = Response::builder().status(status);
            if let Some(headers) = builder.headers_mut() {
                // Framing headers were already stripped when the body was
                // buffered; what remains is safe to copy through.
                headers.extend(response.headers.clone());
            }

            builder
                .body(Full::new(response.body))
                .map_err(|e| GatewayError::Http(e.to_string()))
        }
        ResponseStatus::ProxyUnreachable | ResponseStatus::UnknownError => Ok(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Proxy error",
        )),
    }
}

/// Read the scheduling priority from the client's `x-priority` header.
fn take_priority<B>(req: &Request<B>) -> i64 {
    req.headers()
        .get(PRIORITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        "content-type",
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}
