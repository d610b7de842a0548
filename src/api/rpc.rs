//! The RPC front-end: one unary operation, `SendRequest`.
//!
//! Served as JSON over HTTP on its own listener. The response is a sum of a
//! success payload (base64 body, status, headers) and a typed error.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use url::Url;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::models::{GatewayResponse, ResponseStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct SendRequestParams {
    pub url: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub retry_on_codes: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorType {
    InvalidUrl,
    ProxyError,
    RemoteHostTimedOut,
    RemoteHostUnreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendRequestReply {
    Success {
        /// Base64 of the buffered response body.
        body: String,
        status: u16,
        headers: BTreeMap<String, String>,
    },
    Error {
        error_type: RpcErrorType,
    },
}

impl SendRequestReply {
    fn error(error_type: RpcErrorType) -> Self {
        SendRequestReply::Error { error_type }
    }

    fn success(response: &GatewayResponse) -> Self {
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers.iter() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        SendRequestReply::Success {
            body: BASE64.encode(&response.body),
            status: response.code,
            headers,
        }
    }
}

#[derive(Clone)]
struct RpcState {
    gateway: Arc<Gateway>,
}

/// RPC server
pub struct RpcServer {
    config: Config,
    gateway: Arc<Gateway>,
}

impl RpcServer {
    pub fn new(config: Config, gateway: Arc<Gateway>) -> Self {
        Self { config, gateway }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let state = RpcState {
            gateway: self.gateway.clone(),
        };

        let app = Router::new()
            .route("/send-request", post(send_request))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(self.config.rpc_addr()).await?;
        info!("RPC server listening on {}", self.config.rpc_addr());

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        info!("RPC server shutting down");
        Ok(())
    }
}

/// The unary `SendRequest` operation.
async fn send_request(
    State(state): State<RpcState>,
    Json(params): Json<SendRequestParams>,
) -> Response {
    let Some(url) = parse_request_url(&params.url) else {
        return Json(SendRequestReply::error(RpcErrorType::InvalidUrl)).into_response();
    };

    let priority = params.priority.unwrap_or(0);
    let retry_on_codes = params.retry_on_codes.unwrap_or_default();

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let reply = match state
        .gateway
        .submit(url.clone(), priority, retry_on_codes, cancel)
        .await
    {
        Ok(reply) => reply,
        Err(GatewayError::HostUnreachable) => {
            return Json(SendRequestReply::error(RpcErrorType::RemoteHostUnreachable))
                .into_response();
        }
        Err(e) => {
            error!("ERROR {}: {}", url, e);
            return Json(SendRequestReply::error(RpcErrorType::ProxyError)).into_response();
        }
    };

    let response = match reply.await {
        Ok(response) => response,
        Err(_) => {
            return Json(SendRequestReply::error(RpcErrorType::ProxyError)).into_response();
        }
    };

    match response.status {
        // The cancelled path completes with no payload.
        ResponseStatus::RequestCancelled => StatusCode::NO_CONTENT.into_response(),
        ResponseStatus::Timeout => {
            Json(SendRequestReply::error(RpcErrorType::RemoteHostTimedOut)).into_response()
        }
        ResponseStatus::HostUnreachable => {
            Json(SendRequestReply::error(RpcErrorType::RemoteHostUnreachable)).into_response()
        }
        ResponseStatus::Ok => Json(SendRequestReply::success(&response)).into_response(),
        ResponseStatus::ProxyUnreachable | ResponseStatus::UnknownError => {
            Json(SendRequestReply::error(RpcErrorType::ProxyError)).into_response()
        }
    }
}

/// A submittable URL needs both a scheme and a host.
fn parse_request_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    if url.scheme().is_empty() || url.host_str().is_none() {
        return None;
    }
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::HeaderValue;
    use http::HeaderMap;

    #[test]
    fn test_parse_request_url_requires_scheme_and_host() {
        assert!(parse_request_url("https://example.com/page").is_some());
        assert!(parse_request_url("not a url").is_none());
        assert!(parse_request_url("/relative/path").is_none());
        assert!(parse_request_url("mailto:someone@example.com").is_none());
    }

    #[test]
    fn test_success_reply_encodes_body_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));

        let response = GatewayResponse::ok(200, Bytes::from_static(b"hello"), headers);
        let reply = SendRequestReply::success(&response);

        match reply {
            SendRequestReply::Success {
                body,
                status,
                headers,
            } => {
                assert_eq!(BASE64.decode(body).unwrap(), b"hello");
                assert_eq!(status, 200);
                assert_eq!(headers.get("content-type").unwrap(), "text/html");
            }
            SendRequestReply::Error { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn test_reply_serialization_is_a_tagged_sum() {
        let success = SendRequestReply::Success {
            body: "aGk=".to_string(),
            status: 200,
            headers: BTreeMap::new(),
        };
        let json = serde_json::to_value(&success).unwrap();
        assert!(json.get("success").is_some());

        let error = SendRequestReply::error(RpcErrorType::RemoteHostTimedOut);
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(
            json["error"]["error_type"],
            serde_json::json!("REMOTE_HOST_TIMED_OUT")
        );
    }

    #[test]
    fn test_params_accept_optional_fields() {
        let params: SendRequestParams =
            serde_json::from_str(r#"{"url": "https://example.com"}"#).unwrap();
        assert!(params.priority.is_none());
        assert!(params.retry_on_codes.is_none());

        let params: SendRequestParams = serde_json::from_str(
            r#"{"url": "https://example.com", "priority": 7, "retry_on_codes": [403, 503]}"#,
        )
        .unwrap();
        assert_eq!(params.priority, Some(7));
        assert_eq!(params.retry_on_codes, Some(vec![403, 503]));
    }
}
