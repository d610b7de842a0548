use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Submission errors
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Host is not reachable")]
    HostUnreachable,

    #[error("Request cancelled by client")]
    RequestCancelled,

    // Proxy fleet errors
    #[error("Failed to fetch proxy list: {0}")]
    ProxyListFetch(String),

    #[error("Failed to parse proxy list: {0}")]
    ProxyListParse(String),

    #[error("Proxy client setup failed: {0}")]
    ProxyClientSetup(String),

    // Front-end plumbing
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            GatewayError::InvalidUrl(_) | GatewayError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway
            GatewayError::HostUnreachable => StatusCode::BAD_GATEWAY,

            // 500 Internal Server Error
            GatewayError::MissingEnvVar(_)
            | GatewayError::RequestCancelled
            | GatewayError::ProxyListFetch(_)
            | GatewayError::ProxyListParse(_)
            | GatewayError::ProxyClientSetup(_)
            | GatewayError::Tls(_)
            | GatewayError::Http(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        GatewayError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::InvalidUrl(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            GatewayError::InvalidUrl("nope".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::InvalidConfig("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::HostUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::ProxyListFetch("down".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::Internal("boom".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(GatewayError::InvalidUrl("nope".to_string()).is_client_error());
        assert!(!GatewayError::InvalidUrl("nope".to_string()).is_server_error());

        assert!(GatewayError::HostUnreachable.is_server_error());
        assert!(!GatewayError::HostUnreachable.is_client_error());
    }
}
