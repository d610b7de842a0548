//! Remote proxy list fetching and parsing.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// One SOCKS5 endpoint parsed from the remote list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxyEndpoint {
    /// Render the endpoint in the list's line format, including the CRLF
    /// terminator, so parse(to_line(e)) == [e].
    pub fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}\r\n",
            self.host, self.port, self.username, self.password
        )
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Four dotted octets, a 1-5 digit port, a non-greedy username and a
/// password running to the CRLF line terminator.
fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5}):(.+?):(.+)\r\n")
            .expect("proxy list pattern is valid")
    })
}

/// Parse the text blob of a proxy list. Lines that do not match the grammar
/// are ignored; a matching line with an out-of-range port fails the whole
/// parse.
pub fn parse_proxy_list(body: &str) -> Result<Vec<ProxyEndpoint>> {
    let mut endpoints = Vec::new();

    for captures in line_pattern().captures_iter(body) {
        let port: u16 = captures[2].parse().map_err(|_| {
            GatewayError::ProxyListParse(format!("port out of range in line for {}", &captures[1]))
        })?;

        endpoints.push(ProxyEndpoint {
            host: captures[1].to_string(),
            port,
            username: captures[3].to_string(),
            password: captures[4].to_string(),
        });
    }

    Ok(endpoints)
}

/// Fetch and parse the remote proxy list. Failure here is fatal for the
/// process: without a list there is no fleet to build.
pub async fn fetch_proxy_list(url: &str) -> Result<Vec<ProxyEndpoint>> {
    let body = reqwest::get(url)
        .await
        .map_err(|e| GatewayError::ProxyListFetch(e.to_string()))?
        .text()
        .await
        .map_err(|e| GatewayError::ProxyListFetch(e.to_string()))?;

    let endpoints = parse_proxy_list(&body)?;
    debug!("Parsed {} proxy endpoints from {}", endpoints.len(), url);

    Ok(endpoints)
}
