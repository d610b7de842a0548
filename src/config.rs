use std::env;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote colon-delimited SOCKS5 proxy list (required)
    pub proxy_list_url: String,
    /// First-attempt deadline
    pub request_timeout: Duration,
    /// Deadline for every attempt after the first
    pub retry_timeout: Duration,
    /// Deadline for the proxy bring-up identity probe
    pub initial_ip_info_timeout: Duration,
    /// Maximum automatic retries per request
    pub retries: u32,
    /// Deadline for each host capability probe step
    pub host_info_request_timeout: Duration,
    /// Per-(proxy, host) admission rate
    pub throttle_requests_per_min: u32,
    /// Per-(proxy, host) burst
    pub throttle_requests_burst: u32,
    /// Cool-down after a proxy is marked unreachable
    pub unreachable_client_retry: Duration,
    /// Enable the read-only dashboard
    pub enable_web: bool,
    /// Bind address for all listeners
    pub bind_host: String,
    /// Forward-proxy listener port
    pub http_proxy_port: u16,
    /// RPC listener port
    pub rpc_port: u16,
    /// Dashboard listener port
    pub web_port: u16,
    /// IP-echo endpoint used to derive proxy identities
    pub ip_echo_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy_list_url: env::var("PROXY_LIST_URL")
                .map_err(|_| GatewayError::MissingEnvVar("PROXY_LIST_URL".into()))?,
            request_timeout: get_duration_or("REQUEST_TIMEOUT", "20s")?,
            retry_timeout: get_duration_or("RETRY_TIMEOUT", "5s")?,
            initial_ip_info_timeout: get_duration_or("INITIAL_IP_INFO_TIMEOUT", "10s")?,
            retries: get_env_or("RETRIES", "1").parse().map_err(|_| {
                GatewayError::InvalidConfig("RETRIES must be a non-negative integer".into())
            })?,
            host_info_request_timeout: get_duration_or("HOST_INFO_REQUEST_TIMEOUT", "5s")?,
            throttle_requests_per_min: get_env_or("THROTTLE_REQUESTS_PER_MIN", "30")
                .parse()
                .map_err(|_| {
                    GatewayError::InvalidConfig(
                        "THROTTLE_REQUESTS_PER_MIN must be a positive integer".into(),
                    )
                })?,
            throttle_requests_burst: get_env_or("THROTTLE_REQUESTS_BURST", "5")
                .parse()
                .map_err(|_| {
                    GatewayError::InvalidConfig(
                        "THROTTLE_REQUESTS_BURST must be a non-negative integer".into(),
                    )
                })?,
            unreachable_client_retry: get_duration_or("UNREACHABLE_CLIENT_RETRY", "60s")?,
            enable_web: get_env_or("ENABLE_WEB", "false").parse().unwrap_or(false),
            bind_host: get_env_or("BIND_HOST", "0.0.0.0"),
            http_proxy_port: get_port_or("HTTP_PROXY_PORT", "8080")?,
            rpc_port: get_port_or("RPC_PORT", "8082")?,
            web_port: get_port_or("WEB_PORT", "8081")?,
            ip_echo_url: get_env_or("IP_ECHO_URL", "https://ifconfig.io/ip"),
        })
    }

    /// Forward-proxy listener address
    pub fn http_proxy_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.http_proxy_port)
    }

    /// RPC listener address
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.rpc_port)
    }

    /// Dashboard listener address
    pub fn web_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.web_port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_duration_or(key: &str, default: &str) -> Result<Duration> {
    humantime::parse_duration(&get_env_or(key, default))
        .map_err(|e| GatewayError::InvalidConfig(format!("{} must be a duration: {}", key, e)))
}

fn get_port_or(key: &str, default: &str) -> Result<u16> {
    get_env_or(key, default)
        .parse()
        .map_err(|_| GatewayError::InvalidConfig(format!("{} must be a valid port number", key)))
}

#[cfg(test)]
impl Config {
    /// A configuration for tests that never reads the environment.
    pub fn for_tests() -> Self {
        Config {
            proxy_list_url: "http://proxies.test/list.txt".to_string(),
            request_timeout: Duration::from_secs(20),
            retry_timeout: Duration::from_secs(5),
            initial_ip_info_timeout: Duration::from_secs(10),
            retries: 1,
            host_info_request_timeout: Duration::from_secs(5),
            throttle_requests_per_min: 30,
            throttle_requests_burst: 5,
            unreachable_client_retry: Duration::from_secs(60),
            enable_web: false,
            bind_host: "127.0.0.1".to_string(),
            http_proxy_port: 8080,
            rpc_port: 8082,
            web_port: 8081,
            ip_echo_url: "https://ifconfig.io/ip".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "PROXY_LIST_URL",
        "REQUEST_TIMEOUT",
        "RETRY_TIMEOUT",
        "INITIAL_IP_INFO_TIMEOUT",
        "RETRIES",
        "HOST_INFO_REQUEST_TIMEOUT",
        "THROTTLE_REQUESTS_PER_MIN",
        "THROTTLE_REQUESTS_BURST",
        "UNREACHABLE_CLIENT_RETRY",
        "ENABLE_WEB",
        "BIND_HOST",
        "HTTP_PROXY_PORT",
        "RPC_PORT",
        "WEB_PORT",
        "IP_ECHO_URL",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_requires_proxy_list_url() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatewayError::MissingEnvVar(_)));
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_LIST_URL", "https://proxies.example/list.txt");
        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy_list_url, "https://proxies.example/list.txt");
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(config.retry_timeout, Duration::from_secs(5));
        assert_eq!(config.initial_ip_info_timeout, Duration::from_secs(10));
        assert_eq!(config.retries, 1);
        assert_eq!(config.host_info_request_timeout, Duration::from_secs(5));
        assert_eq!(config.throttle_requests_per_min, 30);
        assert_eq!(config.throttle_requests_burst, 5);
        assert_eq!(config.unreachable_client_retry, Duration::from_secs(60));
        assert!(!config.enable_web);
        assert_eq!(config.http_proxy_addr(), "0.0.0.0:8080");
        assert_eq!(config.rpc_addr(), "0.0.0.0:8082");
        assert_eq!(config.web_addr(), "0.0.0.0:8081");
        assert_eq!(config.ip_echo_url, "https://ifconfig.io/ip");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_LIST_URL", "https://proxies.example/list.txt");
        env::set_var("REQUEST_TIMEOUT", "45s");
        env::set_var("RETRY_TIMEOUT", "1500ms");
        env::set_var("RETRIES", "3");
        env::set_var("THROTTLE_REQUESTS_PER_MIN", "120");
        env::set_var("ENABLE_WEB", "true");
        env::set_var("BIND_HOST", "127.0.0.1");
        env::set_var("HTTP_PROXY_PORT", "9080");

        let config = Config::from_env().unwrap();

        assert_eq!(config.request_timeout, Duration::from_secs(45));
        assert_eq!(config.retry_timeout, Duration::from_millis(1500));
        assert_eq!(config.retries, 3);
        assert_eq!(config.throttle_requests_per_min, 120);
        assert!(config.enable_web);
        assert_eq!(config.http_proxy_addr(), "127.0.0.1:9080");
    }

    #[test]
    fn test_config_from_env_invalid_duration() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_LIST_URL", "https://proxies.example/list.txt");
        env::set_var("REQUEST_TIMEOUT", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_LIST_URL", "https://proxies.example/list.txt");
        env::set_var("RPC_PORT", "not-a-port");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }
}
