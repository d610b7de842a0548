/// Capability snapshot for a target hostname.
///
/// Collected by a direct probe (never through the proxy fleet) and cached
/// with a TTL that depends on whether the host looked reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub host: String,
    pub supports_http: bool,
    pub supports_https: bool,
    pub supports_h2: bool,
    pub supports_ipv4: bool,
    pub supports_ipv6: bool,
}

impl HostInfo {
    /// A fresh snapshot with every capability unset.
    pub fn unreachable(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            supports_http: false,
            supports_https: false,
            supports_h2: false,
            supports_ipv4: false,
            supports_ipv6: false,
        }
    }

    /// A host is online when it resolves to at least one address family and
    /// speaks at least one HTTP flavor.
    pub fn is_online(&self) -> bool {
        (self.supports_ipv4 || self.supports_ipv6)
            && (self.supports_http || self.supports_https || self.supports_h2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_host_is_offline() {
        let info = HostInfo::unreachable("example.com");
        assert_eq!(info.host, "example.com");
        assert!(!info.is_online());
    }

    #[test]
    fn test_online_requires_address_family_and_protocol() {
        let mut info = HostInfo::unreachable("example.com");

        // Protocol without an address family is not online.
        info.supports_https = true;
        assert!(!info.is_online());

        // Address family without a protocol is not online.
        info.supports_https = false;
        info.supports_ipv4 = true;
        assert!(!info.is_online());

        // Any protocol combined with any address family is.
        info.supports_h2 = true;
        assert!(info.is_online());

        info.supports_ipv4 = false;
        info.supports_ipv6 = true;
        assert!(info.is_online());

        info.supports_h2 = false;
        info.supports_http = true;
        assert!(info.is_online());
    }
}
