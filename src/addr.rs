//! Locator to dialable address normalization.

use std::fmt;

use url::{Host, Url};

/// Port used when the locator does not carry one.
pub const DEFAULT_PORT: u16 = 443;

/// A host and port ready to be dialed.
///
/// The host is stored without IPv6 brackets; [`fmt::Display`] adds them back,
/// so a rendered address never ends up wrapped twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    /// Parse a locator such as `https://example.test:4433/tunnel`.
    ///
    /// A bare `host[:port]` is accepted too, which is what makes normalizing
    /// an already normalized address a no-op.
    pub fn parse(locator: &str) -> crate::Result<Self> {
        Self::from_url(&parse_locator(locator)?)
    }

    // `url` must come from `parse_locator`.
    pub(crate) fn from_url(url: &Url) -> crate::Result<Self> {
        let host = match url.host() {
            Some(Host::Domain(domain)) => to_ascii(domain),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(crate::Error::InvalidAddress(format!("no host in {url}"))),
        };
        if host.is_empty() {
            return Err(crate::Error::InvalidAddress(format!("empty host in {url}")));
        }
        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Turn a locator into `host:port`.
pub fn normalize(locator: &str) -> crate::Result<String> {
    TargetAddr::parse(locator).map(|target| target.to_string())
}

/// Parse a locator under a scheme with opaque hosts and no default port.
///
/// Special schemes would drop an explicit `:80` or `:443` and fail the whole
/// parse on an IDNA error; here the written port survives and the host is
/// left for [`to_ascii`].
pub(crate) fn parse_locator(locator: &str) -> crate::Result<Url> {
    let rest = match locator.split_once("://") {
        Some((_, rest)) => rest,
        None => locator,
    };
    Url::parse(&format!("{OPAQUE_SCHEME}://{rest}"))
        .map_err(|e| crate::Error::InvalidAddress(format!("{locator}: {e}")))
}

const OPAQUE_SCHEME: &str = "h3";

// Best effort: a host that fails IDNA processing is kept as is.
fn to_ascii(domain: &str) -> String {
    match Host::parse(domain) {
        Ok(Host::Domain(ascii)) => ascii,
        Ok(Host::Ipv4(ip)) => ip.to_string(),
        Ok(Host::Ipv6(ip)) => ip.to_string(),
        Err(e) => {
            tracing::debug!("keeping host {domain} as is: {e}");
            domain.to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn scheme_default_port_is_kept_when_written() {
        assert_eq!(normalize("http://example.test:80/").unwrap(), "example.test:80");
        assert_eq!(normalize("ws://example.test:80/").unwrap(), "example.test:80");
        assert_eq!(normalize("https://example.test:443/").unwrap(), "example.test:443");
        assert_eq!(normalize("http://example.test/").unwrap(), "example.test:443");
    }

    #[test]
    fn idna_failure_keeps_host() {
        assert_eq!(normalize("https://xn--a.example/").unwrap(), "xn--a.example:443");
        assert_eq!(normalize("http://xn--a.example:80").unwrap(), "xn--a.example:80");
    }

    #[test]
    fn default_port_is_injected() {
        assert_eq!(normalize("https://example.test/tunnel").unwrap(), "example.test:443");
        assert_eq!(normalize("h3://example.test").unwrap(), "example.test:443");
    }

    #[test]
    fn explicit_port_is_kept() {
        assert_eq!(
            normalize("https://example.test:4433/tunnel").unwrap(),
            "example.test:4433"
        );
        assert_eq!(normalize("https://127.0.0.1:8443").unwrap(), "127.0.0.1:8443");
    }

    #[test]
    fn ipv6_literal_is_bracketed_once() {
        assert_eq!(normalize("https://[::1]:8443/x").unwrap(), "[::1]:8443");
        assert_eq!(normalize("https://[::1]/x").unwrap(), "[::1]:443");
        assert_eq!(normalize("[::1]:8443").unwrap(), "[::1]:8443");

        let target = TargetAddr::parse("https://[2001:db8::1]:9000").unwrap();
        assert!(target.is_ipv6());
        assert_eq!(target.host(), "2001:db8::1");
    }

    #[test]
    fn unicode_host_becomes_punycode() {
        assert_eq!(
            normalize("https://bücher.example/").unwrap(),
            "xn--bcher-kva.example:443"
        );
    }

    #[test]
    fn malformed_locators_are_rejected() {
        for locator in ["https://", "https://exa mple.test/", "https://host:99999/", "mailto:x"] {
            match normalize(locator) {
                Err(crate::Error::InvalidAddress(_)) => {}
                other => panic!("{locator}: unexpected {other:?}"),
            }
        }
    }

    proptest! {
        #[test]
        fn explicit_port_survives(
            scheme in "https|http|ws|wss|h3",
            host in "[a-z]{1,12}\\.test",
            port in 1u16..=u16::MAX,
        ) {
            let normalized = normalize(&format!("{scheme}://{host}:{port}/tunnel")).unwrap();
            let target = TargetAddr::parse(&normalized).unwrap();
            prop_assert_eq!(target.host(), host.as_str());
            prop_assert_eq!(target.port(), port);
        }

        #[test]
        fn missing_port_gets_default(
            scheme in "https|http|ws",
            host in "[a-z]{1,12}\\.test",
            path in "/[a-z]{0,8}",
        ) {
            let normalized = normalize(&format!("{scheme}://{host}{path}")).unwrap();
            prop_assert_eq!(normalized, format!("{host}:{DEFAULT_PORT}"));
        }

        #[test]
        fn normalization_is_idempotent(
            host in "[a-z]{1,12}\\.test|[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}|\\[::[0-9a-f]{1,4}\\]",
            port in proptest::option::of(1u16..=u16::MAX),
        ) {
            let locator = match port {
                Some(port) => format!("https://{host}:{port}/"),
                None => format!("https://{host}/"),
            };
            if let Ok(once) = normalize(&locator) {
                prop_assert_eq!(normalize(&once).unwrap(), once);
            }
        }
    }
}
