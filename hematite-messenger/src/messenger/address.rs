//! Peer addresses
//!
//! Addresses are URIs of the shape `amqp[s]://host[:port][/path]`. The
//! scheme picks the default port; a missing scheme is tolerated by
//! retrying with `amqp://` prefixed. The node path is the URI path with
//! a single leading slash stripped.

use url::Url;

use crate::error::Error;

/// A parsed peer address
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Address {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) path: String,
}

impl Address {
    pub(crate) fn parse(input: &str) -> Result<Self, Error> {
        if let Ok(url) = Url::parse(input) {
            if let Some(address) = Self::from_url(&url) {
                return Ok(address);
            }
        }
        // Scheme-less addresses like "host:5672/path" parse wrong or not
        // at all; retry the way the amqp scheme would read them
        if !input.contains("://") {
            if let Ok(url) = Url::parse(&format!("amqp://{}", input)) {
                if let Some(address) = Self::from_url(&url) {
                    return Ok(address);
                }
            }
        }
        Err(Error::InvalidAddress(input.to_owned()))
    }

    fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str().filter(|host| !host.is_empty())?;
        let port = url.port().unwrap_or_else(|| default_port(url.scheme()));
        let path = url.path();
        let path = path.strip_prefix('/').unwrap_or(path);
        Some(Self {
            host: host.to_owned(),
            port,
            path: path.to_owned(),
        })
    }

    /// The connection lookup key for this peer
    pub(crate) fn service(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "amqps" => fe2o3_amqp_types::definitions::SECURE_PORT,
        _ => fe2o3_amqp_types::definitions::PORT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selects_default_port() {
        let amqp = Address::parse("amqp://example.com/q").unwrap();
        assert_eq!(amqp.port, 5672);
        let amqps = Address::parse("amqps://example.com").unwrap();
        assert_eq!(amqps.port, 5671);
    }

    #[test]
    fn explicit_port_and_path() {
        let address = Address::parse("amqp://0.0.0.0:7777/queue/a").unwrap();
        assert_eq!(address.host, "0.0.0.0");
        assert_eq!(address.port, 7777);
        assert_eq!(address.path, "queue/a");
        assert_eq!(address.service(), "0.0.0.0:7777");
    }

    #[test]
    fn empty_path_stays_empty() {
        let address = Address::parse("amqp://example.com").unwrap();
        assert_eq!(address.path, "");
    }

    #[test]
    fn scheme_less_addresses_are_retried() {
        let address = Address::parse("example.com:5555/q").unwrap();
        assert_eq!(address.host, "example.com");
        assert_eq!(address.port, 5555);
        assert_eq!(address.path, "q");
    }

    #[test]
    fn missing_host_is_invalid() {
        assert!(matches!(
            Address::parse("amqp:///q"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(Address::parse(""), Err(Error::InvalidAddress(_))));
    }
}
