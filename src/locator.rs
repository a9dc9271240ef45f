//! Service locator parsing.
//!
//! A service locator names a transport endpoint as
//! `protocol:key=value,key=value`, e.g. `tcp:host=127.0.0.1,port=11111`.
//! Several alternatives may be joined with `;`; they are tried in order.
//! This transport answers to the protocol tokens `tcp` and `kernelTcp`
//! and understands the options `host` and `port`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TransportError};

/// Protocol tokens served by the kernel TCP transport.
pub const TCP_PROTOCOLS: &[&str] = &["tcp", "kernelTcp"];

/// A parsed service locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLocator {
    protocol: String,
    options: Vec<(String, String)>,
}

impl ServiceLocator {
    /// Parse a single locator of the form `protocol:key=value,...`.
    ///
    /// The option list may be empty (`"tcp"` alone is valid); duplicate
    /// keys keep their first occurrence.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransportError::BadLocator("empty locator".into()));
        }

        let (protocol, rest) = match input.split_once(':') {
            Some((p, r)) => (p, Some(r)),
            None => (input, None),
        };
        if protocol.is_empty() {
            return Err(TransportError::BadLocator(format!(
                "missing protocol in {input:?}"
            )));
        }

        let mut options = Vec::new();
        if let Some(rest) = rest {
            for pair in rest.split(',').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    TransportError::BadLocator(format!("malformed option {pair:?} in {input:?}"))
                })?;
                if key.is_empty() {
                    return Err(TransportError::BadLocator(format!(
                        "empty option key in {input:?}"
                    )));
                }
                if !options.iter().any(|(k, _)| k == key) {
                    options.push((key.to_string(), value.to_string()));
                }
            }
        }

        Ok(Self {
            protocol: protocol.to_string(),
            options,
        })
    }

    /// Parse a `;`-separated list of locator alternatives.
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        let locators = input
            .split(';')
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>>>()?;
        if locators.is_empty() {
            return Err(TransportError::BadLocator("empty locator list".into()));
        }
        Ok(locators)
    }

    /// The protocol token.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Whether this locator names the kernel TCP transport.
    pub fn is_tcp(&self) -> bool {
        TCP_PROTOCOLS.iter().any(|p| *p == self.protocol)
    }

    /// Look up an option value by key.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `host` option. Required for both listening and connecting.
    pub fn host(&self) -> Result<&str> {
        self.option("host")
            .ok_or_else(|| TransportError::BadLocator(format!("{self}: host option missing")))
    }

    /// The `port` option, parsed as a `u16`. `0` asks the kernel for a
    /// dynamic port when listening.
    pub fn port(&self) -> Result<u16> {
        let raw = self
            .option("port")
            .ok_or_else(|| TransportError::BadLocator(format!("{self}: port option missing")))?;
        raw.parse().map_err(|_| {
            TransportError::BadLocator(format!("{self}: port option {raw:?} is not a u16"))
        })
    }
}

impl fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.protocol)?;
        for (i, (key, value)) in self.options.iter().enumerate() {
            let sep = if i == 0 { ':' } else { ',' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for ServiceLocator {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let locator = ServiceLocator::parse("tcp:host=127.0.0.1,port=11111").unwrap();
        assert_eq!(locator.protocol(), "tcp");
        assert!(locator.is_tcp());
        assert_eq!(locator.host().unwrap(), "127.0.0.1");
        assert_eq!(locator.port().unwrap(), 11111);
    }

    #[test]
    fn test_kernel_tcp_token() {
        let locator = ServiceLocator::parse("kernelTcp:host=node4,port=8080").unwrap();
        assert!(locator.is_tcp());
        assert_eq!(locator.host().unwrap(), "node4");
    }

    #[test]
    fn test_bare_protocol() {
        let locator = ServiceLocator::parse("tcp").unwrap();
        assert_eq!(locator.protocol(), "tcp");
        assert!(locator.host().is_err());
        assert!(locator.port().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let text = "tcp:host=10.0.0.1,port=80";
        let locator: ServiceLocator = text.parse().unwrap();
        assert_eq!(locator.to_string(), text);
    }

    #[test]
    fn test_parse_list_in_order() {
        let locators =
            ServiceLocator::parse_list("infrc:host=a,port=1;tcp:host=b,port=2").unwrap();
        assert_eq!(locators.len(), 2);
        assert_eq!(locators[0].protocol(), "infrc");
        assert!(locators[1].is_tcp());
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        assert!(ServiceLocator::parse("").is_err());
        assert!(ServiceLocator::parse(":host=x").is_err());
        assert!(ServiceLocator::parse("tcp:hostx").is_err());
        assert!(ServiceLocator::parse("tcp:=v").is_err());
        assert!(ServiceLocator::parse_list(" ; ").is_err());
    }

    #[test]
    fn test_bad_port_rejected() {
        let locator = ServiceLocator::parse("tcp:host=a,port=70000").unwrap();
        assert!(matches!(locator.port(), Err(TransportError::BadLocator(_))));
    }

    #[test]
    fn test_duplicate_keys_keep_first() {
        let locator = ServiceLocator::parse("tcp:host=a,host=b,port=1").unwrap();
        assert_eq!(locator.host().unwrap(), "a");
    }
}
