//! Canonical addresses and time helpers shared across the crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Wall-clock seconds since the Unix epoch.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wall-clock milliseconds since the Unix epoch (UTC).
///
/// Used for envelope timestamps and keepalive RTT measurement.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Role a node advertises in its canonical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeClass {
    Node,
    Streamer,
    Remote,
    Ca,
}

impl NodeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeClass::Node => "ChaskiNode",
            NodeClass::Streamer => "ChaskiStreamer",
            NodeClass::Remote => "ChaskiRemote",
            NodeClass::Ca => "ChaskiCA",
        }
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeClass {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ChaskiNode" => Ok(NodeClass::Node),
            "ChaskiStreamer" => Ok(NodeClass::Streamer),
            "ChaskiRemote" => Ok(NodeClass::Remote),
            "ChaskiCA" => Ok(NodeClass::Ca),
            other => Err(AddressParseError::UnknownClass(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("unknown node class: {0}")]
    UnknownClass(String),
    #[error("missing '@' separator in address: {0}")]
    MissingClass(String),
    #[error("missing ':' port separator in address: {0}")]
    MissingPort(String),
    #[error("invalid port in address: {0}")]
    InvalidPort(String),
    #[error("empty host in address: {0}")]
    EmptyHost(String),
}

/// Canonical node address: `<class>@<host>:<port>`.
///
/// Equality is field equality, which coincides with string equality of the
/// canonical text form. The host is kept verbatim (hostname or IP literal).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub class: NodeClass,
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(class: NodeClass, host: impl Into<String>, port: u16) -> Self {
        Self {
            class,
            host: host.into(),
            port,
        }
    }

    /// `host:port` form for socket connects.
    pub fn socket(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.class, self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (class, rest) = s
            .split_once('@')
            .ok_or_else(|| AddressParseError::MissingClass(s.to_string()))?;
        let class: NodeClass = class.parse()?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| AddressParseError::InvalidPort(s.to_string()))?;
        Ok(Address::new(class, host, port))
    }
}

/// Parse a user-facing connect string. A leading `*` requests immediate
/// pairing on all overlapping topics, bypassing discovery.
pub fn parse_connect(s: &str) -> Result<(Address, bool), AddressParseError> {
    match s.strip_prefix('*') {
        Some(rest) => Ok((rest.parse()?, true)),
        None => Ok((s.parse()?, false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        for s in [
            "ChaskiNode@127.0.0.1:65430",
            "ChaskiStreamer@127.0.0.1:65432",
            "ChaskiRemote@example.com:8080",
            "ChaskiCA@10.0.0.1:65432",
        ] {
            let addr: Address = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
            let again: Address = addr.to_string().parse().unwrap();
            assert_eq!(addr, again);
        }
    }

    #[test]
    fn address_rejects_malformed() {
        assert!("ChaskiNode127.0.0.1:65430".parse::<Address>().is_err());
        assert!("ChaskiNode@127.0.0.1".parse::<Address>().is_err());
        assert!("ChaskiNode@:1234".parse::<Address>().is_err());
        assert!("ChaskiNode@127.0.0.1:notaport".parse::<Address>().is_err());
        assert!("Unknown@127.0.0.1:1".parse::<Address>().is_err());
    }

    #[test]
    fn paired_connect_marker() {
        let (addr, paired) = parse_connect("*ChaskiStreamer@127.0.0.1:65432").unwrap();
        assert!(paired);
        assert_eq!(addr.class, NodeClass::Streamer);

        let (_, paired) = parse_connect("ChaskiStreamer@127.0.0.1:65432").unwrap();
        assert!(!paired);
    }
}
