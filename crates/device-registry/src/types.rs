use moku_transport::{Endpoint, DEFAULT_HTTP_PORT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use time::OffsetDateTime;

/// One device as last seen by discovery.
///
/// Unknown fields in the cache file are ignored so older and newer builds can share it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Stable identity. Empty only for synthetic records built from a literal address.
    #[serde(default)]
    pub serial: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

fn default_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl DeviceRecord {
    pub fn new(
        name: Option<&str>,
        address: impl Into<String>,
        port: u16,
        serial: impl Into<String>,
        last_seen: OffsetDateTime,
    ) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.into(),
            port,
            serial: serial.into(),
            last_seen,
        }
    }

    /// Record for a target given as a literal address; it carries no name and no serial.
    pub fn synthetic(addr: SocketAddr, seen: OffsetDateTime) -> Self {
        Self {
            name: None,
            address: addr.ip().to_string(),
            port: addr.port(),
            serial: String::new(),
            last_seen: seen,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.serial.is_empty()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone(), self.port)
    }

    /// Name when known, otherwise the endpoint.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.endpoint().to_string(),
        }
    }
}

/// Parse `target` as an IP address or `address:port`.
pub fn parse_address(target: &str) -> Option<SocketAddr> {
    let target = target.trim();
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, DEFAULT_HTTP_PORT));
    }
    target.parse::<SocketAddr>().ok()
}
