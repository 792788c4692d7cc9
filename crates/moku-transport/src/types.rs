use core::fmt;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

/// mDNS service type Moku devices advertise.
pub const MOKU_SERVICE: &str = "_moku._tcp.local.";

/// Port of the device HTTP API when an advertisement or target omits one.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Control registers addressable on a custom instrument slot.
pub const CONTROL_REGISTERS: u8 = 16;

/// Output (monitor) registers addressable on a custom instrument slot.
pub const OUTPUT_REGISTERS: u8 = 4;

/// Host and port of one device.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A raw discovery answer, before it becomes a registry record.
#[derive(Clone, Debug, Default)]
pub struct Advertisement {
    /// Full instance name, e.g. `Lilo._moku._tcp.local.`
    pub instance: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// TXT properties.
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RegisterBank {
    Control,
    Output,
}

impl fmt::Display for RegisterBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterBank::Control => f.write_str("Control"),
            RegisterBank::Output => f.write_str("Output"),
        }
    }
}

/// Flags passed through to the device when claiming it.
#[derive(Clone, Debug)]
pub struct ClaimRequest {
    /// Take the device over from another client.
    pub takeover: bool,
    /// Connect even when another client holds the device.
    pub ignore_busy: bool,
    pub persist_state: bool,
    pub timeout: Duration,
    /// Identifies this client in the device's ownership marking.
    pub client: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceInfo {
    pub serial: String,
    pub name: Option<String>,
    pub firmware: Option<String>,
}
