use crate::{Advertisement, ClaimRequest, DeviceInfo, Endpoint, RegisterBank, Result};
use std::time::Duration;

/// Network discovery primitive (mDNS browse or equivalent).
pub trait DeviceScanner {
    /// Collect the advertisements answering for `service` within `window`.
    fn scan(&self, service: &str, window: Duration) -> Result<Vec<Advertisement>>;
}

/// Opens ownership of a device.
pub trait Connector {
    type Link: RegisterLink;

    /// Claim the device at `endpoint`. Implementations report a foreign owner as
    /// [`TransportError::Busy`](crate::TransportError::Busy) unless the request asks for a
    /// takeover or to ignore the busy state.
    fn claim(&self, endpoint: &Endpoint, request: &ClaimRequest) -> Result<Self::Link>;
}

/// A claimed device. All calls block.
pub trait RegisterLink {
    /// Identity reported by the device when it was claimed.
    fn info(&self) -> &DeviceInfo;

    /// Write one control register.
    fn write_control(&mut self, index: u8, value: u32) -> Result<()>;

    /// Read one register, giving up after `timeout`.
    fn read_register(&mut self, bank: RegisterBank, index: u8, timeout: Duration) -> Result<u32>;

    /// Give up ownership. With `persist_state` the device keeps its registers and its
    /// in-use marking.
    fn relinquish(&mut self, persist_state: bool) -> Result<()>;
}
