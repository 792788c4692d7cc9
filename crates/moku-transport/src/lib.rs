//! moku-transport: seams towards the vendor device API
//!
//! This crate provides the blocking traits the rest of the workspace uses to reach a Moku
//! device: a discovery scan, an ownership claim, and register reads/writes on a claimed
//! device. The default build enables a `mock` backend so that binaries and tests run on
//! any host without instruments attached.

mod types;
pub use types::{
    Advertisement, ClaimRequest, DeviceInfo, Endpoint, RegisterBank, CONTROL_REGISTERS,
    DEFAULT_HTTP_PORT, MOKU_SERVICE, OUTPUT_REGISTERS,
};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::{Connector, DeviceScanner, RegisterLink};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockDevice, MockLink, MockMoku};
