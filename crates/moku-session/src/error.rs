use device_registry::RegistryError;
use instrument_codec::CodecError;
use moku_transport::{RegisterBank, TransportError};
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = SessionError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("device {target} is busy (in use by {owner}); connect with force to take it over")]
    DeviceBusy { target: String, owner: String },
    #[error("connecting to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },
    #[error("reading {bank}{index} timed out after {timeout:?}")]
    ReadTimeout {
        bank: RegisterBank,
        index: u8,
        timeout: Duration,
    },
    #[error("a session to {device} is already open in this process")]
    AlreadyConnected { device: String },
    #[error("session is closed")]
    Closed,
    #[error("transport error on {target}: {source}")]
    Transport {
        target: String,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("session state lock poisoned")]
    LockPoisoned,
    #[error("invalid value '{value}' for {var}")]
    InvalidEnv { var: &'static str, value: String },
}
