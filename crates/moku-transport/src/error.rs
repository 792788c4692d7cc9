use crate::RegisterBank;
use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device not reachable: {0}")]
    NotFound(String),
    #[error("device busy: owned by {owner}")]
    Busy { owner: String },
    #[error("timeout")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
    #[error("invalid register: {bank}{index}")]
    InvalidRegister { bank: RegisterBank, index: u8 },
}
