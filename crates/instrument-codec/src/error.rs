use std::path::PathBuf;
use thiserror::Error;

/// Failures while building a canonical configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .path.display())]
    NotFound { path: PathBuf },
    #[error("cannot read {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
    #[error("cannot parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("{field} = {value} is outside the valid range [{min}, {max}]")]
    Range {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("no configuration layer sets {0}")]
    Missing(String),
    #[error("unknown configuration field: {0}")]
    UnknownField(String),
    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: String, value: String },
}

/// Failures while packing or unpacking register words.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A value escaped configuration validation.
    #[error("{field} = {value} does not fit the register field [{min}, {max}]")]
    EncodeRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field}: value kind does not match the field transform")]
    FieldKind { field: &'static str },
    #[error("expected {expected} register words, got {got}")]
    WordCount { expected: usize, got: usize },
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;
