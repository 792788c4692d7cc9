use moku_transport::TransportError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = RegistryError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// `stale_match` is set when a record exists but fell out of the freshness window.
    #[error("no live device matches '{target}'{}", stale_hint(.stale_match))]
    NotFound { target: String, stale_match: bool },
    /// Two live records share a name. Record-time checks prevent this, so it points at a
    /// hand-edited or corrupted cache.
    #[error("name '{name}' is held by several live devices: {serials:?}")]
    Ambiguous { name: String, serials: Vec<String> },
    #[error("cache I/O error at {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
    #[error("cache encoding error: {0}")]
    Format(String),
    #[error("discovery scan failed: {0}")]
    Scan(#[from] TransportError),
}

fn stale_hint(stale_match: &bool) -> &'static str {
    if *stale_match {
        "; only a stale record matches, run `moku discover` to refresh the cache"
    } else {
        ""
    }
}
