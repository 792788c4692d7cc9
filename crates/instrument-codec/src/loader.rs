use crate::{resolve, ConfigError, EmfiSeqConfig, EmfiSeqLayer, Result};
use serde_yaml::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read one YAML configuration layer. An empty document is an empty layer.
pub fn load_layer_file(path: impl AsRef<Path>) -> Result<EmfiSeqLayer> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ConfigError::NotFound {
            path: path.to_path_buf(),
        },
        _ => ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        },
    })?;
    let parse_error = |e: serde_yaml::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let val: Value = serde_yaml::from_str(&raw).map_err(parse_error)?;
    if val.is_null() {
        debug!(path = %path.display(), "empty configuration file");
        return Ok(EmfiSeqLayer::default());
    }
    let layer: EmfiSeqLayer = serde_yaml::from_value(val).map_err(parse_error)?;
    debug!(path = %path.display(), "configuration layer loaded");
    Ok(layer)
}

/// Relative configuration paths are looked up under `data_dir` when given.
pub fn locate(path: impl AsRef<Path>, data_dir: Option<&Path>) -> PathBuf {
    let path = path.as_ref();
    match data_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

/// Built-in defaults, then the file at `path` (if any), then `overrides`.
pub fn resolve_with_file(path: Option<&Path>, overrides: &EmfiSeqLayer) -> Result<EmfiSeqConfig> {
    let file = path.map(|p| load_layer_file(p)).transpose()?;
    resolve(&EmfiSeqLayer::defaults(), file.as_ref(), overrides)
}
