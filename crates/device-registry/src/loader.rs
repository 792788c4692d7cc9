use crate::{DeviceRecord, RegistryError, Result};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The on-disk device cache: a JSON array of [`DeviceRecord`]s.
#[derive(Debug, Clone)]
pub struct CacheFile {
    path: PathBuf,
}

impl CacheFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<user cache dir>/moku/devices.json`
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("moku")
            .join("devices.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every parsable record. A missing, unreadable or corrupt file yields an empty
    /// list; individual records that fail to decode are skipped.
    pub fn load(&self) -> Vec<DeviceRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no device cache yet");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "device cache unreadable; starting empty");
                return Vec::new();
            }
        };
        let entries = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => entries,
            Ok(_) => {
                warn!(path = %self.path.display(), "device cache is not a list; starting empty");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "device cache corrupt; starting empty");
                return Vec::new();
            }
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<DeviceRecord>(entry) {
                Ok(rec) => out.push(rec),
                Err(e) => warn!(path = %self.path.display(), error = %e, "skipping cache entry"),
            }
        }
        out
    }

    /// Write `records` atomically (temp file + rename), creating parent directories.
    pub fn save<'a>(&self, records: impl IntoIterator<Item = &'a DeviceRecord>) -> Result<()> {
        let records: Vec<&DeviceRecord> = records.into_iter().collect();
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| RegistryError::Format(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), n = records.len(), "device cache written");
        Ok(())
    }

    fn io_error(&self, e: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheFile::new(dir.path().join("devices.json"));
        assert!(cache.load().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, "{ this is not json").unwrap();
        assert!(CacheFile::new(&path).load().is_empty());
    }

    #[test]
    fn test_unknown_fields_and_bad_entries_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(
            &path,
            r#"[
                {"name": "Lilo", "address": "10.0.44.219", "port": 80, "serial": "007998",
                 "last_seen": "2026-10-19T08:00:00Z", "hw_rev": "mokugo-2"},
                {"name": "broken"}
            ]"#,
        )
        .unwrap();
        let records = CacheFile::new(&path).load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].serial, "007998");
        assert_eq!(records[0].last_seen, datetime!(2026-10-19 08:00:00 UTC));
    }

    #[test]
    fn test_save_creates_parent_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheFile::new(dir.path().join("nested").join("devices.json"));
        let rec = DeviceRecord::new(
            Some("Lilo"),
            "10.0.44.219",
            80,
            "007998",
            datetime!(2026-10-19 08:00:00 UTC),
        );
        cache.save([&rec]).unwrap();
        assert_eq!(cache.load(), vec![rec]);
    }
}
