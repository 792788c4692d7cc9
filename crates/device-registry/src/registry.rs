use crate::{parse_address, CacheFile, DeviceRecord, RegistryError, Result};
use std::collections::{BTreeMap, HashMap};
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};

/// Records older than this are stale: kept, but never used for name resolution.
pub const DEFAULT_FRESHNESS: Duration = Duration::hours(24);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingSerial,
    /// The name belongs to another live record.
    NameHeld { name: String, serial: String },
}

#[derive(Debug, Clone)]
pub struct Rejected {
    pub record: DeviceRecord,
    pub reason: RejectReason,
}

/// Outcome of one [`DeviceRegistry::record`] call.
#[derive(Debug, Clone, Default)]
pub struct RecordSummary {
    pub inserted: usize,
    pub updated: usize,
    pub rejected: Vec<Rejected>,
    /// Set when the merge applied in memory but the cache file could not be written.
    pub cache_error: Option<String>,
}

/// Discovered devices keyed by serial, with name and address indexes.
///
/// Invariant: no two live records share a name. Entries that would break it are rejected
/// by [`record`](Self::record).
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceRecord>,
    by_name: HashMap<String, Vec<String>>,
    by_address: HashMap<String, Vec<String>>,
    freshness: Duration,
    cache: Option<CacheFile>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),
            by_name: HashMap::new(),
            by_address: HashMap::new(),
            freshness: DEFAULT_FRESHNESS,
            cache: None,
        }
    }
}

impl DeviceRegistry {
    /// An in-memory registry with no backing file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `cache` and write back to it after every mutation.
    pub fn open(cache: CacheFile) -> Self {
        let mut reg = Self::default();
        for rec in cache.load() {
            if rec.serial.is_empty() {
                warn!(address = %rec.address, "cache entry without serial ignored");
                continue;
            }
            reg.devices.insert(rec.serial.clone(), rec);
        }
        reg.reindex();
        info!(path = %cache.path().display(), n = reg.devices.len(), "device cache loaded");
        reg.cache = Some(cache);
        reg
    }

    pub fn with_freshness(mut self, window: Duration) -> Self {
        self.freshness = window;
        self
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    pub fn cache(&self) -> Option<&CacheFile> {
        self.cache.as_ref()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All records, ordered by serial.
    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceRecord> {
        self.devices.get(serial)
    }

    pub fn is_stale(&self, record: &DeviceRecord, now: OffsetDateTime) -> bool {
        now - record.last_seen > self.freshness
    }

    pub fn stale_records(&self, now: OffsetDateTime) -> Vec<&DeviceRecord> {
        self.devices
            .values()
            .filter(|r| self.is_stale(r, now))
            .collect()
    }

    /// Every record, live or stale, last seen at `address`.
    pub fn find_by_address(&self, address: &str) -> Vec<&DeviceRecord> {
        self.by_address
            .get(address)
            .map(|serials| serials.iter().filter_map(|s| self.devices.get(s)).collect())
            .unwrap_or_default()
    }

    /// Upsert `entries` by serial, then write the cache file.
    ///
    /// Records missing from `entries` are kept: a device that did not answer one scan is
    /// not gone. A failed cache write does not undo the merge; it is logged and reported
    /// in [`RecordSummary::cache_error`].
    pub fn record<I>(&mut self, entries: I) -> Result<RecordSummary>
    where
        I: IntoIterator<Item = DeviceRecord>,
    {
        let mut summary = self.merge(entries);
        if let Err(e) = self.persist() {
            error!(error = %e, "device cache not written; registry kept in memory");
            summary.cache_error = Some(e.to_string());
        }
        Ok(summary)
    }

    fn merge<I>(&mut self, entries: I) -> RecordSummary
    where
        I: IntoIterator<Item = DeviceRecord>,
    {
        let mut summary = RecordSummary::default();
        for mut entry in entries {
            if entry.serial.is_empty() {
                warn!(address = %entry.address, "discovery entry without serial rejected");
                summary.rejected.push(Rejected {
                    record: entry,
                    reason: RejectReason::MissingSerial,
                });
                continue;
            }

            let existing = self.devices.get(&entry.serial);
            if entry.name.is_none() {
                entry.name = existing.and_then(|r| r.name.clone());
            }
            if let Some(name) = entry.name.as_deref() {
                if let Some(holder) = self.live_holder(name, &entry.serial, entry.last_seen) {
                    warn!(
                        device = name,
                        serial = %entry.serial,
                        holder = %holder,
                        "name already held by a live device; entry rejected"
                    );
                    let reason = RejectReason::NameHeld {
                        name: name.to_string(),
                        serial: holder,
                    };
                    summary.rejected.push(Rejected {
                        record: entry,
                        reason,
                    });
                    continue;
                }
            }

            match self.devices.get_mut(&entry.serial) {
                Some(rec) => {
                    rec.name = entry.name;
                    rec.address = entry.address;
                    rec.port = entry.port;
                    rec.last_seen = rec.last_seen.max(entry.last_seen);
                    summary.updated += 1;
                }
                None => {
                    debug!(serial = %entry.serial, address = %entry.address, "new device");
                    self.devices.insert(entry.serial.clone(), entry);
                    summary.inserted += 1;
                }
            }
            self.reindex();
        }
        summary
    }

    /// Serial of a live record other than `serial` that is named `name`.
    fn live_holder(&self, name: &str, serial: &str, now: OffsetDateTime) -> Option<String> {
        self.by_name
            .get(name)?
            .iter()
            .filter(|s| s.as_str() != serial)
            .filter_map(|s| self.devices.get(s))
            .find(|r| !self.is_stale(r, now))
            .map(|r| r.serial.clone())
    }

    /// Resolve a name, serial or literal address against the current time.
    pub fn resolve(&self, target: &str) -> Result<DeviceRecord> {
        self.resolve_at(target, OffsetDateTime::now_utc())
    }

    pub fn resolve_at(&self, target: &str, now: OffsetDateTime) -> Result<DeviceRecord> {
        if let Some(addr) = parse_address(target) {
            debug!(%addr, "target is an address");
            return Ok(DeviceRecord::synthetic(addr, now));
        }
        let key = target.trim();
        let candidates: Vec<&DeviceRecord> = match self.by_name.get(key) {
            Some(serials) => serials.iter().filter_map(|s| self.devices.get(s)).collect(),
            None => self.devices.get(key).into_iter().collect(),
        };
        let (live, stale): (Vec<&DeviceRecord>, Vec<&DeviceRecord>) = candidates
            .into_iter()
            .partition(|r| !self.is_stale(r, now));

        match live.as_slice() {
            [one] => Ok((*one).clone()),
            [] => {
                if !stale.is_empty() {
                    warn!(device = key, "only stale records match; re-run discovery");
                }
                Err(RegistryError::NotFound {
                    target: key.to_string(),
                    stale_match: !stale.is_empty(),
                })
            }
            many => Err(RegistryError::Ambiguous {
                name: key.to_string(),
                serials: many.iter().map(|r| r.serial.clone()).collect(),
            }),
        }
    }

    /// Drop every stale record. Only explicit re-discovery calls this.
    pub fn evict_stale(&mut self, now: OffsetDateTime) -> Result<Vec<DeviceRecord>> {
        let stale: Vec<String> = self
            .stale_records(now)
            .into_iter()
            .map(|r| r.serial.clone())
            .collect();
        let removed: Vec<DeviceRecord> = stale
            .iter()
            .filter_map(|s| self.devices.remove(s))
            .collect();
        if !removed.is_empty() {
            self.reindex();
            self.persist()?;
            info!(n = removed.len(), "evicted stale devices");
        }
        Ok(removed)
    }

    /// Write the cache file, if any.
    pub fn save(&self) -> Result<()> {
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.save(self.devices.values()),
            None => Ok(()),
        }
    }

    fn reindex(&mut self) {
        self.by_name.clear();
        self.by_address.clear();
        for (serial, rec) in &self.devices {
            if let Some(name) = &rec.name {
                self.by_name
                    .entry(name.clone())
                    .or_default()
                    .push(serial.clone());
            }
            self.by_address
                .entry(rec.address.clone())
                .or_default()
                .push(serial.clone());
        }
    }
}
