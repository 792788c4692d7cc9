use crate::{DeviceRecord, DeviceRegistry, RecordSummary, Result};
use moku_transport::{Advertisement, DeviceScanner, DEFAULT_HTTP_PORT, MOKU_SERVICE};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

/// How long a scan listens for answers unless told otherwise.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    /// Devices that answered this scan.
    pub found: Vec<DeviceRecord>,
    pub summary: RecordSummary,
}

/// Turn one advertisement into a record. Needs a `serial` TXT property and at least one
/// address; IPv4 addresses win over IPv6.
pub fn record_from_advertisement(ad: &Advertisement, seen: OffsetDateTime) -> Option<DeviceRecord> {
    let serial = ad
        .properties
        .get("serial")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())?;
    let address = ad
        .addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| ad.addresses.first())?;
    let port = if ad.port == 0 {
        DEFAULT_HTTP_PORT
    } else {
        ad.port
    };
    Some(DeviceRecord {
        name: instance_name(&ad.instance),
        address: address.to_string(),
        port,
        serial: serial.to_string(),
        last_seen: seen,
    })
}

fn instance_name(instance: &str) -> Option<String> {
    let short = instance
        .strip_suffix(MOKU_SERVICE)
        .unwrap_or(instance)
        .trim_end_matches('.')
        .trim();
    if short.is_empty() {
        None
    } else {
        Some(short.to_string())
    }
}

/// Scan the network and merge every answer into `registry`.
pub fn discover<S>(scanner: &S, registry: &mut DeviceRegistry, window: Duration) -> Result<DiscoveryReport>
where
    S: DeviceScanner + ?Sized,
{
    let ads = scanner.scan(MOKU_SERVICE, window)?;
    let now = OffsetDateTime::now_utc();
    let mut found = Vec::with_capacity(ads.len());
    for ad in &ads {
        match record_from_advertisement(ad, now) {
            Some(rec) => found.push(rec),
            None => warn!(instance = %ad.instance, "advertisement without serial or address skipped"),
        }
    }
    let summary = registry.record(found.iter().cloned())?;
    info!(
        found = found.len(),
        inserted = summary.inserted,
        updated = summary.updated,
        rejected = summary.rejected.len(),
        "discovery merged"
    );
    Ok(DiscoveryReport { found, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use moku_transport::{MockDevice, MockMoku};
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use time::macros::datetime;

    #[test]
    fn test_ipv4_preferred_and_suffix_stripped() {
        let mut properties = BTreeMap::new();
        properties.insert("serial".to_string(), "007998".to_string());
        let ad = Advertisement {
            instance: "Lilo._moku._tcp.local.".to_string(),
            addresses: vec![
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::new(10, 0, 44, 219)),
            ],
            port: 0,
            properties,
        };
        let rec = record_from_advertisement(&ad, datetime!(2026-10-19 12:00 UTC)).unwrap();
        assert_eq!(rec.name.as_deref(), Some("Lilo"));
        assert_eq!(rec.address, "10.0.44.219");
        assert_eq!(rec.port, DEFAULT_HTTP_PORT);
    }

    #[test]
    fn test_advertisement_without_serial_is_skipped() {
        let ad = Advertisement {
            instance: "Nameless._moku._tcp.local.".to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port: 80,
            properties: BTreeMap::new(),
        };
        assert!(record_from_advertisement(&ad, OffsetDateTime::now_utc()).is_none());
    }

    #[test]
    fn test_discover_merges_mock_network() {
        let net = MockMoku::demo().with_device(
            MockDevice::new("008001", Some("Stitch"), IpAddr::V4(Ipv4Addr::new(10, 0, 44, 220)))
                .hidden(),
        );
        let mut reg = DeviceRegistry::new();
        let report = discover(&net, &mut reg, Duration::from_millis(10)).unwrap();
        assert_eq!(report.found.len(), 1);
        assert_eq!(report.summary.inserted, 1);
        assert_eq!(reg.resolve("Lilo").unwrap().serial, "007998");
        assert!(reg.resolve("Stitch").is_err());
    }
}
