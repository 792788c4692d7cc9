//! device-registry: cache of discovered Moku devices
//!
//! Records are keyed by serial and indexed by name and address. The cache is loaded once
//! at start-up and written back after every mutation; a corrupt file is an empty cache.

mod types;
pub use types::{parse_address, DeviceRecord};

mod error;
pub use error::{RegistryError, Result};

mod loader;
pub use loader::CacheFile;

mod registry;
pub use registry::{DeviceRegistry, RecordSummary, RejectReason, Rejected, DEFAULT_FRESHNESS};

mod discovery;
pub use discovery::{discover, record_from_advertisement, DiscoveryReport, DEFAULT_SCAN_WINDOW};
