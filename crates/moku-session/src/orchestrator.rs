use crate::metrics::MetricsHub;
use crate::session::{ActiveGuard, ActiveSet, ConnectionState};
use crate::{ConnectionPolicy, Result, Session, SessionError};
use device_registry::{discover, DeviceRecord, DeviceRegistry, DiscoveryReport};
use moku_transport::{Connector, DeviceScanner, RegisterLink, TransportError};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Resolves targets through the device registry and hands out scoped sessions, at most one
/// per device in this process.
pub struct Orchestrator<C: Connector> {
    connector: C,
    registry: Mutex<DeviceRegistry>,
    active: ActiveSet,
    metrics: MetricsHub,
    client: String,
}

fn identity_keys(record: &DeviceRecord) -> Vec<String> {
    let mut keys = vec![format!("endpoint:{}", record.endpoint())];
    if !record.is_synthetic() {
        keys.push(format!("serial:{}", record.serial));
    }
    keys
}

fn transition(target: &str, state: ConnectionState) {
    debug!(device = target, ?state, "connection state");
}

impl<C: Connector> Orchestrator<C> {
    pub fn new(connector: C, registry: DeviceRegistry, metrics: MetricsHub) -> Self {
        Self {
            connector,
            registry: Mutex::new(registry),
            active: ActiveSet::default(),
            metrics,
            client: format!("moku-session-{}", Uuid::new_v4()),
        }
    }

    /// Name this process presents in the device's in-use marking.
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn metrics(&self) -> &MetricsHub {
        &self.metrics
    }

    /// Run `f` with exclusive access to the registry. Merges are serialized through here.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut DeviceRegistry) -> R) -> Result<R> {
        let mut registry = self.registry.lock().map_err(|_| SessionError::LockPoisoned)?;
        Ok(f(&mut registry))
    }

    /// Scan the network and merge the answers into the registry.
    pub fn discover<S: DeviceScanner + ?Sized>(
        &self,
        scanner: &S,
        window: Duration,
    ) -> Result<DiscoveryReport> {
        let report = self.with_registry(|registry| discover(scanner, registry, window))??;
        Ok(report)
    }

    pub fn resolve(&self, target: &str) -> Result<DeviceRecord> {
        let record = self.with_registry(|registry| registry.resolve(target))??;
        Ok(record)
    }

    /// Resolve `target` and claim the device under `policy`.
    ///
    /// A busy device fails without retry unless the policy forces or ignores busy. A claim
    /// that outlives `connect_timeout` is given back and reported as a timeout.
    pub fn connect(&self, target: &str, policy: &ConnectionPolicy) -> Result<Session<C::Link>> {
        let outcome = self.try_connect(target, policy);
        if let Err(e) = &outcome {
            self.metrics.session.connect_failures.inc();
            transition(target, ConnectionState::Failed);
            warn!(device = target, error = %e, "connect failed");
        }
        outcome
    }

    fn try_connect(&self, target: &str, policy: &ConnectionPolicy) -> Result<Session<C::Link>> {
        transition(target, ConnectionState::Resolving);
        let record = self.resolve(target)?;
        let endpoint = record.endpoint();
        let mut guard = ActiveGuard::reserve(&self.active, identity_keys(&record))?;

        transition(target, ConnectionState::Connecting);
        let request = policy.claim_request(&self.client);
        let started = Instant::now();
        let mut link = match self.connector.claim(&endpoint, &request) {
            Ok(link) => link,
            Err(TransportError::Busy { owner }) => {
                return Err(SessionError::DeviceBusy {
                    target: target.to_string(),
                    owner,
                })
            }
            Err(TransportError::Timeout) => {
                return Err(SessionError::ConnectTimeout {
                    target: target.to_string(),
                    timeout: policy.connect_timeout,
                })
            }
            Err(source) => {
                return Err(SessionError::Transport {
                    target: target.to_string(),
                    source,
                })
            }
        };

        if started.elapsed() > policy.connect_timeout {
            abandon(&mut link, policy.persist_state, target);
            return Err(SessionError::ConnectTimeout {
                target: target.to_string(),
                timeout: policy.connect_timeout,
            });
        }

        // A literal address only learns its serial once the device answers.
        let serial = link.info().serial.clone();
        if record.is_synthetic() && !serial.is_empty() {
            if let Err(e) = guard.extend(format!("serial:{serial}")) {
                abandon(&mut link, true, target);
                return Err(e);
            }
        }

        transition(target, ConnectionState::Connected);
        Ok(Session::open(
            link,
            record,
            policy.clone(),
            guard,
            self.metrics.session.clone(),
        ))
    }

    /// Connect, run `f`, and release the device on every exit path.
    pub fn with_session<R, E, F>(&self, target: &str, policy: &ConnectionPolicy, f: F) -> Result<R, E>
    where
        F: FnOnce(&Session<C::Link>) -> Result<R, E>,
        E: From<SessionError>,
    {
        let session = self.connect(target, policy)?;
        let out = f(&session);
        session.release();
        out
    }
}

/// Give back a claim that will not become a session.
fn abandon<L: RegisterLink>(link: &mut L, persist_state: bool, target: &str) {
    if let Err(e) = link.relinquish(persist_state) {
        error!(device = target, error = %e, "failed to give back abandoned claim");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instrument_codec::{EmfiSeqConfig, RegisterWord};
    use moku_transport::{MockDevice, MockMoku};
    use std::net::{IpAddr, Ipv4Addr};
    use time::OffsetDateTime;

    const LILO: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 44, 219));

    fn orchestrator(net: &MockMoku) -> Orchestrator<MockMoku> {
        let mut registry = DeviceRegistry::new();
        let rec = DeviceRecord::new(
            Some("Lilo"),
            LILO.to_string(),
            80,
            "007998",
            OffsetDateTime::now_utc(),
        );
        registry.record([rec]).unwrap();
        Orchestrator::new(net.clone(), registry, MetricsHub::new().unwrap()).with_client("bench")
    }

    fn lilo(device: MockDevice) -> MockMoku {
        MockMoku::new().with_device(device)
    }

    fn device() -> MockDevice {
        MockDevice::new("007998", Some("Lilo"), LILO)
    }

    fn fast() -> ConnectionPolicy {
        ConnectionPolicy::default().with_timeouts(Duration::from_millis(50), Duration::from_millis(50))
    }

    #[test]
    fn test_connect_by_name_and_release() {
        let net = MockMoku::demo();
        let orch = orchestrator(&net);
        let session = orch.connect("Lilo", &fast()).unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.info().serial, "007998");
        session.release();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(orch.metrics().session.acquired.get(), 1);
        assert_eq!(orch.metrics().session.released.get(), 1);
        assert_eq!(orch.metrics().session.active.get(), 0);
        assert_eq!(net.relinquishes(), 1);
    }

    #[test]
    fn test_busy_device_fails_without_force() {
        let net = lilo(device().owned_by("other-lab"));
        let orch = orchestrator(&net);
        let err = orch.connect("Lilo", &ConnectionPolicy::exclusive()).err();
        assert!(matches!(err, Some(SessionError::DeviceBusy { ref owner, .. }) if owner == "other-lab"));
        assert_eq!(net.claims(), 0);
        assert_eq!(orch.metrics().session.acquired.get(), 0);
        assert_eq!(orch.metrics().session.connect_failures.get(), 1);
        assert_eq!(orch.metrics().session.active.get(), 0);

        // the failed attempt left nothing reserved
        let session = orch
            .connect("Lilo", &ConnectionPolicy::exclusive().with_force(true))
            .unwrap();
        assert_eq!(net.owner("007998").as_deref(), Some("bench"));
        drop(session);
    }

    #[test]
    fn test_ignore_busy_shares_the_device() {
        let net = lilo(device().owned_by("other-lab"));
        let orch = orchestrator(&net);
        let policy = ConnectionPolicy {
            force_connect: false,
            ..fast()
        };
        let session = orch.connect("Lilo", &policy).unwrap();
        assert_eq!(net.owner("007998").as_deref(), Some("other-lab"));
        session.release();
    }

    #[test]
    fn test_one_session_per_device() {
        let net = MockMoku::demo();
        let orch = orchestrator(&net);
        let first = orch.connect("Lilo", &fast()).unwrap();
        assert!(matches!(
            orch.connect("007998", &fast()),
            Err(SessionError::AlreadyConnected { .. })
        ));
        assert!(matches!(
            orch.connect("10.0.44.219", &fast()),
            Err(SessionError::AlreadyConnected { .. })
        ));
        first.release();
        let again = orch.connect("10.0.44.219", &fast()).unwrap();
        assert!(matches!(
            orch.connect("Lilo", &fast()),
            Err(SessionError::AlreadyConnected { .. })
        ));
        drop(again);
        assert_eq!(net.claims(), net.relinquishes());
    }

    #[test]
    fn test_release_after_failed_write() {
        let net = lilo(device().failing_writes());
        let orch = orchestrator(&net);
        let out: Result<()> = orch.with_session("Lilo", &fast(), |s| {
            s.configure(&EmfiSeqConfig::default())?;
            Ok(())
        });
        assert!(matches!(out, Err(SessionError::Transport { .. })));
        assert_eq!(orch.metrics().session.acquired.get(), 1);
        assert_eq!(orch.metrics().session.released.get(), 1);
        assert_eq!(net.claims(), 1);
        assert_eq!(net.relinquishes(), 1);
    }

    #[test]
    fn test_slow_claim_times_out() {
        let net = lilo(device().with_latency(Duration::from_millis(200)));
        let orch = orchestrator(&net);
        assert!(matches!(
            orch.connect("Lilo", &fast()),
            Err(SessionError::ConnectTimeout { .. })
        ));
        assert_eq!(net.claims(), 0);
    }

    #[test]
    fn test_late_claim_is_given_back() {
        let net = lilo(device().with_latency(Duration::from_millis(120)).late_replies());
        let orch = orchestrator(&net);
        assert!(matches!(
            orch.connect("Lilo", &fast()),
            Err(SessionError::ConnectTimeout { .. })
        ));
        assert_eq!(net.claims(), 1);
        assert_eq!(net.relinquishes(), 1);
        assert_eq!(orch.metrics().session.acquired.get(), 0);
    }

    #[test]
    fn test_read_timeout_keeps_session_open() {
        let net = lilo(device().with_latency(Duration::from_millis(60)));
        let orch = orchestrator(&net);
        let policy = ConnectionPolicy::default()
            .with_timeouts(Duration::from_secs(2), Duration::from_millis(10));
        let session = orch.connect("Lilo", &policy).unwrap();
        assert!(matches!(
            session.read_outputs(4),
            Err(SessionError::ReadTimeout { index: 0, .. })
        ));
        assert_eq!(session.state(), ConnectionState::Connected);
        session.write_controls(&[RegisterWord { index: 1, value: 7 }]).unwrap();
        session.release();
    }

    #[test]
    fn test_persist_state_on_release() {
        let net = MockMoku::demo();
        let orch = orchestrator(&net);
        orch.with_session("Lilo", &fast(), |s| s.configure(&EmfiSeqConfig::default()))
            .unwrap();
        assert_eq!(net.controls("007998").map(|c| c[1]), Some(10));
        assert_eq!(net.owner("007998").as_deref(), Some("bench"));

        let reset = ConnectionPolicy {
            persist_state: false,
            ..fast()
        };
        orch.with_session("Lilo", &reset, |s| s.configure(&EmfiSeqConfig::default()))
            .unwrap();
        assert_eq!(net.controls("007998").map(|c| c[1]), Some(0));
        assert_eq!(net.owner("007998"), None);
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        let net = MockMoku::demo();
        let orch = orchestrator(&net);
        assert!(matches!(
            orch.connect("Stitch", &fast()),
            Err(SessionError::Registry(device_registry::RegistryError::NotFound { .. }))
        ));
        assert_eq!(net.claims(), 0);
    }

    #[test]
    fn test_discover_then_connect() {
        let net = MockMoku::demo();
        let orch = Orchestrator::new(net.clone(), DeviceRegistry::new(), MetricsHub::new().unwrap());
        assert!(orch.resolve("Lilo").is_err());
        let report = orch.discover(&net, Duration::from_millis(10)).unwrap();
        assert_eq!(report.found.len(), 1);
        let session = orch.connect("Lilo", &fast()).unwrap();
        assert_eq!(session.device().serial, "007998");
    }
}
