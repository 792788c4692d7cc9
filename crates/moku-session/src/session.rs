use crate::metrics::SessionMetrics;
use crate::{ConnectionPolicy, Result, SessionError};
use device_registry::DeviceRecord;
use instrument_codec::{encode, ControlLayout, RegisterWord};
use moku_transport::{DeviceInfo, RegisterBank, RegisterLink, TransportError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Where one connection attempt stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Resolving,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Identity keys of the sessions open in this process.
pub(crate) type ActiveSet = Arc<Mutex<HashSet<String>>>;

/// Holds a device's identity keys in the active set until dropped.
#[derive(Debug)]
pub(crate) struct ActiveGuard {
    active: ActiveSet,
    keys: Vec<String>,
}

impl ActiveGuard {
    pub(crate) fn reserve(active: &ActiveSet, keys: Vec<String>) -> Result<Self> {
        let mut set = active.lock().map_err(|_| SessionError::LockPoisoned)?;
        if let Some(held) = keys.iter().find(|k| set.contains(*k)) {
            return Err(SessionError::AlreadyConnected {
                device: held.clone(),
            });
        }
        set.extend(keys.iter().cloned());
        Ok(Self {
            active: Arc::clone(active),
            keys,
        })
    }

    /// Add a key learned after the claim.
    pub(crate) fn extend(&mut self, key: String) -> Result<()> {
        let mut set = self.active.lock().map_err(|_| SessionError::LockPoisoned)?;
        if self.keys.contains(&key) {
            return Ok(());
        }
        if !set.insert(key.clone()) {
            return Err(SessionError::AlreadyConnected { device: key });
        }
        self.keys.push(key);
        Ok(())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut set = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            set.remove(key);
        }
    }
}

struct Held<L> {
    link: L,
    _guard: ActiveGuard,
}

/// An open, exclusively held device connection.
///
/// Register access is serialized through an internal lock. The device is released by
/// [`Session::release`] or, failing that, when the session is dropped.
pub struct Session<L: RegisterLink> {
    id: Uuid,
    device: DeviceRecord,
    info: DeviceInfo,
    policy: ConnectionPolicy,
    acquired_at: OffsetDateTime,
    metrics: SessionMetrics,
    held: Mutex<Option<Held<L>>>,
}

impl<L: RegisterLink> Session<L> {
    pub(crate) fn open(
        link: L,
        device: DeviceRecord,
        policy: ConnectionPolicy,
        guard: ActiveGuard,
        metrics: SessionMetrics,
    ) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            info: link.info().clone(),
            device,
            policy,
            acquired_at: OffsetDateTime::now_utc(),
            metrics,
            held: Mutex::new(Some(Held {
                link,
                _guard: guard,
            })),
        };
        session.metrics.acquired.inc();
        session.metrics.active.inc();
        info!(
            session = %session.id,
            device = %session.device.label(),
            endpoint = %session.device.endpoint(),
            serial = %session.info.serial,
            "session open"
        );
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The registry record the session was resolved from.
    pub fn device(&self) -> &DeviceRecord {
        &self.device
    }

    /// Identity reported by the device itself.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    pub fn acquired_at(&self) -> OffsetDateTime {
        self.acquired_at
    }

    pub fn state(&self) -> ConnectionState {
        match self.held.lock() {
            Ok(held) if held.is_some() => ConnectionState::Connected,
            Ok(_) => ConnectionState::Closed,
            Err(_) => ConnectionState::Failed,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Held<L>>>> {
        self.held.lock().map_err(|_| SessionError::LockPoisoned)
    }

    fn transport(&self, source: TransportError) -> SessionError {
        SessionError::Transport {
            target: self.device.label(),
            source,
        }
    }

    /// Write control words in the order given.
    pub fn write_controls(&self, words: &[RegisterWord]) -> Result<()> {
        let mut held = self.lock()?;
        let held = held.as_mut().ok_or(SessionError::Closed)?;
        for word in words {
            held.link
                .write_control(word.index, word.value)
                .map_err(|e| self.transport(e))?;
            self.metrics.register_writes.inc();
            debug!(session = %self.id, %word, "write");
        }
        Ok(())
    }

    /// Encode `config` and write every control word it produces.
    pub fn configure<C: ControlLayout>(&self, config: &C) -> Result<Vec<RegisterWord>> {
        let words = encode(config)?;
        self.write_controls(&words)?;
        info!(session = %self.id, n = words.len(), "configuration written");
        Ok(words)
    }

    /// Read one register within the policy's read timeout. A timeout leaves the session
    /// open.
    pub fn read_register(&self, bank: RegisterBank, index: u8) -> Result<u32> {
        let timeout = self.policy.read_timeout;
        let mut held = self.lock()?;
        let held = held.as_mut().ok_or(SessionError::Closed)?;
        let started = Instant::now();
        let value = match held.link.read_register(bank, index, timeout) {
            Ok(_) if started.elapsed() > timeout => Err(TransportError::Timeout),
            other => other,
        };
        match value {
            Ok(v) => {
                self.metrics.register_reads.inc();
                Ok(v)
            }
            Err(TransportError::Timeout) => {
                debug!(session = %self.id, %bank, index, "read timed out");
                Err(SessionError::ReadTimeout {
                    bank,
                    index,
                    timeout,
                })
            }
            Err(e) => Err(self.transport(e)),
        }
    }

    /// Control registers `0..count`.
    pub fn read_controls(&self, count: u8) -> Result<Vec<u32>> {
        (0..count)
            .map(|i| self.read_register(RegisterBank::Control, i))
            .collect()
    }

    /// Output registers `0..count`.
    pub fn read_outputs(&self, count: u8) -> Result<Vec<u32>> {
        (0..count)
            .map(|i| self.read_register(RegisterBank::Output, i))
            .collect()
    }

    /// Give the device back. Failures are logged; calling this twice is harmless.
    pub fn release(&self) {
        let taken = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut held) = taken else {
            return;
        };
        if let Err(e) = held.link.relinquish(self.policy.persist_state) {
            error!(session = %self.id, device = %self.device.label(), error = %e, "release failed");
        }
        self.metrics.released.inc();
        self.metrics.active.dec();
        info!(
            session = %self.id,
            device = %self.device.label(),
            persist_state = self.policy.persist_state,
            "session released"
        );
    }
}

impl<L: RegisterLink> Drop for Session<L> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MetricsHub, Orchestrator};
    use device_registry::DeviceRegistry;
    use instrument_codec::{decode_status, EmfiSeqConfig, SequencerState, OUTPUT_WORDS};
    use moku_transport::MockMoku;

    fn connect(net: &MockMoku) -> anyhow::Result<(Orchestrator<MockMoku>, ConnectionPolicy)> {
        let orch = Orchestrator::new(net.clone(), DeviceRegistry::new(), MetricsHub::new()?);
        Ok((orch, ConnectionPolicy::default()))
    }

    #[test]
    fn test_configure_then_read_back() -> anyhow::Result<()> {
        let net = MockMoku::demo();
        let (orch, policy) = connect(&net)?;
        let session = orch.connect("10.0.44.219", &policy)?;
        let config = EmfiSeqConfig::default().with_sequencer_enabled(true);
        let words = session.configure(&config)?;
        assert_eq!(words.len(), 9);

        let controls = session.read_controls(9)?;
        assert_eq!(EmfiSeqConfig::from_controls(&controls)?.delays, config.delays);
        assert_eq!(orch.metrics().session.register_writes.get(), 9);
        assert_eq!(orch.metrics().session.register_reads.get(), 9);
        Ok(())
    }

    #[test]
    fn test_status_words_decode() -> anyhow::Result<()> {
        let net = MockMoku::demo();
        net.set_outputs("007998", [0x1EB8, 0b0001, 0x0014, 0x02])?;
        let (orch, policy) = connect(&net)?;
        let session = orch.connect("10.0.44.219", &policy)?;
        let snap = decode_status(&session.read_outputs(OUTPUT_WORDS as u8)?)?;
        assert_eq!(snap.state, SequencerState::Step(3));
        assert_eq!(snap.entered, [true, false, false, false]);
        assert_eq!(snap.monitor_msbs, 1);
        Ok(())
    }

    #[test]
    fn test_closed_session_refuses_io() -> anyhow::Result<()> {
        let net = MockMoku::demo();
        let (orch, policy) = connect(&net)?;
        let session = orch.connect("10.0.44.219", &policy)?;
        assert_eq!(session.device().serial, "");
        assert_eq!(session.info().serial, "007998");
        session.release();
        session.release();
        assert_eq!(net.relinquishes(), 1);
        assert!(matches!(
            session.write_controls(&[RegisterWord { index: 0, value: 0 }]),
            Err(SessionError::Closed)
        ));
        assert!(matches!(session.read_outputs(1), Err(SessionError::Closed)));
        Ok(())
    }

    #[test]
    fn test_drop_releases() -> anyhow::Result<()> {
        let net = MockMoku::demo();
        let (orch, policy) = connect(&net)?;
        {
            let _session = orch.connect("10.0.44.219", &policy)?;
            assert_eq!(orch.metrics().session.active.get(), 1);
        }
        assert_eq!(orch.metrics().session.active.get(), 0);
        assert_eq!(net.relinquishes(), 1);
        Ok(())
    }
}
