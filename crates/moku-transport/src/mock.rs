use crate::{
    Advertisement, ClaimRequest, Connector, DeviceInfo, DeviceScanner, Endpoint, RegisterBank,
    RegisterLink, Result, TransportError, CONTROL_REGISTERS, DEFAULT_HTTP_PORT, OUTPUT_REGISTERS,
};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// One simulated device on the mock network.
#[derive(Clone, Debug)]
pub struct MockDevice {
    pub serial: String,
    pub name: Option<String>,
    pub address: IpAddr,
    pub port: u16,
    /// Answers discovery scans.
    pub advertised: bool,
    /// Client currently marked as using the device.
    pub owner: Option<String>,
    pub controls: [u32; CONTROL_REGISTERS as usize],
    pub outputs: [u32; OUTPUT_REGISTERS as usize],
    /// Delay applied to every claim and read.
    pub latency: Duration,
    /// When false the device answers after `latency` even if the caller's timeout is shorter.
    pub honour_timeouts: bool,
    pub fail_writes: bool,
}

impl MockDevice {
    pub fn new(serial: impl Into<String>, name: Option<&str>, address: IpAddr) -> Self {
        Self {
            serial: serial.into(),
            name: name.map(str::to_string),
            address,
            port: DEFAULT_HTTP_PORT,
            advertised: true,
            owner: None,
            controls: [0; CONTROL_REGISTERS as usize],
            outputs: [0; OUTPUT_REGISTERS as usize],
            latency: Duration::ZERO,
            honour_timeouts: true,
            fail_writes: false,
        }
    }

    pub fn owned_by(mut self, client: &str) -> Self {
        self.owner = Some(client.to_string());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Reply late instead of timing out.
    pub fn late_replies(mut self) -> Self {
        self.honour_timeouts = false;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn with_outputs(mut self, outputs: [u32; OUTPUT_REGISTERS as usize]) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.advertised = false;
        self
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.to_string(), self.port)
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.serial.clone(),
            name: self.name.clone(),
            firmware: Some("mock".to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<MockDevice>,
    claims: usize,
    relinquishes: usize,
}

impl MockState {
    fn device_mut(&mut self, serial: &str) -> Result<&mut MockDevice> {
        self.devices
            .iter_mut()
            .find(|d| d.serial == serial)
            .ok_or_else(|| TransportError::NotFound(serial.to_string()))
    }
}

/// A simple in-process mock network. Clones share the same devices.
#[derive(Clone, Debug, Default)]
pub struct MockMoku {
    state: Arc<Mutex<MockState>>,
}

impl MockMoku {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network with a single idle device, used by the CLI's mock backend.
    pub fn demo() -> Self {
        Self::new().with_device(MockDevice::new(
            "007998",
            Some("Lilo"),
            IpAddr::V4(Ipv4Addr::new(10, 0, 44, 219)),
        ))
    }

    pub fn with_device(self, device: MockDevice) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.devices.push(device);
        }
        self
    }

    /// Number of successful claims so far.
    pub fn claims(&self) -> usize {
        self.lock().map(|st| st.claims).unwrap_or_default()
    }

    /// Number of relinquish calls so far.
    pub fn relinquishes(&self) -> usize {
        self.lock().map(|st| st.relinquishes).unwrap_or_default()
    }

    pub fn owner(&self, serial: &str) -> Option<String> {
        let mut st = self.lock().ok()?;
        st.device_mut(serial).ok().and_then(|d| d.owner.clone())
    }

    pub fn controls(&self, serial: &str) -> Option<[u32; CONTROL_REGISTERS as usize]> {
        let mut st = self.lock().ok()?;
        st.device_mut(serial).ok().map(|d| d.controls)
    }

    pub fn set_outputs(&self, serial: &str, outputs: [u32; OUTPUT_REGISTERS as usize]) -> Result<()> {
        let mut st = self.lock()?;
        st.device_mut(serial)?.outputs = outputs;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| TransportError::Io("mock state poisoned".to_string()))
    }
}

/// Sleep for the device latency, or fail with a timeout first when the device honours it.
fn wait(latency: Duration, honour_timeouts: bool, timeout: Duration) -> Result<()> {
    if honour_timeouts && latency > timeout {
        thread::sleep(timeout);
        debug!(?latency, ?timeout, "mock device timed out");
        return Err(TransportError::Timeout);
    }
    if !latency.is_zero() {
        thread::sleep(latency);
    }
    Ok(())
}

impl DeviceScanner for MockMoku {
    fn scan(&self, service: &str, _window: Duration) -> Result<Vec<Advertisement>> {
        let st = self.lock()?;
        Ok(st
            .devices
            .iter()
            .filter(|d| d.advertised)
            .map(|d| {
                let label = d.name.clone().unwrap_or_else(|| d.serial.clone());
                let mut properties = BTreeMap::new();
                properties.insert("serial".to_string(), d.serial.clone());
                Advertisement {
                    instance: format!("{label}.{service}"),
                    addresses: vec![d.address],
                    port: d.port,
                    properties,
                }
            })
            .collect())
    }
}

impl Connector for MockMoku {
    type Link = MockLink;

    fn claim(&self, endpoint: &Endpoint, request: &ClaimRequest) -> Result<MockLink> {
        let (serial, latency, honour) = {
            let st = self.lock()?;
            let dev = st
                .devices
                .iter()
                .find(|d| &d.endpoint() == endpoint)
                .ok_or_else(|| TransportError::NotFound(endpoint.to_string()))?;
            (dev.serial.clone(), dev.latency, dev.honour_timeouts)
        };
        wait(latency, honour, request.timeout)?;

        let mut st = self.lock()?;
        let dev = st.device_mut(&serial)?;
        let foreign = dev
            .owner
            .clone()
            .filter(|owner| *owner != request.client);
        match foreign {
            Some(owner) if !request.takeover && !request.ignore_busy => {
                debug!(%serial, %owner, client = %request.client, "mock claim refused: busy");
                return Err(TransportError::Busy { owner });
            }
            // Ignoring the busy state leaves the other client's marking alone.
            Some(_) if !request.takeover => {}
            _ => dev.owner = Some(request.client.clone()),
        }
        let info = dev.info();
        st.claims += 1;
        debug!(%serial, client = %request.client, takeover = request.takeover, "mock claim");
        Ok(MockLink {
            state: Arc::clone(&self.state),
            serial,
            client: request.client.clone(),
            info,
            latency,
            honour_timeouts: honour,
        })
    }
}

/// Claimed handle onto a [`MockDevice`].
#[derive(Debug)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
    serial: String,
    client: String,
    info: DeviceInfo,
    latency: Duration,
    honour_timeouts: bool,
}

impl MockLink {
    fn lock(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| TransportError::Io("mock state poisoned".to_string()))
    }
}

impl RegisterLink for MockLink {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn write_control(&mut self, index: u8, value: u32) -> Result<()> {
        let mut st = self.lock()?;
        let dev = st.device_mut(&self.serial)?;
        if dev.fail_writes {
            debug!(serial = %self.serial, index, "mock write failure injected");
            return Err(TransportError::Io("injected write failure".to_string()));
        }
        let slot = dev
            .controls
            .get_mut(usize::from(index))
            .ok_or(TransportError::InvalidRegister {
                bank: RegisterBank::Control,
                index,
            })?;
        *slot = value;
        Ok(())
    }

    fn read_register(&mut self, bank: RegisterBank, index: u8, timeout: Duration) -> Result<u32> {
        wait(self.latency, self.honour_timeouts, timeout)?;
        let mut st = self.lock()?;
        let dev = st.device_mut(&self.serial)?;
        let value = match bank {
            RegisterBank::Control => dev.controls.get(usize::from(index)),
            RegisterBank::Output => dev.outputs.get(usize::from(index)),
        };
        value
            .copied()
            .ok_or(TransportError::InvalidRegister { bank, index })
    }

    fn relinquish(&mut self, persist_state: bool) -> Result<()> {
        let mut st = self.lock()?;
        st.relinquishes += 1;
        let dev = st.device_mut(&self.serial)?;
        debug!(serial = %self.serial, client = %self.client, persist_state, "mock relinquish");
        if !persist_state {
            dev.controls = [0; CONTROL_REGISTERS as usize];
            if dev.owner.as_deref() == Some(self.client.as_str()) {
                dev.owner = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(client: &str) -> ClaimRequest {
        ClaimRequest {
            takeover: false,
            ignore_busy: false,
            persist_state: false,
            timeout: Duration::from_millis(50),
            client: client.to_string(),
        }
    }

    fn lilo() -> Endpoint {
        Endpoint::new("10.0.44.219", DEFAULT_HTTP_PORT)
    }

    #[test]
    fn test_scan_reports_serial_property() -> anyhow::Result<()> {
        let net = MockMoku::demo();
        let ads = net.scan(crate::MOKU_SERVICE, Duration::from_millis(10))?;
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].instance, "Lilo._moku._tcp.local.");
        assert_eq!(ads[0].properties.get("serial").map(String::as_str), Some("007998"));
        Ok(())
    }

    #[test]
    fn test_foreign_owner_is_busy_unless_taken_over() -> anyhow::Result<()> {
        let net = MockMoku::demo();
        let _first = net.claim(&lilo(), &request("a"))?;
        assert!(matches!(
            net.claim(&lilo(), &request("b")),
            Err(TransportError::Busy { .. })
        ));

        let mut takeover = request("b");
        takeover.takeover = true;
        let _second = net.claim(&lilo(), &takeover)?;
        assert_eq!(net.owner("007998").as_deref(), Some("b"));
        Ok(())
    }

    #[test]
    fn test_relinquish_without_persist_resets_controls() -> anyhow::Result<()> {
        let net = MockMoku::demo();
        let mut link = net.claim(&lilo(), &request("a"))?;
        link.write_control(1, 42)?;
        link.relinquish(false)?;
        assert_eq!(net.controls("007998").map(|c| c[1]), Some(0));
        assert_eq!(net.owner("007998"), None);
        Ok(())
    }

    #[test]
    fn test_slow_device_times_out() {
        let net = MockMoku::new().with_device(
            MockDevice::new("1", None, IpAddr::V4(Ipv4Addr::LOCALHOST))
                .with_latency(Duration::from_millis(200)),
        );
        let ep = Endpoint::new("127.0.0.1", DEFAULT_HTTP_PORT);
        assert!(matches!(
            net.claim(&ep, &request("a")),
            Err(TransportError::Timeout)
        ));
        assert_eq!(net.claims(), 0);
    }
}
