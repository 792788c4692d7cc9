use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct SessionMetrics {
    pub acquired: IntCounter,
    pub released: IntCounter,
    pub connect_failures: IntCounter,
    pub register_writes: IntCounter,
    pub register_reads: IntCounter,
    pub active: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub session: SessionMetrics,
}

impl MetricsHub {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let session = SessionMetrics {
            acquired: IntCounter::new("moku_sessions_acquired_total", "Sessions opened")?,
            released: IntCounter::new("moku_sessions_released_total", "Sessions released")?,
            connect_failures: IntCounter::new(
                "moku_connect_failures_total",
                "Connection attempts that did not yield a session",
            )?,
            register_writes: IntCounter::new(
                "moku_register_writes_total",
                "Control register words written",
            )?,
            register_reads: IntCounter::new("moku_register_reads_total", "Register words read")?,
            active: IntGauge::new("moku_sessions_active", "Sessions currently open")?,
        };
        registry.register(Box::new(session.acquired.clone()))?;
        registry.register(Box::new(session.released.clone()))?;
        registry.register(Box::new(session.connect_failures.clone()))?;
        registry.register(Box::new(session.register_writes.clone()))?;
        registry.register(Box::new(session.register_reads.clone()))?;
        registry.register(Box::new(session.active.clone()))?;
        Ok(Self { registry, session })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposition_names() {
        let hub = MetricsHub::new().unwrap();
        hub.session.acquired.inc();
        hub.session.active.inc();
        let text = hub.encode_text();
        assert!(text.contains("moku_sessions_acquired_total 1"));
        assert!(text.contains("moku_sessions_active 1"));
        assert!(text.contains("moku_connect_failures_total 0"));
    }
}
