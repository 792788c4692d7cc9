use crate::{Result, SessionError};
use moku_transport::ClaimRequest;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_IP: &str = "MOKU_IP";
pub const ENV_DATA_PATH: &str = "MOKU_DATA_PATH";
pub const ENV_CACHE: &str = "MOKU_CACHE";
pub const ENV_FORCE_CONNECT: &str = "MOKU_FORCE_CONNECT";
pub const ENV_IGNORE_BUSY: &str = "MOKU_IGNORE_BUSY";
pub const ENV_PERSIST_STATE: &str = "MOKU_PERSIST_STATE";
pub const ENV_CONNECT_TIMEOUT: &str = "MOKU_CONNECT_TIMEOUT";
pub const ENV_READ_TIMEOUT: &str = "MOKU_READ_TIMEOUT";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a connection is made and released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Take the device over from whichever client holds it.
    pub force_connect: bool,
    /// Connect alongside another client instead of failing as busy.
    pub ignore_busy: bool,
    /// Leave registers and the in-use marking in place on release.
    pub persist_state: bool,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            force_connect: true,
            ignore_busy: true,
            persist_state: true,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ConnectionPolicy {
    /// Never take over or share a busy device, and reset it on release.
    pub fn exclusive() -> Self {
        Self {
            force_connect: false,
            ignore_busy: false,
            persist_state: false,
            ..Self::default()
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force_connect = force;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn claim_request(&self, client: &str) -> ClaimRequest {
        ClaimRequest {
            takeover: self.force_connect,
            ignore_busy: self.ignore_busy,
            persist_state: self.persist_state,
            timeout: self.connect_timeout,
            client: client.to_string(),
        }
    }
}

/// Defaults read from `MOKU_*` environment variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvDefaults {
    /// Target used when a command names none.
    pub target: Option<String>,
    /// Directory relative configuration files are read from.
    pub data_path: Option<PathBuf>,
    pub cache_path: Option<PathBuf>,
    pub policy: ConnectionPolicy,
}

impl EnvDefaults {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset and blank variables keep the stock defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut policy = ConnectionPolicy::default();
        if let Some(v) = get(ENV_FORCE_CONNECT) {
            policy.force_connect = parse_bool(ENV_FORCE_CONNECT, &v)?;
        }
        if let Some(v) = get(ENV_IGNORE_BUSY) {
            policy.ignore_busy = parse_bool(ENV_IGNORE_BUSY, &v)?;
        }
        if let Some(v) = get(ENV_PERSIST_STATE) {
            policy.persist_state = parse_bool(ENV_PERSIST_STATE, &v)?;
        }
        if let Some(v) = get(ENV_CONNECT_TIMEOUT) {
            policy.connect_timeout = parse_seconds(ENV_CONNECT_TIMEOUT, &v)?;
        }
        if let Some(v) = get(ENV_READ_TIMEOUT) {
            policy.read_timeout = parse_seconds(ENV_READ_TIMEOUT, &v)?;
        }
        Ok(Self {
            target: get(ENV_IP).map(|v| v.trim().to_string()),
            data_path: get(ENV_DATA_PATH).map(PathBuf::from),
            cache_path: get(ENV_CACHE).map(PathBuf::from),
            policy,
        })
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(SessionError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_seconds(var: &'static str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| SessionError::InvalidEnv {
            var,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_stock_defaults() {
        let env = EnvDefaults::from_lookup(lookup(&[])).unwrap();
        assert_eq!(env.policy, ConnectionPolicy::default());
        assert!(env.policy.force_connect && env.policy.ignore_busy && env.policy.persist_state);
        assert_eq!(env.policy.connect_timeout, Duration::from_secs(10));
        assert_eq!(env.target, None);
    }

    #[test]
    fn test_variables_override_defaults() {
        let env = EnvDefaults::from_lookup(lookup(&[
            ("MOKU_IP", "10.0.44.219"),
            ("MOKU_DATA_PATH", "/srv/moku"),
            ("MOKU_FORCE_CONNECT", "False"),
            ("MOKU_IGNORE_BUSY", "0"),
            ("MOKU_PERSIST_STATE", "no"),
            ("MOKU_CONNECT_TIMEOUT", "2.5"),
            ("MOKU_READ_TIMEOUT", "3"),
            ("MOKU_CACHE", ""),
        ]))
        .unwrap();
        assert_eq!(env.target.as_deref(), Some("10.0.44.219"));
        assert_eq!(env.data_path, Some(PathBuf::from("/srv/moku")));
        assert_eq!(env.cache_path, None);
        assert!(!env.policy.force_connect);
        assert!(!env.policy.ignore_busy);
        assert!(!env.policy.persist_state);
        assert_eq!(env.policy.connect_timeout, Duration::from_millis(2500));
        assert_eq!(env.policy.read_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_malformed_variables_name_the_variable() {
        let err = EnvDefaults::from_lookup(lookup(&[("MOKU_FORCE_CONNECT", "maybe")])).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidEnv {
                var: "MOKU_FORCE_CONNECT",
                ..
            }
        ));
        let err = EnvDefaults::from_lookup(lookup(&[("MOKU_READ_TIMEOUT", "-1")])).unwrap_err();
        assert!(err.to_string().contains("MOKU_READ_TIMEOUT"));
    }

    #[test]
    fn test_claim_request_carries_flags() {
        let req = ConnectionPolicy::exclusive().with_force(true).claim_request("bench-3");
        assert!(req.takeover);
        assert!(!req.ignore_busy);
        assert!(!req.persist_state);
        assert_eq!(req.client, "bench-3");
    }
}
