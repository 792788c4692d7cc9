//! moku-session: scoped connections to Moku devices
//!
//! An [`Orchestrator`] resolves a target (name, serial or address) through the device
//! registry, claims the device under a [`ConnectionPolicy`] and returns a [`Session`]. The
//! session owns the claim: it is given back on [`Session::release`], on drop, or when the
//! closure passed to [`Orchestrator::with_session`] returns.

mod error;
pub use error::{Result, SessionError};

mod policy;
pub use policy::{
    ConnectionPolicy, EnvDefaults, DEFAULT_TIMEOUT, ENV_CACHE, ENV_CONNECT_TIMEOUT,
    ENV_DATA_PATH, ENV_FORCE_CONNECT, ENV_IGNORE_BUSY, ENV_IP, ENV_PERSIST_STATE,
    ENV_READ_TIMEOUT,
};

mod metrics;
pub use metrics::{MetricsHub, SessionMetrics};

mod session;
pub use session::{ConnectionState, Session};

mod orchestrator;
pub use orchestrator::Orchestrator;
