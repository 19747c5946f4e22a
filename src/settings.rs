//! Broker configuration.
//!
//! Loaded from an optional TOML file plus `MQTTD_`-prefixed environment
//! variables; every field has a default so an empty config is valid.

use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::types::QoS;
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// TCP listen address.
    pub laddr: SocketAddr,
    /// Accept CONNECT packets without credentials.
    pub allow_anonymous: bool,
    /// Highest QoS granted on subscribe, 0 or 1.
    pub max_qos: u8,
    /// Longest accepted client identifier; 0 means unlimited.
    pub max_clientid_len: usize,
    /// How long a fresh connection may take to send CONNECT.
    pub handshake_timeout_ms: u64,
    /// Delay before the first QoS 1 retransmission; doubles per attempt.
    pub base_retry_timeout_ms: u64,
    /// Granularity of the retransmission sweeper.
    pub retry_sweep_interval_ms: u64,
    /// Per-session grace period during broker close.
    pub shutdown_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            laddr: ([0, 0, 0, 0], 1883).into(),
            allow_anonymous: true,
            max_qos: 1,
            max_clientid_len: 0,
            handshake_timeout_ms: 15_000,
            base_retry_timeout_ms: 1_000,
            retry_sweep_interval_ms: 100,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl Settings {
    /// Reads `mqttd.toml` from the working directory (if present) and the
    /// environment, e.g. `MQTTD_LADDR=0.0.0.0:2883`.
    pub fn load() -> Result<Self> {
        Self::load_from("mqttd")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("MQTTD"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    #[inline]
    pub fn max_qos_allowed(&self) -> QoS {
        if self.max_qos == 0 {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        }
    }

    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[inline]
    pub fn base_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.base_retry_timeout_ms)
    }

    #[inline]
    pub fn retry_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.retry_sweep_interval_ms)
    }

    #[inline]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
