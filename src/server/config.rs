//! Reflector configuration.
//!
//! Loaded from a TOML file with `REFLECTOR_*` environment overrides. The
//! `[users]` table maps callsigns to their shared authentication keys.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ReflectorError;

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5300
}

fn default_sql_timeout_blocktime() -> u32 {
    60
}

fn default_tg_for_v1_clients() -> u32 {
    1
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_max_missed() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// TCP control and UDP audio share this port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Seconds of talker silence before a forced release; 0 disables.
    #[serde(default)]
    pub sql_timeout: u32,
    /// Block applied to a talker cleared by the squelch timeout, in seconds.
    #[serde(default = "default_sql_timeout_blocktime")]
    pub sql_timeout_blocktime: u32,
    /// Fixed talkgroup assigned to legacy major-version-1 clients.
    #[serde(default = "default_tg_for_v1_clients")]
    pub tg_for_v1_clients: u32,
    /// Random QSY pool as `"lo:count"`; unset or invalid disables it.
    #[serde(default)]
    pub random_qsy_range: Option<String>,
    /// Port for the HTTP status endpoint; unset disables it.
    #[serde(default)]
    pub http_srv_port: Option<u16>,
    /// Expected cadence of client heartbeats, in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Missed intervals tolerated before a connection is timed out.
    #[serde(default = "default_heartbeat_max_missed")]
    pub heartbeat_max_missed: u32,
    /// Callsign to shared authentication key.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            listen_port: default_listen_port(),
            sql_timeout: 0,
            sql_timeout_blocktime: default_sql_timeout_blocktime(),
            tg_for_v1_clients: default_tg_for_v1_clients(),
            random_qsy_range: None,
            http_srv_port: None,
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_max_missed: default_heartbeat_max_missed(),
            users: HashMap::new(),
        }
    }
}

impl Config {
    /// Parse a TOML document and apply environment overrides.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        let mut cfg: Config = toml::from_str(s)?;
        if let Ok(v) = std::env::var("REFLECTOR_BIND_HOST") {
            cfg.bind_host = v;
        }
        if let Ok(v) = std::env::var("REFLECTOR_LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                cfg.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("REFLECTOR_HTTP_SRV_PORT") {
            if let Ok(p) = v.parse() {
                cfg.http_srv_port = Some(p);
            }
        }
        if let Ok(v) = std::env::var("REFLECTOR_SQL_TIMEOUT") {
            if let Ok(t) = v.parse() {
                cfg.sql_timeout = t;
            }
        }
        Ok(cfg)
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<(), ReflectorError> {
        if self.users.is_empty() {
            return Err(ReflectorError::InvalidConfig(
                "no users configured; add at least one [users] entry".into(),
            ));
        }
        if self.bind_host.parse::<std::net::IpAddr>().is_err() {
            return Err(ReflectorError::InvalidConfig(format!(
                "bind_host is not an IP address: {}",
                self.bind_host
            )));
        }
        if self.heartbeat_interval == 0 {
            return Err(ReflectorError::InvalidConfig(
                "heartbeat_interval must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    /// The inclusive random QSY pool `[lo, hi]`, if configured and sane.
    ///
    /// An invalid range is not fatal: it logs a warning and disables the
    /// pool, so a typo cannot keep the reflector from starting.
    pub fn random_qsy_pool(&self) -> Option<(u32, u32)> {
        let raw = self.random_qsy_range.as_deref()?;
        let parsed = raw.split_once(':').and_then(|(lo, count)| {
            Some((lo.trim().parse::<u32>().ok()?, count.trim().parse::<u32>().ok()?))
        });
        match parsed {
            Some((lo, count)) if lo >= 1 && count >= 1 => Some((lo, lo + count - 1)),
            _ => {
                tracing::warn!(range = raw, "illegal random_qsy_range specified; ignored");
                None
            }
        }
    }

    pub fn sql_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.sql_timeout))
    }

    pub fn sql_timeout_blocktime(&self) -> Duration {
        Duration::from_secs(u64::from(self.sql_timeout_blocktime))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Time without inbound traffic after which a connection is dropped.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_max_missed.max(1)
    }
}
