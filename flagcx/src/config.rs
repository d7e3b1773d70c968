//! Runtime-configurable tuning parameters.
//!
//! All values have defaults. Override via environment variables (prefixed
//! `FLAGCX_`) or by constructing a custom `FlagcxConfig`. Rank and world size
//! are deliberately absent: the caller resolves those and passes them to
//! [`World::init`](crate::World::init).

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FlagcxConfig {
    /// Upper bound on a single send or receive inside an operation.
    pub transfer_timeout: Duration,

    /// Upper bound on dialing a peer and completing the channel handshake.
    pub connect_timeout: Duration,

    /// Upper bound on waiting for a rendezvous key during group creation
    /// and destruction.
    pub store_timeout: Duration,

    /// Largest group size for which all_reduce uses the ring algorithm;
    /// bigger groups use recursive halving-doubling.
    pub ring_max_world: usize,

    /// Address each group endpoint binds to (port is always ephemeral).
    pub bind_addr: IpAddr,

    /// QUIC keep-alive interval; keeps idle channels open between operations.
    pub keep_alive: Duration,
}

impl Default for FlagcxConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(60),
            ring_max_world: 8,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            keep_alive: Duration::from_secs(5),
        }
    }
}

impl FlagcxConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `FLAGCX_TRANSFER_TIMEOUT_SECS`
    /// - `FLAGCX_CONNECT_TIMEOUT_SECS`
    /// - `FLAGCX_STORE_TIMEOUT_SECS`
    /// - `FLAGCX_RING_MAX_WORLD`
    /// - `FLAGCX_BIND_ADDR`
    /// - `FLAGCX_KEEP_ALIVE_SECS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(s) = parse_var::<u64>(&lookup, "FLAGCX_TRANSFER_TIMEOUT_SECS") {
            cfg.transfer_timeout = Duration::from_secs(s);
        }
        if let Some(s) = parse_var::<u64>(&lookup, "FLAGCX_CONNECT_TIMEOUT_SECS") {
            cfg.connect_timeout = Duration::from_secs(s);
        }
        if let Some(s) = parse_var::<u64>(&lookup, "FLAGCX_STORE_TIMEOUT_SECS") {
            cfg.store_timeout = Duration::from_secs(s);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "FLAGCX_RING_MAX_WORLD") {
            cfg.ring_max_world = n;
        }
        if let Some(addr) = parse_var::<IpAddr>(&lookup, "FLAGCX_BIND_ADDR") {
            cfg.bind_addr = addr;
        }
        if let Some(s) = parse_var::<u64>(&lookup, "FLAGCX_KEEP_ALIVE_SECS") {
            cfg.keep_alive = Duration::from_secs(s);
        }

        cfg
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}
