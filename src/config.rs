//! Engine configuration, loadable from a TOML file or built
//! programmatically with [`Config::default`] plus field assignment.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Default retransmission retention period, in seconds: a fixed
/// deployment constant rather than one derived from product size or
/// round-trip time.
pub const DEFAULT_RETENTION_SECONDS: f64 = 120.0;

/// Default EOP-watchdog timeout, in seconds.
pub const DEFAULT_EOP_WATCHDOG_SECONDS: f64 = 0.5;

/// Default multicast TTL.
pub const DEFAULT_TTL: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Unicast address the sender binds its TCP retransmission listener to,
    /// or the address a receiver dials.
    pub tcp_addr: Ipv4Addr,
    /// TCP port. `0` means OS-chosen on the sender side.
    pub tcp_port: u16,
    /// Multicast group address.
    pub mcast_addr: Ipv4Addr,
    /// Multicast group port.
    pub mcast_port: u16,
    /// Multicast TTL for sender-emitted datagrams.
    pub multicast_ttl: u32,
    /// Local interface address used for multicast send/join.
    /// `0.0.0.0` selects the default interface.
    pub iface_addr: Ipv4Addr,
    /// First `prodindex` the sender will assign.
    pub initial_prodindex: u32,
    /// Retention grace period, in seconds, after which an unacknowledged
    /// product is released regardless of pending receivers.
    pub retention_seconds: f64,
    /// EOP-watchdog timeout, in seconds.
    pub eop_watchdog_seconds: f64,
    /// Sender emission rate cap, in bits per second. `0` disables shaping.
    pub rate_bps: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tcp_addr: Ipv4Addr::UNSPECIFIED,
            tcp_port: 0,
            mcast_addr: Ipv4Addr::new(224, 0, 0, 1),
            mcast_port: 5000,
            multicast_ttl: DEFAULT_TTL,
            iface_addr: Ipv4Addr::UNSPECIFIED,
            initial_prodindex: 0,
            retention_seconds: DEFAULT_RETENTION_SECONDS,
            eop_watchdog_seconds: DEFAULT_EOP_WATCHDOG_SECONDS,
            rate_bps: 0,
        }
    }
}

impl Config {
    /// Parses a configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(s)
    }

    /// Loads a configuration from a TOML file, falling back to defaults for
    /// any field the file does not set.
    pub fn from_toml_file(path: &std::path::Path) -> std::io::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Config::from_toml_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_source_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.multicast_ttl, 1);
        assert_eq!(cfg.iface_addr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(cfg.initial_prodindex, 0);
        assert_eq!(cfg.rate_bps, 0);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            mcast_port = 6000
            retention_seconds = 30.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.mcast_port, 6000);
        assert_eq!(cfg.retention_seconds, 30.0);
        assert_eq!(cfg.tcp_port, 0);
        assert_eq!(cfg.multicast_ttl, DEFAULT_TTL);
    }

    #[test]
    fn from_toml_file_reads_an_actual_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "mcast_port = 7000\ninitial_prodindex = 42\n").unwrap();
        let cfg = Config::from_toml_file(file.path()).unwrap();
        assert_eq!(cfg.mcast_port, 7000);
        assert_eq!(cfg.initial_prodindex, 42);
        assert_eq!(cfg.tcp_port, 0);
    }

    #[test]
    fn from_toml_file_missing_path_is_io_error() {
        let err = Config::from_toml_file(std::path::Path::new("/nonexistent/rmtp.toml")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
