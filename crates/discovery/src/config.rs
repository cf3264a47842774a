//! Discovery configuration and datagram format.
//!
//! A probe is the bare scope string. Replies and announcements are
//! `scope|port`, where `port` is the TCP port the server accepts sessions on.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Configuration shared by the discovery client and server.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Tag that keeps unrelated applications on the same network apart.
    pub scope: String,
    /// UDP port the server listens on for probes.
    pub discovery_port: u16,
    /// UDP port clients listen on. Announcements are sent to it; `0` binds an
    /// ephemeral port and disables announcements.
    pub client_port: u16,
    /// Destination of probes and announcements.
    pub broadcast_addr: IpAddr,
    /// Local address to bind.
    pub bind_addr: IpAddr,
    /// Delay between probes while scanning.
    pub probe_interval: Duration,
    /// Delay between server announcements.
    pub announce_interval: Duration,
    /// How long a scan waits for a reply before the timeout callback fires.
    pub timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scope: "parley".to_string(),
            discovery_port: 47777,
            client_port: 47778,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            probe_interval: Duration::from_secs(1),
            announce_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }
}

impl DiscoveryConfig {
    /// Set the scope.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Set the server's probe port.
    #[must_use]
    pub const fn discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    /// Set the client's listen port.
    #[must_use]
    pub const fn client_port(mut self, port: u16) -> Self {
        self.client_port = port;
        self
    }

    /// Set the broadcast destination.
    #[must_use]
    pub const fn broadcast_addr(mut self, addr: IpAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    /// Set the local bind address.
    #[must_use]
    pub const fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the probe interval.
    #[must_use]
    pub const fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the announcement interval.
    #[must_use]
    pub const fn announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    /// Set the scan timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn reply(&self, port: u16) -> String {
        format!("{}|{port}", self.scope)
    }

    pub(crate) fn is_probe(&self, datagram: &[u8]) -> bool {
        datagram == self.scope.as_bytes()
    }

    /// Port carried by a correctly scoped reply.
    pub(crate) fn parse_reply(&self, datagram: &[u8]) -> Option<u16> {
        let text = std::str::from_utf8(datagram).ok()?;
        let (scope, port) = text.split_once('|')?;
        if scope != self.scope {
            return None;
        }
        port.trim().parse().ok().filter(|&port| port != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_round_trip() {
        let config = DiscoveryConfig::default();
        let reply = config.reply(7000);
        assert_eq!(reply, "parley|7000");
        assert_eq!(config.parse_reply(reply.as_bytes()), Some(7000));
    }

    #[test]
    fn test_foreign_datagrams_are_ignored() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.parse_reply(b"other|7000"), None);
        assert_eq!(config.parse_reply(b"parley"), None);
        assert_eq!(config.parse_reply(b"parley|port"), None);
        assert_eq!(config.parse_reply(b"parley|0"), None);
        assert_eq!(config.parse_reply(&[0xff, 0xfe]), None);

        assert!(config.is_probe(b"parley"));
        assert!(!config.is_probe(b"parley|7000"));
    }
}
