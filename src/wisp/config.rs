//! Wisp server configuration

use std::collections::HashSet;

/// Resolved configuration for the Wisp proxy server. The session engine
/// receives this as an immutable snapshot; mutating it after startup has no
/// effect on live sessions.
#[derive(Debug, Clone)]
pub struct WispConfig {
    /// Initial per-stream credit and inbound queue capacity
    pub buffer_remaining_length: u32,
    /// Reject UDP streams
    pub disable_udp: bool,
    /// Read buffer size for the outbound (destination to client) pump
    pub tcp_buffer_size: usize,
    /// Disable Nagle on outbound TCP sockets
    pub tcp_no_delay: bool,
    /// Disable Nagle on the accepted WebSocket socket
    pub websocket_tcp_no_delay: bool,
    /// Request permessage-deflate on the WebSocket
    pub websocket_permessage_deflate: bool,
    /// SOCKS5 egress proxy as `host:port` (None = direct)
    pub proxy: Option<String>,
    /// Custom DNS server address (None = system resolution)
    pub dns_server: Option<String>,
    /// Exact-match hostnames to reject
    pub blacklist_hostnames: HashSet<String>,
    /// If non-empty, only these hostnames are allowed
    pub whitelist_hostnames: HashSet<String>,
}

impl Default for WispConfig {
    fn default() -> Self {
        Self {
            buffer_remaining_length: 128,
            disable_udp: false,
            tcp_buffer_size: 4096,
            tcp_no_delay: false,
            websocket_tcp_no_delay: false,
            websocket_permessage_deflate: false,
            proxy: None,
            dns_server: None,
            blacklist_hostnames: HashSet::new(),
            whitelist_hostnames: HashSet::new(),
        }
    }
}

impl WispConfig {
    /// Check whether a CONNECT hostname is rejected by policy. Matching is
    /// exact string equality on the hostname bytes; no wildcards or
    /// normalization.
    pub fn is_hostname_blocked(&self, hostname: &str) -> bool {
        if self.blacklist_hostnames.contains(hostname) {
            return true;
        }
        !self.whitelist_hostnames.is_empty() && !self.whitelist_hostnames.contains(hostname)
    }
}
