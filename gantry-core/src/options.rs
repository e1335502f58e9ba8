//! Socket configuration options
//!
//! Per-socket knobs shared by the stream and datagram engines. Values are
//! copied into a socket when it is created; changing the struct afterwards
//! has no effect on live sockets.

use std::time::Duration;

use crate::addr::{FamilyPolicy, FamilyPreference};

/// Default size of a single kernel read.
pub const DEFAULT_READ_CHUNK: usize = 8192;

/// Default maximum datagram size accepted per family.
pub const DEFAULT_MAX_RECEIVE: usize = 9216;

/// Largest datagram an IPv4 socket can receive.
pub const MAX_RECEIVE_IPV4: usize = 65_535;

/// Largest datagram an IPv6 socket can receive (jumbograms excluded).
pub const MAX_RECEIVE_IPV6: usize = 65_575;

/// Socket configuration options.
///
/// # Examples
///
/// ```
/// use gantry_core::options::SocketOptions;
/// use gantry_core::addr::FamilyPreference;
/// use std::time::Duration;
///
/// let opts = SocketOptions::default()
///     .with_preference(FamilyPreference::PreferV6)
///     .with_tcp_nodelay(true)
///     .with_tcp_keepalive(Some(Duration::from_secs(30)));
/// assert!(opts.tcp_nodelay);
/// ```
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Which family wins when a host resolves to both.
    pub preference: FamilyPreference,

    /// Allow IPv4 addresses and descriptors (default `true`).
    pub ipv4_enabled: bool,

    /// Allow IPv6 addresses and descriptors (default `true`).
    pub ipv6_enabled: bool,

    /// Bytes requested from the kernel per read.
    ///
    /// - Default: 8192
    /// - Reads that know how many bytes they still need request exactly that
    ///   much when it is smaller
    pub read_chunk_size: usize,

    /// Upper bound on bytes read ahead of any pending read operation.
    ///
    /// Once the carry-over buffer holds this much, the socket stops reading
    /// until an operation consumes some of it.
    pub max_prebuffer: usize,

    /// Largest IPv4 datagram delivered (default 9216, max 65535).
    pub max_receive_ipv4: usize,

    /// Largest IPv6 datagram delivered (default 9216, max 65575).
    pub max_receive_ipv6: usize,

    /// Close the socket when a read or write times out.
    ///
    /// - `false` (default): only the timed-out operation fails
    /// - `true`: the timeout also tears the connection down
    pub close_on_timeout: bool,

    /// Disable Nagle's algorithm on stream sockets (default `false`).
    pub tcp_nodelay: bool,

    /// TCP keepalive idle time. `None` leaves the OS default.
    pub tcp_keepalive: Option<Duration>,

    /// Set `SO_REUSEADDR` before binding (default `true`).
    pub reuse_address: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            preference: FamilyPreference::PreferV4,
            ipv4_enabled: true,
            ipv6_enabled: true,
            read_chunk_size: DEFAULT_READ_CHUNK,
            max_prebuffer: 4 * 1024 * 1024,
            max_receive_ipv4: DEFAULT_MAX_RECEIVE,
            max_receive_ipv6: DEFAULT_MAX_RECEIVE,
            close_on_timeout: false,
            tcp_nodelay: false,
            tcp_keepalive: None,
            reuse_address: true,
        }
    }
}

impl SocketOptions {
    /// Create new socket options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The dual-stack part of the options.
    #[must_use]
    pub const fn family_policy(&self) -> FamilyPolicy {
        FamilyPolicy {
            preference: self.preference,
            ipv4_enabled: self.ipv4_enabled,
            ipv6_enabled: self.ipv6_enabled,
        }
    }

    /// Set the family preference.
    #[must_use]
    pub const fn with_preference(mut self, preference: FamilyPreference) -> Self {
        self.preference = preference;
        self
    }

    /// Enable or disable IPv4.
    #[must_use]
    pub const fn with_ipv4(mut self, enabled: bool) -> Self {
        self.ipv4_enabled = enabled;
        self
    }

    /// Enable or disable IPv6.
    #[must_use]
    pub const fn with_ipv6(mut self, enabled: bool) -> Self {
        self.ipv6_enabled = enabled;
        self
    }

    /// Set the kernel read size. Zero is bumped to one byte.
    #[must_use]
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Set the read-ahead cap.
    #[must_use]
    pub const fn with_max_prebuffer(mut self, size: usize) -> Self {
        self.max_prebuffer = size;
        self
    }

    /// Set the largest IPv4 datagram delivered.
    ///
    /// # Examples
    ///
    /// ```
    /// use gantry_core::options::{SocketOptions, MAX_RECEIVE_IPV4};
    ///
    /// let opts = SocketOptions::new().with_max_receive_ipv4(1_000_000);
    /// assert_eq!(opts.max_receive_ipv4, MAX_RECEIVE_IPV4);
    /// ```
    #[must_use]
    pub fn with_max_receive_ipv4(mut self, size: usize) -> Self {
        self.max_receive_ipv4 = size.clamp(1, MAX_RECEIVE_IPV4);
        self
    }

    /// Set the largest IPv6 datagram delivered.
    #[must_use]
    pub fn with_max_receive_ipv6(mut self, size: usize) -> Self {
        self.max_receive_ipv6 = size.clamp(1, MAX_RECEIVE_IPV6);
        self
    }

    /// Close the socket when a read or write times out.
    #[must_use]
    pub const fn with_close_on_timeout(mut self, close: bool) -> Self {
        self.close_on_timeout = close;
        self
    }

    /// Set `TCP_NODELAY`.
    #[must_use]
    pub const fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Set the TCP keepalive idle time.
    #[must_use]
    pub const fn with_tcp_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.tcp_keepalive = idle;
        self
    }

    /// Set `SO_REUSEADDR`.
    #[must_use]
    pub const fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SocketOptions::default();
        assert_eq!(opts.read_chunk_size, 8192);
        assert_eq!(opts.max_receive_ipv4, 9216);
        assert_eq!(opts.max_receive_ipv6, 9216);
        assert!(!opts.close_on_timeout);
        assert_eq!(opts.family_policy(), FamilyPolicy::default());
    }

    #[test]
    fn test_receive_size_clamped() {
        let opts = SocketOptions::new()
            .with_max_receive_ipv4(0)
            .with_max_receive_ipv6(usize::MAX);
        assert_eq!(opts.max_receive_ipv4, 1);
        assert_eq!(opts.max_receive_ipv6, MAX_RECEIVE_IPV6);
    }
}
