//! TCP tuning helpers.
//!
//! Works on a borrowed [`socket2::SockRef`], so the same helpers serve
//! sockets created through `socket2` and streams handed out by a `mio`
//! listener without taking ownership of the descriptor.

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tracing::trace;

use crate::options::SocketOptions;

/// Enable `TCP_NODELAY`, disabling Nagle's algorithm.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(sock: &SockRef<'_>) -> io::Result<()> {
    sock.set_nodelay(true)
}

/// Turn keepalive on with the given idle time before the first probe.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
pub fn configure_tcp_keepalive(sock: &SockRef<'_>, idle: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle);
    sock.set_tcp_keepalive(&keepalive)
}

/// Apply every TCP-level option in `opts`.
///
/// # Errors
///
/// Returns the first option that could not be set.
pub fn apply(sock: &SockRef<'_>, opts: &SocketOptions) -> io::Result<()> {
    if opts.tcp_nodelay {
        enable_tcp_nodelay(sock)?;
    }
    if let Some(idle) = opts.tcp_keepalive {
        configure_tcp_keepalive(sock, idle)?;
    }
    trace!(
        "[TCP] nodelay={} keepalive={:?}",
        opts.tcp_nodelay,
        opts.tcp_keepalive
    );
    Ok(())
}
