//! Socket event monitoring.
//!
//! A monitor is a channel of lifecycle events, independent of the delegate.
//! It suits code that wants to observe a socket without implementing a
//! delegate, such as tests and supervisors.

use std::fmt;
use std::net::SocketAddr;

/// Socket lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Socket connected to a peer.
    Connected(SocketAddr),

    /// A connect candidate failed; the socket may try the next one.
    ConnectFailed { addr: SocketAddr, reason: String },

    /// Socket bound a local address.
    Bound(SocketAddr),

    /// Socket is listening for incoming connections.
    Listening(SocketAddr),

    /// Socket accepted a connection from this peer.
    Accepted(SocketAddr),

    /// TLS handshake completed.
    Secured,

    /// Socket closed, with the terminating error if there was one.
    Closed { reason: Option<String> },
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(addr) => write!(f, "Connected to {addr}"),
            Self::ConnectFailed { addr, reason } => write!(f, "Connect to {addr} failed: {reason}"),
            Self::Bound(addr) => write!(f, "Bound to {addr}"),
            Self::Listening(addr) => write!(f, "Listening on {addr}"),
            Self::Accepted(addr) => write!(f, "Accepted connection from {addr}"),
            Self::Secured => write!(f, "TLS established"),
            Self::Closed { reason: None } => write!(f, "Closed"),
            Self::Closed { reason: Some(reason) } => write!(f, "Closed: {reason}"),
        }
    }
}

/// Handle for receiving socket events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Sending half kept by the socket.
pub type SocketEventSender = flume::Sender<SocketEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}

/// Send `event` to every live monitor, dropping the ones whose receiver is
/// gone.
pub(crate) fn emit(monitors: &mut Vec<SocketEventSender>, event: &SocketEvent) {
    monitors.retain(|tx| tx.send(event.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert_eq!(SocketEvent::Connected(addr).to_string(), "Connected to 127.0.0.1:80");
        assert_eq!(SocketEvent::Closed { reason: None }.to_string(), "Closed");
    }

    #[test]
    fn test_emit_prunes_dropped_monitors() {
        let (tx1, rx1) = create_monitor();
        let (tx2, rx2) = create_monitor();
        drop(rx2);
        let mut monitors = vec![tx1, tx2];
        emit(&mut monitors, &SocketEvent::Secured);
        assert_eq!(monitors.len(), 1);
        assert_eq!(rx1.try_recv().unwrap(), SocketEvent::Secured);
    }
}
