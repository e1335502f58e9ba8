//! # Gantry
//!
//! An asynchronous socket engine: non-blocking TCP and UDP sockets behind a
//! queued, delegate-driven API that is safe to call from any thread.
//!
//! ## Architecture
//!
//! - **`gantry-core`**: serial queues, timers, the `mio` readiness reactor,
//!   byte buffers, address families and resolution
//! - **`gantry-net`**: the stream and datagram engines, TLS via `rustls`
//! - **`gantry`**: public API surface (this crate)
//!
//! ## Model
//!
//! You queue operations on a socket (read exactly N bytes, read up to a
//! delimiter, write a buffer, upgrade to TLS) and the engine completes them
//! in order. Each result is delivered to your delegate on a serial queue you
//! pick, carrying the tag you supplied.
//!
//! ## Quick Start
//!
//! ### Line-based client
//!
//! ```rust,no_run
//! # #[cfg(feature = "net")]
//! # fn example() -> gantry::Result<()> {
//! use gantry::prelude::*;
//! use std::sync::Arc;
//!
//! struct Lines;
//!
//! impl StreamDelegate for Lines {
//!     fn connected(&self, sock: &StreamSocket, _peer: std::net::SocketAddr) {
//!         sock.read_until(&b"\n"[..], None, 1);
//!     }
//!
//!     fn read_complete(&self, sock: &StreamSocket, line: Bytes, _tag: Tag) {
//!         print!("{}", String::from_utf8_lossy(&line));
//!         sock.read_until(&b"\n"[..], None, 1);
//!     }
//! }
//!
//! let delegate: Arc<dyn StreamDelegate> = Arc::new(Lines);
//! let sock = StreamSocket::new(Arc::downgrade(&delegate), SerialQueue::new("lines"));
//! sock.connect_to_host("localhost", 7000, Some(std::time::Duration::from_secs(5)))?;
//! # Ok(())
//! # }
//! ```
//!
//! ### UDP
//!
//! ```rust,no_run
//! # #[cfg(feature = "net")]
//! # fn example() -> gantry::Result<()> {
//! use gantry::prelude::*;
//! use std::sync::Arc;
//!
//! struct Quiet;
//! impl DatagramDelegate for Quiet {}
//!
//! let delegate: Arc<dyn DatagramDelegate> = Arc::new(Quiet);
//! let sock = DatagramSocket::new(Arc::downgrade(&delegate), SerialQueue::new("udp"));
//! sock.send_to_host(&b"hello"[..], "localhost", 9999, None, 0);
//! sock.close_after_sending();
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! The engine logs through `tracing` and never installs a subscriber. Call
//! [`dev_tracing::init_tracing`] with `RUST_LOG` set to see its output.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Tracing setup for demos and tests.
pub mod dev_tracing;

// Re-export core types
pub use bytes::Bytes;
pub use gantry_core::addr::{Family, FamilyPreference};
pub use gantry_core::error::{GantryError, Result};
pub use gantry_core::options::SocketOptions;
pub use gantry_core::queue::SerialQueue;
pub use gantry_core::timer::timeout_secs;

// Socket engine (opt-out via features)
#[cfg(feature = "net")]
pub use gantry_net::{
    Capabilities, ClientAuth, DatagramDelegate, DatagramSocket, DatagramState, DatagramStats, FilterContext,
    Filtered, ReadKind, ReceiveFilter, SocketEvent, SocketMonitor, SocketState, StreamDelegate, StreamSocket,
    StreamStats, Tag, TlsInfo, TlsSettings, UserData,
};

/// TLS helpers: settings builders and PEM parsing.
#[cfg(feature = "net")]
pub mod tls {
    pub use gantry_net::tls::{
        certs_from_pem, key_from_pem, roots_from_pem, ClientAuth, ClientTlsBuilder, ServerTlsBuilder, TlsInfo, TlsSettings,
        DEFAULT_HANDSHAKE_TIMEOUT,
    };
}

/// Convenient imports.
///
/// # Example
///
/// ```rust
/// use gantry::prelude::*;
///
/// // Now you have:
/// // - StreamSocket, DatagramSocket and their delegate traits
/// // - SerialQueue, SocketOptions, GantryError
/// // - Bytes for zero-copy payloads
/// ```
pub mod prelude {
    pub use super::{GantryError, SerialQueue, SocketOptions};
    pub use bytes::Bytes;

    #[cfg(feature = "net")]
    pub use super::{
        Capabilities, DatagramDelegate, DatagramSocket, ReadKind, StreamDelegate, StreamSocket, Tag, TlsSettings,
    };
}
