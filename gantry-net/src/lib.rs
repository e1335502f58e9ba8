//! # Gantry Net
//!
//! The socket engine behind `gantry`.
//!
//! ## Overview
//!
//! - **[`StreamSocket`]**: connected byte streams with queued exact,
//!   delimiter and up-to reads, queued writes, in-band TLS upgrade and a
//!   listening mode that accepts new sockets
//! - **[`DatagramSocket`]**: UDP with queued sends, continuous or one-shot
//!   receiving, a receive filter, multicast and broadcast
//!
//! Every socket owns a serial queue; all of its state changes happen there.
//! Results come back through a delegate, on a queue the caller chooses.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gantry_net::{StreamDelegate, StreamSocket};
//! use gantry_core::queue::SerialQueue;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl StreamDelegate for Printer {
//!     fn read_complete(&self, _sock: &StreamSocket, data: bytes::Bytes, tag: i64) {
//!         println!("read {tag}: {:?}", data);
//!     }
//! }
//!
//! let delegate: Arc<dyn StreamDelegate> = Arc::new(Printer);
//! let sock = StreamSocket::new(Arc::downgrade(&delegate), SerialQueue::new("app"));
//! sock.connect_to_host("example.com", 80, None)?;
//! sock.write(&b"GET / HTTP/1.0\r\n\r\n"[..], None, 0);
//! sock.read_until(&b"\r\n\r\n"[..], None, 1);
//! # Ok::<(), gantry_core::error::GantryError>(())
//! ```

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod config;
pub mod datagram;
pub mod delegate;
pub mod monitor;
pub mod op;
pub mod stream;
pub mod tls;

pub use datagram::{DatagramSocket, DatagramState, DatagramStats};
pub use delegate::{Capabilities, DatagramDelegate, FilterContext, Filtered, ReceiveFilter, StreamDelegate};
pub use monitor::{SocketEvent, SocketMonitor};
pub use op::{ReadKind, Tag};
pub use stream::{SocketState, StreamSocket, StreamStats, UserData};
pub use tls::{ClientAuth, TlsInfo, TlsSettings};
