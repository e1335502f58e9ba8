//! Gantry Core
//!
//! This crate contains the building blocks the socket engine runs on. None
//! of it knows about reads, writes or delegates:
//! - Byte buffer with read/write cursors (`buffer`)
//! - Error types (`error`)
//! - Address families and dual-stack policy (`addr`)
//! - Non-blocking hostname resolution (`resolve`)
//! - Shared `tokio` task runtime (`runtime`)
//! - Serial execution queues on that runtime (`queue`)
//! - Deadline timers (`timer`)
//! - `mio`-backed readiness reactor (`reactor`)
//! - Socket options (`options`)
//! - TCP tuning helpers (`tcp`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod addr;
pub mod buffer;
pub mod error;
pub mod options;
pub mod queue;
pub mod reactor;
pub mod resolve;
pub mod runtime;
pub mod tcp;
pub mod timer;

// Optional: a small prelude to make downstream crates ergonomic.
pub mod prelude {
    pub use crate::addr::{Candidates, Family, FamilyPolicy, FamilyPreference, LocalBinding};
    pub use crate::buffer::ByteBuffer;
    pub use crate::error::{GantryError, Result};
    pub use crate::options::SocketOptions;
    pub use crate::queue::SerialQueue;
    pub use crate::reactor::{Reactor, Readiness, Registration};
    pub use crate::resolve::Resolver;
    pub use crate::timer::{timeout_secs, TimerHandle};
}
