//! Engine buffer sizing
//!
//! Sizes used by the stream engine when it allocates operation buffers and
//! talks to the kernel. Per-socket knobs (read chunk, prebuffer cap, UDP
//! receive sizes) live in `SocketOptions`.

/// Maximum bytes handed to the kernel per write call (64KB)
///
/// Keeps a single large write from monopolizing the socket's queue.
pub const MAX_WRITE_CHUNK: usize = 65536;

/// Initial capacity of a read operation's own buffer (256 bytes)
///
/// Delimiter reads grow from here; exact reads allocate their full length.
pub const READ_OP_INITIAL_CAP: usize = 256;

/// Upper bound on the initial allocation of an exact read (1MB)
///
/// Larger exact reads grow as data arrives instead of reserving up front.
pub const EXACT_READ_PREALLOC_MAX: usize = 1024 * 1024;

/// Pending connections accepted per listener readiness event
pub const ACCEPT_BATCH: usize = 64;

/// Backlog passed to `listen(2)`
pub const LISTEN_BACKLOG: i32 = 1024;
