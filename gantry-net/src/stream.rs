//! Stream (TCP) socket engine.
//!
//! A [`StreamSocket`] is a cheap, cloneable handle. All of its state lives in
//! an [`Engine`] that is only touched from tasks running on the socket's own
//! [`SerialQueue`]. Public methods marshal a closure onto that queue and
//! return; the setup calls that report misuse (`connect`, `accept_on`,
//! `bind`) wait for their answer. Getters read the engine under its lock,
//! which queue tasks only hold for one non-blocking step.
//!
//! # Progress loop
//!
//! Reads and writes sit in independent FIFO queues. At most one of each is
//! in flight. Every readiness event, every enqueue and every state change
//! runs the same pump:
//!
//! 1. continue a TLS handshake in progress, or
//! 2. push the head write to the kernel until it blocks,
//! 3. satisfy the head read from the carry-over buffer, reading more from the
//!    kernel until it blocks,
//! 4. start a queued TLS upgrade once it heads both queues,
//! 5. close if a close-after condition is met.
//!
//! Registrations are edge-triggered, so each step keeps going until the
//! descriptor reports `WouldBlock`.

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use smallvec::SmallVec;
use socket2::{Protocol, SockRef, Socket, Type};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

use gantry_core::addr::{Candidates, Family, LocalBinding};
use gantry_core::buffer::ByteBuffer;
use gantry_core::error::{GantryError, Result};
use gantry_core::options::SocketOptions;
use gantry_core::queue::SerialQueue;
use gantry_core::reactor::{Reactor, Readiness, ReadyFn, Registration};
use gantry_core::resolve::Resolver;
use gantry_core::tcp;
use gantry_core::timer::TimerHandle;
use parking_lot::Mutex;

use crate::config::{ACCEPT_BATCH, LISTEN_BACKLOG, MAX_WRITE_CHUNK};
use crate::delegate::{Dispatcher, StreamDelegate};
use crate::monitor::{self, SocketEvent, SocketEventSender, SocketMonitor};
use crate::op::{Queued, ReadKind, ReadOp, ReadProgress, Tag, WriteOp};
use crate::tls::{HandshakePhase, Io, TlsInfo, TlsSession, TlsSettings};

/// Lifecycle of a stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Resolving,
    Connecting,
    /// Includes the TLS handshake, see [`StreamSocket::is_secure`].
    Connected,
    Listening,
    Closing,
    Closed,
}

/// Instrumentation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub reads_completed: u64,
    pub writes_completed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Highest number of reads ever progressing at once.
    pub peak_reads_in_flight: usize,
    /// Highest number of writes ever progressing at once.
    pub peak_writes_in_flight: usize,
}

/// Opaque per-socket value owned by the application.
pub type UserData = Arc<dyn Any + Send + Sync>;

struct Listener {
    listener: TcpListener,
    registration: Registration,
    addr: SocketAddr,
}

enum Descriptor {
    None,
    Stream {
        stream: TcpStream,
        registration: Registration,
    },
    Listeners(Vec<Listener>),
}

impl Descriptor {
    fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        match self {
            Self::Stream { stream, .. } => Some(stream),
            _ => None,
        }
    }

    fn release(&mut self) {
        match mem::replace(self, Self::None) {
            Self::None => {}
            Self::Stream {
                mut stream,
                registration,
            } => {
                if let Err(e) = registration.deregister(&mut stream) {
                    trace!("[STREAM] Deregister failed: {}", e);
                }
            }
            Self::Listeners(listeners) => {
                for mut l in listeners {
                    if let Err(e) = l.registration.deregister(&mut l.listener) {
                        trace!("[STREAM] Deregister failed: {}", e);
                    }
                }
            }
        }
    }
}

enum Target {
    Addr(SocketAddr),
    Host(String, u16),
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

struct Engine {
    opts: SocketOptions,
    state: SocketState,
    dispatcher: Dispatcher<dyn StreamDelegate>,
    monitors: Vec<SocketEventSender>,
    desc: Descriptor,

    binding: Option<LocalBinding>,
    connect_started: bool,
    connect_timeout: Option<Duration>,
    connect_timer: Option<TimerHandle>,
    candidates: SmallVec<[SocketAddr; 4]>,
    connecting_to: Option<SocketAddr>,
    last_connect_error: Option<GantryError>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,

    reads: VecDeque<Queued<ReadOp>>,
    writes: VecDeque<Queued<WriteOp>>,
    current_read: Option<ReadOp>,
    current_write: Option<WriteOp>,
    prebuffer: ByteBuffer,
    read_eof: bool,
    close_after_reading: bool,
    close_after_writing: bool,

    tls: Option<TlsSession>,
    tls_pending: Option<TlsSettings>,
    tls_requested: bool,
    tls_timer: Option<TimerHandle>,
    tls_info: Option<TlsInfo>,

    reads_in_flight: usize,
    writes_in_flight: usize,
    stats: StreamStats,
}

struct Shared {
    queue: SerialQueue,
    engine: Mutex<Engine>,
    user_data: Mutex<Option<UserData>>,
}

/// Handle to a stream socket.
///
/// Clones refer to the same socket. The socket is torn down when the last
/// handle is dropped, without a close notification; call
/// [`close`](Self::close) to get one.
#[derive(Clone)]
pub struct StreamSocket {
    shared: Arc<Shared>,
}

#[derive(Clone)]
struct WeakSocket(Weak<Shared>);

impl WeakSocket {
    fn upgrade(&self) -> Option<StreamSocket> {
        self.0.upgrade().map(|shared| StreamSocket { shared })
    }
}

impl StreamSocket {
    /// Create an unconnected socket with default options.
    ///
    /// Notifications are delivered to `delegate` on `delegate_queue`.
    pub fn new(delegate: Weak<dyn StreamDelegate>, delegate_queue: SerialQueue) -> Self {
        Self::with_options(delegate, delegate_queue, SocketOptions::default())
    }

    /// Create an unconnected socket.
    pub fn with_options(delegate: Weak<dyn StreamDelegate>, delegate_queue: SerialQueue, opts: SocketOptions) -> Self {
        Self::build(
            "gantry.stream",
            opts,
            Dispatcher::stream(Some(delegate), delegate_queue),
        )
    }

    fn build(label: &str, opts: SocketOptions, dispatcher: Dispatcher<dyn StreamDelegate>) -> Self {
        let engine = Engine {
            opts,
            state: SocketState::Unconnected,
            dispatcher,
            monitors: Vec::new(),
            desc: Descriptor::None,
            binding: None,
            connect_started: false,
            connect_timeout: None,
            connect_timer: None,
            candidates: SmallVec::new(),
            connecting_to: None,
            last_connect_error: None,
            local: None,
            peer: None,
            reads: VecDeque::new(),
            writes: VecDeque::new(),
            current_read: None,
            current_write: None,
            prebuffer: ByteBuffer::new(),
            read_eof: false,
            close_after_reading: false,
            close_after_writing: false,
            tls: None,
            tls_pending: None,
            tls_requested: false,
            tls_timer: None,
            tls_info: None,
            reads_in_flight: 0,
            writes_in_flight: 0,
            stats: StreamStats::default(),
        };
        Self {
            shared: Arc::new(Shared {
                queue: SerialQueue::new(label),
                engine: Mutex::new(engine),
                user_data: Mutex::new(None),
            }),
        }
    }

    fn from_accepted(
        mut stream: TcpStream,
        peer: SocketAddr,
        opts: SocketOptions,
        dispatcher: Dispatcher<dyn StreamDelegate>,
    ) -> Result<Self> {
        if let Err(e) = tcp::apply(&SockRef::from(&stream), &opts) {
            warn!("[STREAM] Could not apply TCP options to {}: {}", peer, e);
        }
        let sock = Self::build(&format!("gantry.stream.{peer}"), opts, dispatcher);
        let registration = Reactor::global()?.register(
            &mut stream,
            Interest::READABLE | Interest::WRITABLE,
            sock.ready_handler(),
        )?;
        {
            let mut engine = sock.shared.engine.lock();
            engine.local = stream.local_addr().ok();
            engine.peer = Some(peer);
            engine.desc = Descriptor::Stream {
                stream,
                registration,
            };
            engine.connect_started = true;
            engine.state = SocketState::Connected;
        }
        Ok(sock)
    }

    fn downgrade(&self) -> WeakSocket {
        WeakSocket(Arc::downgrade(&self.shared))
    }

    // Read engine state from any thread.
    fn peek<R>(&self, f: impl FnOnce(&Engine) -> R) -> R {
        f(&self.shared.engine.lock())
    }

    // Run `f` against the engine and wait for the result.
    fn exec<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Engine, &StreamSocket) -> R + Send + 'static,
    {
        let me = self.clone();
        self.shared.queue.run_exclusive(move || {
            let mut engine = me.shared.engine.lock();
            f(&mut engine, &me)
        })
    }

    // Run `f` against the engine later.
    fn submit<F>(&self, f: F)
    where
        F: FnOnce(&mut Engine, &StreamSocket) + Send + 'static,
    {
        let me = self.clone();
        self.shared.queue.schedule(move || {
            let mut engine = me.shared.engine.lock();
            f(&mut engine, &me);
        });
    }

    // Run `f` against the engine after `delay`, if the socket still exists.
    fn arm_timer<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce(&mut Engine, &StreamSocket) + Send + 'static,
    {
        let weak = self.downgrade();
        self.shared.queue.schedule_after(delay, move || {
            if let Some(sock) = weak.upgrade() {
                let mut engine = sock.shared.engine.lock();
                f(&mut engine, &sock);
            }
        })
    }

    fn ready_handler(&self) -> ReadyFn {
        let weak = self.downgrade();
        let queue = self.shared.queue.clone();
        Arc::new(move |ready: Readiness| {
            let weak = weak.clone();
            queue.schedule(move || {
                if let Some(sock) = weak.upgrade() {
                    let mut engine = sock.shared.engine.lock();
                    engine.on_ready(&sock, ready);
                }
            });
        })
    }

    /// Replace the delegate and its queue.
    pub fn set_delegate(&self, delegate: Weak<dyn StreamDelegate>, delegate_queue: SerialQueue) {
        let dispatcher = Dispatcher::stream(Some(delegate), delegate_queue);
        self.submit(move |e, _| e.dispatcher = dispatcher);
    }

    /// The current delegate, if one is attached.
    #[must_use]
    pub fn delegate(&self) -> Option<Weak<dyn StreamDelegate>> {
        self.peek(|e| e.dispatcher.delegate())
    }

    /// The queue delegate notifications run on.
    #[must_use]
    pub fn delegate_queue(&self) -> Option<SerialQueue> {
        Some(self.peek(|e| e.dispatcher.queue().clone()))
    }

    /// Subscribe to lifecycle events.
    pub fn monitor(&self) -> SocketMonitor {
        let (tx, rx) = monitor::create_monitor();
        self.submit(move |e, _| e.monitors.push(tx));
        rx
    }

    /// Set the local port (and optionally interface) outgoing connections
    /// bind to. Only valid before connecting, at most once.
    pub fn bind(&self, port: u16, interface: Option<&str>) -> Result<()> {
        let interface = interface.map(str::to_owned);
        self.exec(move |e, _| e.bind(port, interface.as_deref()))?
    }

    /// Connect to an address with no timeout.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.connect_with_timeout(addr, None)
    }

    /// Connect to an address. The timeout bounds the attempt.
    pub fn connect_with_timeout(&self, addr: SocketAddr, timeout: Option<Duration>) -> Result<()> {
        self.exec(move |e, s| e.begin_connect(s, Target::Addr(addr), timeout))?
    }

    /// Resolve `host` and connect to its addresses in preference order.
    ///
    /// The timeout covers resolution and then applies to each candidate
    /// address in turn. Resolution and connect failures arrive through
    /// `closed`; this only fails for misuse.
    pub fn connect_to_host(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<()> {
        let host = host.to_owned();
        self.exec(move |e, s| e.begin_connect(s, Target::Host(host, port), timeout))?
    }

    /// Listen on `port` (0 picks one) and accept connections. Every
    /// accepted connection is announced through `accepted`.
    ///
    /// Without an interface the socket listens on every enabled family.
    pub fn accept_on(&self, port: u16, interface: Option<&str>) -> Result<()> {
        let interface = interface.map(str::to_owned);
        self.exec(move |e, s| e.listen(s, port, interface.as_deref()))?
    }

    /// Queue a read.
    pub fn read(&self, kind: ReadKind, timeout: Option<Duration>, tag: Tag) {
        self.submit(move |e, s| e.enqueue_read(s, ReadOp::new(kind, timeout, tag)));
    }

    /// Read exactly `len` bytes. Zero is a no-op.
    pub fn read_exact(&self, len: usize, timeout: Option<Duration>, tag: Tag) {
        self.read(ReadKind::Exact(len), timeout, tag);
    }

    /// Read up to and including `delimiter`.
    pub fn read_until(&self, delimiter: impl Into<Bytes>, timeout: Option<Duration>, tag: Tag) {
        self.read(ReadKind::delimiter(delimiter), timeout, tag);
    }

    /// Read up to and including `delimiter`, scanning at most `max_length`
    /// bytes.
    pub fn read_until_max(&self, delimiter: impl Into<Bytes>, max_length: usize, timeout: Option<Duration>, tag: Tag) {
        let kind = ReadKind::Delimiter {
            delimiter: delimiter.into(),
            max_length,
        };
        self.read(kind, timeout, tag);
    }

    /// Read whatever is available, at most `max` bytes (0 for no cap).
    pub fn read_up_to(&self, max: usize, timeout: Option<Duration>, tag: Tag) {
        self.read(ReadKind::UpTo(max), timeout, tag);
    }

    /// Queue a write. An empty buffer is a no-op.
    pub fn write(&self, data: impl Into<Bytes>, timeout: Option<Duration>, tag: Tag) {
        let op = WriteOp::new(data.into(), timeout, tag);
        self.submit(move |e, s| e.enqueue_write(s, op));
    }

    /// Queue a TLS upgrade behind every read and write queued so far.
    ///
    /// Misuse (a second upgrade, a listening or closed socket) is reported
    /// here; the upgrade itself is ordered with the queued operations.
    pub fn start_tls(&self, settings: TlsSettings) -> Result<()> {
        self.shared.engine.lock().claim_tls()?;
        self.submit(move |e, s| e.enqueue_tls(s, settings));
        Ok(())
    }

    /// Close now. Queued operations fail with [`GantryError::Closed`].
    pub fn close(&self) {
        self.submit(|e, s| e.close(s, None));
    }

    /// Close once every queued write has completed.
    pub fn close_after_writing(&self) {
        self.submit(|e, s| e.set_close_after(s, false, true));
    }

    /// Close once every queued read has completed.
    pub fn close_after_reading(&self) {
        self.submit(|e, s| e.set_close_after(s, true, false));
    }

    /// Close once every queued read and write has completed.
    pub fn close_after_reading_and_writing(&self) {
        self.submit(|e, s| e.set_close_after(s, true, true));
    }

    #[must_use]
    pub fn state(&self) -> SocketState {
        self.peek(|e| e.state)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SocketState::Closed
    }

    /// True once a TLS handshake has completed.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.peek(|e| e.tls.as_ref().is_some_and(TlsSession::is_established))
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.peek(|e| e.local)
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peek(|e| e.peer)
    }

    /// Every address a listening socket accepts on.
    #[must_use]
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.peek(|e| match &e.desc {
            Descriptor::Listeners(list) => list.iter().map(|l| l.addr).collect(),
            _ => Vec::new(),
        })
    }

    /// What the TLS handshake negotiated.
    #[must_use]
    pub fn tls_info(&self) -> Option<TlsInfo> {
        self.peek(|e| e.tls_info.clone())
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.peek(|e| e.stats)
    }

    /// Run `f` on the socket's queue and wait for it.
    ///
    /// Inside `f` the socket state is stable and [`raw_fd`](Self::raw_fd)
    /// answers.
    pub fn perform<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.shared.queue.run_exclusive(f)
    }

    /// The descriptor, only from inside [`perform`](Self::perform).
    #[cfg(unix)]
    #[must_use]
    pub fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        if !self.shared.queue.is_current() {
            warn!("[STREAM] raw_fd requested outside the socket queue");
            return None;
        }
        let engine = self.shared.engine.lock();
        match &engine.desc {
            Descriptor::Stream { stream, .. } => Some(stream.as_raw_fd()),
            Descriptor::Listeners(list) => list.first().map(|l| l.listener.as_raw_fd()),
            Descriptor::None => None,
        }
    }

    /// Attach an application value to the socket.
    pub fn set_user_data(&self, data: Option<UserData>) {
        *self.shared.user_data.lock() = data;
    }

    #[must_use]
    pub fn user_data(&self) -> Option<UserData> {
        self.shared.user_data.lock().clone()
    }
}

impl fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSocket")
            .field("queue", &self.shared.queue)
            .finish()
    }
}

impl PartialEq for StreamSocket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for StreamSocket {}

fn in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}

fn plain_read(stream: &mut TcpStream, buf: &mut ByteBuffer, max: usize) -> Result<Io> {
    loop {
        return match buf.read_from(stream, max) {
            Ok(0) => Ok(Io::Eof),
            Ok(n) => Ok(Io::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Io::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e.into()),
        };
    }
}

fn plain_write(stream: &mut TcpStream, data: &[u8]) -> Result<Io> {
    loop {
        return match stream.write(data) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => Ok(Io::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Io::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e.into()),
        };
    }
}

impl Engine {
    fn emit(&mut self, event: SocketEvent) {
        monitor::emit(&mut self.monitors, &event);
    }

    fn accepts_ops(&self) -> bool {
        !matches!(self.state, SocketState::Closing | SocketState::Closed)
            && !self.close_after_reading
            && !self.close_after_writing
    }

    // ---- setup -----------------------------------------------------------

    fn bind(&mut self, port: u16, interface: Option<&str>) -> Result<()> {
        if self.state != SocketState::Unconnected || self.connect_started {
            return Err(GantryError::config("bind must happen before connecting"));
        }
        if self.binding.is_some() {
            return Err(GantryError::config("socket is already bound"));
        }
        let binding = LocalBinding::for_interface(interface, port, &self.opts.family_policy())?;
        debug!("[STREAM] Bound to {:?}", binding);
        self.binding = Some(binding);
        Ok(())
    }

    fn begin_connect(&mut self, me: &StreamSocket, target: Target, timeout: Option<Duration>) -> Result<()> {
        if self.state != SocketState::Unconnected || self.connect_started {
            return Err(GantryError::config("socket is already connected or connecting"));
        }
        let policy = self.opts.family_policy();
        policy.validate()?;

        let (host, port) = match target {
            Target::Addr(addr) => return self.connect_literal(me, addr, timeout),
            Target::Host(host, port) => match Resolver::literal(&host, port) {
                Some(addr) => return self.connect_literal(me, addr, timeout),
                None => (host, port),
            },
        };

        self.connect_started = true;
        self.connect_timeout = timeout;
        self.state = SocketState::Resolving;
        debug!("[STREAM] Resolving {}:{}", host, port);
        if let Some(t) = timeout {
            self.connect_timer = Some(me.arm_timer(t, move |e, s| {
                if e.state == SocketState::Resolving {
                    e.close(s, Some(GantryError::ConnectTimeout(t)));
                }
            }));
        }
        let weak = me.downgrade();
        let queue = me.shared.queue.clone();
        Resolver::new(policy).resolve(&host, port, move |result| {
            queue.schedule(move || {
                if let Some(sock) = weak.upgrade() {
                    let mut engine = sock.shared.engine.lock();
                    engine.on_resolved(&sock, result);
                }
            });
        });
        Ok(())
    }

    fn connect_literal(&mut self, me: &StreamSocket, addr: SocketAddr, timeout: Option<Duration>) -> Result<()> {
        let family = Family::of(&addr);
        if !self.opts.family_policy().allows(family) {
            return Err(GantryError::config(format!("{family} is disabled")));
        }
        if self.binding.is_some_and(|b| b.get(family).is_none()) {
            return Err(GantryError::config(format!("bound interface has no {family} address")));
        }
        self.connect_started = true;
        self.connect_timeout = timeout;
        let mut one = Candidates::new();
        one.push(addr);
        self.connect_candidates(me, one);
        Ok(())
    }

    fn on_resolved(&mut self, me: &StreamSocket, result: Result<Candidates>) {
        if self.state != SocketState::Resolving {
            return;
        }
        if let Some(timer) = self.connect_timer.take() {
            timer.cancel();
        }
        match result {
            Ok(candidates) => self.connect_candidates(me, candidates),
            Err(e) => self.close(me, Some(e)),
        }
    }

    fn connect_candidates(&mut self, me: &StreamSocket, mut candidates: Candidates) {
        if let Some(binding) = self.binding {
            candidates.retain(|a| binding.get(Family::of(a)).is_some());
        }
        if candidates.is_empty() {
            let err = GantryError::config("no candidate address matches the bound interface");
            self.close(me, Some(err));
            return;
        }
        candidates.reverse();
        self.candidates = candidates;
        self.try_next_candidate(me);
    }

    fn try_next_candidate(&mut self, me: &StreamSocket) {
        while let Some(addr) = self.candidates.pop() {
            match self.open_candidate(me, addr) {
                Ok(()) => {
                    self.state = SocketState::Connecting;
                    self.connecting_to = Some(addr);
                    if let Some(t) = self.connect_timeout {
                        self.connect_timer = Some(me.arm_timer(t, move |e, s| e.on_connect_timeout(s, addr, t)));
                    }
                    debug!("[STREAM] Connecting to {}", addr);
                    return;
                }
                Err(e) => self.candidate_failed(addr, e),
            }
        }
        let err = self
            .last_connect_error
            .take()
            .unwrap_or_else(|| GantryError::other("no address to connect to"));
        self.close(me, Some(err));
    }

    fn open_candidate(&mut self, me: &StreamSocket, addr: SocketAddr) -> Result<()> {
        let family = Family::of(&addr);
        let socket = Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        if let Some(local) = self.binding.and_then(|b| b.get(family)) {
            if self.opts.reuse_address {
                socket.set_reuse_address(true)?;
            }
            socket.bind(&local.into())?;
        }
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if in_progress(&e) => {}
            Err(e) => return Err(e.into()),
        }
        let mut stream = TcpStream::from_std(socket.into());
        let registration = Reactor::global()?.register(
            &mut stream,
            Interest::READABLE | Interest::WRITABLE,
            me.ready_handler(),
        )?;
        self.desc = Descriptor::Stream {
            stream,
            registration,
        };
        Ok(())
    }

    fn candidate_failed(&mut self, addr: SocketAddr, err: GantryError) {
        debug!("[STREAM] Connect to {} failed: {}", addr, err);
        self.desc.release();
        self.connecting_to = None;
        self.emit(SocketEvent::ConnectFailed {
            addr,
            reason: err.to_string(),
        });
        self.last_connect_error = Some(err);
    }

    fn on_connect_timeout(&mut self, me: &StreamSocket, addr: SocketAddr, after: Duration) {
        if self.state != SocketState::Connecting || self.connecting_to != Some(addr) {
            return;
        }
        self.connect_timer = None;
        self.candidate_failed(addr, GantryError::ConnectTimeout(after));
        self.try_next_candidate(me);
    }

    fn check_connect(&mut self, me: &StreamSocket) {
        let (Some(addr), Some(stream)) = (self.connecting_to, self.desc.stream_mut()) else {
            return;
        };
        let outcome = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match stream.peer_addr() {
                Ok(peer) => Ok(Some(peer)),
                Err(e) if e.kind() == io::ErrorKind::NotConnected || in_progress(&e) => Ok(None),
                Err(e) => Err(e),
            },
        };
        match outcome {
            Ok(None) => {}
            Ok(Some(peer)) => self.did_connect(me, peer),
            Err(e) => {
                if let Some(timer) = self.connect_timer.take() {
                    timer.cancel();
                }
                self.candidate_failed(addr, e.into());
                self.try_next_candidate(me);
            }
        }
    }

    fn did_connect(&mut self, me: &StreamSocket, peer: SocketAddr) {
        if let Some(timer) = self.connect_timer.take() {
            timer.cancel();
        }
        self.candidates.clear();
        self.connecting_to = None;
        self.last_connect_error = None;
        self.state = SocketState::Connected;
        self.peer = Some(peer);
        if let Some(stream) = self.desc.stream_mut() {
            self.local = stream.local_addr().ok();
            if let Err(e) = tcp::apply(&SockRef::from(&*stream), &self.opts) {
                warn!("[STREAM] Could not apply TCP options: {}", e);
            }
        }
        debug!("[STREAM] Connected to {}", peer);
        self.emit(SocketEvent::Connected(peer));
        self.dispatcher.notify(me, move |d, s| d.connected(s, peer));
        self.pump(me);
    }

    fn listen(&mut self, me: &StreamSocket, port: u16, interface: Option<&str>) -> Result<()> {
        if self.state != SocketState::Unconnected || self.connect_started || self.binding.is_some() {
            return Err(GantryError::config("socket is already in use"));
        }
        let binding = LocalBinding::for_interface(interface, port, &self.opts.family_policy())?;
        let reactor = Reactor::global()?;

        let mut listeners = Vec::new();
        let mut first_err = None;
        let mut shared_port = port;
        for mut addr in [binding.v4, binding.v6].into_iter().flatten() {
            if shared_port != 0 {
                addr.set_port(shared_port);
            }
            match self.open_listener(&reactor, me, addr) {
                Ok(l) => {
                    shared_port = l.addr.port();
                    listeners.push(l);
                }
                Err(e) => {
                    // a wildcard listen survives one family being unavailable
                    debug!("[STREAM] Cannot listen on {}: {}", addr, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        if listeners.is_empty() {
            return Err(first_err.unwrap_or_else(|| GantryError::config("no address to listen on")));
        }
        if interface.is_some() {
            if let Some(e) = first_err {
                return Err(e);
            }
        }

        self.local = listeners.first().map(|l| l.addr);
        for l in &listeners {
            debug!("[STREAM] Listening on {}", l.addr);
        }
        let events: Vec<SocketEvent> = listeners.iter().map(|l| SocketEvent::Listening(l.addr)).collect();
        self.desc = Descriptor::Listeners(listeners);
        self.state = SocketState::Listening;
        self.connect_started = true;
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    fn open_listener(&self, reactor: &Arc<Reactor>, me: &StreamSocket, addr: SocketAddr) -> Result<Listener> {
        let family = Family::of(&addr);
        let socket = Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))?;
        if family == Family::V6 {
            socket.set_only_v6(true)?;
        }
        if self.opts.reuse_address {
            socket.set_reuse_address(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let std_listener: std::net::TcpListener = socket.into();
        let mut listener = TcpListener::from_std(std_listener);
        let bound = listener.local_addr()?;
        let registration = reactor.register(&mut listener, Interest::READABLE, me.ready_handler())?;
        Ok(Listener {
            listener,
            registration,
            addr: bound,
        })
    }

    fn accept_pending(&mut self, me: &StreamSocket) {
        let Descriptor::Listeners(listeners) = &mut self.desc else {
            return;
        };
        let mut accepted = Vec::new();
        let mut more = false;
        for l in listeners.iter_mut() {
            let mut budget = ACCEPT_BATCH;
            loop {
                if budget == 0 {
                    more = true;
                    break;
                }
                match l.listener.accept() {
                    Ok(conn) => {
                        budget -= 1;
                        accepted.push(conn);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!("[STREAM] Accept on {} failed: {}", l.addr, e);
                        break;
                    }
                }
            }
        }

        for (stream, peer) in accepted {
            match StreamSocket::from_accepted(stream, peer, self.opts.clone(), self.dispatcher.clone()) {
                Ok(child) => {
                    debug!("[STREAM] Accepted {}", peer);
                    self.emit(SocketEvent::Accepted(peer));
                    self.dispatcher.notify(me, move |d, s| d.accepted(s, child));
                }
                Err(e) => warn!("[STREAM] Dropping connection from {}: {}", peer, e),
            }
        }
        if more {
            // the readiness edge is spent; come back for the rest
            me.submit(|e, s| e.accept_pending(s));
        }
    }

    fn on_ready(&mut self, me: &StreamSocket, ready: Readiness) {
        trace!(
            "[STREAM] Ready in {:?}: readable={} writable={} read_closed={} error={}",
            self.state,
            ready.readable,
            ready.writable,
            ready.read_closed,
            ready.error
        );
        match self.state {
            SocketState::Connecting => self.check_connect(me),
            SocketState::Listening => self.accept_pending(me),
            SocketState::Connected => self.pump(me),
            _ => {}
        }
    }

    // ---- queueing --------------------------------------------------------

    fn enqueue_read(&mut self, me: &StreamSocket, mut op: ReadOp) {
        if op.is_trivial() {
            trace!("[STREAM] Ignoring zero-length read (tag {})", op.tag);
            return;
        }
        let tag = op.tag;
        if let ReadKind::Delimiter { delimiter, .. } = &op.kind {
            if delimiter.is_empty() {
                let err = GantryError::config("delimiter must not be empty");
                self.dispatcher.notify(me, move |d, s| d.read_failed(s, tag, &err));
                return;
            }
        }
        if self.state == SocketState::Listening {
            let err = GantryError::config("cannot read from a listening socket");
            self.dispatcher.notify(me, move |d, s| d.read_failed(s, tag, &err));
            return;
        }
        if !self.accepts_ops() {
            self.dispatcher
                .notify(me, move |d, s| d.read_failed(s, tag, &GantryError::Closed));
            return;
        }
        if let Some(t) = op.timeout {
            let id = op.id;
            op.timer = Some(me.arm_timer(t, move |e, s| e.on_timeout(s, Direction::Read, id)));
        }
        self.reads.push_back(Queued::Op(op));
        self.pump(me);
    }

    fn enqueue_write(&mut self, me: &StreamSocket, mut op: WriteOp) {
        if op.is_empty() {
            trace!("[STREAM] Ignoring empty write (tag {})", op.tag);
            return;
        }
        let tag = op.tag;
        if self.state == SocketState::Listening {
            let err = GantryError::config("cannot write to a listening socket");
            self.dispatcher.notify(me, move |d, s| d.write_failed(s, tag, &err));
            return;
        }
        if !self.accepts_ops() {
            self.dispatcher
                .notify(me, move |d, s| d.write_failed(s, tag, &GantryError::Closed));
            return;
        }
        if let Some(t) = op.timeout {
            let id = op.id;
            op.timer = Some(me.arm_timer(t, move |e, s| e.on_timeout(s, Direction::Write, id)));
        }
        self.writes.push_back(Queued::Op(op));
        self.pump(me);
    }

    fn claim_tls(&mut self) -> Result<()> {
        if self.tls_requested {
            return Err(GantryError::config("TLS was already started on this socket"));
        }
        match self.state {
            SocketState::Listening => return Err(GantryError::config("cannot start TLS on a listening socket")),
            SocketState::Closing | SocketState::Closed => return Err(GantryError::Closed),
            _ => {}
        }
        self.tls_requested = true;
        Ok(())
    }

    fn enqueue_tls(&mut self, me: &StreamSocket, settings: TlsSettings) {
        if matches!(self.state, SocketState::Closing | SocketState::Closed) {
            debug!("[STREAM] Socket closed before TLS could be queued");
            return;
        }
        self.tls_pending = Some(settings);
        self.reads.push_back(Queued::StartTls);
        self.writes.push_back(Queued::StartTls);
        self.pump(me);
    }

    // ---- progress --------------------------------------------------------

    fn handshaking(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| !t.is_established())
    }

    fn pump(&mut self, me: &StreamSocket) {
        if self.state != SocketState::Connected {
            return;
        }
        if self.handshaking() {
            self.continue_handshake(me);
            return;
        }
        self.do_writes(me);
        if self.state != SocketState::Connected {
            return;
        }
        self.do_reads(me);
        if self.state != SocketState::Connected {
            return;
        }
        if self.try_begin_tls(me) {
            return;
        }
        self.check_close_after(me);
    }

    fn do_writes(&mut self, me: &StreamSocket) {
        loop {
            if self.current_write.is_none() {
                if !matches!(self.writes.front(), Some(Queued::Op(_))) {
                    return;
                }
                if let Some(Queued::Op(op)) = self.writes.pop_front() {
                    self.writes_in_flight += 1;
                    self.stats.peak_writes_in_flight = self.stats.peak_writes_in_flight.max(self.writes_in_flight);
                    trace!("[STREAM] Write {} started ({} bytes)", op.tag, op.len());
                    self.current_write = Some(op);
                }
            }
            let (Some(op), Some(stream)) = (self.current_write.as_mut(), self.desc.stream_mut()) else {
                return;
            };

            let mut blocked = false;
            if !op.is_done() {
                let len = op.remaining().len().min(MAX_WRITE_CHUNK);
                let chunk = &op.remaining()[..len];
                let result = match self.tls.as_mut() {
                    Some(tls) => tls.write(stream, chunk),
                    None => plain_write(stream, chunk),
                };
                match result {
                    Ok(Io::Done(n)) => {
                        op.advance(n);
                        self.stats.bytes_written += n as u64;
                        trace!("[STREAM] Wrote {} bytes", n);
                        if !op.is_done() && self.dispatcher.capabilities().write_progress {
                            let tag = op.tag;
                            self.dispatcher.notify(me, move |d, s| d.write_progress(s, n, tag));
                        }
                    }
                    Ok(Io::Blocked | Io::Eof) => blocked = true,
                    Err(e) => {
                        self.close(me, Some(e));
                        return;
                    }
                }
            }

            if op.is_done() {
                let flushed = match self.tls.as_mut() {
                    Some(tls) => tls.flush(stream),
                    None => Ok(true),
                };
                match flushed {
                    Ok(true) => {
                        self.finish_write(me, None);
                        continue;
                    }
                    Ok(false) => return,
                    Err(e) => {
                        self.close(me, Some(e));
                        return;
                    }
                }
            }
            if blocked {
                return;
            }
        }
    }

    fn do_reads(&mut self, me: &StreamSocket) {
        loop {
            if self.current_read.is_none() && matches!(self.reads.front(), Some(Queued::Op(_))) {
                if let Some(Queued::Op(op)) = self.reads.pop_front() {
                    self.reads_in_flight += 1;
                    self.stats.peak_reads_in_flight = self.stats.peak_reads_in_flight.max(self.reads_in_flight);
                    trace!("[STREAM] Read {} started ({:?})", op.tag, op.kind);
                    self.current_read = Some(op);
                }
            }

            let mut chunk = self.opts.read_chunk_size;
            if let Some(op) = self.current_read.as_mut() {
                let before = op.bytes_done();
                match op.absorb(&mut self.prebuffer) {
                    ReadProgress::Done(data) => {
                        self.finish_read(me, Ok(data));
                        continue;
                    }
                    ReadProgress::MaxedOut { max } => {
                        self.finish_read(me, Err(GantryError::ReadMaxedOut { max }));
                        continue;
                    }
                    ReadProgress::NeedMore { wanted } => {
                        if let Some(w) = wanted.filter(|w| *w > 0) {
                            chunk = chunk.min(w);
                        }
                        let gained = op.bytes_done().saturating_sub(before);
                        if gained > 0 && self.dispatcher.capabilities().read_progress {
                            let tag = op.tag;
                            self.dispatcher.notify(me, move |d, s| d.read_progress(s, gained, tag));
                        }
                    }
                }
            } else if self.prebuffer.len() >= self.opts.max_prebuffer {
                return;
            }

            if self.read_eof {
                self.handle_eof(me);
                return;
            }

            let Some(stream) = self.desc.stream_mut() else {
                return;
            };
            let result = match self.tls.as_mut() {
                Some(tls) => tls.read_into(stream, &mut self.prebuffer, chunk),
                None => plain_read(stream, &mut self.prebuffer, chunk),
            };
            match result {
                Ok(Io::Done(n)) => {
                    self.stats.bytes_read += n as u64;
                    trace!("[STREAM] Read {} bytes", n);
                }
                Ok(Io::Eof) => {
                    debug!("[STREAM] Peer finished sending");
                    self.read_eof = true;
                }
                Ok(Io::Blocked) => return,
                Err(e) => {
                    self.close(me, Some(e));
                    return;
                }
            }
        }
    }

    fn handle_eof(&mut self, me: &StreamSocket) {
        // Buffered bytes stay readable until no read can use them.
        if self.current_read.is_some() || self.prebuffer.is_empty() {
            self.close(me, Some(GantryError::PeerClosed));
        }
    }

    fn finish_read(&mut self, me: &StreamSocket, outcome: Result<Bytes>) {
        let Some(mut op) = self.current_read.take() else {
            return;
        };
        op.disarm();
        self.reads_in_flight -= 1;
        let tag = op.tag;
        match outcome {
            Ok(data) => {
                self.stats.reads_completed += 1;
                trace!("[STREAM] Read {} complete ({} bytes)", tag, data.len());
                self.dispatcher.notify(me, move |d, s| d.read_complete(s, data, tag));
            }
            Err(err) => {
                op.unwind_into(&mut self.prebuffer);
                debug!("[STREAM] Read {} failed: {}", tag, err);
                self.dispatcher.notify(me, move |d, s| d.read_failed(s, tag, &err));
            }
        }
    }

    fn finish_write(&mut self, me: &StreamSocket, err: Option<GantryError>) {
        let Some(mut op) = self.current_write.take() else {
            return;
        };
        op.disarm();
        self.writes_in_flight -= 1;
        let tag = op.tag;
        match err {
            None => {
                self.stats.writes_completed += 1;
                trace!("[STREAM] Write {} complete", tag);
                self.dispatcher.notify(me, move |d, s| d.write_complete(s, tag));
            }
            Some(err) => {
                debug!("[STREAM] Write {} failed: {}", tag, err);
                self.dispatcher.notify(me, move |d, s| d.write_failed(s, tag, &err));
            }
        }
    }

    // ---- TLS -------------------------------------------------------------

    fn try_begin_tls(&mut self, me: &StreamSocket) -> bool {
        let ready = self.current_read.is_none()
            && self.current_write.is_none()
            && matches!(self.reads.front(), Some(Queued::StartTls))
            && matches!(self.writes.front(), Some(Queued::StartTls));
        if !ready {
            return false;
        }
        self.reads.pop_front();
        self.writes.pop_front();
        let Some(settings) = self.tls_pending.take() else {
            return false;
        };

        let mut session = match TlsSession::new(&settings) {
            Ok(session) => session,
            Err(e) => {
                self.close(me, Some(e));
                return true;
            }
        };
        // Anything read ahead so far is the peer's first handshake flight.
        let early = self.prebuffer.take_all();
        if let Err(e) = session.feed(&early) {
            self.close(me, Some(e));
            return true;
        }
        debug!(
            "[TLS] Starting {} handshake",
            if settings.is_server() { "server" } else { "client" }
        );
        if let Some(t) = settings.handshake_timeout {
            self.tls_timer = Some(me.arm_timer(t, |e, s| {
                if e.handshaking() {
                    e.close(s, Some(GantryError::security("TLS handshake timed out")));
                }
            }));
        }
        self.tls = Some(session);
        self.continue_handshake(me);
        true
    }

    fn continue_handshake(&mut self, me: &StreamSocket) {
        let (Some(tls), Some(stream)) = (self.tls.as_mut(), self.desc.stream_mut()) else {
            return;
        };
        match tls.handshake(stream) {
            Ok(HandshakePhase::Established) => {
                if let Some(timer) = self.tls_timer.take() {
                    timer.cancel();
                }
                let info = tls.info();
                debug!("[TLS] Secured ({:?}, {:?})", info.protocol_version, info.cipher_suite);
                self.tls_info = Some(info.clone());
                self.emit(SocketEvent::Secured);
                self.dispatcher.notify(me, move |d, s| d.secured(s, &info));
                self.pump(me);
            }
            Ok(_) => {}
            Err(e) => {
                let err = match e {
                    GantryError::Security(_) => e,
                    other => GantryError::security(format!("handshake failed: {other}")),
                };
                self.close(me, Some(err));
            }
        }
    }

    // ---- timeouts --------------------------------------------------------

    fn op_info(&self, dir: Direction, id: u64) -> Option<(Tag, Duration, usize)> {
        match dir {
            Direction::Read => self
                .current_read
                .iter()
                .chain(self.reads.iter().filter_map(|q| match q {
                    Queued::Op(op) => Some(op),
                    Queued::StartTls => None,
                }))
                .find(|op| op.id == id)
                .map(|op| (op.tag, op.queued_at.elapsed(), op.bytes_done())),
            Direction::Write => self
                .current_write
                .iter()
                .chain(self.writes.iter().filter_map(|q| match q {
                    Queued::Op(op) => Some(op),
                    Queued::StartTls => None,
                }))
                .find(|op| op.id == id)
                .map(|op| (op.tag, op.queued_at.elapsed(), op.bytes_done())),
        }
    }

    fn on_timeout(&mut self, me: &StreamSocket, dir: Direction, id: u64) {
        let Some((tag, elapsed, done)) = self.op_info(dir, id) else {
            return;
        };
        if !self.dispatcher.capabilities().extend_timeouts {
            self.expire(me, dir, id, None);
            return;
        }
        let weak = me.downgrade();
        let queue = me.shared.queue.clone();
        self.dispatcher.ask(
            me,
            move |d, s| match dir {
                Direction::Read => d.extend_read_timeout(s, tag, elapsed, done),
                Direction::Write => d.extend_write_timeout(s, tag, elapsed, done),
            },
            move |answer| {
                queue.schedule(move || {
                    if let Some(sock) = weak.upgrade() {
                        let mut engine = sock.shared.engine.lock();
                        engine.expire(&sock, dir, id, answer.flatten());
                    }
                });
            },
        );
    }

    fn expire(&mut self, me: &StreamSocket, dir: Direction, id: u64, extension: Option<Duration>) {
        if self.op_info(dir, id).is_none() || self.state == SocketState::Closed {
            return;
        }
        if let Some(extra) = extension.filter(|d| !d.is_zero()) {
            let timer = me.arm_timer(extra, move |e, s| e.on_timeout(s, dir, id));
            trace!("[STREAM] Timeout of op {} extended by {:?}", id, extra);
            match dir {
                Direction::Read => {
                    if let Some(op) = self.find_read(id) {
                        op.timeout = op.timeout.map(|t| t + extra);
                        op.timer = Some(timer);
                    }
                }
                Direction::Write => {
                    if let Some(op) = self.find_write(id) {
                        op.timeout = op.timeout.map(|t| t + extra);
                        op.timer = Some(timer);
                    }
                }
            }
            return;
        }

        match dir {
            Direction::Read => {
                let waited = self.find_read(id).and_then(|op| op.timeout).unwrap_or_default();
                let err = GantryError::ReadTimeout(waited);
                if self.current_read.as_ref().is_some_and(|op| op.id == id) {
                    self.finish_read(me, Err(err.clone()));
                } else if let Some(pos) = self.queued_read_pos(id) {
                    if let Some(Queued::Op(mut op)) = self.reads.remove(pos) {
                        op.disarm();
                        let tag = op.tag;
                        let err = err.clone();
                        self.dispatcher.notify(me, move |d, s| d.read_failed(s, tag, &err));
                    }
                }
                self.after_timeout(me, err);
            }
            Direction::Write => {
                let waited = self.find_write(id).and_then(|op| op.timeout).unwrap_or_default();
                let err = GantryError::WriteTimeout(waited);
                if self.current_write.as_ref().is_some_and(|op| op.id == id) {
                    self.finish_write(me, Some(err.clone()));
                } else if let Some(pos) = self.queued_write_pos(id) {
                    if let Some(Queued::Op(mut op)) = self.writes.remove(pos) {
                        op.disarm();
                        let tag = op.tag;
                        let err = err.clone();
                        self.dispatcher.notify(me, move |d, s| d.write_failed(s, tag, &err));
                    }
                }
                self.after_timeout(me, err);
            }
        }
    }

    fn after_timeout(&mut self, me: &StreamSocket, err: GantryError) {
        if self.opts.close_on_timeout {
            self.close(me, Some(err));
        } else {
            self.pump(me);
        }
    }

    fn find_read(&mut self, id: u64) -> Option<&mut ReadOp> {
        if self.current_read.as_ref().is_some_and(|op| op.id == id) {
            return self.current_read.as_mut();
        }
        self.reads.iter_mut().find_map(|q| match q {
            Queued::Op(op) if op.id == id => Some(op),
            _ => None,
        })
    }

    fn find_write(&mut self, id: u64) -> Option<&mut WriteOp> {
        if self.current_write.as_ref().is_some_and(|op| op.id == id) {
            return self.current_write.as_mut();
        }
        self.writes.iter_mut().find_map(|q| match q {
            Queued::Op(op) if op.id == id => Some(op),
            _ => None,
        })
    }

    fn queued_read_pos(&self, id: u64) -> Option<usize> {
        self.reads
            .iter()
            .position(|q| matches!(q, Queued::Op(op) if op.id == id))
    }

    fn queued_write_pos(&self, id: u64) -> Option<usize> {
        self.writes
            .iter()
            .position(|q| matches!(q, Queued::Op(op) if op.id == id))
    }

    // ---- closing ---------------------------------------------------------

    fn set_close_after(&mut self, me: &StreamSocket, reading: bool, writing: bool) {
        if matches!(self.state, SocketState::Closing | SocketState::Closed) {
            return;
        }
        self.close_after_reading |= reading;
        self.close_after_writing |= writing;
        self.check_close_after(me);
    }

    fn check_close_after(&mut self, me: &StreamSocket) {
        if !self.close_after_reading && !self.close_after_writing {
            return;
        }
        if self.state == SocketState::Listening {
            self.close(me, None);
            return;
        }
        let reads_done = self.current_read.is_none() && self.reads.is_empty();
        let writes_done = self.current_write.is_none() && self.writes.is_empty() && !self.handshaking();
        let done = match (self.close_after_reading, self.close_after_writing) {
            (true, true) => reads_done && writes_done,
            (true, false) => reads_done,
            _ => writes_done,
        };
        if done {
            self.close(me, None);
        }
    }

    /// Tear the socket down. Every pending operation fails, in the order it
    /// was queued, before the single close notification.
    fn close(&mut self, me: &StreamSocket, err: Option<GantryError>) {
        if matches!(self.state, SocketState::Closing | SocketState::Closed) {
            return;
        }
        let previous = self.state;
        self.state = SocketState::Closing;
        for timer in [self.connect_timer.take(), self.tls_timer.take()].into_iter().flatten() {
            timer.cancel();
        }

        // In-flight operations report what killed the connection.
        let in_flight = err.clone().unwrap_or(GantryError::Closed);
        let mut failed: Vec<(u64, Direction, Tag, GantryError)> = Vec::new();
        if let Some(mut op) = self.current_read.take() {
            op.disarm();
            failed.push((op.id, Direction::Read, op.tag, in_flight.clone()));
        }
        if let Some(mut op) = self.current_write.take() {
            op.disarm();
            failed.push((op.id, Direction::Write, op.tag, in_flight));
        }
        for q in self.reads.drain(..) {
            if let Queued::Op(mut op) = q {
                op.disarm();
                failed.push((op.id, Direction::Read, op.tag, GantryError::Closed));
            }
        }
        for q in self.writes.drain(..) {
            if let Queued::Op(mut op) = q {
                op.disarm();
                failed.push((op.id, Direction::Write, op.tag, GantryError::Closed));
            }
        }
        failed.sort_by_key(|(id, ..)| *id);
        for (_, dir, tag, e) in failed {
            match dir {
                Direction::Read => self.dispatcher.notify(me, move |d, s| d.read_failed(s, tag, &e)),
                Direction::Write => self.dispatcher.notify(me, move |d, s| d.write_failed(s, tag, &e)),
            }
        }

        if err.is_none() {
            if let (Some(tls), Some(stream)) = (self.tls.as_mut(), self.desc.stream_mut()) {
                if tls.is_established() {
                    tls.send_close_notify();
                    let _ = tls.flush(stream);
                }
            }
        }
        self.desc.release();
        self.tls = None;
        self.tls_pending = None;
        self.prebuffer.clear();
        self.candidates.clear();
        self.reads_in_flight = 0;
        self.writes_in_flight = 0;
        self.state = SocketState::Closed;

        match &err {
            Some(e) => debug!("[STREAM] Closed from {:?}: {}", previous, e),
            None => debug!("[STREAM] Closed from {:?}", previous),
        }
        self.emit(SocketEvent::Closed {
            reason: err.as_ref().map(ToString::to_string),
        });
        self.dispatcher.notify(me, move |d, s| d.closed(s, err.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::Capabilities;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Connected,
        Read(Tag, Vec<u8>),
        ReadFailed(Tag, String),
        Written(Tag),
        WriteFailed(Tag, String),
        Closed(Option<String>),
    }

    struct Recorder {
        tx: flume::Sender<Event>,
    }

    impl StreamDelegate for Recorder {
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        fn connected(&self, _: &StreamSocket, _: SocketAddr) {
            let _ = self.tx.send(Event::Connected);
        }
        fn read_complete(&self, _: &StreamSocket, data: Bytes, tag: Tag) {
            let _ = self.tx.send(Event::Read(tag, data.to_vec()));
        }
        fn read_failed(&self, _: &StreamSocket, tag: Tag, err: &GantryError) {
            let _ = self.tx.send(Event::ReadFailed(tag, err.to_string()));
        }
        fn write_complete(&self, _: &StreamSocket, tag: Tag) {
            let _ = self.tx.send(Event::Written(tag));
        }
        fn write_failed(&self, _: &StreamSocket, tag: Tag, err: &GantryError) {
            let _ = self.tx.send(Event::WriteFailed(tag, err.to_string()));
        }
        fn closed(&self, _: &StreamSocket, err: Option<&GantryError>) {
            let _ = self.tx.send(Event::Closed(err.map(ToString::to_string)));
        }
    }

    fn recorder() -> (Arc<dyn StreamDelegate>, flume::Receiver<Event>) {
        let (tx, rx) = flume::unbounded();
        (Arc::new(Recorder { tx }), rx)
    }

    fn next(rx: &flume::Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5)).expect("event")
    }

    #[test]
    fn test_bind_rules() {
        let (delegate, _rx) = recorder();
        let sock = StreamSocket::new(Arc::downgrade(&delegate), SerialQueue::new("d"));
        sock.bind(0, Some("localhost")).unwrap();
        assert!(matches!(sock.bind(0, None), Err(GantryError::Config(_))));
        assert!(matches!(sock.accept_on(0, None), Err(GantryError::Config(_))));
    }

    #[test]
    fn test_close_fails_queued_ops_in_order() {
        let (delegate, rx) = recorder();
        let sock = StreamSocket::new(Arc::downgrade(&delegate), SerialQueue::new("d"));
        sock.read_exact(4, None, 1);
        sock.write(&b"hi"[..], None, 2);
        sock.read_up_to(0, None, 3);
        sock.close();
        assert_eq!(next(&rx), Event::ReadFailed(1, "Socket closed".into()));
        assert_eq!(next(&rx), Event::WriteFailed(2, "Socket closed".into()));
        assert_eq!(next(&rx), Event::ReadFailed(3, "Socket closed".into()));
        assert_eq!(next(&rx), Event::Closed(None));
        assert!(sock.is_closed());
    }

    #[test]
    fn test_connect_only_once() {
        let (delegate, rx) = recorder();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = StreamSocket::new(Arc::downgrade(&delegate), SerialQueue::new("d"));
        sock.connect(addr).unwrap();
        assert!(matches!(sock.connect(addr), Err(GantryError::Config(_))));
        assert!(matches!(sock.bind(0, None), Err(GantryError::Config(_))));
        assert_eq!(next(&rx), Event::Connected);
        assert_eq!(sock.peer_addr(), Some(addr));
        sock.close();
    }

    #[test]
    fn test_connect_refused_reports_close_error() {
        let (delegate, rx) = recorder();
        // Grab a free port, then release it so nothing listens there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let sock = StreamSocket::new(Arc::downgrade(&delegate), SerialQueue::new("d"));
        sock.connect(SocketAddr::from(([127, 0, 0, 1], port))).unwrap();
        match next(&rx) {
            Event::Closed(Some(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_raw_fd_only_inside_queue() {
        let (delegate, _rx) = recorder();
        let sock = StreamSocket::new(Arc::downgrade(&delegate), SerialQueue::new("d"));
        sock.accept_on(0, Some("127.0.0.1")).unwrap();
        assert_eq!(sock.raw_fd(), None);
        let inner = sock.clone();
        let fd = sock.perform(move || inner.raw_fd()).unwrap();
        assert!(fd.is_some());
        sock.close();
    }
}
