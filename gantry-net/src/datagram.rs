//! Datagram (UDP) socket engine.
//!
//! There is no read queue. Once receiving is switched on, every inbound
//! datagram is read, passed through the optional receive filter on the
//! socket's filter queue, and handed to the delegate. Sends (and a queued
//! connect) sit in one FIFO and go out one at a time.
//!
//! An unbound socket opens one descriptor per enabled family on first use,
//! so it can talk to both IPv4 and IPv6 peers. `connect` commits it to the
//! peer's family and releases the other descriptor.

use bytes::Bytes;
use mio::net::UdpSocket;
use mio::Interest;
use socket2::{Protocol, Socket, Type};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

use gantry_core::addr::{Candidates, Family, LocalBinding};
use gantry_core::error::{GantryError, Result};
use gantry_core::options::SocketOptions;
use gantry_core::queue::SerialQueue;
use gantry_core::reactor::{Reactor, Readiness, ReadyFn, Registration};
use gantry_core::resolve::Resolver;
use gantry_core::timer::TimerHandle;
use parking_lot::Mutex;

use crate::delegate::{DatagramDelegate, Dispatcher, Filtered, ReceiveFilter};
use crate::monitor::{self, SocketEvent, SocketEventSender, SocketMonitor};
use crate::op::{next_op_id, Tag};
use crate::stream::UserData;

/// Lifecycle of a datagram socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramState {
    /// No descriptor yet.
    Unbound,
    /// Descriptor(s) open, no fixed peer.
    Bound,
    Connected,
    Closed,
}

/// Instrumentation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatagramStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Highest number of sends ever progressing at once.
    pub peak_sends_in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveMode {
    Paused,
    Once,
    Continuous,
}

#[derive(Debug, Clone)]
enum Dest {
    Connected,
    Addr(SocketAddr),
    Host(String, u16),
}

impl fmt::Display for Dest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected peer"),
            Self::Addr(addr) => write!(f, "{addr}"),
            Self::Host(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

struct SendOp {
    id: u64,
    tag: Tag,
    data: Bytes,
    dest: Dest,
    resolved: Option<SocketAddr>,
    resolving: bool,
    timeout: Option<Duration>,
    timer: Option<TimerHandle>,
}

impl SendOp {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

enum Entry {
    Send(SendOp),
    Connect(Dest),
}

struct Endpoint {
    socket: UdpSocket,
    registration: Registration,
    local: SocketAddr,
}

impl Endpoint {
    fn release(mut self) {
        if let Err(e) = self.registration.deregister(&mut self.socket) {
            trace!("[UDP] Deregister failed: {}", e);
        }
    }
}

struct Engine {
    opts: SocketOptions,
    state: DatagramState,
    dispatcher: Dispatcher<dyn DatagramDelegate>,
    monitors: Vec<SocketEventSender>,

    v4: Option<Endpoint>,
    v6: Option<Endpoint>,
    peer: Option<SocketAddr>,
    connect_requested: bool,
    connect_resolving: bool,

    sends: VecDeque<Entry>,
    current: Option<SendOp>,
    close_after_sending: bool,

    receive: ReceiveMode,
    awaiting_verdict: bool,
    filter: Option<ReceiveFilter>,
    scratch: Vec<u8>,

    sends_in_flight: usize,
    stats: DatagramStats,
}

struct Shared {
    queue: SerialQueue,
    filter_queue: SerialQueue,
    engine: Mutex<Engine>,
    // bumped on pause and close so filtered datagrams in transit are dropped
    receive_epoch: AtomicU64,
    user_data: Mutex<Option<UserData>>,
}

/// Handle to a datagram socket.
#[derive(Clone)]
pub struct DatagramSocket {
    shared: Arc<Shared>,
}

#[derive(Clone)]
struct WeakSocket(Weak<Shared>);

impl WeakSocket {
    fn upgrade(&self) -> Option<DatagramSocket> {
        self.0.upgrade().map(|shared| DatagramSocket { shared })
    }
}

impl DatagramSocket {
    pub fn new(delegate: Weak<dyn DatagramDelegate>, delegate_queue: SerialQueue) -> Self {
        Self::with_options(delegate, delegate_queue, SocketOptions::default())
    }

    pub fn with_options(delegate: Weak<dyn DatagramDelegate>, delegate_queue: SerialQueue, opts: SocketOptions) -> Self {
        let engine = Engine {
            opts,
            state: DatagramState::Unbound,
            dispatcher: Dispatcher::new(Some(delegate), delegate_queue),
            monitors: Vec::new(),
            v4: None,
            v6: None,
            peer: None,
            connect_requested: false,
            connect_resolving: false,
            sends: VecDeque::new(),
            current: None,
            close_after_sending: false,
            receive: ReceiveMode::Paused,
            awaiting_verdict: false,
            filter: None,
            scratch: Vec::new(),
            sends_in_flight: 0,
            stats: DatagramStats::default(),
        };
        Self {
            shared: Arc::new(Shared {
                queue: SerialQueue::new("gantry.udp"),
                filter_queue: SerialQueue::new("gantry.udp.filter"),
                engine: Mutex::new(engine),
                receive_epoch: AtomicU64::new(0),
                user_data: Mutex::new(None),
            }),
        }
    }

    fn downgrade(&self) -> WeakSocket {
        WeakSocket(Arc::downgrade(&self.shared))
    }

    // Read engine state from any thread.
    fn peek<R>(&self, f: impl FnOnce(&Engine) -> R) -> R {
        f(&self.shared.engine.lock())
    }

    fn exec<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Engine, &DatagramSocket) -> R + Send + 'static,
    {
        let me = self.clone();
        self.shared.queue.run_exclusive(move || {
            let mut engine = me.shared.engine.lock();
            f(&mut engine, &me)
        })
    }

    fn submit<F>(&self, f: F)
    where
        F: FnOnce(&mut Engine, &DatagramSocket) + Send + 'static,
    {
        let me = self.clone();
        self.shared.queue.schedule(move || {
            let mut engine = me.shared.engine.lock();
            f(&mut engine, &me);
        });
    }

    fn arm_timer<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce(&mut Engine, &DatagramSocket) + Send + 'static,
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

    fn epoch(&self) -> u64 {
        self.shared.receive_epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.shared.receive_epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_delegate(&self, delegate: Weak<dyn DatagramDelegate>, delegate_queue: SerialQueue) {
        let dispatcher = Dispatcher::new(Some(delegate), delegate_queue);
        self.submit(move |e, _| e.dispatcher = dispatcher);
    }

    /// Subscribe to lifecycle events.
    pub fn monitor(&self) -> SocketMonitor {
        let (tx, rx) = monitor::create_monitor();
        self.submit(move |e, _| e.monitors.push(tx));
        rx
    }

    /// Bind to `port` on `interface` (every enabled family when `None`).
    pub fn bind(&self, port: u16, interface: Option<&str>) -> Result<()> {
        let interface = interface.map(str::to_owned);
        self.exec(move |e, s| {
            let binding = LocalBinding::for_interface(interface.as_deref(), port, &e.opts.family_policy())?;
            e.bind(s, binding, interface.is_none())
        })?
    }

    /// Bind to one explicit local address.
    pub fn bind_to_addr(&self, addr: SocketAddr) -> Result<()> {
        self.exec(move |e, s| {
            let family = Family::of(&addr);
            if !e.opts.family_policy().allows(family) {
                return Err(GantryError::config(format!("{family} is disabled")));
            }
            e.bind(s, LocalBinding::for_addr(addr), false)
        })?
    }

    /// Queue a connect to `addr`, ordered with sends.
    ///
    /// The outcome arrives as `connected` or `connect_failed`. This only
    /// fails for misuse.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.exec(move |e, s| e.enqueue_connect(s, Dest::Addr(addr)))?
    }

    /// Queue a connect to the preferred address of `host`.
    pub fn connect_to_host(&self, host: &str, port: u16) -> Result<()> {
        let host = host.to_owned();
        self.exec(move |e, s| e.enqueue_connect(s, Dest::Host(host, port)))?
    }

    /// Send to the connected peer.
    pub fn send(&self, data: impl Into<Bytes>, timeout: Option<Duration>, tag: Tag) {
        self.enqueue(data.into(), Dest::Connected, timeout, tag);
    }

    /// Send to `addr`. Fails at dequeue with a configuration error if the
    /// socket is connected, even to `addr` itself.
    pub fn send_to(&self, data: impl Into<Bytes>, addr: SocketAddr, timeout: Option<Duration>, tag: Tag) {
        self.enqueue(data.into(), Dest::Addr(addr), timeout, tag);
    }

    /// Send to `host`, resolved for this packet only.
    pub fn send_to_host(&self, data: impl Into<Bytes>, host: &str, port: u16, timeout: Option<Duration>, tag: Tag) {
        self.enqueue(data.into(), Dest::Host(host.to_owned(), port), timeout, tag);
    }

    fn enqueue(&self, data: Bytes, dest: Dest, timeout: Option<Duration>, tag: Tag) {
        let op = SendOp {
            id: next_op_id(),
            tag,
            data,
            dest,
            resolved: None,
            resolving: false,
            timeout,
            timer: None,
        };
        self.submit(move |e, s| e.enqueue_send(s, op));
    }

    /// Install or remove the receive filter. It runs on the socket's filter
    /// queue before anything reaches the delegate.
    pub fn set_receive_filter(&self, filter: Option<ReceiveFilter>) {
        self.submit(move |e, _| e.filter = filter);
    }

    /// Deliver every inbound datagram until paused.
    pub fn begin_receiving(&self) -> Result<()> {
        self.exec(|e, s| e.start_receiving(s, ReceiveMode::Continuous))?
    }

    /// Deliver the next datagram that passes the filter, then pause.
    pub fn receive_once(&self) -> Result<()> {
        self.exec(|e, s| e.start_receiving(s, ReceiveMode::Once))?
    }

    /// Stop delivering datagrams. The socket stays open.
    pub fn pause_receiving(&self) {
        self.submit(|e, s| {
            e.receive = ReceiveMode::Paused;
            s.bump_epoch();
        });
    }

    /// Join a multicast group. `interface` is the local address to join on
    /// (IPv4) or an interface index (IPv6); `None` lets the OS choose.
    pub fn join_multicast(&self, group: &str, interface: Option<&str>) -> Result<()> {
        let (group, interface) = (group.to_owned(), interface.map(str::to_owned));
        self.exec(move |e, _| e.multicast(&group, interface.as_deref(), true))?
    }

    pub fn leave_multicast(&self, group: &str, interface: Option<&str>) -> Result<()> {
        let (group, interface) = (group.to_owned(), interface.map(str::to_owned));
        self.exec(move |e, _| e.multicast(&group, interface.as_deref(), false))?
    }

    /// Allow sending to broadcast addresses (IPv4 only).
    pub fn enable_broadcast(&self, enabled: bool) -> Result<()> {
        self.exec(move |e, _| {
            let ep = e
                .v4
                .as_ref()
                .ok_or_else(|| GantryError::config("broadcast needs a bound IPv4 descriptor"))?;
            ep.socket.set_broadcast(enabled)?;
            debug!("[UDP] Broadcast {}", if enabled { "enabled" } else { "disabled" });
            Ok(())
        })?
    }

    /// Close now. Queued sends fail with [`GantryError::Closed`].
    pub fn close(&self) {
        self.submit(|e, s| e.close(s, None));
    }

    /// Close once every queued send has gone out.
    pub fn close_after_sending(&self) {
        self.submit(|e, s| {
            if e.state != DatagramState::Closed {
                e.close_after_sending = true;
                e.check_close_after(s);
            }
        });
    }

    #[must_use]
    pub fn state(&self) -> DatagramState {
        self.peek(|e| e.state)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == DatagramState::Connected
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == DatagramState::Closed
    }

    /// Local address, preferring the family the socket prefers.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.peek(|e| {
            let addrs = [e.v4.as_ref(), e.v6.as_ref()].into_iter().flatten().map(|ep| ep.local);
            e.opts.family_policy().pick(addrs)
        })
    }

    #[must_use]
    pub fn local_addr_v4(&self) -> Option<SocketAddr> {
        self.peek(|e| e.v4.as_ref().map(|ep| ep.local))
    }

    #[must_use]
    pub fn local_addr_v6(&self) -> Option<SocketAddr> {
        self.peek(|e| e.v6.as_ref().map(|ep| ep.local))
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peek(|e| e.peer)
    }

    #[must_use]
    pub fn stats(&self) -> DatagramStats {
        self.peek(|e| e.stats)
    }

    /// Run `f` on the socket's queue and wait for it.
    pub fn perform<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.shared.queue.run_exclusive(f)
    }

    /// A descriptor of `family`, only from inside [`perform`](Self::perform).
    #[cfg(unix)]
    #[must_use]
    pub fn raw_fd(&self, family: Family) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        if !self.shared.queue.is_current() {
            warn!("[UDP] raw_fd requested outside the socket queue");
            return None;
        }
        let engine = self.shared.engine.lock();
        engine.endpoint(family).map(|ep| ep.socket.as_raw_fd())
    }

    pub fn set_user_data(&self, data: Option<UserData>) {
        *self.shared.user_data.lock() = data;
    }

    #[must_use]
    pub fn user_data(&self) -> Option<UserData> {
        self.shared.user_data.lock().clone()
    }
}

impl fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSocket")
            .field("queue", &self.shared.queue)
            .finish()
    }
}

impl PartialEq for DatagramSocket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for DatagramSocket {}

enum Resolved {
    Ready(SocketAddr),
    Pending,
}

impl Engine {
    fn emit(&mut self, event: SocketEvent) {
        monitor::emit(&mut self.monitors, &event);
    }

    fn endpoint(&self, family: Family) -> Option<&Endpoint> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    fn has_endpoint(&self) -> bool {
        self.v4.is_some() || self.v6.is_some()
    }

    // ---- descriptors -----------------------------------------------------

    fn bind(&mut self, me: &DatagramSocket, binding: LocalBinding, wildcard: bool) -> Result<()> {
        match self.state {
            DatagramState::Closed => return Err(GantryError::Closed),
            DatagramState::Unbound if !self.connect_requested => {}
            _ => return Err(GantryError::config("socket is already bound or connected")),
        }
        self.open_endpoints(me, binding, wildcard)?;
        Ok(())
    }

    /// Open one descriptor per address in `binding`. A wildcard binding
    /// tolerates one family being unavailable.
    fn open_endpoints(&mut self, me: &DatagramSocket, binding: LocalBinding, wildcard: bool) -> Result<()> {
        let reactor = Reactor::global()?;
        let mut first_err = None;
        let mut shared_port = 0;
        for mut addr in [binding.v4, binding.v6].into_iter().flatten() {
            let ephemeral = addr.port() == 0;
            if ephemeral && shared_port != 0 {
                addr.set_port(shared_port);
            }
            let mut opened = self.open_endpoint(&reactor, me, addr);
            if opened.is_err() && ephemeral && addr.port() != 0 {
                // the other family's ephemeral port is taken here
                addr.set_port(0);
                opened = self.open_endpoint(&reactor, me, addr);
            }
            match opened {
                Ok(ep) => {
                    shared_port = ep.local.port();
                    debug!("[UDP] Bound to {}", ep.local);
                    self.emit(SocketEvent::Bound(ep.local));
                    match Family::of(&ep.local) {
                        Family::V4 => self.v4 = Some(ep),
                        Family::V6 => self.v6 = Some(ep),
                    }
                }
                Err(e) => {
                    debug!("[UDP] Cannot bind {}: {}", addr, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        if !self.has_endpoint() || (!wildcard && first_err.is_some()) {
            self.release_endpoints();
            return Err(first_err.unwrap_or_else(|| GantryError::config("no address to bind")));
        }
        self.state = DatagramState::Bound;
        Ok(())
    }

    fn open_endpoint(&self, reactor: &Arc<Reactor>, me: &DatagramSocket, addr: SocketAddr) -> Result<Endpoint> {
        let family = Family::of(&addr);
        let socket = Socket::new(family.domain(), Type::DGRAM, Some(Protocol::UDP))?;
        if family == Family::V6 {
            socket.set_only_v6(true)?;
        }
        if self.opts.reuse_address {
            socket.set_reuse_address(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        let mut socket = UdpSocket::from_std(std_socket);
        let local = socket.local_addr()?;
        let registration = reactor.register(&mut socket, Interest::READABLE | Interest::WRITABLE, me.ready_handler())?;
        Ok(Endpoint {
            socket,
            registration,
            local,
        })
    }

    /// Open wildcard descriptors for every enabled family if none exist.
    fn ensure_endpoints(&mut self, me: &DatagramSocket) -> Result<()> {
        if self.has_endpoint() {
            return Ok(());
        }
        let binding = LocalBinding::for_interface(None, 0, &self.opts.family_policy())?;
        self.open_endpoints(me, binding, true)
    }

    fn release_endpoints(&mut self) {
        for ep in [self.v4.take(), self.v6.take()].into_iter().flatten() {
            ep.release();
        }
    }

    fn multicast(&mut self, group: &str, interface: Option<&str>, join: bool) -> Result<()> {
        let group: IpAddr = group
            .parse()
            .map_err(|_| GantryError::config(format!("invalid multicast group: {group}")))?;
        if !group.is_multicast() {
            return Err(GantryError::config(format!("{group} is not a multicast address")));
        }
        let family = Family::of(&SocketAddr::new(group, 0));
        let ep = self
            .endpoint(family)
            .ok_or_else(|| GantryError::config(format!("multicast needs a bound {family} descriptor")))?;
        match group {
            IpAddr::V4(g) => {
                let iface = match interface {
                    None => Ipv4Addr::UNSPECIFIED,
                    Some(s) => s
                        .parse()
                        .map_err(|_| GantryError::config(format!("invalid IPv4 interface: {s}")))?,
                };
                if join {
                    ep.socket.join_multicast_v4(&g, &iface)?;
                } else {
                    ep.socket.leave_multicast_v4(&g, &iface)?;
                }
            }
            IpAddr::V6(g) => {
                let index = match interface {
                    None => 0,
                    Some(s) => s
                        .parse()
                        .map_err(|_| GantryError::config(format!("invalid IPv6 interface index: {s}")))?,
                };
                if join {
                    ep.socket.join_multicast_v6(&g, index)?;
                } else {
                    ep.socket.leave_multicast_v6(&g, index)?;
                }
            }
        }
        debug!("[UDP] {} multicast group {}", if join { "Joined" } else { "Left" }, group);
        Ok(())
    }

    // ---- connect ---------------------------------------------------------

    fn enqueue_connect(&mut self, me: &DatagramSocket, dest: Dest) -> Result<()> {
        if self.state == DatagramState::Closed || self.close_after_sending {
            return Err(GantryError::Closed);
        }
        if self.connect_requested || self.state == DatagramState::Connected {
            return Err(GantryError::config("socket is already connected or connecting"));
        }
        self.opts.family_policy().validate()?;
        self.connect_requested = true;
        self.sends.push_back(Entry::Connect(dest));
        self.pump(me);
        Ok(())
    }

    fn begin_connect(&mut self, me: &DatagramSocket, dest: Dest) {
        let (host, port) = match dest {
            Dest::Addr(addr) => {
                let mut one = Candidates::new();
                one.push(addr);
                self.finish_connect(me, Ok(one));
                return;
            }
            Dest::Host(host, port) => (host, port),
            Dest::Connected => {
                self.finish_connect(me, Err(GantryError::config("connect needs a destination")));
                return;
            }
        };
        self.connect_resolving = true;
        let weak = me.downgrade();
        let queue = me.shared.queue.clone();
        Resolver::new(self.opts.family_policy()).resolve(&host, port, move |result| {
            queue.schedule(move || {
                if let Some(sock) = weak.upgrade() {
                    let mut engine = sock.shared.engine.lock();
                    if engine.connect_resolving {
                        engine.finish_connect(&sock, result);
                        engine.pump(&sock);
                    }
                }
            });
        });
    }

    fn finish_connect(&mut self, me: &DatagramSocket, result: Result<Candidates>) {
        self.connect_resolving = false;
        match result.and_then(|candidates| self.commit_connect(me, &candidates)) {
            Ok(peer) => {
                self.peer = Some(peer);
                self.state = DatagramState::Connected;
                debug!("[UDP] Connected to {}", peer);
                self.emit(SocketEvent::Connected(peer));
                self.dispatcher.notify(me, move |d, s| d.connected(s, peer));
            }
            Err(err) => {
                self.connect_requested = false;
                debug!("[UDP] Connect failed: {}", err);
                self.dispatcher.notify(me, move |d, s| d.connect_failed(s, &err));
            }
        }
    }

    fn commit_connect(&mut self, me: &DatagramSocket, candidates: &Candidates) -> Result<SocketAddr> {
        let policy = self.opts.family_policy();
        let peer = policy
            .pick(candidates.iter().copied())
            .ok_or_else(|| GantryError::config("no address in an enabled family"))?;
        let family = Family::of(&peer);
        self.ensure_endpoints(me)?;
        let ep = self
            .endpoint(family)
            .ok_or_else(|| GantryError::config(format!("socket has no {family} descriptor")))?;
        ep.socket.connect(peer)?;
        // committed to one family
        let other = match family {
            Family::V4 => self.v6.take(),
            Family::V6 => self.v4.take(),
        };
        if let Some(ep) = other {
            ep.release();
        }
        Ok(peer)
    }

    // ---- sending ---------------------------------------------------------

    fn enqueue_send(&mut self, me: &DatagramSocket, mut op: SendOp) {
        if op.data.is_empty() {
            warn!("[UDP] Ignoring empty send (tag {})", op.tag);
            return;
        }
        if self.state == DatagramState::Closed || self.close_after_sending {
            let tag = op.tag;
            self.dispatcher
                .notify(me, move |d, s| d.send_failed(s, tag, &GantryError::Closed));
            return;
        }
        if let Some(t) = op.timeout {
            let id = op.id;
            op.timer = Some(me.arm_timer(t, move |e, s| e.on_send_timeout(s, id, t)));
        }
        self.sends.push_back(Entry::Send(op));
        self.pump(me);
    }

    fn on_ready(&mut self, me: &DatagramSocket, ready: Readiness) {
        if self.state == DatagramState::Closed {
            return;
        }
        if ready.writable || ready.error {
            self.pump(me);
        }
        if ready.readable || ready.error {
            self.do_receives(me);
        }
    }

    fn pump(&mut self, me: &DatagramSocket) {
        loop {
            if self.state == DatagramState::Closed || self.connect_resolving {
                return;
            }
            if self.current.is_none() {
                match self.sends.pop_front() {
                    None => break,
                    Some(Entry::Connect(dest)) => {
                        self.begin_connect(me, dest);
                        continue;
                    }
                    Some(Entry::Send(op)) => {
                        self.sends_in_flight += 1;
                        self.stats.peak_sends_in_flight = self.stats.peak_sends_in_flight.max(self.sends_in_flight);
                        self.current = Some(op);
                    }
                }
            }
            match self.progress_send(me) {
                Ok(true) => self.finish_send(me, None),
                Ok(false) => return,
                Err(e) => self.finish_send(me, Some(e)),
            }
        }
        self.check_close_after(me);
    }

    /// Push the current send. `Ok(false)` means waiting on resolution or
    /// writability.
    fn progress_send(&mut self, me: &DatagramSocket) -> Result<bool> {
        let Some(op) = self.current.as_ref() else {
            return Ok(false);
        };
        if op.resolving {
            return Ok(false);
        }
        let dest = match op.resolved {
            Some(addr) => addr,
            None => match self.resolve_dest(me)? {
                Resolved::Ready(addr) => addr,
                Resolved::Pending => return Ok(false),
            },
        };
        if let Some(op) = self.current.as_mut() {
            op.resolved = Some(dest);
        }
        if self.peer.is_none() {
            self.ensure_endpoints(me)?;
        }

        let family = Family::of(&dest);
        let (Some(op), Some(ep)) = (self.current.as_ref(), self.endpoint(family)) else {
            return Err(GantryError::config(format!("socket has no {family} descriptor")));
        };
        let sent = if self.peer.is_some() {
            ep.socket.send(&op.data)
        } else {
            ep.socket.send_to(&op.data, dest)
        };
        match sent {
            Ok(n) => {
                trace!("[UDP] Sent {} bytes to {}", n, dest);
                self.stats.bytes_sent += n as u64;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.progress_send(me),
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_dest(&mut self, me: &DatagramSocket) -> Result<Resolved> {
        let Some(op) = self.current.as_mut() else {
            return Ok(Resolved::Pending);
        };
        let policy = self.opts.family_policy();
        match (&op.dest, self.peer) {
            (Dest::Connected, Some(peer)) => Ok(Resolved::Ready(peer)),
            (Dest::Connected, None) => Err(GantryError::config("socket is not connected")),
            (Dest::Addr(_) | Dest::Host(..), Some(peer)) => Err(GantryError::config(format!(
                "socket is connected to {peer}, cannot send to {}; use send",
                op.dest
            ))),
            (Dest::Addr(addr), None) => {
                if !policy.allows(Family::of(addr)) {
                    return Err(GantryError::config(format!("{} is disabled", Family::of(addr))));
                }
                Ok(Resolved::Ready(*addr))
            }
            (Dest::Host(host, port), None) => {
                if let Some(addr) = Resolver::literal(host, *port) {
                    return policy
                        .pick([addr])
                        .map(Resolved::Ready)
                        .ok_or_else(|| GantryError::config(format!("{} is disabled", Family::of(&addr))));
                }
                op.resolving = true;
                let id = op.id;
                let weak = me.downgrade();
                let queue = me.shared.queue.clone();
                Resolver::new(policy).resolve(host, *port, move |result| {
                    queue.schedule(move || {
                        if let Some(sock) = weak.upgrade() {
                            let mut engine = sock.shared.engine.lock();
                            engine.on_send_resolved(&sock, id, result);
                        }
                    });
                });
                Ok(Resolved::Pending)
            }
        }
    }

    fn on_send_resolved(&mut self, me: &DatagramSocket, id: u64, result: Result<Candidates>) {
        let policy = self.opts.family_policy();
        let Some(op) = self.current.as_mut().filter(|op| op.id == id) else {
            return;
        };
        op.resolving = false;
        let picked = result.and_then(|c| {
            policy
                .pick(c)
                .ok_or_else(|| GantryError::config("no address in an enabled family"))
        });
        match picked {
            Ok(addr) => op.resolved = Some(addr),
            Err(e) => {
                self.finish_send(me, Some(e));
            }
        }
        self.pump(me);
    }

    fn finish_send(&mut self, me: &DatagramSocket, err: Option<GantryError>) {
        let Some(mut op) = self.current.take() else {
            return;
        };
        op.disarm();
        self.sends_in_flight -= 1;
        let tag = op.tag;
        match err {
            None => {
                self.stats.datagrams_sent += 1;
                if let Some(dest) = op.resolved {
                    self.dispatcher.notify(me, move |d, s| d.sent(s, tag, dest));
                }
            }
            Some(err) => {
                debug!("[UDP] Send {} to {} failed: {}", tag, op.dest, err);
                self.dispatcher.notify(me, move |d, s| d.send_failed(s, tag, &err));
            }
        }
    }

    fn on_send_timeout(&mut self, me: &DatagramSocket, id: u64, after: Duration) {
        let err = GantryError::SendTimeout(after);
        if self.current.as_ref().is_some_and(|op| op.id == id) {
            self.finish_send(me, Some(err.clone()));
        } else if let Some(pos) = self
            .sends
            .iter()
            .position(|e| matches!(e, Entry::Send(op) if op.id == id))
        {
            if let Some(Entry::Send(mut op)) = self.sends.remove(pos) {
                op.disarm();
                let tag = op.tag;
                let err = err.clone();
                self.dispatcher.notify(me, move |d, s| d.send_failed(s, tag, &err));
            }
        } else {
            return;
        }
        if self.opts.close_on_timeout {
            self.close(me, Some(err));
        } else {
            self.pump(me);
        }
    }

    // ---- receiving -------------------------------------------------------

    fn start_receiving(&mut self, me: &DatagramSocket, mode: ReceiveMode) -> Result<()> {
        if self.state == DatagramState::Closed {
            return Err(GantryError::Closed);
        }
        if !self.has_endpoint() {
            return Err(GantryError::config("bind, connect or send before receiving"));
        }
        if self.receive != mode {
            trace!("[UDP] Receive mode {:?} -> {:?}", self.receive, mode);
        }
        self.receive = mode;
        self.do_receives(me);
        Ok(())
    }

    fn do_receives(&mut self, me: &DatagramSocket) {
        for family in [Family::V4, Family::V6] {
            loop {
                if self.receive == ReceiveMode::Paused || self.awaiting_verdict {
                    return;
                }
                let max = match family {
                    Family::V4 => self.opts.max_receive_ipv4,
                    Family::V6 => self.opts.max_receive_ipv6,
                };
                if self.scratch.len() < max {
                    self.scratch.resize(max, 0);
                }
                let Some(ep) = (match family {
                    Family::V4 => self.v4.as_ref(),
                    Family::V6 => self.v6.as_ref(),
                }) else {
                    break;
                };
                match ep.socket.recv_from(&mut self.scratch[..max]) {
                    Ok((n, from)) => {
                        let data = Bytes::copy_from_slice(&self.scratch[..n]);
                        trace!("[UDP] Received {} bytes from {}", n, from);
                        self.stats.datagrams_received += 1;
                        self.stats.bytes_received += n as u64;
                        self.dispatch_datagram(me, data, from);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                        ) =>
                    {
                        // ICMP unreachable reported on a later receive
                        debug!("[UDP] Peer unreachable: {}", e);
                    }
                    Err(e) => {
                        self.close(me, Some(e.into()));
                        return;
                    }
                }
            }
        }
    }

    fn dispatch_datagram(&mut self, me: &DatagramSocket, data: Bytes, from: SocketAddr) {
        let once = self.receive == ReceiveMode::Once;
        if once {
            self.awaiting_verdict = true;
        }
        let filter = self.filter.clone();
        let dispatcher = self.dispatcher.clone();
        let epoch = me.epoch();
        let sock = me.clone();
        me.shared.filter_queue.schedule(move || {
            let verdict = match &filter {
                Some(filter) => filter(&data, from),
                None => Filtered::Deliver(None),
            };
            let delivered = match verdict {
                Filtered::Discard => {
                    trace!("[UDP] Filter discarded datagram from {}", from);
                    false
                }
                Filtered::Deliver(_) if sock.epoch() != epoch => false,
                Filtered::Deliver(ctx) => {
                    dispatcher.notify(&sock, move |d, s| d.received(s, data, from, ctx));
                    true
                }
            };
            if once {
                sock.submit(move |e, s| e.on_once_verdict(s, delivered));
            }
        });
    }

    fn on_once_verdict(&mut self, me: &DatagramSocket, delivered: bool) {
        self.awaiting_verdict = false;
        if self.receive != ReceiveMode::Once {
            self.do_receives(me);
            return;
        }
        if delivered {
            self.receive = ReceiveMode::Paused;
        } else {
            self.do_receives(me);
        }
    }

    // ---- closing ---------------------------------------------------------

    fn check_close_after(&mut self, me: &DatagramSocket) {
        if self.close_after_sending && self.current.is_none() && self.sends.is_empty() && !self.connect_resolving {
            self.close(me, None);
        }
    }

    fn close(&mut self, me: &DatagramSocket, err: Option<GantryError>) {
        if self.state == DatagramState::Closed {
            return;
        }
        me.bump_epoch();
        self.receive = ReceiveMode::Paused;

        let in_flight = err.clone().unwrap_or(GantryError::Closed);
        if let Some(mut op) = self.current.take() {
            op.disarm();
            let tag = op.tag;
            self.dispatcher.notify(me, move |d, s| d.send_failed(s, tag, &in_flight));
        }
        if self.connect_resolving {
            self.connect_resolving = false;
            self.dispatcher
                .notify(me, |d, s| d.connect_failed(s, &GantryError::Closed));
        }
        for entry in self.sends.drain(..) {
            match entry {
                Entry::Send(mut op) => {
                    op.disarm();
                    let tag = op.tag;
                    self.dispatcher
                        .notify(me, move |d, s| d.send_failed(s, tag, &GantryError::Closed));
                }
                Entry::Connect(_) => {
                    self.dispatcher
                        .notify(me, |d, s| d.connect_failed(s, &GantryError::Closed));
                }
            }
        }

        self.release_endpoints();
        self.sends_in_flight = 0;
        self.state = DatagramState::Closed;
        match &err {
            Some(e) => debug!("[UDP] Closed: {}", e),
            None => debug!("[UDP] Closed"),
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

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Sent(Tag, SocketAddr),
        SendFailed(Tag, String),
        Received(Vec<u8>, SocketAddr),
        Closed,
    }

    struct Recorder {
        tx: flume::Sender<Event>,
    }

    impl DatagramDelegate for Recorder {
        fn sent(&self, _: &DatagramSocket, tag: Tag, dest: SocketAddr) {
            let _ = self.tx.send(Event::Sent(tag, dest));
        }
        fn send_failed(&self, _: &DatagramSocket, tag: Tag, err: &GantryError) {
            let _ = self.tx.send(Event::SendFailed(tag, err.to_string()));
        }
        fn received(&self, _: &DatagramSocket, data: Bytes, from: SocketAddr, _: Option<crate::delegate::FilterContext>) {
            let _ = self.tx.send(Event::Received(data.to_vec(), from));
        }
        fn closed(&self, _: &DatagramSocket, _: Option<&GantryError>) {
            let _ = self.tx.send(Event::Closed);
        }
    }

    fn socket() -> (DatagramSocket, Arc<dyn DatagramDelegate>, flume::Receiver<Event>) {
        let (tx, rx) = flume::unbounded();
        let delegate: Arc<dyn DatagramDelegate> = Arc::new(Recorder { tx });
        let sock = DatagramSocket::new(Arc::downgrade(&delegate), SerialQueue::new("udp-test"));
        (sock, delegate, rx)
    }

    fn next(rx: &flume::Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5)).expect("event")
    }

    #[test]
    fn test_receive_needs_descriptor() {
        let (sock, _d, _rx) = socket();
        assert!(matches!(sock.begin_receiving(), Err(GantryError::Config(_))));
        sock.bind(0, Some("127.0.0.1")).unwrap();
        assert!(sock.begin_receiving().is_ok());
        assert!(sock.local_addr_v4().is_some());
        assert_eq!(sock.local_addr_v6(), None);
        assert!(matches!(sock.bind(0, None), Err(GantryError::Config(_))));
    }

    #[test]
    fn test_send_without_peer_fails() {
        let (sock, _d, rx) = socket();
        sock.send(&b"x"[..], None, 4);
        match next(&rx) {
            Event::SendFailed(4, msg) => assert!(msg.contains("not connected")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_loopback_roundtrip() {
        let (a, _da, rx_a) = socket();
        let (b, _db, rx_b) = socket();
        b.bind(0, Some("127.0.0.1")).unwrap();
        b.begin_receiving().unwrap();
        let dest = b.local_addr().unwrap();

        a.send_to(&b"ping"[..], dest, None, 1);
        assert_eq!(next(&rx_a), Event::Sent(1, dest));
        match next(&rx_b) {
            Event::Received(data, _) => assert_eq!(data, b"ping"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(a.stats().peak_sends_in_flight, 1);
        a.close();
        b.close();
        assert_eq!(next(&rx_a), Event::Closed);
    }

    #[test]
    fn test_multicast_requires_group_address() {
        let (sock, _d, _rx) = socket();
        sock.bind(0, Some("0.0.0.0")).unwrap();
        assert!(matches!(
            sock.join_multicast("10.0.0.1", None),
            Err(GantryError::Config(_))
        ));
        assert!(matches!(
            sock.join_multicast("ff02::1", None),
            Err(GantryError::Config(_))
        ));
        assert!(sock.enable_broadcast(true).is_ok());
    }
}
