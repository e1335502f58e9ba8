//! Readiness reactor.
//!
//! A single background thread waits on a `mio::Poll` and forwards readiness
//! to whoever registered the descriptor. Handlers run on the reactor thread
//! and must only hand the event off (schedule onto a serial queue); they
//! never perform I/O themselves.
//!
//! Registrations are edge-triggered. A consumer must keep transferring until
//! the OS reports `WouldBlock` before it can rely on the next event.

use dashmap::DashMap;
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token};
use once_cell::sync::OnceCell;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, trace};

use crate::error::Result;

/// Events fetched per `poll` call.
const EVENT_CAPACITY: usize = 1024;

static GLOBAL: OnceCell<Arc<Reactor>> = OnceCell::new();

/// Callback invoked on the reactor thread for every event of a registration.
pub type ReadyFn = Arc<dyn Fn(Readiness) + Send + Sync>;

/// What the OS reported for a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

/// The process-wide reactor.
pub struct Reactor {
    registry: Registry,
    handlers: DashMap<usize, ReadyFn>,
    next_token: AtomicUsize,
}

impl Reactor {
    /// Get the shared reactor, starting its thread on first use.
    pub fn global() -> Result<Arc<Self>> {
        GLOBAL.get_or_try_init(Self::start).map(Arc::clone).map_err(Into::into)
    }

    fn start() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let reactor = Arc::new(Self {
            registry,
            handlers: DashMap::new(),
            next_token: AtomicUsize::new(1),
        });
        let runner = Arc::clone(&reactor);
        thread::Builder::new()
            .name("gantry-reactor".into())
            .spawn(move || runner.run(poll))?;
        debug!("[REACTOR] Started");
        Ok(reactor)
    }

    fn run(&self, mut poll: Poll) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("[REACTOR] Poll failed, reactor stopping: {}", e);
                return;
            }
            for event in events.iter() {
                let token = event.token().0;
                // Clone the handler out so the map shard is not held while it runs.
                let handler = self.handlers.get(&token).map(|h| Arc::clone(h.value()));
                match handler {
                    Some(handler) => handler(Readiness::from(event)),
                    None => trace!("[REACTOR] Event for retired token {}", token),
                }
            }
        }
    }

    /// Register `source` and route its events to `handler`.
    pub fn register<S>(self: &Arc<Self>, source: &mut S, interest: Interest, handler: ReadyFn) -> io::Result<Registration>
    where
        S: Source + ?Sized,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers.insert(token, handler);
        if let Err(e) = self.registry.register(source, Token(token), interest) {
            self.handlers.remove(&token);
            return Err(e);
        }
        trace!("[REACTOR] Registered token {}", token);
        Ok(Registration {
            token,
            reactor: Arc::clone(self),
        })
    }

}

/// A live registration. Dropping it stops event delivery.
pub struct Registration {
    token: usize,
    reactor: Arc<Reactor>,
}

impl Registration {
    #[must_use]
    pub const fn token(&self) -> usize {
        self.token
    }

    /// Remove the source from the poller. Must be called before the
    /// descriptor is closed.
    pub fn deregister<S>(self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.reactor.registry.deregister(source)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.reactor.handlers.remove(&self.token);
        trace!("[REACTOR] Retired token {}", self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_readable_event_reaches_handler() {
        let reactor = Reactor::global().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut server = mio::net::TcpStream::from_std(server);

        let (tx, rx) = flume::unbounded();
        let registration = reactor
            .register(
                &mut server,
                Interest::READABLE,
                Arc::new(move |ready: Readiness| {
                    let _ = tx.send(ready);
                }),
            )
            .unwrap();

        client.write_all(b"ping").unwrap();
        let ready = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ready.readable);

        let token = registration.token();
        registration.deregister(&mut server).unwrap();
        assert!(reactor.handlers.get(&token).is_none());
    }
}
