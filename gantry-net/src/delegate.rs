//! Delegate traits and the dispatcher that calls them.
//!
//! Every method has a no-op default, so a delegate implements only what it
//! cares about. Callbacks that cost the engine extra work (partial progress,
//! the timeout-extension round trip) are additionally gated by
//! [`Capabilities`].
//!
//! Delegates are held weakly. A socket never keeps its delegate alive, and
//! notifications addressed to a dropped delegate are discarded.

use bytes::Bytes;
use gantry_core::error::GantryError;
use gantry_core::queue::SerialQueue;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::datagram::DatagramSocket;
use crate::op::Tag;
use crate::stream::StreamSocket;
use crate::tls::TlsInfo;

/// Optional callbacks a delegate opts into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Call `read_progress` for every partial transfer.
    pub read_progress: bool,
    /// Call `write_progress` for every partial transfer.
    pub write_progress: bool,
    /// Ask `extend_read_timeout` / `extend_write_timeout` before failing an
    /// operation whose timer fired.
    pub extend_timeouts: bool,
}

impl Capabilities {
    /// Every optional callback enabled.
    pub const ALL: Self = Self {
        read_progress: true,
        write_progress: true,
        extend_timeouts: true,
    };
}

/// Receives notifications from a [`StreamSocket`].
#[allow(unused_variables)]
pub trait StreamDelegate: Send + Sync + 'static {
    /// Queried once, when the delegate is attached to a socket.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// A listening socket accepted `new_socket`. The new socket shares this
    /// delegate and delegate queue until changed.
    fn accepted(&self, sock: &StreamSocket, new_socket: StreamSocket) {}

    /// The connect attempt succeeded.
    fn connected(&self, sock: &StreamSocket, peer: SocketAddr) {}

    /// A read finished. `data` is owned by the delegate.
    fn read_complete(&self, sock: &StreamSocket, data: Bytes, tag: Tag) {}

    /// Some bytes arrived for a read that is not finished yet.
    fn read_progress(&self, sock: &StreamSocket, partial_len: usize, tag: Tag) {}

    /// A read failed; the socket may still be open.
    fn read_failed(&self, sock: &StreamSocket, tag: Tag, err: &GantryError) {}

    /// A write was fully handed to the kernel.
    fn write_complete(&self, sock: &StreamSocket, tag: Tag) {}

    /// Part of a write was handed to the kernel.
    fn write_progress(&self, sock: &StreamSocket, partial_len: usize, tag: Tag) {}

    /// A write failed; the socket may still be open.
    fn write_failed(&self, sock: &StreamSocket, tag: Tag, err: &GantryError) {}

    /// A read timer fired. Return extra time to keep the read alive.
    fn extend_read_timeout(&self, sock: &StreamSocket, tag: Tag, elapsed: Duration, bytes_done: usize) -> Option<Duration> {
        None
    }

    /// A write timer fired. Return extra time to keep the write alive.
    fn extend_write_timeout(&self, sock: &StreamSocket, tag: Tag, elapsed: Duration, bytes_done: usize) -> Option<Duration> {
        None
    }

    /// The TLS handshake completed.
    fn secured(&self, sock: &StreamSocket, info: &TlsInfo) {}

    /// The socket closed. `err` is `None` for a local, clean close.
    fn closed(&self, sock: &StreamSocket, err: Option<&GantryError>) {}
}

/// Opaque value produced by a receive filter and handed to the delegate
/// along with the datagram.
pub type FilterContext = Box<dyn Any + Send>;

/// Verdict of a receive filter.
pub enum Filtered {
    Discard,
    Deliver(Option<FilterContext>),
}

/// Inspects inbound datagrams before they reach the delegate.
pub type ReceiveFilter = Arc<dyn Fn(&[u8], SocketAddr) -> Filtered + Send + Sync>;

/// Receives notifications from a [`DatagramSocket`].
#[allow(unused_variables)]
pub trait DatagramDelegate: Send + Sync + 'static {
    /// A queued connect succeeded.
    fn connected(&self, sock: &DatagramSocket, peer: SocketAddr) {}

    /// A queued connect failed. The socket stays usable.
    fn connect_failed(&self, sock: &DatagramSocket, err: &GantryError) {}

    /// A datagram was handed to the kernel. `dest` is where it went.
    fn sent(&self, sock: &DatagramSocket, tag: Tag, dest: SocketAddr) {}

    /// A send failed.
    fn send_failed(&self, sock: &DatagramSocket, tag: Tag, err: &GantryError) {}

    /// A datagram arrived and passed the receive filter.
    fn received(&self, sock: &DatagramSocket, data: Bytes, from: SocketAddr, ctx: Option<FilterContext>) {}

    /// The socket closed. `err` is `None` for a local, clean close.
    fn closed(&self, sock: &DatagramSocket, err: Option<&GantryError>) {}
}

/// Delivers notifications for one socket on its delegate queue.
///
/// Notifications are scheduled, never run inline, so they arrive in the
/// order the engine produced them and never while the engine holds state.
pub(crate) struct Dispatcher<D: ?Sized> {
    delegate: Option<Weak<D>>,
    queue: SerialQueue,
    caps: Capabilities,
}

impl<D: ?Sized> Clone for Dispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            delegate: self.delegate.clone(),
            queue: self.queue.clone(),
            caps: self.caps,
        }
    }
}

impl<D: ?Sized + Send + Sync + 'static> Dispatcher<D> {
    pub(crate) fn new(delegate: Option<Weak<D>>, queue: SerialQueue) -> Self {
        Self {
            delegate,
            queue,
            caps: Capabilities::default(),
        }
    }

    pub(crate) fn queue(&self) -> &SerialQueue {
        &self.queue
    }

    pub(crate) fn delegate(&self) -> Option<Weak<D>> {
        self.delegate.clone()
    }

    /// Call the delegate with `sock` on the delegate queue.
    pub(crate) fn notify<S, F>(&self, sock: &S, f: F)
    where
        S: Clone + Send + 'static,
        F: FnOnce(&D, &S) + Send + 'static,
    {
        let Some(weak) = self.delegate.clone() else {
            return;
        };
        let sock = sock.clone();
        self.queue.schedule(move || {
            if let Some(delegate) = weak.upgrade() {
                f(&*delegate, &sock);
            }
        });
    }

    /// Ask the delegate something on its queue and hand the answer to
    /// `reply`. `reply` runs on the delegate queue; it is expected to
    /// schedule back onto the socket's own queue. The answer is `None` when
    /// no live delegate is attached.
    pub(crate) fn ask<S, R, F, K>(&self, sock: &S, f: F, reply: K)
    where
        S: Clone + Send + 'static,
        R: Send + 'static,
        F: FnOnce(&D, &S) -> R + Send + 'static,
        K: FnOnce(Option<R>) + Send + 'static,
    {
        let Some(weak) = self.delegate.clone() else {
            self.queue.schedule(move || reply(None));
            return;
        };
        let sock = sock.clone();
        self.queue.schedule(move || {
            let answer = weak.upgrade().map(|delegate| f(&*delegate, &sock));
            reply(answer);
        });
    }
}

impl Dispatcher<dyn StreamDelegate> {
    /// Attach a stream delegate, reading its capabilities now so the engine
    /// never calls into the delegate while it holds socket state.
    pub(crate) fn stream(delegate: Option<Weak<dyn StreamDelegate>>, queue: SerialQueue) -> Self {
        let caps = delegate
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|d| d.capabilities())
            .unwrap_or_default();
        Self { delegate, queue, caps }
    }

    /// Capabilities the delegate declared when attached.
    pub(crate) fn capabilities(&self) -> Capabilities {
        self.caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        caps: Capabilities,
    }

    impl StreamDelegate for Counter {
        fn capabilities(&self) -> Capabilities {
            self.caps
        }
    }

    #[test]
    fn test_notify_preserves_order() {
        let queue = SerialQueue::new("delegate");
        let target: Arc<dyn Any + Send + Sync> = Arc::new(());
        let dispatcher: Dispatcher<dyn Any + Send + Sync> = Dispatcher::new(Some(Arc::downgrade(&target)), queue.clone());
        let (tx, rx) = flume::unbounded();
        for i in 0..50 {
            let tx = tx.clone();
            dispatcher.notify(&i, move |_, n| {
                let _ = tx.send(*n);
            });
        }
        queue.run_exclusive(|| ()).unwrap();
        let seen: Vec<i32> = rx.drain().collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_dropped_delegate_is_skipped() {
        let queue = SerialQueue::new("gone");
        let target: Arc<dyn Any + Send + Sync> = Arc::new(());
        let dispatcher: Dispatcher<dyn Any + Send + Sync> = Dispatcher::new(Some(Arc::downgrade(&target)), queue.clone());
        drop(target);

        let (tx, rx) = flume::unbounded::<()>();
        dispatcher.notify(&(), move |_, _| {
            let _ = tx.send(());
        });
        let (reply_tx, reply_rx) = flume::bounded(1);
        dispatcher.ask(&(), |_, _| 1, move |answer: Option<i32>| {
            let _ = reply_tx.send(answer);
        });
        queue.run_exclusive(|| ()).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(reply_rx.recv().unwrap(), None);
    }

    #[test]
    fn test_capabilities_read_once_on_attach() {
        let caps = Capabilities::ALL;
        let delegate: Arc<dyn StreamDelegate> = Arc::new(Counter { caps });
        let queue = SerialQueue::new("caps");
        let dispatcher = Dispatcher::stream(Some(Arc::downgrade(&delegate)), queue.clone());
        // the answer outlives the delegate
        drop(delegate);
        assert_eq!(dispatcher.capabilities(), caps);
        assert_eq!(dispatcher.clone().capabilities(), caps);

        let detached = Dispatcher::stream(None, queue);
        assert_eq!(detached.capabilities(), Capabilities::default());
    }
}
