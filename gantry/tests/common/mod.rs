//! Delegates that forward every callback into a channel.
#![allow(dead_code)]

use gantry::prelude::*;
use gantry::{DatagramState, FilterContext, TlsInfo};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Ev {
    Accepted(StreamSocket),
    Connected(SocketAddr),
    Read(Tag, Vec<u8>),
    ReadProgress(Tag, usize),
    ReadFailed(Tag, GantryError),
    Written(Tag),
    WriteFailed(Tag, GantryError),
    Extend(Tag),
    Secured(TlsInfo),
    Closed(Option<GantryError>),
}

pub struct StreamRecorder {
    tx: flume::Sender<Ev>,
    caps: Capabilities,
    extension: Mutex<Option<Duration>>,
}

impl StreamRecorder {
    pub fn new() -> (Arc<Self>, flume::Receiver<Ev>) {
        Self::with_capabilities(Capabilities::default(), None)
    }

    /// A recorder that extends the first timeout it is asked about.
    pub fn with_capabilities(caps: Capabilities, extension: Option<Duration>) -> (Arc<Self>, flume::Receiver<Ev>) {
        let (tx, rx) = flume::unbounded();
        let recorder = Self {
            tx,
            caps,
            extension: Mutex::new(extension),
        };
        (Arc::new(recorder), rx)
    }

    pub fn socket(self: &Arc<Self>, label: &str) -> StreamSocket {
        let delegate: Arc<dyn StreamDelegate> = Arc::clone(self) as Arc<dyn StreamDelegate>;
        let weak = Arc::downgrade(&delegate);
        StreamSocket::new(weak, SerialQueue::new(label))
    }

    fn send(&self, ev: Ev) {
        let _ = self.tx.send(ev);
    }
}

impl StreamDelegate for StreamRecorder {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }
    fn accepted(&self, _: &StreamSocket, new_socket: StreamSocket) {
        self.send(Ev::Accepted(new_socket));
    }
    fn connected(&self, _: &StreamSocket, peer: SocketAddr) {
        self.send(Ev::Connected(peer));
    }
    fn read_complete(&self, _: &StreamSocket, data: Bytes, tag: Tag) {
        self.send(Ev::Read(tag, data.to_vec()));
    }
    fn read_progress(&self, _: &StreamSocket, partial_len: usize, tag: Tag) {
        self.send(Ev::ReadProgress(tag, partial_len));
    }
    fn read_failed(&self, _: &StreamSocket, tag: Tag, err: &GantryError) {
        self.send(Ev::ReadFailed(tag, err.clone()));
    }
    fn write_complete(&self, _: &StreamSocket, tag: Tag) {
        self.send(Ev::Written(tag));
    }
    fn write_failed(&self, _: &StreamSocket, tag: Tag, err: &GantryError) {
        self.send(Ev::WriteFailed(tag, err.clone()));
    }
    fn extend_read_timeout(&self, _: &StreamSocket, tag: Tag, _: Duration, _: usize) -> Option<Duration> {
        self.send(Ev::Extend(tag));
        self.extension.lock().unwrap().take()
    }
    fn secured(&self, _: &StreamSocket, info: &TlsInfo) {
        self.send(Ev::Secured(info.clone()));
    }
    fn closed(&self, _: &StreamSocket, err: Option<&GantryError>) {
        self.send(Ev::Closed(err.cloned()));
    }
}

/// Next event, skipping progress notifications.
pub fn next(rx: &flume::Receiver<Ev>) -> Ev {
    loop {
        match rx.recv_timeout(WAIT) {
            Ok(Ev::ReadProgress(..)) => {}
            Ok(ev) => return ev,
            Err(e) => panic!("no event within {WAIT:?}: {e}"),
        }
    }
}

pub fn expect_accepted(rx: &flume::Receiver<Ev>) -> StreamSocket {
    match next(rx) {
        Ev::Accepted(sock) => sock,
        other => panic!("expected accept, got {other:?}"),
    }
}

pub fn expect_connected(rx: &flume::Receiver<Ev>) -> SocketAddr {
    match next(rx) {
        Ev::Connected(peer) => peer,
        other => panic!("expected connect, got {other:?}"),
    }
}

pub fn expect_read(rx: &flume::Receiver<Ev>, tag: Tag) -> Vec<u8> {
    match next(rx) {
        Ev::Read(t, data) if t == tag => data,
        other => panic!("expected read {tag}, got {other:?}"),
    }
}

/// A listener on loopback plus a connected client and the accepted peer.
pub struct Pair {
    pub server: Arc<StreamRecorder>,
    pub server_rx: flume::Receiver<Ev>,
    pub client: Arc<StreamRecorder>,
    pub client_rx: flume::Receiver<Ev>,
    pub listener: StreamSocket,
    pub accepted: StreamSocket,
    pub conn: StreamSocket,
}

pub fn connected_pair() -> Pair {
    let (server, server_rx) = StreamRecorder::new();
    let (client, client_rx) = StreamRecorder::new();
    connect_with(server, server_rx, client, client_rx)
}

pub fn connect_with(
    server: Arc<StreamRecorder>,
    server_rx: flume::Receiver<Ev>,
    client: Arc<StreamRecorder>,
    client_rx: flume::Receiver<Ev>,
) -> Pair {
    let listener = server.socket("listener");
    listener.accept_on(0, Some("127.0.0.1")).expect("listen");
    let addr = listener.local_addr().expect("listen address");

    let conn = client.socket("client");
    conn.connect(addr).expect("connect");
    expect_connected(&client_rx);
    let accepted = expect_accepted(&server_rx);
    Pair {
        server,
        server_rx,
        client,
        client_rx,
        listener,
        accepted,
        conn,
    }
}

#[derive(Debug)]
pub enum Dg {
    Connected(SocketAddr),
    ConnectFailed(GantryError),
    Sent(Tag, SocketAddr),
    SendFailed(Tag, GantryError),
    Received(Vec<u8>, SocketAddr, Option<String>),
    Closed(Option<GantryError>),
}

pub struct DatagramRecorder {
    tx: flume::Sender<Dg>,
}

impl DatagramRecorder {
    pub fn new() -> (Arc<Self>, flume::Receiver<Dg>) {
        let (tx, rx) = flume::unbounded();
        (Arc::new(Self { tx }), rx)
    }

    pub fn socket(self: &Arc<Self>, label: &str) -> DatagramSocket {
        let delegate: Arc<dyn DatagramDelegate> = Arc::clone(self) as Arc<dyn DatagramDelegate>;
        let sock = DatagramSocket::new(Arc::downgrade(&delegate), SerialQueue::new(label));
        assert_eq!(sock.state(), DatagramState::Unbound);
        sock
    }
}

impl DatagramDelegate for DatagramRecorder {
    fn connected(&self, _: &DatagramSocket, peer: SocketAddr) {
        let _ = self.tx.send(Dg::Connected(peer));
    }
    fn connect_failed(&self, _: &DatagramSocket, err: &GantryError) {
        let _ = self.tx.send(Dg::ConnectFailed(err.clone()));
    }
    fn sent(&self, _: &DatagramSocket, tag: Tag, dest: SocketAddr) {
        let _ = self.tx.send(Dg::Sent(tag, dest));
    }
    fn send_failed(&self, _: &DatagramSocket, tag: Tag, err: &GantryError) {
        let _ = self.tx.send(Dg::SendFailed(tag, err.clone()));
    }
    fn received(&self, _: &DatagramSocket, data: Bytes, from: SocketAddr, ctx: Option<FilterContext>) {
        let label = ctx.and_then(|c| c.downcast::<String>().ok()).map(|b| *b);
        let _ = self.tx.send(Dg::Received(data.to_vec(), from, label));
    }
    fn closed(&self, _: &DatagramSocket, err: Option<&GantryError>) {
        let _ = self.tx.send(Dg::Closed(err.cloned()));
    }
}

pub fn next_dg(rx: &flume::Receiver<Dg>) -> Dg {
    match rx.recv_timeout(WAIT) {
        Ok(ev) => ev,
        Err(e) => panic!("no datagram event within {WAIT:?}: {e}"),
    }
}
