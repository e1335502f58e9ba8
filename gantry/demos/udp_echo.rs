//! UDP echo
//!
//! Runs an echo responder and a client in one process. The responder drops
//! datagrams that start with `#` through a receive filter.
//!
//! ```text
//! cargo run --example udp_echo
//! ```

use gantry::prelude::*;
use gantry::{Filtered, ReceiveFilter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

struct Responder;

impl DatagramDelegate for Responder {
    fn received(&self, sock: &DatagramSocket, data: Bytes, from: SocketAddr, _ctx: Option<gantry::FilterContext>) {
        println!("responder: {} bytes from {from}", data.len());
        sock.send_to(data, from, None, 0);
    }
}

struct Client {
    replies: flume::Sender<Bytes>,
}

impl DatagramDelegate for Client {
    fn sent(&self, _sock: &DatagramSocket, tag: Tag, dest: SocketAddr) {
        println!("client: datagram {tag} sent to {dest}");
    }

    fn send_failed(&self, _sock: &DatagramSocket, tag: Tag, err: &GantryError) {
        eprintln!("client: datagram {tag} failed: {err}");
    }

    fn received(&self, _sock: &DatagramSocket, data: Bytes, _from: SocketAddr, _ctx: Option<gantry::FilterContext>) {
        let _ = self.replies.send(data);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    gantry::dev_tracing::init_tracing();

    let responder_delegate: Arc<dyn DatagramDelegate> = Arc::new(Responder);
    let responder = DatagramSocket::new(Arc::downgrade(&responder_delegate), SerialQueue::new("responder"));
    responder.bind(0, Some("127.0.0.1"))?;
    let filter: ReceiveFilter = Arc::new(|data: &[u8], _from: SocketAddr| {
        if data.starts_with(b"#") {
            Filtered::Discard
        } else {
            Filtered::Deliver(None)
        }
    });
    responder.set_receive_filter(Some(filter));
    responder.begin_receiving()?;
    let addr = responder.local_addr().ok_or("responder has no address")?;
    println!("Responder on {addr}");

    let (tx, rx) = flume::unbounded();
    let client_delegate: Arc<dyn DatagramDelegate> = Arc::new(Client { replies: tx });
    let client = DatagramSocket::new(Arc::downgrade(&client_delegate), SerialQueue::new("client"));
    client.connect(addr)?;
    client.send(&b"# comment, filtered out"[..], None, 1);
    client.send(&b"ping"[..], None, 2);
    client.send(&b"pong"[..], None, 3);
    client.begin_receiving()?;

    for _ in 0..2 {
        let reply = rx.recv_timeout(Duration::from_secs(2))?;
        println!("client: echo {:?}", String::from_utf8_lossy(&reply));
    }
    println!("{:?}", client.stats());

    client.close();
    responder.close();
    Ok(())
}
