//! Line echo server
//!
//! Listens on loopback and echoes every line back, optionally over TLS with
//! the test certificate.
//!
//! ```text
//! cargo run --example echo_server -- --port 7000 [--tls]
//! ```

use gantry::prelude::*;
use gantry::tls::{certs_from_pem, key_from_pem};
use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

const LINE: Tag = 1;
const ECHO: Tag = 2;

struct EchoServer {
    tls: Option<TlsSettings>,
    // accepted sockets close when dropped
    conns: Mutex<Vec<StreamSocket>>,
}

impl StreamDelegate for EchoServer {
    fn accepted(&self, _listener: &StreamSocket, sock: StreamSocket) {
        if let Some(peer) = sock.peer_addr() {
            println!("Accepted connection from {peer}");
        }
        if let Some(tls) = &self.tls {
            if let Err(e) = sock.start_tls(tls.clone()) {
                eprintln!("TLS setup failed: {e}");
                return;
            }
        }
        sock.write(&b"gantry echo, type a line\r\n"[..], None, ECHO);
        sock.read_until(&b"\n"[..], None, LINE);
        if let Ok(mut conns) = self.conns.lock() {
            conns.push(sock);
        }
    }

    fn secured(&self, sock: &StreamSocket, info: &gantry::TlsInfo) {
        println!(
            "{:?} secured with {}",
            sock.peer_addr(),
            info.cipher_suite.as_deref().unwrap_or("?")
        );
    }

    fn read_complete(&self, sock: &StreamSocket, line: Bytes, _tag: Tag) {
        if String::from_utf8_lossy(&line).trim() == "quit" {
            sock.write(&b"bye\r\n"[..], None, ECHO);
            sock.close_after_writing();
            return;
        }
        sock.write(line, None, ECHO);
        sock.read_until(&b"\n"[..], None, LINE);
    }

    fn closed(&self, sock: &StreamSocket, err: Option<&GantryError>) {
        match err {
            Some(e) => println!("{:?} closed: {e}", sock.peer_addr()),
            None => println!("{:?} closed", sock.peer_addr()),
        }
        if let Ok(mut conns) = self.conns.lock() {
            conns.retain(|c| !c.is_closed());
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    gantry::dev_tracing::init_tracing();

    let args: Vec<String> = env::args().collect();
    let port = match args.iter().position(|a| a == "--port") {
        Some(i) => args.get(i + 1).ok_or("--port needs a value")?.parse::<u16>()?,
        None => 7000,
    };
    let tls = if args.iter().any(|a| a == "--tls") {
        let chain = certs_from_pem(include_bytes!("../tests/certs/localhost.pem"))?;
        let key = key_from_pem(include_bytes!("../tests/certs/localhost.key"))?;
        Some(TlsSettings::server(chain, key).build()?)
    } else {
        None
    };

    let delegate: Arc<dyn StreamDelegate> = Arc::new(EchoServer {
        tls,
        conns: Mutex::new(Vec::new()),
    });
    let listener = StreamSocket::new(Arc::downgrade(&delegate), SerialQueue::new("echo-server"));
    listener.accept_on(port, Some("127.0.0.1"))?;
    let addrs: Vec<SocketAddr> = listener.listen_addrs();
    println!("Echo server listening on {addrs:?}");

    loop {
        std::thread::park();
    }
}
