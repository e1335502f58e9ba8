//! Line echo client
//!
//! Connects to the echo server, sends a few lines and prints the replies.
//!
//! ```text
//! cargo run --example echo_client -- --port 7000 [--tls]
//! ```

use gantry::prelude::*;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const GREETING: Tag = 0;
const REPLY: Tag = 1;

struct EchoClient {
    lines: Vec<&'static str>,
    done: flume::Sender<Option<GantryError>>,
}

impl StreamDelegate for EchoClient {
    fn connected(&self, sock: &StreamSocket, peer: SocketAddr) {
        println!("Connected to {peer}");
        sock.read_until(&b"\n"[..], Some(Duration::from_secs(5)), GREETING);
        for (i, line) in self.lines.iter().enumerate() {
            sock.write(format!("{line}\r\n").into_bytes(), None, i as Tag);
            sock.read_until(&b"\n"[..], Some(Duration::from_secs(5)), REPLY);
        }
        sock.write(&b"quit\r\n"[..], None, -1);
    }

    fn secured(&self, _sock: &StreamSocket, info: &gantry::TlsInfo) {
        println!("TLS {:?}", info.protocol_version);
    }

    fn read_complete(&self, _sock: &StreamSocket, line: Bytes, tag: Tag) {
        let text = String::from_utf8_lossy(&line);
        match tag {
            GREETING => print!("server: {text}"),
            _ => print!("echo: {text}"),
        }
    }

    fn read_failed(&self, _sock: &StreamSocket, tag: Tag, err: &GantryError) {
        eprintln!("read {tag} failed: {err}");
    }

    fn closed(&self, _sock: &StreamSocket, err: Option<&GantryError>) {
        let _ = self.done.send(err.cloned());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    gantry::dev_tracing::init_tracing();

    let args: Vec<String> = env::args().collect();
    let port = match args.iter().position(|a| a == "--port") {
        Some(i) => args.get(i + 1).ok_or("--port needs a value")?.parse::<u16>()?,
        None => 7000,
    };
    let use_tls = args.iter().any(|a| a == "--tls");

    let (tx, rx) = flume::bounded(1);
    let delegate: Arc<dyn StreamDelegate> = Arc::new(EchoClient {
        lines: vec!["hello", "gantry", "goodbye"],
        done: tx,
    });
    let sock = StreamSocket::new(Arc::downgrade(&delegate), SerialQueue::new("echo-client"));
    sock.connect_to_host("localhost", port, Some(Duration::from_secs(5)))?;
    if use_tls {
        let settings = TlsSettings::client("localhost")
            .add_roots_pem(include_bytes!("../tests/certs/ca.pem"))?
            .build()?;
        sock.start_tls(settings)?;
    }

    match rx.recv()? {
        None | Some(GantryError::PeerClosed) => println!("Done"),
        Some(e) => return Err(e.into()),
    }
    println!("{:?}", sock.stats());
    Ok(())
}
