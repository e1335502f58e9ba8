#![no_main]

use gantry_core::buffer::ByteBuffer;
use gantry_net::op::{ReadKind, ReadOp, ReadProgress};
use libfuzzer_sys::fuzz_target;

// Feeds arbitrary input to read operations in arbitrary chunk sizes and
// checks that no byte is lost or duplicated.
fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let (header, payload) = data.split_at(3);
    let param = usize::from(header[1]) + 1;
    let chunk = usize::from(header[2] % 32) + 1;

    let make = || match header[0] % 4 {
        0 => ReadKind::Exact(param),
        1 => ReadKind::delimiter(&b"\r\n"[..]),
        2 => ReadKind::Delimiter {
            delimiter: bytes::Bytes::from_static(b"\n"),
            max_length: param,
        },
        _ => ReadKind::UpTo(param % 8),
    };

    let mut prebuffer = ByteBuffer::new();
    let mut out = Vec::new();
    let mut op = ReadOp::new(make(), None, 0);
    let mut fed = 0;

    loop {
        match op.absorb(&mut prebuffer) {
            ReadProgress::Done(bytes) => {
                match &op.kind {
                    ReadKind::Exact(n) => assert_eq!(bytes.len(), *n),
                    ReadKind::Delimiter { delimiter, max_length } => {
                        assert!(bytes.ends_with(delimiter));
                        assert!(*max_length == 0 || bytes.len() <= *max_length);
                    }
                    ReadKind::UpTo(max) => assert!(*max == 0 || bytes.len() <= *max),
                }
                out.extend_from_slice(&bytes);
                op = ReadOp::new(make(), None, 0);
            }
            ReadProgress::MaxedOut { .. } => {
                // the failed read gives its bytes back; consume one so the
                // next read can make progress
                op.unwind_into(&mut prebuffer);
                let Some(byte) = prebuffer.take(1) else {
                    panic!("maxed out with nothing buffered");
                };
                out.extend_from_slice(&byte);
                op = ReadOp::new(make(), None, 0);
            }
            ReadProgress::NeedMore { .. } => {
                if fed == payload.len() {
                    break;
                }
                let end = (fed + chunk).min(payload.len());
                prebuffer.extend_from_slice(&payload[fed..end]);
                fed = end;
            }
        }
    }

    op.unwind_into(&mut prebuffer);
    out.extend_from_slice(prebuffer.as_slice());
    assert_eq!(out, payload);
});
