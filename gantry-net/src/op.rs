//! Queued operations and their progress algorithms.
//!
//! The algorithms here are pure: they move bytes between the socket's
//! carry-over buffer and an operation's own buffer and report whether the
//! operation is satisfied. They never touch a descriptor, which keeps them
//! testable against arbitrary chunkings of the input.

use bytes::Bytes;
use gantry_core::buffer::ByteBuffer;
use gantry_core::timer::TimerHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::{EXACT_READ_PREALLOC_MAX, READ_OP_INITIAL_CAP};

/// Caller-supplied correlation value. Never interpreted by the engine.
pub type Tag = i64;

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic id used to fail pending operations in enqueue order.
pub(crate) fn next_op_id() -> u64 {
    NEXT_OP_ID.fetch_add(1, Ordering::Relaxed)
}

/// What a read waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadKind {
    /// Exactly `n` bytes.
    Exact(usize),
    /// Everything up to and including `delimiter`.
    ///
    /// `max_length` bounds the bytes scanned (delimiter included); zero
    /// means unbounded.
    Delimiter { delimiter: Bytes, max_length: usize },
    /// Whatever one transfer yields, at most `max` bytes. Zero means no cap.
    UpTo(usize),
}

impl ReadKind {
    /// Shorthand for a delimiter read with no length bound.
    pub fn delimiter(delimiter: impl Into<Bytes>) -> Self {
        Self::Delimiter {
            delimiter: delimiter.into(),
            max_length: 0,
        }
    }
}

/// Outcome of feeding a read operation.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadProgress {
    /// The read is satisfied; these bytes go to the delegate.
    Done(Bytes),
    /// More input required. `wanted` is how many bytes would satisfy the
    /// read when that is known, otherwise the read's remaining budget.
    NeedMore { wanted: Option<usize> },
    /// The delimiter scan reached its maximum length without a match.
    MaxedOut { max: usize },
}

/// A pending read.
#[derive(Debug)]
pub struct ReadOp {
    pub(crate) id: u64,
    pub tag: Tag,
    pub kind: ReadKind,
    pub timeout: Option<Duration>,
    buf: ByteBuffer,
    pub(crate) queued_at: Instant,
    pub(crate) timer: Option<TimerHandle>,
}

impl ReadOp {
    pub fn new(kind: ReadKind, timeout: Option<Duration>, tag: Tag) -> Self {
        let capacity = match &kind {
            ReadKind::Exact(n) => (*n).min(EXACT_READ_PREALLOC_MAX),
            _ => READ_OP_INITIAL_CAP,
        };
        Self {
            id: next_op_id(),
            tag,
            kind,
            timeout,
            buf: ByteBuffer::with_capacity(capacity),
            queued_at: Instant::now(),
            timer: None,
        }
    }

    /// Bytes accumulated so far.
    #[must_use]
    pub fn bytes_done(&self) -> usize {
        self.buf.len()
    }

    /// True for reads that complete without any input.
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        matches!(self.kind, ReadKind::Exact(0))
    }

    /// Pull what this read needs out of `prebuffer`.
    ///
    /// Bytes the read does not need stay in `prebuffer`, in order.
    pub fn absorb(&mut self, prebuffer: &mut ByteBuffer) -> ReadProgress {
        match &self.kind {
            ReadKind::Exact(n) => {
                let n = *n;
                let missing = n - self.buf.len();
                prebuffer.transfer_to(&mut self.buf, missing);
                if self.buf.len() == n {
                    ReadProgress::Done(self.buf.take_all())
                } else {
                    ReadProgress::NeedMore {
                        wanted: Some(n - self.buf.len()),
                    }
                }
            }
            ReadKind::Delimiter {
                delimiter,
                max_length,
            } => {
                let (dlen, max) = (delimiter.len(), *max_length);
                if dlen == 0 {
                    return ReadProgress::Done(Bytes::new());
                }
                // A delimiter may straddle the old tail and the new bytes.
                let scan_from = self.buf.len().saturating_sub(dlen - 1);
                prebuffer.transfer_to(&mut self.buf, prebuffer.len());

                if let Some(pos) = self.buf.find(delimiter, scan_from) {
                    let end = pos + dlen;
                    if max > 0 && end > max {
                        let rest = self.buf.split_off(max);
                        prebuffer.prepend(rest.as_slice());
                        return ReadProgress::MaxedOut { max };
                    }
                    let rest = self.buf.split_off(end);
                    prebuffer.prepend(rest.as_slice());
                    return ReadProgress::Done(self.buf.take_all());
                }

                if max > 0 && self.buf.len() >= max {
                    let rest = self.buf.split_off(max);
                    prebuffer.prepend(rest.as_slice());
                    return ReadProgress::MaxedOut { max };
                }
                ReadProgress::NeedMore {
                    wanted: (max > 0).then(|| max - self.buf.len()),
                }
            }
            ReadKind::UpTo(max) => {
                if prebuffer.is_empty() {
                    return ReadProgress::NeedMore {
                        wanted: (*max > 0).then_some(*max),
                    };
                }
                let n = if *max == 0 {
                    prebuffer.len()
                } else {
                    (*max).min(prebuffer.len())
                };
                prebuffer.transfer_to(&mut self.buf, n);
                ReadProgress::Done(self.buf.take_all())
            }
        }
    }

    /// Disarm the timeout, if any.
    pub(crate) fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Abandon the read, returning its accumulated bytes to the front of
    /// `prebuffer` so the next read sees them first.
    pub fn unwind_into(mut self, prebuffer: &mut ByteBuffer) {
        self.disarm();
        let taken = self.buf.take_all();
        prebuffer.prepend(&taken);
    }
}

/// A pending write.
#[derive(Debug)]
pub struct WriteOp {
    pub(crate) id: u64,
    pub tag: Tag,
    pub timeout: Option<Duration>,
    data: Bytes,
    offset: usize,
    pub(crate) queued_at: Instant,
    pub(crate) timer: Option<TimerHandle>,
}

impl WriteOp {
    pub fn new(data: Bytes, timeout: Option<Duration>, tag: Tag) -> Self {
        Self {
            id: next_op_id(),
            tag,
            timeout,
            data,
            offset: 0,
            queued_at: Instant::now(),
            timer: None,
        }
    }

    /// The bytes not yet accepted by the kernel.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Record that the kernel accepted `n` more bytes.
    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }

    #[must_use]
    pub fn bytes_done(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.offset == self.data.len()
    }

    /// Disarm the timeout, if any.
    pub(crate) fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Entry in a per-direction queue. A TLS upgrade is queued in both
/// directions and starts once it heads both queues.
#[derive(Debug)]
pub(crate) enum Queued<T> {
    Op(T),
    StartTls,
}
