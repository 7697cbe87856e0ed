//! In-memory transport and file harness shared by the integration tests
//!
//! Grounded in `awelkie-xmodem`'s `tests/loopback.rs` convention: drive both
//! ends of a transfer against in-memory buffers instead of a real serial
//! line or external `sx`/`sz` process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use transferkit::core::error::{LocalFileError, TransportError};
use transferkit::{ByteTransport, LocalFile, ReadOutcome};

struct Queue {
    bytes: Mutex<VecDeque<u8>>,
}

impl Queue {
    fn new() -> Self {
        Self { bytes: Mutex::new(VecDeque::new()) }
    }
}

/// One direction of an in-memory duplex byte pipe.
pub struct LoopbackTransport {
    inbound: Arc<Queue>,
    outbound: Arc<Queue>,
    cancelled: Arc<AtomicBool>,
    corrupt_every_nth: Option<usize>,
    write_count: usize,
}

/// Build a connected pair: writes to `.0` arrive as reads on `.1` and vice versa.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let a_to_b = Arc::new(Queue::new());
    let b_to_a = Arc::new(Queue::new());
    let a = LoopbackTransport {
        inbound: b_to_a.clone(),
        outbound: a_to_b.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        corrupt_every_nth: None,
        write_count: 0,
    };
    let b = LoopbackTransport {
        inbound: a_to_b,
        outbound: b_to_a,
        cancelled: Arc::new(AtomicBool::new(false)),
        corrupt_every_nth: None,
        write_count: 0,
    };
    (a, b)
}

impl LoopbackTransport {
    /// Flip the low bit of every `n`th byte written on this side, to
    /// exercise checksum-mismatch retransmission.
    pub fn with_noise(mut self, every_nth: usize) -> Self {
        self.corrupt_every_nth = Some(every_nth);
        self
    }
}

#[async_trait]
impl ByteTransport for LoopbackTransport {
    async fn read(&mut self, timeout: Duration) -> ReadOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return ReadOutcome::Cancelled;
            }
            if let Some(b) = self.inbound.bytes.lock().unwrap().pop_front() {
                return ReadOutcome::Byte(b);
            }
            if Instant::now() >= deadline {
                return ReadOutcome::TimedOut;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn read_into(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut n = 0;
        while n < buf.len() {
            let per_byte_timeout = if n == 0 { timeout } else { Duration::from_millis(500) };
            match self.read(per_byte_timeout).await {
                ReadOutcome::Byte(b) => {
                    buf[n] = b;
                    n += 1;
                }
                ReadOutcome::TimedOut if n > 0 => return Ok(n),
                ReadOutcome::TimedOut => return Err(TransportError::Timeout),
                ReadOutcome::EndOfStream => return Err(TransportError::EndOfStream),
                ReadOutcome::Cancelled => return Err(TransportError::Cancelled),
            }
        }
        Ok(n)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut queue = self.outbound.bytes.lock().unwrap();
        for &b in bytes {
            self.write_count += 1;
            let corrupt = self
                .corrupt_every_nth
                .is_some_and(|n| n > 0 && self.write_count % n == 0);
            queue.push_back(if corrupt { b ^ 0x01 } else { b });
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn available(&mut self) -> usize {
        self.inbound.bytes.lock().unwrap().len()
    }

    async fn skip(&mut self, n: usize) {
        let mut queue = self.inbound.bytes.lock().unwrap();
        for _ in 0..n {
            if queue.pop_front().is_none() {
                break;
            }
        }
    }

    fn cancel_read(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// An in-memory [`LocalFile`] backed by a `Vec<u8>`, with a separate read
/// cursor so the same buffer can be drained sequentially.
pub struct MemoryFile {
    data: Vec<u8>,
    cursor: usize,
    modified: Option<DateTime<Utc>>,
    deleted: bool,
}

impl MemoryFile {
    /// Create a file pre-populated with `data`, ready to be sent.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data, cursor: 0, modified: None, deleted: false }
    }

    /// Create an empty file, ready to be written into.
    pub fn empty() -> Self {
        Self::with_data(Vec::new())
    }

    /// The bytes written so far (or the full source buffer for a sender).
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Whether `delete()` was called.
    pub fn was_deleted(&self) -> bool {
        self.deleted
    }
}

#[async_trait]
impl LocalFile for MemoryFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LocalFileError> {
        let remaining = &self.data[self.cursor..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.cursor += n;
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), LocalFileError> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    async fn len(&self) -> Result<u64, LocalFileError> {
        Ok(self.data.len() as u64)
    }

    async fn modified(&self) -> Result<Option<DateTime<Utc>>, LocalFileError> {
        Ok(self.modified)
    }

    async fn set_modified(&mut self, when: DateTime<Utc>) -> Result<(), LocalFileError> {
        self.modified = Some(when);
        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> Result<(), LocalFileError> {
        self.data.truncate(len as usize);
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), LocalFileError> {
        self.data.clear();
        self.deleted = true;
        Ok(())
    }
}
