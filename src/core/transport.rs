//! Abstract byte transport
//!
//! [`ByteTransport`] is the only I/O dependency of the protocol engines: a
//! bidirectional, timed byte channel. It deliberately knows nothing about
//! serial ports, sockets, or any particular wire -- concrete transports
//! (serial, TCP, a loopback pair for tests) live outside this crate and are
//! supplied by the caller.

use async_trait::async_trait;
use std::time::Duration;

use super::error::TransportError;

/// Outcome of a single-byte read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One byte was read.
    Byte(u8),
    /// No byte arrived before the timeout; retryable.
    TimedOut,
    /// The stream has ended; fatal for the current transfer.
    EndOfStream,
    /// `cancel_read()` was called while this read was in flight.
    Cancelled,
}

/// A full-duplex, timed byte channel.
///
/// Implementations must never buffer more than one logical packet ahead of
/// what the caller has consumed -- engines re-read until framing succeeds,
/// and assume bytes they haven't asked for are still sitting in the
/// transport (or the OS) rather than in a private buffer here.
#[async_trait]
pub trait ByteTransport: Send {
    /// Read a single byte, waiting up to `timeout`.
    async fn read(&mut self, timeout: Duration) -> ReadOutcome;

    /// Fill up to `buf.len()` bytes, waiting up to `timeout` for the first
    /// byte. May return fewer bytes than requested (a short read) once at
    /// least one byte has arrived.
    async fn read_into(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write the entire buffer. Does not implicitly flush.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Flush any buffered writes out to the wire.
    async fn flush(&mut self) -> Result<(), TransportError>;

    /// Number of bytes currently available to read without blocking.
    async fn available(&mut self) -> usize;

    /// Discard up to `n` already-available bytes (used to purge line noise
    /// between retransmits).
    async fn skip(&mut self, n: usize);

    /// Cause the transport's current (or next) blocking read to return
    /// [`ReadOutcome::Cancelled`]. Cooperative: it does not drop the
    /// transport, just unblocks a read so the worker can observe the
    /// session's cancel flag.
    fn cancel_read(&self);
}
