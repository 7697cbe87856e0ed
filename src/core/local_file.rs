//! Narrow local-file interface
//!
//! Engines never touch the filesystem directly; they read and write through
//! a [`LocalFile`] so that callers can back a transfer with a real file, an
//! in-memory buffer (tests), or anything else that can produce and consume
//! bytes with a length and a modification time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::LocalFileError;

/// POSIX-like protection bits, as carried by a Ymodem block 0 or a Kermit
/// Attributes packet. Only the low 9 bits (rwxrwxrwx) are meaningful.
pub type ProtectionBits = u32;

/// A sink/source for the local half of a file transfer.
#[async_trait]
pub trait LocalFile: Send {
    /// Read up to `buf.len()` bytes starting at the file's current read
    /// cursor. Returns the number of bytes read (0 at EOF).
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LocalFileError>;

    /// Append `data` to the file.
    async fn write(&mut self, data: &[u8]) -> Result<(), LocalFileError>;

    /// Total length of the file in bytes.
    async fn len(&self) -> Result<u64, LocalFileError>;

    /// Whether the file is empty.
    async fn is_empty(&self) -> Result<bool, LocalFileError> {
        Ok(self.len().await? == 0)
    }

    /// Last modification time, if the underlying storage tracks one.
    async fn modified(&self) -> Result<Option<DateTime<Utc>>, LocalFileError>;

    /// POSIX-like protection bits, if the underlying storage tracks them.
    async fn protection(&self) -> Result<Option<ProtectionBits>, LocalFileError> {
        Ok(None)
    }

    /// Set the modification time after a transfer completes (Ymodem/Kermit
    /// carry the sender's mtime and the receiver applies it).
    async fn set_modified(&mut self, _when: DateTime<Utc>) -> Result<(), LocalFileError> {
        Ok(())
    }

    /// Truncate the file to `len` bytes (used to trim CP/M EOF padding).
    async fn truncate(&mut self, len: u64) -> Result<(), LocalFileError>;

    /// Delete the file. Called on a discard-partial cancellation.
    async fn delete(&mut self) -> Result<(), LocalFileError>;
}
