//! Error types shared by every protocol engine
//!
//! A single [`TransferError`] enum covers the error kinds laid out for the
//! transfer protocols: transport-fatal, transport-transient (after the retry
//! budget is spent), framing/parse, protocol violations, local I/O, and
//! cancellation. `Display` renders the short uppercase tag that is also what
//! gets pushed onto the session message log.

use thiserror::Error;

/// Errors surfaced by [`crate::core::transport::ByteTransport`] implementations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The read did not complete within the requested timeout.
    #[error("timed out")]
    Timeout,
    /// The underlying stream has terminated; no more bytes will arrive.
    #[error("end of stream")]
    EndOfStream,
    /// The blocking read was interrupted by `cancel_read()`.
    #[error("read cancelled")]
    Cancelled,
    /// Any other I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Errors surfaced by [`crate::core::local_file::LocalFile`] implementations.
#[derive(Error, Debug)]
pub enum LocalFileError {
    /// Failed to open, create, read or write the local file.
    #[error("unable to access local file: {0}")]
    Io(String),
}

/// The error kinds a protocol engine can terminate with.
///
/// Every variant's `Display` text is the exact uppercase tag the session
/// message log records per the error-handling design.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The transport ended or failed irrecoverably mid-transfer.
    #[error("CONNECTION LOST")]
    TransportFatal(#[source] TransportErrorSource),

    /// The retry budget for a single packet/block was exhausted.
    #[error("TOO MANY ERRORS")]
    TooManyRetries,

    /// A single read timed out (retryable; counted toward the retry budget).
    #[error("TIMEOUT")]
    Timeout,

    /// A received block/packet failed its checksum or CRC.
    #[error("CHECKSUM ERROR IN BLOCK #{block}")]
    ChecksumMismatch {
        /// 1-based block/packet number.
        block: u32,
    },

    /// A Kermit packet failed to parse (bad LEN/SEQ/TYPE/HCHECK/encoding).
    #[error("PACKET PARSE ERROR: {0}")]
    FramingError(&'static str),

    /// An Xmodem block's (seq, 255-seq) pair was not complementary.
    #[error("BLOCK SEQUENCE CHECK FAILED")]
    BadBlockComplement,

    /// A packet arrived with a sequence number outside {expected, expected-1}.
    #[error("PROTOCOL ERROR, INVALID PACKET SEQUENCE")]
    InvalidSequence,

    /// An unexpected packet type arrived for the engine's current state.
    #[error("PROTOCOL ERROR, UNEXPECTED PACKET TYPE")]
    UnexpectedPacketType,

    /// The remote sent an explicit Kermit ERROR packet.
    #[error("REMOTE ERROR: {0}")]
    RemoteError(String),

    /// The remote sent CAN (Xmodem) to abort the transfer.
    #[error("CANCELLED BY REMOTE")]
    CancelledByRemote,

    /// The local user requested cancellation.
    #[error("CANCELLED BY USER")]
    CancelledByUser,

    /// The flavor was downgraded (not fatal; recorded for the message log).
    #[error("DOWNGRADE TO {0}")]
    Downgrade(&'static str),

    /// Failed to read, write, open, or delete the local file.
    #[error("UNABLE TO ACCESS LOCAL FILE: {0}")]
    LocalIo(#[from] LocalFileError),
}

/// Boxed transport error, kept distinct from [`TransportError`] so that
/// `TransferError` does not need a generic parameter.
#[derive(Debug)]
pub struct TransportErrorSource(pub TransportError);

impl std::fmt::Display for TransportErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportErrorSource {}

impl From<TransportError> for TransferError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => TransferError::Timeout,
            other => TransferError::TransportFatal(TransportErrorSource(other)),
        }
    }
}

/// Convenience alias used throughout the engines.
pub type Result<T> = std::result::Result<T, TransferError>;
