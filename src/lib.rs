//! # transferkit
//!
//! Protocol engines for the classic serial file-transfer protocols:
//! Xmodem (Vanilla, Relaxed, CRC, 1K, 1K/G), Ymodem, and Kermit.
//!
//! This crate is transport-agnostic: every engine drives an abstract
//! [`core::transport::ByteTransport`] and [`core::local_file::LocalFile`]
//! pair, so callers can plug in a serial port, a TCP socket, or an
//! in-memory loopback for tests without the engines knowing the
//! difference.
//!
//! ## Example
//!
//! ```rust,no_run
//! use transferkit::{ProtocolKind, Session};
//! use transferkit::protocol::xmodem::{XmodemEngine, XmodemFlavor};
//!
//! # async fn run(mut transport: impl transferkit::ByteTransport, mut file: impl transferkit::LocalFile) -> transferkit::Result<()> {
//! let session = Session::new(ProtocolKind::Xmodem, false);
//! let idx = session.begin_file(transferkit::FileInfo::new("report.bin", 128));
//! let engine = XmodemEngine::new(XmodemFlavor::Crc);
//! engine.receive_file(&mut transport, &mut file, &session, idx).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod core;

pub use crate::core::error::{LocalFileError, Result, TransferError, TransportError};
pub use crate::core::local_file::{LocalFile, ProtectionBits};
pub use crate::core::session::{
    CancelMode, ExitCondition, FileInfo, ProgressSnapshot, ProtocolKind, Session, SessionState,
};
pub use crate::core::transport::{ByteTransport, ReadOutcome};

pub use crate::core::{kermit, protocol};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
