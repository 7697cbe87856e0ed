//! Core module: transport-agnostic building blocks for the transfer engines
//!
//! This module provides:
//! - Error types shared by every engine (`error`)
//! - The abstract byte transport every engine drives (`transport`)
//! - The abstract local file every engine reads from or writes to (`local_file`)
//! - Session state and progress reporting (`session`)
//! - Checksums and the Xmodem/Ymodem block formats (`protocol`)
//! - Kermit packet framing, negotiation, and the send/receive state machines (`kermit`)

pub mod error;
pub mod kermit;
pub mod local_file;
pub mod protocol;
pub mod session;
pub mod transport;
