//! Protocol implementations
//!
//! Provides the wire-level building blocks the transfer engines share:
//! - Checksum and CRC algorithms (`checksum`)
//! - The Xmodem block format and send/receive state machine (`xmodem`)
//! - Ymodem's block-0 filename header on top of Xmodem (`ymodem`)

pub mod checksum;
pub mod xmodem;
pub mod ymodem;
