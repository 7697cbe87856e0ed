//! Kermit implementation
//!
//! Provides the wire-level building blocks and state machine Kermit needs
//! on top of the shared [`crate::core::transport::ByteTransport`] and
//! [`crate::core::local_file::LocalFile`] abstractions:
//! - Packet framing and data quoting (`packet`)
//! - Send-Init parameter negotiation (`negotiation`)
//! - The sender/receiver state machines (`engine`)

pub mod engine;
pub mod negotiation;
pub mod packet;
