//! Xmodem: framed 128- or 1024-byte blocks over a NAK/ACK or streaming
//! handshake, in its Vanilla, Relaxed, CRC, 1K and 1K/G flavors.

use std::time::Duration;

use super::checksum;
use crate::core::error::{Result, TransferError, TransportError};
use crate::core::local_file::LocalFile;
use crate::core::session::{CancelMode, Session};
use crate::core::transport::{ByteTransport, ReadOutcome};

pub(crate) const SOH: u8 = 0x01;
pub(crate) const STX: u8 = 0x02;
pub(crate) const EOT: u8 = 0x04;
pub(crate) const ACK: u8 = 0x06;
pub(crate) const NAK: u8 = 0x15;
pub(crate) const CAN: u8 = 0x18;
pub(crate) const SUB: u8 = 0x1A;
pub(crate) const C: u8 = b'C';
pub(crate) const G: u8 = b'G';

pub(crate) const MAX_RETRIES: u32 = 10;

/// Which Xmodem variant is in play. `Vanilla` and `Relaxed` share the wire
/// format; they differ only in how patient the receiver is on timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmodemFlavor {
    /// 128-byte blocks, 8-bit sum, 10s timeout.
    Vanilla,
    /// 128-byte blocks, 8-bit sum, 100s timeout.
    Relaxed,
    /// 128-byte blocks, CRC-16, 10s timeout.
    Crc,
    /// 1024-byte blocks, CRC-16, 10s timeout.
    OneK,
    /// 1024-byte blocks, CRC-16, 10s timeout, no per-block ACK (streaming).
    OneKG,
}

impl XmodemFlavor {
    pub(crate) fn block_size(self) -> usize {
        match self {
            XmodemFlavor::OneK | XmodemFlavor::OneKG => 1024,
            _ => 128,
        }
    }

    pub(crate) fn uses_crc(self) -> bool {
        !matches!(self, XmodemFlavor::Vanilla | XmodemFlavor::Relaxed)
    }

    pub(crate) fn streaming(self) -> bool {
        matches!(self, XmodemFlavor::OneKG)
    }

    pub(crate) fn handshake_byte(self) -> u8 {
        match self {
            XmodemFlavor::Vanilla | XmodemFlavor::Relaxed => NAK,
            XmodemFlavor::Crc | XmodemFlavor::OneK => C,
            XmodemFlavor::OneKG => G,
        }
    }

    pub(crate) fn timeout(self) -> Duration {
        match self {
            XmodemFlavor::Relaxed => Duration::from_secs(100),
            _ => Duration::from_secs(10),
        }
    }

    pub(crate) fn downgrade(self) -> Option<XmodemFlavor> {
        match self {
            XmodemFlavor::Crc => Some(XmodemFlavor::Vanilla),
            XmodemFlavor::OneKG => Some(XmodemFlavor::OneK),
            _ => None,
        }
    }

    /// Map a handshake byte seen on the wire to the flavor it selects,
    /// keeping `requested`'s 1K/Relaxed preference where the byte is
    /// ambiguous between two flavors that share it.
    pub(crate) fn from_handshake(requested: XmodemFlavor, byte: u8) -> Option<XmodemFlavor> {
        match byte {
            NAK => Some(if requested == XmodemFlavor::Relaxed {
                XmodemFlavor::Relaxed
            } else {
                XmodemFlavor::Vanilla
            }),
            C => Some(if requested == XmodemFlavor::OneK {
                XmodemFlavor::OneK
            } else {
                XmodemFlavor::Crc
            }),
            G => Some(XmodemFlavor::OneKG),
            _ => None,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            XmodemFlavor::Vanilla => "XMODEM",
            XmodemFlavor::Relaxed => "XMODEM (relaxed timeout)",
            XmodemFlavor::Crc => "XMODEM-CRC",
            XmodemFlavor::OneK => "XMODEM-1K",
            XmodemFlavor::OneKG => "XMODEM-1K/G",
        }
    }
}

pub(crate) fn frame_header(block_size: usize) -> u8 {
    if block_size == 1024 {
        STX
    } else {
        SOH
    }
}

pub(crate) fn build_block(flavor: XmodemFlavor, seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 5);
    packet.push(frame_header(payload.len()));
    packet.push(seq);
    packet.push(!seq);
    packet.extend_from_slice(payload);
    if flavor.uses_crc() {
        let crc = checksum::crc16_xmodem(payload);
        packet.push((crc >> 8) as u8);
        packet.push((crc & 0xFF) as u8);
    } else {
        packet.push(checksum::sum8(payload, false));
    }
    packet
}

fn cancellation_error() -> TransferError {
    TransferError::CancelledByUser
}

/// Discard whatever has already arrived without blocking, so a retransmit
/// isn't framed against line noise left over from the block just rejected.
async fn purge(transport: &mut dyn ByteTransport) {
    let n = transport.available().await;
    if n > 0 {
        transport.skip(n).await;
    }
}

/// Send or receive a single file using one Xmodem flavor.
///
/// The engine is generic over the transport and local file; callers supply
/// a [`Session`] and the index of the [`crate::core::session::FileInfo`] it
/// should report progress against.
pub struct XmodemEngine {
    flavor: XmodemFlavor,
}

impl XmodemEngine {
    /// Create an engine that will try for (and may downgrade away from)
    /// `flavor`.
    pub fn new(flavor: XmodemFlavor) -> Self {
        Self { flavor }
    }

    /// Human-readable protocol name for logs and `FileInfo` display.
    pub fn name(&self) -> &'static str {
        self.flavor.name()
    }

    /// The flavor this engine was configured with (before any downgrade).
    pub(crate) fn flavor(&self) -> XmodemFlavor {
        self.flavor
    }

    /// Receive one file: drive the handshake, accept blocks, and write
    /// them to `file` via `session`'s file slot `file_idx`.
    pub async fn receive_file(
        &self,
        transport: &mut dyn ByteTransport,
        file: &mut dyn LocalFile,
        session: &Session,
        file_idx: usize,
    ) -> Result<()> {
        let mut flavor = self.flavor;
        let mut expected_seq: u8 = 1;
        let mut error_count: u32 = 0;
        let mut handshake_failures: u32 = 0;
        let mut awaiting_first_block = true;
        let mut pending_block: Option<Vec<u8>> = None;
        let mut bytes_written: u64 = 0;
        let mut blocks_written: u32 = 0;

        loop {
            if self.check_cancel(transport, session).await? {
                return Err(cancellation_error());
            }

            if awaiting_first_block {
                transport.write_all(&[flavor.handshake_byte()]).await?;
                transport.flush().await?;
            }

            let header = match transport.read(flavor.timeout()).await {
                ReadOutcome::Byte(b) => b,
                ReadOutcome::TimedOut => {
                    if awaiting_first_block {
                        handshake_failures += 1;
                        if handshake_failures >= 3 {
                            if let Some(next) = flavor.downgrade() {
                                session.log(format!("DOWNGRADE TO {}", next.name()));
                                flavor = next;
                                handshake_failures = 0;
                            }
                        }
                        continue;
                    }
                    error_count += 1;
                    session.record_error(file_idx);
                    if error_count >= MAX_RETRIES {
                        return Err(TransferError::TooManyRetries);
                    }
                    purge(transport).await;
                    transport.write_all(&[NAK]).await?;
                    continue;
                }
                ReadOutcome::EndOfStream => return Err(TransportError::EndOfStream.into()),
                ReadOutcome::Cancelled => return Err(cancellation_error()),
            };

            match header {
                EOT => {
                    if let Some(mut last) = pending_block.take() {
                        while last.last() == Some(&SUB) {
                            last.pop();
                        }
                        file.write(&last).await?;
                        bytes_written += last.len() as u64;
                        blocks_written += 1;
                        session.record_progress(file_idx, bytes_written, blocks_written);
                    }
                    transport.write_all(&[ACK]).await?;
                    transport.flush().await?;
                    return Ok(());
                }
                CAN => return Err(TransferError::CancelledByRemote),
                SOH | STX => {
                    awaiting_first_block = false;
                    let block_size = if header == STX { 1024 } else { 128 };

                    let mut seq_bytes = [0u8; 2];
                    if transport.read_into(&mut seq_bytes, flavor.timeout()).await? < 2 {
                        error_count += 1;
                        purge(transport).await;
                        transport.write_all(&[NAK]).await?;
                        continue;
                    }
                    let (seq, comp) = (seq_bytes[0], seq_bytes[1]);

                    let mut payload = vec![0u8; block_size];
                    if transport.read_into(&mut payload, flavor.timeout()).await? < block_size {
                        error_count += 1;
                        session.record_error(file_idx);
                        purge(transport).await;
                        transport.write_all(&[NAK]).await?;
                        continue;
                    }

                    let check_len = if flavor.uses_crc() { 2 } else { 1 };
                    let mut check = vec![0u8; check_len];
                    if transport.read_into(&mut check, flavor.timeout()).await? < check_len {
                        error_count += 1;
                        purge(transport).await;
                        transport.write_all(&[NAK]).await?;
                        continue;
                    }

                    if seq != !comp {
                        error_count += 1;
                        session.record_error(file_idx);
                        session.log("BLOCK SEQUENCE CHECK FAILED");
                        purge(transport).await;
                        transport.write_all(&[NAK]).await?;
                        continue;
                    }

                    let valid = if flavor.uses_crc() {
                        let received = ((check[0] as u16) << 8) | check[1] as u16;
                        checksum::crc16_xmodem(&payload) == received
                    } else {
                        checksum::sum8(&payload, false) == check[0]
                    };
                    if !valid {
                        error_count += 1;
                        session.record_error(file_idx);
                        session.log(format!("CHECKSUM ERROR IN BLOCK #{seq}"));
                        purge(transport).await;
                        transport.write_all(&[NAK]).await?;
                        continue;
                    }

                    error_count = 0;
                    let is_duplicate = seq == expected_seq.wrapping_sub(1);
                    if seq == expected_seq {
                        if let Some(prev) = pending_block.take() {
                            file.write(&prev).await?;
                            bytes_written += prev.len() as u64;
                            blocks_written += 1;
                            session.record_progress(file_idx, bytes_written, blocks_written);
                        }
                        pending_block = Some(payload);
                        expected_seq = expected_seq.wrapping_add(1);
                    } else if !is_duplicate {
                        return Err(TransferError::InvalidSequence);
                    }

                    if !flavor.streaming() {
                        transport.write_all(&[ACK]).await?;
                        transport.flush().await?;
                    }
                }
                _ => {
                    error_count += 1;
                    purge(transport).await;
                    transport.write_all(&[NAK]).await?;
                }
            }
        }
    }

    /// Send one file: negotiate the flavor from the receiver's handshake,
    /// then stream blocks read from `file`.
    pub async fn send_file(
        &self,
        transport: &mut dyn ByteTransport,
        file: &mut dyn LocalFile,
        session: &Session,
        file_idx: usize,
    ) -> Result<()> {
        let mut handshake_failures: u32 = 0;
        let flavor = loop {
            if self.check_cancel(transport, session).await? {
                return Err(cancellation_error());
            }
            match transport.read(Duration::from_secs(60)).await {
                ReadOutcome::Byte(CAN) => return Err(TransferError::CancelledByRemote),
                ReadOutcome::Byte(b) => {
                    if let Some(flavor) = XmodemFlavor::from_handshake(self.flavor, b) {
                        break flavor;
                    }
                    continue;
                }
                ReadOutcome::TimedOut => {
                    handshake_failures += 1;
                    if handshake_failures >= MAX_RETRIES {
                        return Err(TransferError::TooManyRetries);
                    }
                    continue;
                }
                ReadOutcome::EndOfStream => return Err(TransportError::EndOfStream.into()),
                ReadOutcome::Cancelled => return Err(cancellation_error()),
            }
        };

        let total_len = file.len().await?;
        let mut seq: u8 = 1;
        let mut bytes_sent: u64 = 0;
        let mut blocks_sent: u32 = 0;

        loop {
            let remaining = total_len.saturating_sub(bytes_sent);
            if remaining == 0 {
                break;
            }

            let block_size = if flavor.block_size() == 1024 && remaining > 128 {
                1024
            } else {
                128
            };

            let mut buf = vec![0u8; block_size];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            if buf.len() < block_size {
                buf.resize(block_size, SUB);
            }

            let packet = build_block(flavor, seq, &buf);
            let mut retries: u32 = 0;
            loop {
                if self.check_cancel(transport, session).await? {
                    transport.write_all(&[CAN, CAN, CAN]).await.ok();
                    return Err(cancellation_error());
                }

                transport.write_all(&packet).await?;
                transport.flush().await?;

                if flavor.streaming() {
                    break;
                }

                match transport.read(flavor.timeout()).await {
                    ReadOutcome::Byte(ACK) => break,
                    ReadOutcome::Byte(CAN) => return Err(TransferError::CancelledByRemote),
                    ReadOutcome::Cancelled => return Err(cancellation_error()),
                    ReadOutcome::EndOfStream => return Err(TransportError::EndOfStream.into()),
                    _ => {
                        retries += 1;
                        session.record_error(file_idx);
                        if retries >= MAX_RETRIES {
                            return Err(TransferError::TooManyRetries);
                        }
                    }
                }
            }

            seq = seq.wrapping_add(1);
            bytes_sent += n as u64;
            blocks_sent += 1;
            session.record_progress(file_idx, bytes_sent, blocks_sent);
        }

        let mut retries: u32 = 0;
        loop {
            transport.write_all(&[EOT]).await?;
            transport.flush().await?;
            match transport.read(flavor.timeout()).await {
                ReadOutcome::Byte(ACK) => return Ok(()),
                ReadOutcome::Byte(CAN) => return Err(TransferError::CancelledByRemote),
                ReadOutcome::Cancelled => return Err(cancellation_error()),
                ReadOutcome::EndOfStream => return Err(TransportError::EndOfStream.into()),
                _ => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(TransferError::TooManyRetries);
                    }
                }
            }
        }
    }

    async fn check_cancel(&self, transport: &mut dyn ByteTransport, session: &Session) -> Result<bool> {
        if matches!(session.cancel_mode(), CancelMode::KeepPartial | CancelMode::DiscardPartial) {
            transport.cancel_read();
            return Ok(true);
        }
        Ok(false)
    }
}
