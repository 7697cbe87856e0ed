//! Kermit sender and receiver state machines
//!
//! Sender: `SINIT -> FILE -> [ATTR] -> DATA* -> EOF -> (more files? FILE : BREAK) -> COMPLETE`.
//! Receiver mirrors it, starting from a NAK(0) that doubles as its own
//! Send-Init solicitation.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::negotiation::{negotiate, KermitParameters, CAPAS_LONG_PACKETS, CAPAS_RESEND, CAPAS_STREAMING};
use super::packet::{decode_packet, encode_packet, KermitPacket, PacketType, ParseState, WireParams};
use crate::core::error::{Result, TransferError};
use crate::core::local_file::LocalFile;
use crate::core::session::{CancelMode, FileInfo, Session, SessionState};
use crate::core::transport::{ByteTransport, ReadOutcome};

const MAX_RETRIES: u32 = 10;
const MAX_FRAME_LEN: usize = 4096;

/// Environment options a caller can set before starting a Kermit session.
#[derive(Debug, Clone, Copy)]
pub struct KermitOptions {
    /// Offer/accept streaming (no per-packet ACK on DATA).
    pub streaming: bool,
    /// Send filenames verbatim instead of reducing them to restricted ASCII.
    pub robust_filenames: bool,
    /// Offer/accept CRC-based resend-from-point-of-failure recovery.
    pub resend: bool,
    /// Offer/accept long packets.
    pub long_packets: bool,
    /// Treat every file as binary even if it looks like text.
    pub force_binary: bool,
}

impl Default for KermitOptions {
    fn default() -> Self {
        Self {
            streaming: false,
            robust_filenames: false,
            resend: true,
            long_packets: true,
            force_binary: false,
        }
    }
}

fn timeout_for(active: &KermitParameters) -> Duration {
    if active.time == 0 {
        Duration::from_secs(10)
    } else {
        Duration::from_secs(active.time as u64)
    }
}

fn file_attributes(size: u64, modified: Option<DateTime<Utc>>) -> Vec<u8> {
    let mtime = modified
        .map(|m| m.format("%Y%m%d %H:%M:%S").to_string())
        .unwrap_or_default();
    format!("{size} {mtime}").into_bytes()
}

fn parse_attributes(data: &[u8]) -> (Option<u64>, Option<DateTime<Utc>>) {
    let text = String::from_utf8_lossy(data);
    let mut fields = text.split_whitespace();
    let size = fields.next().and_then(|s| s.parse::<u64>().ok());
    let modified = fields.next().and_then(|date| {
        fields
            .next()
            .map(|time| format!("{date} {time}"))
            .and_then(|stamp| {
                chrono::NaiveDateTime::parse_from_str(&stamp, "%Y%m%d %H:%M:%S").ok()
            })
            .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
    });
    (size, modified)
}

/// Reduces a filename to uppercase alphanumerics with a single separating dot,
/// the restricted form classic Kermit servers expect unless robust filenames
/// were negotiated.
fn restrict_filename(name: &str) -> String {
    let stem_and_ext = name.rsplit_once('.');
    let squash = |s: &str| -> String {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect()
    };
    match stem_and_ext {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{}.{}", squash(stem), squash(ext))
        }
        _ => squash(name),
    }
}

fn parse_error(state: ParseState) -> TransferError {
    match state {
        ParseState::ChecksumMismatch => TransferError::ChecksumMismatch { block: 0 },
        ParseState::BadLen => TransferError::FramingError("bad packet length"),
        ParseState::BadSeq => TransferError::FramingError("sequence number out of range"),
        ParseState::BadType => TransferError::FramingError("unrecognized packet type"),
        ParseState::BadHcheck => TransferError::FramingError("long-packet header check mismatch"),
        ParseState::EncodingError => TransferError::FramingError("quote/prefix decoding failed"),
        ParseState::Ok => unreachable!("Ok is not an error state"),
    }
}

/// Drives a Kermit batch send or receive over a raw [`ByteTransport`].
pub struct KermitEngine {
    options: KermitOptions,
}

impl KermitEngine {
    /// Create an engine configured with `options`.
    pub fn new(options: KermitOptions) -> Self {
        Self { options }
    }

    fn local_params(&self) -> KermitParameters {
        let mut capas = 0u8;
        if self.options.resend {
            capas |= CAPAS_RESEND;
        }
        if self.options.long_packets {
            capas |= CAPAS_LONG_PACKETS;
        }
        if self.options.streaming {
            capas |= CAPAS_STREAMING;
        }
        KermitParameters {
            chkt: b'3',
            qbin: b'Y',
            rept: b'~',
            capas,
            long_packets: self.options.long_packets,
            streaming: self.options.streaming,
            windowing: false,
            ..KermitParameters::default()
        }
    }

    async fn write_packet(
        &self,
        transport: &mut dyn ByteTransport,
        wire: &WireParams,
        packet: &KermitPacket,
    ) -> Result<()> {
        let frame = encode_packet(wire, packet);
        transport.write_all(&frame).await?;
        transport.flush().await?;
        Ok(())
    }

    async fn read_packet(
        &self,
        transport: &mut dyn ByteTransport,
        wire: &WireParams,
        timeout: Duration,
    ) -> Result<KermitPacket> {
        let mut buf = Vec::with_capacity(64);
        loop {
            match transport.read(timeout).await {
                ReadOutcome::Byte(b) => {
                    if buf.is_empty() && b != wire.mark {
                        continue;
                    }
                    buf.push(b);
                    if buf.len() > 1 && b == wire.eol {
                        let (packet, state) = decode_packet(wire, &buf);
                        return match packet {
                            Some(p) if state == ParseState::Ok => Ok(p),
                            _ => Err(parse_error(state)),
                        };
                    }
                    if buf.len() > MAX_FRAME_LEN {
                        return Err(TransferError::FramingError("frame exceeded maximum length"));
                    }
                }
                ReadOutcome::TimedOut => return Err(TransferError::Timeout),
                ReadOutcome::EndOfStream => return Err(crate::core::error::TransportError::EndOfStream.into()),
                ReadOutcome::Cancelled => return Err(TransferError::CancelledByUser),
            }
        }
    }

    /// Discard whatever has already arrived without blocking, so a
    /// retransmit doesn't get framed against line noise left over from the
    /// packet that was just rejected.
    async fn purge(&self, transport: &mut dyn ByteTransport) {
        let n = transport.available().await;
        if n > 0 {
            transport.skip(n).await;
        }
    }

    /// Read one packet, NAKing `nak_seq` and retrying on a timeout or parse
    /// failure, up to [`MAX_RETRIES`]. Transport-fatal errors and user
    /// cancellation are not retried.
    async fn read_or_nak(
        &self,
        transport: &mut dyn ByteTransport,
        wire: &WireParams,
        timeout: Duration,
        session: &Session,
        file_idx: Option<usize>,
        nak_seq: u8,
    ) -> Result<KermitPacket> {
        let mut retries: u32 = 0;
        loop {
            match self.read_packet(transport, wire, timeout).await {
                Ok(p) => return Ok(p),
                Err(e @ (TransferError::TransportFatal(_) | TransferError::CancelledByUser)) => return Err(e),
                Err(_) => {
                    if let Some(idx) = file_idx {
                        session.record_error(idx);
                    }
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(TransferError::TooManyRetries);
                    }
                    self.purge(transport).await;
                    let nak = KermitPacket::new(nak_seq, PacketType::Nak, Vec::new());
                    self.write_packet(transport, wire, &nak).await?;
                }
            }
        }
    }

    async fn check_cancel(&self, transport: &mut dyn ByteTransport, session: &Session) -> bool {
        if matches!(session.cancel_mode(), CancelMode::KeepPartial | CancelMode::DiscardPartial) {
            transport.cancel_read();
            return true;
        }
        false
    }

    async fn send_error(&self, transport: &mut dyn ByteTransport, wire: &WireParams, seq: u8, message: &str) {
        let packet = KermitPacket::new(seq, PacketType::Error, message.as_bytes().to_vec());
        let _ = self.write_packet(transport, wire, &packet).await;
    }

    async fn abort(
        &self,
        transport: &mut dyn ByteTransport,
        wire: &WireParams,
        session: &Session,
        seq: u8,
        file: Option<&mut dyn LocalFile>,
    ) -> TransferError {
        self.send_error(transport, wire, seq, "CANCELLED BY USER").await;
        session.set_state(SessionState::Abort);
        if session.cancel_mode() == CancelMode::DiscardPartial {
            if let Some(file) = file {
                let _ = file.delete().await;
            }
        }
        TransferError::CancelledByUser
    }

    /// Send a Send-Init and negotiate parameters with the receiver's ACK.
    async fn exchange_init(
        &self,
        transport: &mut dyn ByteTransport,
        local: &KermitParameters,
    ) -> Result<KermitParameters> {
        let bootstrap = local.wire_params(false, false);
        let init = KermitPacket::new(0, PacketType::SendInit, local.encode());
        let mut retries: u32 = 0;
        loop {
            self.write_packet(transport, &bootstrap, &init).await?;
            match self.read_packet(transport, &bootstrap, Duration::from_secs(10)).await {
                Ok(p) if p.kind == PacketType::Ack => {
                    let remote = KermitParameters::decode(&p.data);
                    return Ok(negotiate(local, &remote));
                }
                Ok(p) if p.kind == PacketType::Error => {
                    return Err(TransferError::RemoteError(String::from_utf8_lossy(&p.data).into_owned()));
                }
                _ => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(TransferError::TooManyRetries);
                    }
                }
            }
        }
    }

    /// Wait for the sender's Send-Init and ACK it with our own parameters.
    async fn wait_for_init(
        &self,
        transport: &mut dyn ByteTransport,
        local: &KermitParameters,
    ) -> Result<KermitParameters> {
        let bootstrap = local.wire_params(false, false);
        let mut retries: u32 = 0;
        loop {
            match self.read_packet(transport, &bootstrap, Duration::from_secs(60)).await {
                Ok(p) if p.kind == PacketType::SendInit => {
                    let remote = KermitParameters::decode(&p.data);
                    let active = negotiate(local, &remote);
                    let ack = KermitPacket::new(0, PacketType::Ack, local.encode());
                    self.write_packet(transport, &bootstrap, &ack).await?;
                    return Ok(active);
                }
                Ok(p) if p.kind == PacketType::Error => {
                    return Err(TransferError::RemoteError(String::from_utf8_lossy(&p.data).into_owned()));
                }
                _ => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(TransferError::TooManyRetries);
                    }
                }
            }
        }
    }

    async fn send_and_ack(
        &self,
        transport: &mut dyn ByteTransport,
        wire: &WireParams,
        timeout: Duration,
        packet: &KermitPacket,
    ) -> Result<()> {
        let mut retries: u32 = 0;
        loop {
            self.write_packet(transport, wire, packet).await?;
            match self.read_packet(transport, wire, timeout).await {
                Ok(p) if p.kind == PacketType::Ack && p.seq == packet.seq => return Ok(()),
                Ok(p) if p.kind == PacketType::Error => {
                    return Err(TransferError::RemoteError(String::from_utf8_lossy(&p.data).into_owned()));
                }
                _ => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(TransferError::TooManyRetries);
                    }
                }
            }
        }
    }

    async fn ack(&self, transport: &mut dyn ByteTransport, wire: &WireParams, seq: u8, data: Vec<u8>) -> Result<()> {
        let packet = KermitPacket::new(seq, PacketType::Ack, data);
        self.write_packet(transport, wire, &packet).await
    }

    /// Send a batch of already-opened files.
    pub async fn send_files(
        &self,
        transport: &mut dyn ByteTransport,
        session: &Session,
        files: &mut [(String, Box<dyn LocalFile>)],
    ) -> Result<()> {
        session.set_state(SessionState::Init);
        let local = self.local_params();
        let active = self.exchange_init(transport, &local).await?;
        let wire = active.wire_params(false, !self.options.force_binary);
        let timeout = timeout_for(&active);

        let mut seq: u8 = 1;
        for (name, file) in files.iter_mut() {
            if self.check_cancel(transport, session).await {
                return Err(self.abort(transport, &wire, session, seq, Some(file.as_mut())).await);
            }

            session.set_state(SessionState::FileInfo);
            let wire_name = if self.options.robust_filenames {
                name.clone()
            } else {
                restrict_filename(name)
            };
            let file_packet = KermitPacket::new(seq, PacketType::File, wire_name.into_bytes());
            self.send_and_ack(transport, &wire, timeout, &file_packet).await?;
            seq = seq.wrapping_add(1) % 64;

            let size = file.len().await?;
            let modified = file.modified().await?;
            let attr_packet = KermitPacket::new(seq, PacketType::Attributes, file_attributes(size, modified));
            self.send_and_ack(transport, &wire, timeout, &attr_packet).await?;
            seq = seq.wrapping_add(1) % 64;

            let mut info = FileInfo::new(name.clone(), active.maxl as usize);
            info.size = Some(size);
            info.modified = modified;
            let idx = session.begin_file(info);

            session.set_state(SessionState::Transfer);
            let outcome = self
                .send_file_data(transport, session, &wire, timeout, active.streaming, active.maxl, &mut seq, file.as_mut(), idx)
                .await;
            session.finish_file(idx, outcome.is_ok());
            session.set_state(SessionState::FileDone);
            outcome?;

            let eof_packet = KermitPacket::new(seq, PacketType::Eof, Vec::new());
            self.send_and_ack(transport, &wire, timeout, &eof_packet).await?;
            seq = seq.wrapping_add(1) % 64;
        }

        let break_packet = KermitPacket::new(seq, PacketType::Break, Vec::new());
        self.send_and_ack(transport, &wire, timeout, &break_packet).await?;
        session.set_state(SessionState::End);
        Ok(())
    }

    async fn send_file_data(
        &self,
        transport: &mut dyn ByteTransport,
        session: &Session,
        wire: &WireParams,
        timeout: Duration,
        streaming: bool,
        maxl: u8,
        seq: &mut u8,
        file: &mut dyn LocalFile,
        file_idx: usize,
    ) -> Result<()> {
        let max_data = maxl.saturating_sub(3).max(1) as usize;
        let mut bytes_sent: u64 = 0;
        let mut blocks_sent: u32 = 0;

        loop {
            if self.check_cancel(transport, session).await {
                return Err(self.abort(transport, wire, session, *seq, Some(file)).await);
            }

            let mut buf = vec![0u8; max_data];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            buf.truncate(n);

            let packet = KermitPacket::new(*seq, PacketType::Data, buf);

            if streaming {
                self.write_packet(transport, wire, &packet).await?;
            } else {
                let mut retries: u32 = 0;
                loop {
                    self.write_packet(transport, wire, &packet).await?;
                    match self.read_packet(transport, wire, timeout).await {
                        Ok(p) if p.kind == PacketType::Ack && p.seq == packet.seq => break,
                        Ok(p) if p.kind == PacketType::Error => {
                            return Err(TransferError::RemoteError(String::from_utf8_lossy(&p.data).into_owned()));
                        }
                        _ => {
                            retries += 1;
                            session.record_error(file_idx);
                            if retries >= MAX_RETRIES {
                                return Err(TransferError::TooManyRetries);
                            }
                        }
                    }
                }
            }

            *seq = seq.wrapping_add(1) % 64;
            bytes_sent += n as u64;
            blocks_sent += 1;
            session.record_progress(file_idx, bytes_sent, blocks_sent);
        }
    }

    /// Receive a batch of files. `open_file` is called with each announced
    /// name and must return a [`LocalFile`] ready to be written.
    pub async fn receive_files(
        &self,
        transport: &mut dyn ByteTransport,
        session: &Session,
        mut open_file: impl FnMut(&str) -> Result<Box<dyn LocalFile>>,
    ) -> Result<()> {
        session.set_state(SessionState::Init);
        let local = self.local_params();
        let active = self.wait_for_init(transport, &local).await?;
        let wire = active.wire_params(false, !self.options.force_binary);
        let timeout = timeout_for(&active);

        let mut expected: u8 = 1;
        loop {
            if self.check_cancel(transport, session).await {
                return Err(self.abort(transport, &wire, session, expected, None).await);
            }

            session.set_state(SessionState::FileInfo);
            let file_packet = self.read_or_nak(transport, &wire, timeout, session, None, expected).await?;
            match file_packet.kind {
                PacketType::Break => {
                    self.ack(transport, &wire, file_packet.seq, Vec::new()).await?;
                    session.set_state(SessionState::End);
                    return Ok(());
                }
                PacketType::Error => {
                    return Err(TransferError::RemoteError(String::from_utf8_lossy(&file_packet.data).into_owned()));
                }
                PacketType::File => {}
                _ => return Err(TransferError::UnexpectedPacketType),
            }
            self.ack(transport, &wire, file_packet.seq, Vec::new()).await?;
            expected = file_packet.seq.wrapping_add(1) % 64;

            let name = if self.options.robust_filenames {
                String::from_utf8_lossy(&file_packet.data).into_owned()
            } else {
                String::from_utf8_lossy(&file_packet.data)
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
                    .collect()
            };
            let mut file = open_file(&name)?;

            let mut size = None;
            let mut modified = None;
            let attr_packet = self.read_or_nak(transport, &wire, timeout, session, None, expected).await?;
            if attr_packet.kind == PacketType::Attributes {
                let (s, m) = parse_attributes(&attr_packet.data);
                size = s;
                modified = m;
                self.ack(transport, &wire, attr_packet.seq, Vec::new()).await?;
                expected = attr_packet.seq.wrapping_add(1) % 64;
                if let Some(modified) = modified {
                    file.set_modified(modified).await?;
                }
            }

            let mut info = FileInfo::new(name.clone(), active.maxl as usize);
            info.size = size;
            info.modified = modified;
            let idx = session.begin_file(info);

            session.set_state(SessionState::Transfer);
            let first_packet = if attr_packet.kind == PacketType::Attributes {
                None
            } else {
                Some(attr_packet)
            };
            let outcome = self
                .receive_file_data(transport, session, &wire, timeout, active.streaming, &mut expected, file.as_mut(), idx, first_packet)
                .await;
            session.finish_file(idx, outcome.is_ok());
            session.set_state(SessionState::FileDone);
            outcome?;
        }
    }

    async fn receive_file_data(
        &self,
        transport: &mut dyn ByteTransport,
        session: &Session,
        wire: &WireParams,
        timeout: Duration,
        streaming: bool,
        expected: &mut u8,
        file: &mut dyn LocalFile,
        file_idx: usize,
        mut pending: Option<KermitPacket>,
    ) -> Result<()> {
        let mut bytes_written: u64 = 0;
        let mut blocks_written: u32 = 0;

        loop {
            if self.check_cancel(transport, session).await {
                return Err(self.abort(transport, wire, session, *expected, Some(file)).await);
            }

            let packet = match pending.take() {
                Some(p) => p,
                None => self.read_or_nak(transport, wire, timeout, session, Some(file_idx), *expected).await?,
            };

            match packet.kind {
                PacketType::Data => {
                    let is_duplicate = packet.seq == expected.wrapping_sub(1) % 64;
                    if packet.seq == *expected {
                        file.write(&packet.data).await?;
                        bytes_written += packet.data.len() as u64;
                        blocks_written += 1;
                        session.record_progress(file_idx, bytes_written, blocks_written);
                        *expected = expected.wrapping_add(1) % 64;
                    } else if !is_duplicate {
                        return Err(TransferError::InvalidSequence);
                    }
                    if !streaming {
                        self.ack(transport, wire, packet.seq, Vec::new()).await?;
                    }
                }
                PacketType::Eof => {
                    self.ack(transport, wire, packet.seq, Vec::new()).await?;
                    return Ok(());
                }
                PacketType::Error => {
                    return Err(TransferError::RemoteError(String::from_utf8_lossy(&packet.data).into_owned()));
                }
                _ => return Err(TransferError::UnexpectedPacketType),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_params_enable_capas_bits_from_options() {
        let engine = KermitEngine::new(KermitOptions { streaming: true, resend: true, long_packets: true, ..KermitOptions::default() });
        let local = engine.local_params();
        assert_eq!(local.capas & CAPAS_RESEND, CAPAS_RESEND);
        assert_eq!(local.capas & CAPAS_LONG_PACKETS, CAPAS_LONG_PACKETS);
        assert_eq!(local.capas & CAPAS_STREAMING, CAPAS_STREAMING);
        assert!(local.streaming);
        assert!(local.long_packets);
    }

    #[test]
    fn timeout_for_falls_back_to_ten_seconds_when_unset() {
        let mut params = KermitParameters::default();
        params.time = 0;
        assert_eq!(timeout_for(&params), Duration::from_secs(10));
    }

    #[test]
    fn file_attributes_round_trip_size_and_mtime() {
        let when = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let encoded = file_attributes(4096, Some(when));
        let (size, modified) = parse_attributes(&encoded);
        assert_eq!(size, Some(4096));
        assert_eq!(modified, Some(when));
    }

    #[test]
    fn parse_error_maps_encoding_failure_to_framing_error() {
        assert!(matches!(parse_error(ParseState::EncodingError), TransferError::FramingError(_)));
    }
}
