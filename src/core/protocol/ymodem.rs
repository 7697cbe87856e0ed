//! Ymodem: Xmodem plus a block-0 filename/size/mtime header and batch
//! transfer of more than one file per session.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::checksum;
use super::xmodem::{self, XmodemEngine, XmodemFlavor, ACK, CAN, MAX_RETRIES, NAK, SOH, STX};
use crate::core::error::{Result, TransferError, TransportError};
use crate::core::local_file::LocalFile;
use crate::core::session::{FileInfo, Session, SessionState};
use crate::core::transport::{ByteTransport, ReadOutcome};

/// Parsed contents of a Ymodem block-0 header. `None` marks the empty
/// filename that terminates a batch.
struct Block0 {
    name: String,
    size: Option<u64>,
    modified: Option<DateTime<Utc>>,
}

fn build_block0(name: &str, size: Option<u64>, modified: Option<DateTime<Utc>>, block_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(block_size);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    if let Some(size) = size {
        let mtime_octal = modified.map(|m| format!("{:o}", m.timestamp())).unwrap_or_default();
        buf.extend_from_slice(format!("{size} {mtime_octal}").as_bytes());
    }
    buf.resize(block_size, 0);
    buf
}

fn parse_block0(payload: &[u8]) -> Option<Block0> {
    let name_end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();
    if name.is_empty() {
        return None;
    }

    let rest = &payload[name_end.saturating_add(1).min(payload.len())..];
    let rest_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let meta = String::from_utf8_lossy(&rest[..rest_end]);
    let mut fields = meta.split_whitespace();
    let size = fields.next().and_then(|s| s.parse::<u64>().ok());
    let modified = fields
        .next()
        .and_then(|s| u64::from_str_radix(s, 8).ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));

    Some(Block0 { name, size, modified })
}

/// Drives a Ymodem batch send or receive on top of an [`XmodemEngine`] for
/// each file's data phase.
pub struct YmodemEngine {
    flavor: XmodemFlavor,
}

impl YmodemEngine {
    /// Create an engine that will try for (and may downgrade away from)
    /// `flavor` for both the header blocks and file data.
    pub fn new(flavor: XmodemFlavor) -> Self {
        Self { flavor }
    }

    /// Send a batch of files, each already opened for reading.
    pub async fn send_files(
        &self,
        transport: &mut dyn ByteTransport,
        session: &Session,
        files: &mut [(String, Box<dyn LocalFile>)],
    ) -> Result<()> {
        for (name, file) in files.iter_mut() {
            session.set_state(SessionState::FileInfo);
            let size = file.len().await?;
            let modified = file.modified().await?;
            self.send_header(transport, Some(name.as_str()), Some(size), modified)
                .await?;

            let mut info = FileInfo::new(name.clone(), self.flavor.block_size());
            info.size = Some(size);
            info.modified = modified;
            let idx = session.begin_file(info);

            session.set_state(SessionState::Transfer);
            let data_engine = XmodemEngine::new(self.flavor);
            let outcome = data_engine.send_file(transport, file.as_mut(), session, idx).await;
            session.finish_file(idx, outcome.is_ok());
            session.set_state(SessionState::FileDone);
            outcome?;
        }

        self.send_header(transport, None, None, None).await?;
        session.set_state(SessionState::End);
        Ok(())
    }

    /// Receive a batch of files. `open_file` is called with each
    /// announced name and must return a [`LocalFile`] ready to be written.
    pub async fn receive_files(
        &self,
        transport: &mut dyn ByteTransport,
        session: &Session,
        mut open_file: impl FnMut(&str) -> Result<Box<dyn LocalFile>>,
    ) -> Result<()> {
        let mut flavor = self.flavor;
        loop {
            session.set_state(SessionState::FileInfo);
            let Some(header) = self.receive_header(transport, &mut flavor, session).await? else {
                session.set_state(SessionState::End);
                return Ok(());
            };

            let mut file = open_file(&header.name)?;
            if let Some(modified) = header.modified {
                file.set_modified(modified).await?;
            }

            let mut info = FileInfo::new(header.name.clone(), flavor.block_size());
            info.size = header.size;
            info.modified = header.modified;
            let idx = session.begin_file(info);

            session.set_state(SessionState::Transfer);
            let data_engine = XmodemEngine::new(flavor);
            let outcome = data_engine.receive_file(transport, file.as_mut(), session, idx).await;
            session.finish_file(idx, outcome.is_ok());
            session.set_state(SessionState::FileDone);
            outcome?;
        }
    }

    async fn send_header(
        &self,
        transport: &mut dyn ByteTransport,
        name: Option<&str>,
        size: Option<u64>,
        modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut retries: u32 = 0;
        loop {
            match transport.read(Duration::from_secs(60)).await {
                ReadOutcome::Byte(CAN) => return Err(TransferError::CancelledByRemote),
                ReadOutcome::Byte(b) if XmodemFlavor::from_handshake(self.flavor, b).is_some() => break,
                ReadOutcome::TimedOut => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(TransferError::TooManyRetries);
                    }
                }
                ReadOutcome::EndOfStream => return Err(TransportError::EndOfStream.into()),
                ReadOutcome::Cancelled => return Err(TransferError::CancelledByUser),
                _ => {}
            }
        }

        let payload = build_block0(name.unwrap_or(""), size, modified, self.flavor.block_size());
        let packet = xmodem::build_block(self.flavor, 0, &payload);

        let mut retries: u32 = 0;
        loop {
            transport.write_all(&packet).await?;
            transport.flush().await?;
            match transport.read(self.flavor.timeout()).await {
                ReadOutcome::Byte(ACK) => return Ok(()),
                ReadOutcome::Byte(CAN) => return Err(TransferError::CancelledByRemote),
                ReadOutcome::EndOfStream => return Err(TransportError::EndOfStream.into()),
                ReadOutcome::Cancelled => return Err(TransferError::CancelledByUser),
                _ => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(TransferError::TooManyRetries);
                    }
                }
            }
        }
    }

    async fn receive_header(
        &self,
        transport: &mut dyn ByteTransport,
        flavor: &mut XmodemFlavor,
        session: &Session,
    ) -> Result<Option<Block0>> {
        let mut handshake_failures: u32 = 0;
        loop {
            transport.write_all(&[flavor.handshake_byte()]).await?;
            transport.flush().await?;

            let header = match transport.read(flavor.timeout()).await {
                ReadOutcome::Byte(b) => b,
                ReadOutcome::TimedOut => {
                    handshake_failures += 1;
                    if handshake_failures >= 3 {
                        if let Some(next) = flavor.downgrade() {
                            session.log(format!("DOWNGRADE TO {}", next.name()));
                            *flavor = next;
                            handshake_failures = 0;
                        }
                    }
                    continue;
                }
                ReadOutcome::EndOfStream => return Err(TransportError::EndOfStream.into()),
                ReadOutcome::Cancelled => return Err(TransferError::CancelledByUser),
            };

            match header {
                CAN => return Err(TransferError::CancelledByRemote),
                SOH | STX => {
                    let block_size = if header == STX { 1024 } else { 128 };

                    let mut seq_bytes = [0u8; 2];
                    if transport.read_into(&mut seq_bytes, flavor.timeout()).await? < 2 {
                        transport.write_all(&[NAK]).await?;
                        continue;
                    }

                    let mut payload = vec![0u8; block_size];
                    if transport.read_into(&mut payload, flavor.timeout()).await? < block_size {
                        transport.write_all(&[NAK]).await?;
                        continue;
                    }

                    let check_len = if flavor.uses_crc() { 2 } else { 1 };
                    let mut check = vec![0u8; check_len];
                    if transport.read_into(&mut check, flavor.timeout()).await? < check_len {
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
                        session.log("CHECKSUM ERROR IN BLOCK #0");
                        transport.write_all(&[NAK]).await?;
                        continue;
                    }

                    transport.write_all(&[ACK]).await?;
                    transport.flush().await?;
                    return Ok(parse_block0(&payload));
                }
                _ => {
                    transport.write_all(&[NAK]).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block0_round_trips_name_size_and_mtime() {
        let when = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let payload = build_block0("report.txt", Some(4096), Some(when), 128);
        let parsed = parse_block0(&payload).expect("non-empty block 0");
        assert_eq!(parsed.name, "report.txt");
        assert_eq!(parsed.size, Some(4096));
        assert_eq!(parsed.modified, Some(when));
    }

    #[test]
    fn empty_filename_marks_end_of_batch() {
        let payload = build_block0("", None, None, 128);
        assert!(parse_block0(&payload).is_none());
    }

    #[test]
    fn block0_is_padded_with_nul_not_sub() {
        let payload = build_block0("a", Some(1), None, 128);
        assert_eq!(payload.len(), 128);
        assert_eq!(*payload.last().unwrap(), 0);
    }
}
