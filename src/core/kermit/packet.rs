//! Kermit packet framing and quote/prefix data encoding
//!
//! `MARK, tochar(LEN), tochar(SEQ), TYPE, data, check, EOL` for short
//! packets; `MARK, tochar(0), tochar(SEQ), TYPE, tochar(LENX1),
//! tochar(LENX2), tochar(HCHECK), data, check, EOL` once a packet would not
//! fit in a single tochar'd length byte.

use super::super::protocol::checksum;

/// Kermit packet type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Send-Init: session parameter proposal.
    SendInit,
    /// Positive acknowledgement.
    Ack,
    /// Negative acknowledgement / resend request.
    Nak,
    /// A chunk of file data.
    Data,
    /// File header (name, and via a following Attributes packet: size/mtime).
    File,
    /// End of the current file.
    Eof,
    /// End of the batch.
    Break,
    /// Fatal protocol or application error; aborts the session.
    Error,
    /// File attributes (size, mtime, type).
    Attributes,
}

impl PacketType {
    /// Wire type character.
    pub fn to_byte(self) -> u8 {
        match self {
            PacketType::SendInit => b'S',
            PacketType::Ack => b'Y',
            PacketType::Nak => b'N',
            PacketType::Data => b'D',
            PacketType::File => b'F',
            PacketType::Eof => b'Z',
            PacketType::Break => b'B',
            PacketType::Error => b'E',
            PacketType::Attributes => b'A',
        }
    }

    /// Parse a wire type character.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'S' => Some(PacketType::SendInit),
            b'Y' => Some(PacketType::Ack),
            b'N' => Some(PacketType::Nak),
            b'D' => Some(PacketType::Data),
            b'F' => Some(PacketType::File),
            b'Z' => Some(PacketType::Eof),
            b'B' => Some(PacketType::Break),
            b'E' => Some(PacketType::Error),
            b'A' => Some(PacketType::Attributes),
            _ => None,
        }
    }

    /// Whether this type's data field skips quote/prefix decoding (it is
    /// carried on the wire, and read back, byte for byte).
    pub fn dont_encode_data(self) -> bool {
        matches!(self, PacketType::SendInit | PacketType::Ack | PacketType::Attributes)
    }
}

/// Result of decoding a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Decoded cleanly.
    Ok,
    /// The check field didn't match the recomputed checksum/CRC.
    ChecksumMismatch,
    /// LEN/LENX1/LENX2 inconsistent with the bytes actually present.
    BadLen,
    /// SEQ outside 0..64.
    BadSeq,
    /// Unrecognized TYPE character.
    BadType,
    /// Long-packet header check (HCHECK) mismatch.
    BadHcheck,
    /// Quote/prefix decoding failed (e.g. QBIN immediately followed by QBIN).
    EncodingError,
}

/// A decoded or to-be-encoded Kermit packet.
#[derive(Debug, Clone)]
pub struct KermitPacket {
    /// Sequence number, 0..64.
    pub seq: u8,
    /// Packet type.
    pub kind: PacketType,
    /// Raw (unencoded) payload.
    pub data: Vec<u8>,
    /// Whether to frame this packet in long form even if it would fit short.
    pub long: bool,
}

impl KermitPacket {
    /// Build a short-form packet (the common case).
    pub fn new(seq: u8, kind: PacketType, data: Vec<u8>) -> Self {
        Self { seq: seq % 64, kind, data, long: false }
    }
}

/// The subset of negotiated [`super::negotiation::KermitParameters`] the
/// codec needs to frame and quote a packet.
#[derive(Debug, Clone, Copy)]
pub struct WireParams {
    /// Start-of-packet marker, normally SOH (0x01).
    pub mark: u8,
    /// End-of-line byte appended to every packet, normally CR.
    pub eol: u8,
    /// Control-quote character.
    pub qctl: u8,
    /// 8-bit-quote character, or `b' '` if 8-bit prefixing is disabled.
    pub qbin: u8,
    /// Run-length prefix character, or `b' '` if disabled.
    pub rept: u8,
    /// Check type: 1, 2, 3, or 12 ("B" form).
    pub chkt: u8,
    /// Mask every byte to 7 bits before computing checks/encoding runs.
    pub seven_bit_only: bool,
    /// CR-stripping / LF->CRLF text-mode normalization.
    pub text_mode: bool,
}

/// `c + 32`, Kermit's printable-byte encoding.
pub fn tochar(n: u8) -> u8 {
    n.wrapping_add(32)
}

/// Inverse of [`tochar`].
pub fn unchar(c: u8) -> u8 {
    c.wrapping_sub(32)
}

/// Toggle between a control character and its printable surrogate.
pub fn ctl(c: u8) -> u8 {
    c ^ 0x40
}

fn is_control(b: u8) -> bool {
    b < 0x20 || b == 0x7F
}

fn check_length(chkt: u8) -> usize {
    match chkt {
        1 => 1,
        2 | 12 => 2,
        3 => 3,
        _ => 1,
    }
}

fn append_check(data: &[u8], chkt: u8, seven_bit: bool, out: &mut Vec<u8>) {
    match chkt {
        2 => {
            let sum = checksum::sum12(data, seven_bit);
            out.push(tochar((sum & 0x3F) as u8));
            out.push(tochar(((sum >> 6) & 0x3F) as u8));
        }
        12 => {
            let sum = checksum::sum12(data, seven_bit);
            out.push(tochar(((sum & 0x3F) as u8).wrapping_add(1) & 0x3F));
            out.push(tochar((((sum >> 6) & 0x3F) as u8).wrapping_add(1) & 0x3F));
        }
        3 => {
            let crc = checksum::crc16_kermit(data, seven_bit);
            out.push(tochar(((crc >> 12) & 0x0F) as u8));
            out.push(tochar(((crc >> 6) & 0x3F) as u8));
            out.push(tochar((crc & 0x3F) as u8));
        }
        _ => out.push(tochar(checksum::kermit_check1(data, seven_bit))),
    }
}

fn verify_check(data: &[u8], chkt: u8, seven_bit: bool, received: &[u8]) -> bool {
    let mut expected = Vec::with_capacity(received.len());
    append_check(data, chkt, seven_bit, &mut expected);
    expected == received
}

fn compute_hcheck(seq: u8, type_byte: u8, lenx1: u8, lenx2: u8) -> u8 {
    let s: u16 = tochar(0) as u16
        + tochar(seq) as u16
        + type_byte as u16
        + tochar(lenx1) as u16
        + tochar(lenx2) as u16;
    ((s + ((s & 0xC0) >> 6)) & 0x3F) as u8
}

/// Apply Kermit's text-mode line-ending rule to outgoing data: each `\n`
/// becomes `\r\n`.
fn text_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}

fn encode_one_byte(b: u8, p: &WireParams, out: &mut Vec<u8>) {
    if b == p.qctl {
        out.push(p.qctl);
        out.push(p.qctl);
    } else if p.qbin != b' ' && b == p.qbin {
        out.push(p.qctl);
        out.push(p.qbin);
    } else if p.rept != b' ' && b == p.rept {
        out.push(p.qctl);
        out.push(p.rept);
    } else if is_control(b) {
        out.push(p.qctl);
        out.push(ctl(b));
    } else if p.qbin != b' ' && (b & 0x80) != 0 {
        let lower = b & 0x7F;
        out.push(p.qbin);
        if lower == p.qctl || is_control(lower) {
            out.push(p.qctl);
            out.push(ctl(lower));
        } else {
            out.push(lower);
        }
    } else {
        out.push(b);
    }
}

fn decode_one_byte(bytes: &[u8], p: &WireParams) -> Result<(u8, usize), ParseState> {
    let b0 = bytes[0];
    if b0 == p.qctl {
        let b1 = *bytes.get(1).ok_or(ParseState::EncodingError)?;
        if b1 == p.qctl || (p.qbin != b' ' && b1 == p.qbin) || (p.rept != b' ' && b1 == p.rept) {
            return Ok((b1, 2));
        }
        return Ok((ctl(b1), 2));
    }
    if p.qbin != b' ' && b0 == p.qbin {
        let b1 = *bytes.get(1).ok_or(ParseState::EncodingError)?;
        if b1 == p.qbin {
            return Err(ParseState::EncodingError);
        }
        if b1 == p.qctl {
            let b2 = *bytes.get(2).ok_or(ParseState::EncodingError)?;
            return Ok((ctl(b2) | 0x80, 3));
        }
        return Ok((b1 | 0x80, 2));
    }
    Ok((b0, 1))
}

/// Quote/prefix-encode a packet's data field per `p`.
pub fn encode_data(data: &[u8], p: &WireParams) -> Vec<u8> {
    let transformed = if p.text_mode { text_encode(data) } else { data.to_vec() };
    let mut out = Vec::with_capacity(transformed.len());
    let mut i = 0;
    while i < transformed.len() {
        let b = transformed[i];
        let mut run_len = 1usize;
        while i + run_len < transformed.len() && transformed[i + run_len] == b && run_len < 94 {
            run_len += 1;
        }
        let run_eligible = p.rept != b' ' && (run_len >= 4 || (p.chkt == 12 && b == b' '));
        if run_eligible {
            out.push(p.rept);
            out.push(tochar(run_len as u8));
            encode_one_byte(b, p, &mut out);
            i += run_len;
        } else {
            encode_one_byte(b, p, &mut out);
            i += 1;
        }
    }
    out
}

/// Inverse of [`encode_data`].
pub fn decode_data(encoded: &[u8], p: &WireParams) -> Result<Vec<u8>, ParseState> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        let b0 = encoded[i];
        if p.rept != b' ' && b0 == p.rept {
            let count = unchar(*encoded.get(i + 1).ok_or(ParseState::EncodingError)?);
            let rest = encoded.get(i + 2..).ok_or(ParseState::EncodingError)?;
            let (byte, consumed) = decode_one_byte(rest, p)?;
            for _ in 0..count {
                out.push(byte);
            }
            i += 2 + consumed;
        } else {
            let (byte, consumed) = decode_one_byte(&encoded[i..], p)?;
            out.push(byte);
            i += consumed;
        }
    }
    if p.text_mode {
        out.retain(|&b| b != b'\r');
    }
    Ok(out)
}

/// Frame `packet` onto the wire per `p`.
pub fn encode_packet(p: &WireParams, packet: &KermitPacket) -> Vec<u8> {
    let encoded_data = if packet.kind.dont_encode_data() {
        packet.data.clone()
    } else {
        encode_data(&packet.data, p)
    };

    let seq_char = tochar(packet.seq % 64);
    let type_char = packet.kind.to_byte();
    let check_len = check_length(p.chkt);
    let short_total_len = 2 + encoded_data.len() + check_len;

    if !packet.long && short_total_len <= 94 {
        let mut frame = vec![p.mark, tochar(short_total_len as u8), seq_char, type_char];
        frame.extend_from_slice(&encoded_data);
        let check_input: Vec<u8> = frame[1..].to_vec();
        append_check(&check_input, p.chkt, p.seven_bit_only, &mut frame);
        frame.push(p.eol);
        frame
    } else {
        let total_len = 1 + 3 + encoded_data.len() + check_len;
        let lenx1 = (total_len / 95) as u8;
        let lenx2 = (total_len % 95) as u8;
        let hcheck = compute_hcheck(packet.seq % 64, type_char, lenx1, lenx2);
        let mut frame = vec![
            p.mark,
            tochar(0),
            seq_char,
            type_char,
            tochar(lenx1),
            tochar(lenx2),
            tochar(hcheck),
        ];
        frame.extend_from_slice(&encoded_data);
        let check_input: Vec<u8> = std::iter::once(seq_char)
            .chain(std::iter::once(type_char))
            .chain(encoded_data.iter().copied())
            .collect();
        append_check(&check_input, p.chkt, p.seven_bit_only, &mut frame);
        frame.push(p.eol);
        frame
    }
}

/// Parse a framed packet off the wire. `raw` should contain exactly one
/// frame, MARK through (and including) EOL.
pub fn decode_packet(p: &WireParams, raw: &[u8]) -> (Option<KermitPacket>, ParseState) {
    if raw.len() < 5 || raw[0] != p.mark {
        return (None, ParseState::BadLen);
    }

    let len_field = unchar(raw[1]);
    let check_len = check_length(p.chkt);

    if len_field == 0 {
        if raw.len() < 8 {
            return (None, ParseState::BadLen);
        }
        let seq = unchar(raw[2]) % 64;
        let type_byte = raw[3];
        let lenx1 = unchar(raw[4]);
        let lenx2 = unchar(raw[5]);
        let hcheck_received = unchar(raw[6]);
        if compute_hcheck(seq, type_byte, lenx1, lenx2) != hcheck_received {
            return (None, ParseState::BadHcheck);
        }

        let total_len = lenx1 as usize * 95 + lenx2 as usize;
        let header_tail = 1 + 3; // TYPE + LENX1 + LENX2 + HCHECK
        if total_len < header_tail + check_len {
            return (None, ParseState::BadLen);
        }
        let data_len = total_len - header_tail - check_len;
        let body_start = 7;
        if raw.len() < body_start + data_len + check_len + 1 {
            return (None, ParseState::BadLen);
        }

        let Some(kind) = PacketType::from_byte(type_byte) else {
            return (None, ParseState::BadType);
        };

        let encoded_data = &raw[body_start..body_start + data_len];
        let check_bytes = &raw[body_start + data_len..body_start + data_len + check_len];
        let check_input: Vec<u8> = std::iter::once(raw[2])
            .chain(std::iter::once(type_byte))
            .chain(encoded_data.iter().copied())
            .collect();
        if !verify_check(&check_input, p.chkt, p.seven_bit_only, check_bytes) {
            return (None, ParseState::ChecksumMismatch);
        }

        let data = if kind.dont_encode_data() {
            encoded_data.to_vec()
        } else {
            match decode_data(encoded_data, p) {
                Ok(d) => d,
                Err(e) => return (None, e),
            }
        };
        (Some(KermitPacket { seq, kind, data, long: true }), ParseState::Ok)
    } else {
        let total_len = len_field as usize;
        if total_len < 2 + check_len {
            return (None, ParseState::BadLen);
        }
        let data_len = total_len - 2 - check_len;
        let body_start = 4;
        if raw.len() < body_start + data_len + check_len + 1 {
            return (None, ParseState::BadLen);
        }

        let seq = unchar(raw[2]) % 64;
        let type_byte = raw[3];
        let Some(kind) = PacketType::from_byte(type_byte) else {
            return (None, ParseState::BadType);
        };

        let encoded_data = &raw[body_start..body_start + data_len];
        let check_bytes = &raw[body_start + data_len..body_start + data_len + check_len];
        let check_input: Vec<u8> = raw[1..body_start + data_len].to_vec();
        if !verify_check(&check_input, p.chkt, p.seven_bit_only, check_bytes) {
            return (None, ParseState::ChecksumMismatch);
        }

        let data = if kind.dont_encode_data() {
            encoded_data.to_vec()
        } else {
            match decode_data(encoded_data, p) {
                Ok(d) => d,
                Err(e) => return (None, e),
            }
        };
        (Some(KermitPacket { seq, kind, data, long: false }), ParseState::Ok)
    }
}
