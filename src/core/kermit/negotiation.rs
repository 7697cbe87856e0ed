//! Kermit Send-Init parameter negotiation
//!
//! Three [`KermitParameters`] instances exist per session: what this side
//! proposes (`local`), what the far side proposed (`remote`), and what
//! [`negotiate`] derives from the two (`active`) -- the parameters the
//! packet codec actually uses.

use super::packet::WireParams;

const DEFAULT_BLOCK_SIZE: u16 = 1024;
pub(crate) const CAPAS_RESEND: u8 = 0x10;
pub(crate) const CAPAS_LONG_PACKETS: u8 = 0x02;
pub(crate) const CAPAS_STREAMING: u8 = 0x04;

/// One side's Send-Init proposal (or the negotiated result).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KermitParameters {
    /// Maximum short-packet length this side can receive.
    pub maxl: u8,
    /// Timeout in seconds this side wants its peer to use.
    pub time: u8,
    /// Number of padding bytes to send before each packet.
    pub npad: u8,
    /// Padding byte.
    pub padc: u8,
    /// End-of-line byte.
    pub eol: u8,
    /// Control-quote character.
    pub qctl: u8,
    /// 8-bit-quote character, or `b'N'`/`b' '` to mean "disabled" as seen
    /// on the wire (`'Y'` to request, `'N'` to refuse, or the character
    /// itself to propose).
    pub qbin: u8,
    /// Check type character: `'1'`, `'2'`, `'3'`, or `'B'`.
    pub chkt: u8,
    /// Run-length prefix character, or `b' '` if not offered.
    pub rept: u8,
    /// Capability bitmask (bit 0x10 = RESEND, bit 0x02 = long packets).
    pub capas: u8,
    /// Sliding window size offered.
    pub windo: u8,
    /// Long-packet length, high part.
    pub maxlx1: u8,
    /// Long-packet length, low part.
    pub maxlx2: u8,
    /// "What am I" capability byte (attributes/streaming flags).
    pub whatami: u8,
    /// Whether this side offers the Attributes packet.
    pub attributes: bool,
    /// Whether this side offers long packets.
    pub long_packets: bool,
    /// Whether this side offers streaming (no per-packet ACK on DATA).
    pub streaming: bool,
    /// Whether this side offers sliding windows.
    pub windowing: bool,
}

impl Default for KermitParameters {
    fn default() -> Self {
        Self {
            maxl: 94,
            time: 5,
            npad: 0,
            padc: 0,
            eol: 0x0D,
            qctl: b'#',
            qbin: b'Y',
            chkt: b'1',
            rept: b'~',
            capas: CAPAS_RESEND | CAPAS_LONG_PACKETS,
            windo: 1,
            maxlx1: 0,
            maxlx2: 0,
            whatami: 0,
            attributes: true,
            long_packets: true,
            streaming: false,
            windowing: false,
        }
    }
}

impl KermitParameters {
    /// Encode as a classic Send-Init data field: 9 base characters followed
    /// by the long-packet/windowing extension.
    pub fn encode(&self) -> Vec<u8> {
        use super::packet::{ctl, tochar};
        vec![
            tochar(self.maxl),
            tochar(self.time),
            tochar(self.npad),
            ctl(self.padc),
            tochar(self.eol),
            self.qctl,
            self.qbin,
            self.chkt,
            self.rept,
            tochar(self.capas),
            tochar(self.windo),
            tochar(self.maxlx1),
            tochar(self.maxlx2),
            tochar(self.whatami),
        ]
    }

    /// Decode a Send-Init data field produced by [`Self::encode`]. Missing
    /// trailing extension fields fall back to conservative defaults.
    pub fn decode(data: &[u8]) -> Self {
        use super::packet::{ctl, unchar};
        let get = |i: usize| data.get(i).copied();
        let mut p = KermitParameters {
            maxl: get(0).map(unchar).unwrap_or(94),
            time: get(1).map(unchar).unwrap_or(5),
            npad: get(2).map(unchar).unwrap_or(0),
            padc: get(3).map(ctl).unwrap_or(0),
            eol: get(4).map(unchar).unwrap_or(0x0D),
            qctl: get(5).unwrap_or(b'#'),
            qbin: get(6).unwrap_or(b'N'),
            chkt: get(7).unwrap_or(b'1'),
            rept: get(8).unwrap_or(b' '),
            capas: get(9).map(unchar).unwrap_or(0),
            windo: get(10).map(unchar).unwrap_or(1),
            maxlx1: get(11).map(unchar).unwrap_or(0),
            maxlx2: get(12).map(unchar).unwrap_or(0),
            whatami: get(13).map(unchar).unwrap_or(0),
            attributes: true,
            long_packets: false,
            streaming: false,
            windowing: false,
        };
        p.long_packets = (p.capas & CAPAS_LONG_PACKETS) != 0;
        p.streaming = (p.capas & CAPAS_STREAMING) != 0;
        p.windowing = p.windo > 1;
        p
    }

    /// Numeric check type (`'B'` maps to 12).
    pub fn check_type(&self) -> u8 {
        if self.chkt == b'B' {
            12
        } else {
            self.chkt.saturating_sub(b'0')
        }
    }

    /// The [`WireParams`] the packet codec needs, derived from these
    /// parameters plus the session's text/binary and 7-bit settings.
    pub fn wire_params(&self, seven_bit_only: bool, text_mode: bool) -> WireParams {
        WireParams {
            mark: 0x01,
            eol: self.eol,
            qctl: self.qctl,
            qbin: if self.qbin == b'Y' || self.qbin == b'N' { b' ' } else { self.qbin },
            rept: self.rept,
            chkt: self.check_type(),
            seven_bit_only,
            text_mode,
        }
    }
}

fn qbin_valid(c: u8) -> bool {
    (33..=62).contains(&c) || (96..=126).contains(&c)
}

/// Derive the active parameters from `local`'s proposal and `remote`'s
/// counter-proposal.
pub fn negotiate(local: &KermitParameters, remote: &KermitParameters) -> KermitParameters {
    let qbin = if remote.qbin == b'Y' && qbin_valid(local.qbin) {
        local.qbin
    } else if remote.qbin == b'N' {
        b'N'
    } else if qbin_valid(remote.qbin) {
        remote.qbin
    } else {
        b'N'
    };

    let chkt = if local.chkt == remote.chkt { local.chkt } else { b'1' };

    let rept = if local.rept == remote.rept
        && local.rept != b' '
        && local.rept != local.qctl
        && local.rept != qbin
    {
        local.rept
    } else {
        b' '
    };

    let attributes = local.attributes && remote.attributes;
    let long_packets = local.long_packets && remote.long_packets;
    let streaming = local.streaming && remote.streaming;
    let windowing = local.windowing && remote.windowing;

    let windo = if windowing { local.windo.min(remote.windo).max(1) } else { 1 };

    let (maxlx1, maxlx2) = if long_packets {
        if local.maxlx1 == 0 && local.maxlx2 == 0 && remote.maxlx1 == 0 && remote.maxlx2 == 0 {
            let total = 500u16.min(DEFAULT_BLOCK_SIZE);
            ((total / 95) as u8, (total % 95) as u8)
        } else {
            (local.maxlx1.min(remote.maxlx1), local.maxlx2.min(remote.maxlx2))
        }
    } else {
        (0, 0)
    };

    let do_resend = (local.capas & CAPAS_RESEND) != 0 && (remote.capas & CAPAS_RESEND) != 0;
    let mut capas = 0u8;
    if do_resend {
        capas |= CAPAS_RESEND;
    }
    if long_packets {
        capas |= CAPAS_LONG_PACKETS;
    }
    if streaming {
        capas |= CAPAS_STREAMING;
    }

    KermitParameters {
        maxl: local.maxl.min(remote.maxl),
        time: local.time.min(remote.time).max(1),
        npad: remote.npad,
        padc: remote.padc,
        eol: remote.eol,
        qctl: local.qctl,
        qbin,
        chkt,
        rept,
        capas,
        windo,
        maxlx1,
        maxlx2,
        whatami: local.whatami,
        attributes,
        long_packets,
        streaming,
        windowing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_matches_spec_worked_example() {
        let local = KermitParameters {
            maxl: 80,
            chkt: b'3',
            qbin: b'Y',
            rept: b'~',
            long_packets: true,
            streaming: false,
            ..Default::default()
        };
        let remote = KermitParameters {
            maxl: 94,
            chkt: b'3',
            qbin: b'&',
            rept: b'~',
            long_packets: true,
            streaming: false,
            ..Default::default()
        };

        let active = negotiate(&local, &remote);
        assert_eq!(active.maxl, 80);
        assert_eq!(active.chkt, b'3');
        assert_eq!(active.check_type(), 3);
        assert_eq!(active.qbin, b'&');
        assert_eq!(active.rept, b'~');
        assert!(active.long_packets);
        assert!(!active.streaming);
        assert!(!active.windowing);
        assert_eq!(active.windo, 1);
    }

    #[test]
    fn negotiation_is_idempotent_on_capability_flags() {
        let local = KermitParameters { streaming: true, windowing: true, windo: 4, ..Default::default() };
        let remote = KermitParameters { streaming: true, windowing: true, windo: 8, ..Default::default() };

        let once = negotiate(&local, &remote);
        let twice = negotiate(&once, &remote);

        assert_eq!(once.attributes, twice.attributes);
        assert_eq!(once.long_packets, twice.long_packets);
        assert_eq!(once.streaming, twice.streaming);
        assert_eq!(once.windowing, twice.windowing);
    }

    #[test]
    fn mismatched_check_type_falls_back_to_type_1() {
        let local = KermitParameters { chkt: b'3', ..Default::default() };
        let remote = KermitParameters { chkt: b'2', ..Default::default() };
        assert_eq!(negotiate(&local, &remote).chkt, b'1');
    }

    #[test]
    fn rept_disabled_when_it_collides_with_qctl() {
        let local = KermitParameters { rept: b'#', qctl: b'#', ..Default::default() };
        let remote = KermitParameters { rept: b'#', qctl: b'#', ..Default::default() };
        assert_eq!(negotiate(&local, &remote).rept, b' ');
    }
}
