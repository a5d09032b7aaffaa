//! MySQL handshake prober (spec.md §4.3 "MySQL").
//!
//! Two variants are supported, selected by whether the check was configured
//! with a username to provoke an extended (two-packet) greeting:
//! legacy mode parses a single initial handshake packet; two-packet mode
//! additionally waits for the second packet the server sends in response.

use crate::check::CheckStatus;
use crate::probers::ProbeOutcome;

/// The minimum length of a server greeting packet in legacy mode. The
/// literal comes from HAProxy's `check->bi->i > 51` condition — named here
/// per the spec's open question asking for it to be a constant.
const LEGACY_MIN_GREETING_LEN: usize = 51;

fn read_u24_le(buf: &[u8], offset: usize) -> Option<usize> {
    if buf.len() < offset + 3 {
        return None;
    }
    Some(buf[offset] as usize | (buf[offset + 1] as usize) << 8 | (buf[offset + 2] as usize) << 16)
}

fn error_text(buf: &[u8], offset: usize) -> String {
    let msg = buf.get(offset..).unwrap_or(b"");
    let end = msg.iter().position(|&b| b == 0).unwrap_or(msg.len());
    String::from_utf8_lossy(&msg[..end]).into_owned()
}

/// Feed the MySQL prober the current ingress buffer.
pub fn probe(bi: &[u8], done: bool, two_packet: bool) -> ProbeOutcome {
    if two_packet {
        probe_two_packet(bi, done)
    } else {
        probe_legacy(bi, done)
    }
}

fn probe_legacy(bi: &[u8], done: bool) -> ProbeOutcome {
    if bi.len() < 5 {
        return if done {
            ProbeOutcome::done(CheckStatus::L7Rsp, "truncated MySQL greeting")
        } else {
            ProbeOutcome::Pending
        };
    }
    if bi[4] == 0xFF {
        return ProbeOutcome::done(CheckStatus::L7Sts, error_text(bi, 7));
    }
    if bi.len() > LEGACY_MIN_GREETING_LEN {
        let version_end = bi[5..].iter().position(|&b| b == 0).map(|p| 5 + p).unwrap_or(bi.len());
        return ProbeOutcome::done(
            CheckStatus::L7Ok,
            String::from_utf8_lossy(&bi[5..version_end]).into_owned(),
        );
    }
    if done {
        ProbeOutcome::done(CheckStatus::L7Rsp, "truncated MySQL greeting")
    } else {
        ProbeOutcome::Pending
    }
}

fn probe_two_packet(bi: &[u8], done: bool) -> ProbeOutcome {
    let Some(first_len) = read_u24_le(bi, 0) else {
        return if done {
            ProbeOutcome::done(CheckStatus::L7Rsp, "truncated MySQL greeting")
        } else {
            ProbeOutcome::Pending
        };
    };
    if bi.len() < first_len + 4 {
        return if done {
            ProbeOutcome::done(CheckStatus::L7Rsp, "truncated MySQL greeting")
        } else {
            ProbeOutcome::Pending
        };
    }
    if bi[4] == 0xFF {
        return ProbeOutcome::done(CheckStatus::L7Sts, error_text(bi, 7));
    }
    if bi.len() == first_len + 4 {
        // First packet present and clean; still waiting for the second.
        return if done {
            ProbeOutcome::done(CheckStatus::L7Rsp, "missing second MySQL packet")
        } else {
            ProbeOutcome::Pending
        };
    }

    let Some(second_len) = read_u24_le(bi, first_len + 4) else {
        return if done {
            ProbeOutcome::done(CheckStatus::L7Rsp, "truncated second MySQL packet")
        } else {
            ProbeOutcome::Pending
        };
    };
    let total = first_len + 4 + second_len + 4;
    if bi.len() < total {
        return if done {
            ProbeOutcome::done(CheckStatus::L7Rsp, "truncated second MySQL packet")
        } else {
            ProbeOutcome::Pending
        };
    }

    if bi[first_len + 8] == 0xFF {
        ProbeOutcome::done(CheckStatus::L7Sts, error_text(bi, first_len + 11))
    } else {
        ProbeOutcome::done(CheckStatus::L7Ok, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_greeting(version: &str, extra_len: usize) -> Vec<u8> {
        let mut pkt = vec![0u8; 4];
        pkt.push(10); // protocol version
        pkt.extend_from_slice(version.as_bytes());
        pkt.push(0);
        pkt.extend(std::iter::repeat(0u8).take(extra_len));
        pkt
    }

    #[test]
    fn legacy_greeting_passes_when_long_enough() {
        let pkt = legacy_greeting("8.0.34", 64);
        let outcome = probe(&pkt, true, false);
        match outcome {
            ProbeOutcome::Done { status, desc, .. } => {
                assert_eq!(status, CheckStatus::L7Ok);
                assert_eq!(desc, "8.0.34");
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn legacy_greeting_too_short_waits() {
        let pkt = legacy_greeting("8.0.34", 0);
        assert_eq!(probe(&pkt, false, false), ProbeOutcome::Pending);
    }

    #[test]
    fn legacy_error_byte_fails() {
        let mut pkt = vec![0u8; 7];
        pkt[4] = 0xFF;
        pkt.extend_from_slice(b"Access denied\x00");
        let outcome = probe(&pkt, true, false);
        match outcome {
            ProbeOutcome::Done { status, desc, .. } => {
                assert_eq!(status, CheckStatus::L7Sts);
                assert_eq!(desc, "Access denied");
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn two_packet_waits_for_second_packet() {
        let mut pkt = vec![5, 0, 0, 0, 10];
        pkt.extend_from_slice(&[0u8; 4]);
        assert_eq!(probe(&pkt, false, true), ProbeOutcome::Pending);
    }

    #[test]
    fn two_packet_completes_successfully() {
        let mut pkt = vec![5, 0, 0, 0, 10, 0, 0, 0, 0];
        // second packet header: length=1, seq, then a non-0xFF byte
        pkt.extend_from_slice(&[1, 0, 0, 1, 0x00]);
        let outcome = probe(&pkt, true, true);
        assert!(matches!(outcome, ProbeOutcome::Done { status: CheckStatus::L7Ok, .. }));
    }
}
