//! PostgreSQL startup-reply prober (spec.md §4.3 "PostgreSQL").

use crate::check::CheckStatus;
use crate::probers::ProbeOutcome;

/// Feed the PostgreSQL prober the current ingress buffer.
pub fn probe(bi: &[u8], done: bool) -> ProbeOutcome {
    if bi.len() < 9 {
        return if done {
            ProbeOutcome::done(CheckStatus::L7Rsp, "truncated PostgreSQL reply")
        } else {
            ProbeOutcome::Pending
        };
    }

    match bi[0] {
        b'R' => ProbeOutcome::done(CheckStatus::L7Ok, ""),
        b'E' => {
            let msg = &bi[6..];
            let end = msg.iter().position(|&b| b == 0).unwrap_or(msg.len());
            if end == 0 {
                ProbeOutcome::done(CheckStatus::L7Rsp, "empty PostgreSQL error message")
            } else {
                ProbeOutcome::done(CheckStatus::L7Sts, String::from_utf8_lossy(&msg[..end]).into_owned())
            }
        }
        other => ProbeOutcome::done(
            CheckStatus::L7Rsp,
            format!("unexpected PostgreSQL message type {other:#x}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_ok_passes() {
        let outcome = probe(b"R\x00\x00\x00\x08\x00\x00\x00\x00", true);
        assert!(matches!(outcome, ProbeOutcome::Done { status: CheckStatus::L7Ok, .. }));
    }

    #[test]
    fn error_response_fails_with_message() {
        let mut bi = b"E\x00\x00\x00\x00\x00".to_vec();
        bi.extend_from_slice(b"FATAL: password authentication failed\x00");
        let outcome = probe(&bi, true);
        match outcome {
            ProbeOutcome::Done { status, desc, .. } => {
                assert_eq!(status, CheckStatus::L7Sts);
                assert_eq!(desc, "FATAL: password authentication failed");
            }
            _ => panic!("expected done"),
        }
    }
}
