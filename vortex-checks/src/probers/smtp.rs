//! SMTP banner prober (spec.md §4.3 "SMTP").

use crate::check::CheckStatus;
use crate::probers::{first_line, ProbeOutcome};

const MIN_LEN: usize = b"000\r".len();

/// Feed the SMTP prober the current ingress buffer.
pub fn probe(bi: &[u8], done: bool) -> ProbeOutcome {
    if bi.len() < MIN_LEN {
        return if done {
            ProbeOutcome::done(CheckStatus::L7Rsp, "truncated SMTP banner")
        } else {
            ProbeOutcome::Pending
        };
    }

    if !bi[0..3].iter().all(u8::is_ascii_digit) || !(bi[3] == b' ' || bi[3] == b'\r') {
        let (line, _) = first_line(bi).unwrap_or((bi, bi.len()));
        return ProbeOutcome::done(CheckStatus::L7Rsp, String::from_utf8_lossy(line).into_owned());
    }

    let code: i64 = std::str::from_utf8(&bi[0..3])
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let (line, _) = first_line(bi).unwrap_or((bi, bi.len()));
    let reason = String::from_utf8_lossy(line.get(4..).unwrap_or(b"")).into_owned();

    if (200..300).contains(&code) {
        ProbeOutcome::done_with_code(CheckStatus::L7Ok, code, reason)
    } else {
        ProbeOutcome::done_with_code(CheckStatus::L7Sts, code, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_220_passes() {
        let outcome = probe(b"220 mail.example.com ESMTP ready\r\n", true);
        match outcome {
            ProbeOutcome::Done { status, code, .. } => {
                assert_eq!(status, CheckStatus::L7Ok);
                assert_eq!(code, 220);
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn service_unavailable_fails() {
        let outcome = probe(b"421 Service not available\r\n", true);
        match outcome {
            ProbeOutcome::Done { status, code, .. } => {
                assert_eq!(status, CheckStatus::L7Sts);
                assert_eq!(code, 421);
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn malformed_opening_is_l7rsp() {
        let outcome = probe(b"not an smtp banner\r\n", true);
        assert!(matches!(outcome, ProbeOutcome::Done { status: CheckStatus::L7Rsp, .. }));
    }
}
