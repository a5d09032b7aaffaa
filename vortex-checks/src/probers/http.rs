//! HTTP prober (spec.md §4.3 "HTTP").

use crate::check::CheckStatus;
use crate::probers::expect::ExpectRule;
use crate::probers::{first_line, ProbeOutcome};

const MIN_LEN: usize = b"HTTP/1.0 000\r".len();

/// Feed the HTTP prober the current ingress buffer.
///
/// `disable404_running` indicates the server is currently RUNNING and
/// `DISABLE404` is configured, in which case a 404 is a conditional pass
/// rather than a hard failure.
pub fn probe(bi: &[u8], done: bool, expect: Option<&ExpectRule>, disable404_running: bool) -> ProbeOutcome {
    if bi.len() < MIN_LEN {
        return if done {
            ProbeOutcome::done(CheckStatus::L7Rsp, "truncated HTTP response")
        } else {
            ProbeOutcome::Pending
        };
    }

    if &bi[0..7] != b"HTTP/1." || !(bi[12] == b' ' || bi[12] == b'\r') || !bi[9..12].iter().all(u8::is_ascii_digit) {
        let (line, _) = first_line(bi).unwrap_or((bi, bi.len()));
        return ProbeOutcome::done(
            CheckStatus::L7Rsp,
            String::from_utf8_lossy(line).into_owned(),
        );
    }

    let status_region = &bi[9..12];
    let code: i64 = std::str::from_utf8(status_region)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    if disable404_running && code == 404 {
        return ProbeOutcome::done_with_code(CheckStatus::L7OkC, code, "");
    }

    if let Some(rule) = expect {
        return match crate::probers::expect::evaluate(rule, status_region, bi, done) {
            ProbeOutcome::Done { status, desc, .. } => ProbeOutcome::done_with_code(status, code, desc),
            ProbeOutcome::Pending => ProbeOutcome::Pending,
        };
    }

    let reason = first_line(bi)
        .map(|(line, _)| String::from_utf8_lossy(line).into_owned())
        .unwrap_or_default();
    if (200..400).contains(&code) {
        ProbeOutcome::done_with_code(CheckStatus::L7Ok, code, reason)
    } else {
        ProbeOutcome::done_with_code(CheckStatus::L7Sts, code, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_200() {
        let outcome = probe(b"HTTP/1.1 200 OK\r\n\r\n", true, None, false);
        assert!(matches!(
            outcome,
            ProbeOutcome::Done { status: CheckStatus::L7Ok, code: 200, .. }
        ));
    }

    #[test]
    fn server_error_503() {
        let outcome = probe(b"HTTP/1.1 503 Service Unavailable\r\n", true, None, false);
        match outcome {
            ProbeOutcome::Done { status, code, .. } => {
                assert_eq!(status, CheckStatus::L7Sts);
                assert_eq!(code, 503);
            }
            _ => panic!("expected a terminal outcome"),
        }
    }

    #[test]
    fn disable404_conditionally_passes() {
        let outcome = probe(b"HTTP/1.1 404 Not Found\r\n", true, None, true);
        match outcome {
            ProbeOutcome::Done { status, code, .. } => {
                assert_eq!(status, CheckStatus::L7OkC);
                assert_eq!(code, 404);
            }
            _ => panic!("expected a terminal outcome"),
        }
    }

    #[test]
    fn malformed_prefix_is_l7rsp() {
        let outcome = probe(b"garbage response here\r\n", true, None, false);
        assert!(matches!(outcome, ProbeOutcome::Done { status: CheckStatus::L7Rsp, .. }));
    }

    #[test]
    fn short_buffer_waits_unless_done() {
        assert_eq!(probe(b"HTTP/1.", false, None, false), ProbeOutcome::Pending);
    }

    #[test]
    fn full_buffer_with_no_crlf_is_done() {
        // A buffer filled to the last byte with no CRLF must not wait forever.
        let filled = vec![b'a'; MIN_LEN];
        let outcome = probe(&filled, true, None, false);
        assert!(matches!(outcome, ProbeOutcome::Done { status: CheckStatus::L7Rsp, .. }));
    }
}
