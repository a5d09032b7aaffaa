//! SSL/TLS hello prober (spec.md §4.3 "SSL hello").
//!
//! This is a raw byte probe, not a full TLS handshake: a fixed ClientHello
//! template is sent and only the first byte of whatever comes back is
//! inspected (a TLS record's content type: handshake or alert).

use crate::check::CheckStatus;
use crate::probers::ProbeOutcome;

const TLS_CONTENT_TYPE_ALERT: u8 = 0x15;
const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Feed the SSL hello prober the current ingress buffer.
pub fn probe(bi: &[u8], done: bool) -> ProbeOutcome {
    if bi.len() < 5 {
        return if done {
            ProbeOutcome::done(CheckStatus::L6Rsp, "truncated TLS record")
        } else {
            ProbeOutcome::Pending
        };
    }
    match bi[0] {
        TLS_CONTENT_TYPE_ALERT | TLS_CONTENT_TYPE_HANDSHAKE => ProbeOutcome::done(CheckStatus::L6Ok, ""),
        other => ProbeOutcome::done(
            CheckStatus::L6Rsp,
            format!("unexpected TLS record type {other:#x}"),
        ),
    }
}

/// The fixed ClientHello template (spec.md §4.1): a 4-byte big-endian Unix
/// timestamp is inserted at offset 11 of this buffer before sending.
pub const CLIENT_HELLO_TEMPLATE: &[u8] = &[
    0x16, 0x03, 0x00, 0x00, 0x79, 0x01, 0x00, 0x00, 0x75, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Build the ClientHello payload with the current Unix time stamped at
/// offset 11, matching HAProxy's `sslv3_client_hello` construction.
pub fn build_client_hello(now_unix_secs: u32) -> Vec<u8> {
    let mut hello = CLIENT_HELLO_TEMPLATE.to_vec();
    hello[11..15].copy_from_slice(&now_unix_secs.to_be_bytes());
    hello
}
