//! Protocol probers.
//!
//! Each prober inspects the accumulated ingress buffer (`bi`) after an
//! opportunistic read and decides [`ProbeOutcome::Pending`] (needs more
//! bytes), or a terminal [`ProbeOutcome::Done`] carrying the status, result
//! and description to report through [`crate::check::Check::set_status`].
//!
//! The ingress buffer is guaranteed NUL-terminated at the tail at decision
//! time by the caller; `done` tells a prober whether the buffer is known to
//! be final (connection closed or buffer full) so "need more" can be turned
//! into a hard failure instead of waiting forever.

pub mod agent;
pub mod expect;
pub mod http;
pub mod ldap;
pub mod mysql;
pub mod pgsql;
pub mod redis;
pub mod smtp;
pub mod ssl;

use crate::check::CheckStatus;

/// The result of feeding a prober the current ingress buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Not enough data yet; wait for the next read.
    Pending,
    /// A terminal verdict was reached.
    Done {
        /// The diagnostic status to record.
        status: CheckStatus,
        /// Numeric sub-code, if any (0 otherwise).
        code: i64,
        /// Human-readable description.
        desc: String,
    },
}

impl ProbeOutcome {
    /// Build a terminal outcome with no sub-code.
    pub fn done(status: CheckStatus, desc: impl Into<String>) -> Self {
        ProbeOutcome::Done {
            status,
            code: 0,
            desc: desc.into(),
        }
    }

    /// Build a terminal outcome carrying a numeric sub-code.
    pub fn done_with_code(status: CheckStatus, code: i64, desc: impl Into<String>) -> Self {
        ProbeOutcome::Done {
            status,
            code,
            desc: desc.into(),
        }
    }
}

/// Find the first CRLF- or LF-terminated line in `buf`, returning the line
/// (without its terminator) and the byte offset just past the terminator.
pub(crate) fn first_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    for (i, b) in buf.iter().enumerate() {
        if *b == b'\n' {
            let end = if i > 0 && buf[i - 1] == b'\r' { i - 1 } else { i };
            return Some((&buf[..end], i + 1));
        }
    }
    None
}

/// Locate the end of the HTTP header block: the offset just past the second
/// consecutive LF (CRs are skipped, matching `\r\n\r\n` or bare `\n\n`).
pub(crate) fn end_of_headers(buf: &[u8]) -> Option<usize> {
    let mut lf_count = 0;
    for (i, b) in buf.iter().enumerate() {
        match *b {
            b'\n' => {
                lf_count += 1;
                if lf_count >= 2 {
                    return Some(i + 1);
                }
            }
            b'\r' => {}
            _ => lf_count = 0,
        }
    }
    None
}
