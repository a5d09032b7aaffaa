//! The status classifier (spec.md §7).
//!
//! A pure function from "what phase were we in, what happened" to a
//! [`CheckStatus`]. It never itself returns a `Result`: every classification
//! produces a definite, useful verdict, even for timeouts and resource
//! exhaustion.

use crate::check::CheckStatus;
use crate::connection::ConnectionError;

/// Which phase of a round the classifier should reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the L4 TCP connect has completed.
    Connect,
    /// Connected, performing a TLS (or SSL-hello) handshake.
    Handshake,
    /// Fully established; request sent and/or reply being read.
    Established,
}

/// Whether the check in question is the raw SSL3-hello probe, which uses
/// `L6TOUT` rather than `L7TOUT` on an established-phase expiry (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyContext {
    /// The phase the round was in when the error/expiry was observed.
    pub phase: Phase,
    /// Whether this check is a raw SSL3-hello probe.
    pub is_ssl_hello: bool,
}

/// Classify a connection error observed (not via timeout) into a status.
pub fn classify_connection_error(ctx: ClassifyContext, err: &ConnectionError) -> CheckStatus {
    match (ctx.phase, err) {
        (Phase::Connect, ConnectionError::ResourceExhausted(_)) => CheckStatus::SockErr,
        (Phase::Connect, _) => CheckStatus::L4Con,
        (Phase::Handshake, _) => CheckStatus::L6Rsp,
        (Phase::Established, ConnectionError::ResourceExhausted(_)) => CheckStatus::SockErr,
        (Phase::Established, _) => CheckStatus::SockErr,
    }
}

/// Classify a task expiry (no error, but the deadline passed) into a status.
pub fn classify_expiry(ctx: ClassifyContext) -> CheckStatus {
    match ctx.phase {
        Phase::Connect => CheckStatus::L4Tout,
        Phase::Handshake => CheckStatus::L6Tout,
        Phase::Established if ctx.is_ssl_hello => CheckStatus::L6Tout,
        Phase::Established => CheckStatus::L7Tout,
    }
}
