//! Scripted TCP check engine (spec.md §4.5).

use std::net::SocketAddr;

use bitflags::bitflags;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use tokio_rustls::TlsConnector;

use crate::check::CheckStatus;
use crate::connection::CheckConnection;
use crate::error::{classify_connection_error, ClassifyContext, Phase};
use crate::probers::expect::ExpectPattern;
use crate::probers::ProbeOutcome;

bitflags! {
    /// Per-CONNECT-step options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectOpts: u8 {
        /// Upgrade the new connection with a real TLS handshake.
        const SSL        = 0b01;
        /// Send a PROXY protocol header before the script's own traffic.
        const SEND_PROXY = 0b10;
    }
}

/// A single step of a scripted TCP check program.
#[derive(Debug, Clone)]
pub enum TcpCheckRule {
    /// Open a new connection, replacing any existing one.
    Connect {
        /// Port override; falls back to the check's configured port.
        port: Option<u16>,
        /// CONNECT-step options (TLS, send-PROXY).
        opts: ConnectOpts,
    },
    /// Queue bytes for transmission.
    Send {
        /// The literal bytes to send.
        data: Vec<u8>,
    },
    /// Wait for and match a pattern in the response.
    Expect {
        /// The pattern to match against the accumulated ingress buffer.
        pattern: ExpectPattern,
        /// Invert the match verdict.
        inverse: bool,
    },
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum RawRule {
    Connect {
        port: Option<u16>,
        #[serde(default)]
        ssl: bool,
        #[serde(default)]
        send_proxy: bool,
    },
    Send {
        string: String,
    },
    Expect {
        #[serde(default)]
        string: Option<String>,
        #[serde(default)]
        expect_regex: Option<String>,
        #[serde(default)]
        inverse: bool,
    },
}

impl<'de> Deserialize<'de> for TcpCheckRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawRule::deserialize(deserializer)?;
        Ok(match raw {
            RawRule::Connect { port, ssl, send_proxy } => {
                let mut opts = ConnectOpts::empty();
                opts.set(ConnectOpts::SSL, ssl);
                opts.set(ConnectOpts::SEND_PROXY, send_proxy);
                TcpCheckRule::Connect { port, opts }
            }
            RawRule::Send { string } => TcpCheckRule::Send {
                data: string.into_bytes(),
            },
            RawRule::Expect { string, expect_regex, inverse } => {
                let pattern = match (string, expect_regex) {
                    (Some(s), None) => ExpectPattern::Literal(s.into_bytes()),
                    (None, Some(re)) => {
                        ExpectPattern::Regex(regex::bytes::Regex::new(&re).map_err(D::Error::custom)?)
                    }
                    _ => return Err(D::Error::custom("expect rule needs exactly one of string/expect_regex")),
                };
                TcpCheckRule::Expect { pattern, inverse }
            }
        })
    }
}

/// Mutable script-engine cursor, embedded in [`crate::check::Check`].
pub struct ScriptCursor<'a> {
    /// Next step to run.
    pub current_step: &'a mut usize,
    /// Most recently started step, for diagnostics.
    pub last_started_step: &'a mut Option<usize>,
}

/// 1-based step id for diagnostics (spec.md §4.5 "Step-id numbering").
pub fn step_id(last_started_step: Option<usize>) -> usize {
    1 + last_started_step.unwrap_or(0)
}

/// The environment a script CONNECT step runs in.
pub struct ScriptEnv<'a> {
    /// The server address to connect to (host part only; port comes from
    /// the rule or `default_port`).
    pub target: SocketAddr,
    /// Fallback port when a CONNECT step doesn't specify its own.
    pub default_port: Option<u16>,
    /// TLS connector used for `OPT_SSL` steps.
    pub tls_connector: Option<&'a TlsConnector>,
    /// Server name presented during the TLS handshake.
    pub tls_server_name: Option<pki_types::ServerName<'static>>,
}

fn classify_connect(err: &crate::connection::ConnectionError) -> CheckStatus {
    classify_connection_error(
        ClassifyContext { phase: Phase::Connect, is_ssl_hello: false },
        err,
    )
}

/// Run the script from `cursor.current_step` to completion or to a terminal
/// verdict, operating on `conn_slot` (taking ownership of reconnects as
/// CONNECT steps require).
pub async fn run(
    rules: &[TcpCheckRule],
    cursor: &mut ScriptCursor<'_>,
    conn_slot: &mut Option<CheckConnection>,
    env: &ScriptEnv<'_>,
) -> ProbeOutcome {
    loop {
        if let Some(conn) = conn_slot.as_mut() {
            if !conn.bo.is_empty() {
                if let Err(e) = conn.flush_bo().await {
                    return ProbeOutcome::done(CheckStatus::SockErr, format!("tcp-check send error: {e}"));
                }
            }
        }

        let Some(rule) = rules.get(*cursor.current_step) else {
            let bo_empty = conn_slot.as_ref().map(|c| c.bo.is_empty()).unwrap_or(true);
            if bo_empty {
                return ProbeOutcome::done(CheckStatus::L7Ok, "(tcp-check)");
            }
            continue;
        };

        match rule {
            TcpCheckRule::Connect { port, opts } => {
                *cursor.last_started_step = Some(*cursor.current_step);
                if let Some(old) = conn_slot.take() {
                    old.force_close();
                }
                let mut addr = env.target;
                if let Some(p) = port.or(env.default_port) {
                    addr.set_port(p);
                }
                let mut new_conn = match CheckConnection::connect(addr).await {
                    Ok(c) => c,
                    Err(e) => return ProbeOutcome::done(classify_connect(&e), format!("{e}")),
                };
                if opts.contains(ConnectOpts::SEND_PROXY) {
                    new_conn.bo.extend_from_slice(build_proxy_header(addr).as_bytes());
                }
                if opts.contains(ConnectOpts::SSL) {
                    if let (Some(connector), Some(server_name)) =
                        (env.tls_connector, env.tls_server_name.clone())
                    {
                        if let Err(e) = new_conn.upgrade_tls(connector, server_name).await {
                            return ProbeOutcome::done(
                                CheckStatus::L6Rsp,
                                format!("tcp-check TLS handshake failed: {e}"),
                            );
                        }
                    }
                }
                *conn_slot = Some(new_conn);
                *cursor.current_step += 1;
            }
            TcpCheckRule::Send { data } => {
                let Some(conn) = conn_slot.as_mut() else {
                    return ProbeOutcome::done(CheckStatus::L7Rsp, "tcp-check SEND with no open connection");
                };
                if data.len() > crate::connection::DEFAULT_BUFFER_SIZE {
                    return ProbeOutcome::done(CheckStatus::L7Rsp, "tcp-check SEND exceeds buffer capacity");
                }
                conn.bo.extend_from_slice(data);
                *cursor.current_step += 1;
            }
            TcpCheckRule::Expect { pattern, inverse } => {
                let Some(conn) = conn_slot.as_mut() else {
                    return ProbeOutcome::done(CheckStatus::L7Rsp, "tcp-check EXPECT with no open connection");
                };
                loop {
                    let done = conn.bi_full() || conn.flags().contains(crate::connection::ConnFlags::READ_SHUT);
                    if conn.bi.is_empty() && done {
                        return ProbeOutcome::done(CheckStatus::L7Rsp, "empty response");
                    }
                    let matched = pattern_matches(pattern, &conn.bi);
                    if matched != *inverse {
                        *cursor.current_step += 1;
                        break;
                    }
                    if done {
                        let msg = format!(
                            "TCPCHK did not match content '{}' at step {}",
                            pattern.display(),
                            step_id(*cursor.last_started_step)
                        );
                        return ProbeOutcome::done(CheckStatus::L7Rsp, msg);
                    }
                    if let Err(e) = conn.read_into_bi().await {
                        return ProbeOutcome::done(CheckStatus::SockErr, format!("{e}"));
                    }
                }
            }
        }
    }
}

fn pattern_matches(pattern: &ExpectPattern, haystack: &[u8]) -> bool {
    match pattern {
        ExpectPattern::Literal(needle) => {
            !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle.as_slice())
        }
        ExpectPattern::Regex(re) => re.is_match(haystack),
    }
}

fn build_proxy_header(addr: SocketAddr) -> String {
    format!("PROXY TCP{} {} {} 0 {}\r\n", if addr.is_ipv6() { 6 } else { 4 }, addr.ip(), addr.ip(), addr.port())
}
