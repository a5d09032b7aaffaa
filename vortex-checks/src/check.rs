//! The check record: per-probe configuration and live round state.

use bitflags::bitflags;
use bytes::BytesMut;
use serde::Deserialize;

use crate::clock::Tick;
use crate::connection::CheckConnection;
use crate::tcpcheck::TcpCheckRule;

/// Maximum length retained for [`Check::desc`], matching HAProxy's
/// `HCHK_DESC_LEN` bound on the check description buffer.
pub const DESC_MAX_LEN: usize = 256;

/// The protocol a check speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    /// No protocol: success is a bare TCP connect.
    None,
    /// HTTP request/response with optional status/body expect rules.
    Http,
    /// A raw SSLv3/TLS ClientHello probe (not a full handshake).
    Ssl3Hello,
    /// SMTP banner / EHLO reply.
    Smtp,
    /// PostgreSQL startup packet reply.
    Pgsql,
    /// Redis `PING`.
    Redis,
    /// MySQL handshake (legacy or two-packet).
    Mysql,
    /// LDAPv3 anonymous bind.
    Ldap,
    /// A scripted connect/send/expect program.
    TcpScript,
    /// The agent line protocol (a secondary, advisory check).
    AgentLine,
}

bitflags! {
    /// Check state bits, mirroring HAProxy's `CHK_ST_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CheckStateFlags: u8 {
        /// The check has a valid configuration attached.
        const CONFIGURED  = 0b0000_0001;
        /// The check is enabled and will be scheduled.
        const ENABLED     = 0b0000_0010;
        /// The check is temporarily paused (proxy stopped, etc).
        const PAUSED      = 0b0000_0100;
        /// Exactly one probe round is currently live.
        const IN_PROGRESS = 0b0000_1000;
        /// This is the secondary agent check, not the primary health check.
        const AGENT       = 0b0001_0000;
    }
}

/// The granular diagnostic code of a completed (or in-flight) round.
///
/// Maps 1:1 to HAProxy's `HCHK_STATUS_*` table (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// No round has completed yet.
    Unknown,
    /// The round was just initialised (`status <- START`, not itself stored).
    Init,
    /// An observe-mode analyser forced this verdict.
    Hana,
    /// A socket-level error with no further diagnosis.
    SockErr,
    /// Layer 4 (plain connect) succeeded.
    L4Ok,
    /// Layer 4 connect timed out.
    L4Tout,
    /// Layer 4 connect failed (refused / unreachable / reset).
    L4Con,
    /// Layer 6 (TLS hello) succeeded.
    L6Ok,
    /// Layer 6 handshake/hello timed out.
    L6Tout,
    /// Layer 6 handshake/hello produced an invalid response.
    L6Rsp,
    /// Layer 7 round timed out after data was exchanged.
    L7Tout,
    /// Layer 7 response could not be parsed.
    L7Rsp,
    /// Layer 7 response parsed but passed.
    L7Ok,
    /// Layer 7 response parsed but conditionally passed (e.g. DISABLE404).
    L7OkC,
    /// Layer 7 response parsed but carried a failing status/result code.
    L7Sts,
}

impl CheckStatus {
    /// The stable string tag used in logs/telemetry (spec.md §6).
    pub fn tag(self) -> &'static str {
        match self {
            CheckStatus::Unknown => "UNK",
            CheckStatus::Init => "INI",
            CheckStatus::Hana => "HANA",
            CheckStatus::SockErr => "SOCKERR",
            CheckStatus::L4Ok => "L4OK",
            CheckStatus::L4Tout => "L4TOUT",
            CheckStatus::L4Con => "L4CON",
            CheckStatus::L6Ok => "L6OK",
            CheckStatus::L6Tout => "L6TOUT",
            CheckStatus::L6Rsp => "L6RSP",
            CheckStatus::L7Tout => "L7TOUT",
            CheckStatus::L7Rsp => "L7RSP",
            CheckStatus::L7Ok => "L7OK",
            CheckStatus::L7OkC => "L7OKC",
            CheckStatus::L7Sts => "L7STS",
        }
    }

    /// The result this status maps to, if fixed (see spec.md §6 table). Agent
    /// checks that haven't reached `L7STS` never force a result on their own
    /// (spec.md §4.2's "ignore early exits" rule) — that's applied by the
    /// verdict engine, not encoded here.
    pub fn result(self) -> CheckResult {
        match self {
            CheckStatus::Unknown | CheckStatus::Init => CheckResult::Unknown,
            CheckStatus::Hana
            | CheckStatus::SockErr
            | CheckStatus::L4Tout
            | CheckStatus::L4Con
            | CheckStatus::L6Tout
            | CheckStatus::L6Rsp
            | CheckStatus::L7Tout
            | CheckStatus::L7Rsp
            | CheckStatus::L7Sts => CheckResult::Failed,
            CheckStatus::L4Ok | CheckStatus::L6Ok | CheckStatus::L7Ok => CheckResult::Passed,
            CheckStatus::L7OkC => CheckResult::CondPass,
        }
    }

    /// The "agent failure may mark down" predicate from the re-architecture
    /// cues: the only ordering the original relies on is `status >= L7TOUT`.
    pub fn allows_marking_down_agent(self) -> bool {
        matches!(
            self,
            CheckStatus::L7Tout | CheckStatus::L7Rsp | CheckStatus::L7Ok | CheckStatus::L7OkC | CheckStatus::L7Sts
        )
    }
}

/// The verdict of a completed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// No verdict yet.
    Unknown,
    /// The round passed outright.
    Passed,
    /// The round passed conditionally (drain-worthy, e.g. HTTP 404 under DISABLE404).
    CondPass,
    /// The round failed.
    Failed,
}

/// `onerror` reactions available to the observe-mode passive analyser.
/// (Re-exported here so callers configuring a [`Check`] don't need to reach
/// into `vortex_core` for a check-local concept.)
pub use vortex_core::domain::backend::OnError;

/// Static, validated configuration for a [`Check`]; the part of HAProxy's
/// config file grammar the health-check core actually consumes
/// (spec.md §6, "Configuration options consumed by the core").
#[derive(Debug, Clone, Deserialize)]
pub struct CheckConfig {
    /// The protocol this check speaks.
    pub kind: CheckKind,
    /// Consecutive passes required to mark UP.
    pub rise: u32,
    /// Consecutive failures required to mark DOWN.
    pub fall: u32,
    /// Steady-state inter-check delay, in milliseconds.
    pub inter_ms: u64,
    /// Faster inter-check delay used after `onerror = fastinter`, in milliseconds.
    pub fastinter_ms: Option<u64>,
    /// Inter-check delay while DOWN, in milliseconds.
    pub downinter_ms: Option<u64>,
    /// Overall per-round timeout, in milliseconds; `None` follows the `inter`-only schedule.
    pub timeout_check_ms: Option<u64>,
    /// Connect-phase timeout, in milliseconds.
    pub timeout_connect_ms: Option<u64>,
    /// Slow-start ramp duration, in milliseconds; 0 disables warmup.
    pub slowstart_ms: u64,
    /// Optional check-specific port override.
    pub port: Option<u16>,
    /// The literal HTTP request line(s) to send, for `CheckKind::Http`.
    pub http_request: Option<Vec<u8>>,
    /// Whether to append the `X-Haproxy-Server-State` header to HTTP requests.
    pub send_state_header: bool,
    /// Optional HTTP expect rule.
    pub expect: Option<crate::probers::expect::ExpectRule>,
    /// Whether HTTP 404 should be treated as a conditional pass while RUNNING.
    pub disable404: bool,
    /// The scripted program, for `CheckKind::TcpScript`.
    #[serde(default)]
    pub tcp_script: Vec<TcpCheckRule>,
    /// Whether the agent line protocol is enabled for the secondary check.
    pub agent_enabled: bool,
    /// Whether the MySQL prober should expect the extended two-packet
    /// greeting (a username was configured to provoke it) rather than the
    /// legacy single-packet greeting.
    pub mysql_two_packet: bool,
}

/// Errors raised while constructing a [`Check`] from a [`CheckConfig`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `rise` was zero.
    #[error("rise must be >= 1")]
    RiseZero,
    /// `fall` was zero.
    #[error("fall must be >= 1")]
    FallZero,
    /// A `CheckKind::TcpScript` check was configured with no rules.
    #[error("tcp-check requires at least one rule")]
    EmptyTcpScript,
}

/// A probe instance: configuration plus the live state of the current (or
/// most recently completed) round.
pub struct Check {
    /// Immutable configuration.
    pub config: CheckConfig,
    /// Check state bits (CONFIGURED / ENABLED / PAUSED / IN_PROGRESS / AGENT).
    pub state: CheckStateFlags,
    /// Progress counter in `[0, rise+fall-1]`.
    pub health: u32,
    /// The verdict of the current/last round.
    pub result: CheckResult,
    /// The granular diagnostic code of the current/last round.
    pub status: CheckStatus,
    /// Numeric sub-code (HTTP status, SMTP code, LDAP result code).
    pub code: i64,
    /// Short human description, truncated to [`DESC_MAX_LEN`].
    pub desc: String,
    /// Wall-clock start of the current round.
    pub start: Option<Tick>,
    /// Elapsed milliseconds of the current/last round; `-1` for HANA-forced rounds.
    pub duration: i64,
    /// The connection currently associated with this probe, if any.
    pub conn: Option<CheckConnection>,
    /// Next step to run, for `CheckKind::TcpScript`.
    pub current_step: usize,
    /// Most recently *started* step, for diagnostics (step-id numbering).
    pub last_started_step: Option<usize>,
}

impl Check {
    /// Construct a new, validated check in the CONFIGURED|ENABLED state.
    pub fn new(config: CheckConfig) -> Result<Self, ConfigError> {
        if config.rise == 0 {
            return Err(ConfigError::RiseZero);
        }
        if config.fall == 0 {
            return Err(ConfigError::FallZero);
        }
        if config.kind == CheckKind::TcpScript && config.tcp_script.is_empty() {
            return Err(ConfigError::EmptyTcpScript);
        }
        let health = config.rise; // start on the DOWN/UP boundary, unproven
        Ok(Self {
            config,
            state: CheckStateFlags::CONFIGURED | CheckStateFlags::ENABLED,
            health,
            result: CheckResult::Unknown,
            status: CheckStatus::Unknown,
            code: 0,
            desc: String::new(),
            start: None,
            duration: 0,
            conn: None,
            current_step: 0,
            last_started_step: None,
        })
    }

    /// The maximum value `health` may reach.
    pub fn health_max(&self) -> u32 {
        self.config.rise + self.config.fall - 1
    }

    /// Whether this round's verdict currently allows reporting the server UP
    /// (`health >= rise`).
    pub fn is_on_up_side(&self) -> bool {
        self.health >= self.config.rise
    }

    /// Begin a fresh round: reset transient per-round state.
    pub fn start_round(&mut self, now: Tick) {
        self.status = CheckStatus::Unknown;
        self.result = CheckResult::Unknown;
        self.desc.clear();
        self.start = Some(now);
        self.state.insert(CheckStateFlags::IN_PROGRESS);
        self.current_step = 0;
    }

    /// Set `status`/`result`/`desc` and compute `duration`, mirroring
    /// HAProxy's `set_server_check_status`. `desc` is truncated to
    /// [`DESC_MAX_LEN`]. Idempotent against being called more than once per
    /// round: the second call leaves `duration` untouched (`start` is
    /// cleared after the first).
    pub fn set_status(&mut self, status: CheckStatus, desc: impl Into<String>, now: Tick) {
        let desc = desc.into();
        self.desc = if desc.len() > DESC_MAX_LEN {
            let mut end = DESC_MAX_LEN;
            while end > 0 && !desc.is_char_boundary(end) {
                end -= 1;
            }
            desc[..end].to_string()
        } else {
            desc
        };
        self.status = status;
        self.result = status.result();
        if matches!(status, CheckStatus::Hana) {
            self.duration = -1;
        } else if let Some(start) = self.start.take() {
            self.duration = now.as_millis() as i64 - start.as_millis() as i64;
        }
    }

    /// Clear `IN_PROGRESS`; called on every exit path out of the driver.
    pub fn finish_round(&mut self) {
        self.state.remove(CheckStateFlags::IN_PROGRESS);
    }

    /// Whether this is the secondary agent check.
    pub fn is_agent(&self) -> bool {
        self.state.contains(CheckStateFlags::AGENT)
    }
}
