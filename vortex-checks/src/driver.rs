//! The check task driver (spec.md §4.1): the single async entry point that
//! launches a probe, advances it to a verdict, and reschedules the next
//! round. Subsumes the connection callback trio (§4.6) — since a round here
//! is a single `async fn` rather than a poller invoking separate
//! `on_readable`/`on_writable`/`on_wake` callbacks, those three concerns are
//! just the sequential awaits below.

use std::sync::atomic::Ordering;

use rand::Rng;
use tokio_rustls::TlsConnector;

use vortex_core::domain::backend::{ServerStateFlags, SharedBackend};

use crate::check::{Check, CheckKind, CheckResult, CheckStateFlags, CheckStatus};
use crate::clock::{Clock, Tick};
use crate::connection::CheckConnection;
use crate::error::{classify_connection_error, classify_expiry, ClassifyContext, Phase};
use crate::hooks::LbHooks;
use crate::probers::{self, ProbeOutcome};
use crate::task::CheckTask;
use crate::tcpcheck::{self, ScriptCursor, ScriptEnv};
use crate::verdict::{self, CheckRegistry};

/// Per-driver environment: the bits a round needs that aren't part of the
/// check's own configuration.
pub struct DriverEnv {
    /// TLS client connector, used by TCP-SCRIPT `OPT_SSL` CONNECT steps.
    pub tls_connector: Option<TlsConnector>,
    /// Server name presented during any TLS handshake this driver performs.
    pub tls_server_name: Option<pki_types::ServerName<'static>>,
    /// `global.spread_checks`, a percentage in `[0, 100]`.
    pub spread_checks_pct: u32,
}

/// Drive `check` forever: wait for its task to fire, run one round, apply
/// the verdict, reschedule, repeat. Exits only if the task is dropped.
pub async fn run_forever(
    check: std::sync::Arc<tokio::sync::Mutex<Check>>,
    server: SharedBackend,
    registry: std::sync::Arc<CheckRegistry>,
    hooks: std::sync::Arc<dyn LbHooks>,
    task: std::sync::Arc<CheckTask>,
    env: DriverEnv,
) {
    let mut was_warming = server.state().contains(ServerStateFlags::WARMINGUP);
    loop {
        task.wait().await;
        let now = Clock::now();
        if !task.is_expired(now) {
            continue;
        }

        let mut guard = check.lock().await;
        run_round(&mut guard, &server, &registry, hooks.as_ref(), &task, now, &env).await;
        drop(guard);

        // Spawn the slow-start ramp (spec.md §4.2 Set-UP step 4) the moment
        // WARMINGUP is entered; it self-terminates once the ramp finishes or
        // the server leaves RUNNING, so it only needs arming on the edge.
        let now_warming = server.state().contains(ServerStateFlags::WARMINGUP);
        if now_warming && !was_warming {
            let warmup_task = std::sync::Arc::new(CheckTask::new());
            tokio::spawn(crate::warmup::run(server.clone(), warmup_task, hooks.clone()));
        }
        was_warming = now_warming;
    }
}

/// Run exactly one round to completion (spec.md §4.1's "not in progress" +
/// "in progress" phases collapsed into straight-line async code, since a
/// round never actually spans more than one task wakeup in this driver: we
/// await every suspension point inline instead of returning to the caller).
pub async fn run_round(
    check: &mut Check,
    server: &SharedBackend,
    registry: &CheckRegistry,
    hooks: &dyn LbHooks,
    task: &CheckTask,
    now: Tick,
    env: &DriverEnv,
) {
    if !check.state.contains(CheckStateFlags::ENABLED) || check.state.contains(CheckStateFlags::PAUSED) {
        task.set_expire(now.add_millis(check.config.inter_ms));
        return;
    }

    check.start_round(now);

    let connect_deadline = match check.config.timeout_connect_ms {
        Some(t) => std::cmp::min(check.config.inter_ms, t),
        None => check.config.inter_ms,
    };
    task.set_expire(now.add_millis(connect_deadline));

    let target = server.check_target();
    let target = if let Some(port) = check.config.port {
        let mut t = target;
        t.set_port(port);
        t
    } else {
        target
    };

    let is_ssl_hello = check.config.kind == CheckKind::Ssl3Hello;

    let outcome = if check.config.kind == CheckKind::TcpScript {
        run_tcp_script(check, target, task, env).await
    } else {
        run_protocol_round(check, server, hooks, target, task, is_ssl_hello).await
    };

    match outcome {
        RoundOutcome::Done { status, code, desc } => {
            check.set_status(status, desc, Clock::now());
            check.code = code;
        }
        RoundOutcome::StillConnected => {
            // A bare TCP connect with no protocol: connectivity alone is the verdict.
            check.set_status(CheckStatus::L4Ok, "", Clock::now());
        }
    }

    let disable404 = check.config.disable404;
    verdict::apply_round(check, server, registry, hooks, Clock::now(), disable404);
    check.finish_round();

    reschedule(check, task, env);
}

enum RoundOutcome {
    Done { status: CheckStatus, code: i64, desc: String },
    StillConnected,
}

fn classify_ctx(phase: Phase, is_ssl_hello: bool) -> ClassifyContext {
    ClassifyContext { phase, is_ssl_hello }
}

/// Connect, optionally send a request, and feed reads to the prober matching
/// `check.config.kind` until a terminal verdict or the task expires.
async fn run_protocol_round(
    check: &mut Check,
    server: &SharedBackend,
    hooks: &dyn LbHooks,
    target: std::net::SocketAddr,
    task: &CheckTask,
    is_ssl_hello: bool,
) -> RoundOutcome {
    let mut conn = match CheckConnection::connect(target).await {
        Ok(c) => c,
        Err(e) => {
            let status = classify_connection_error(classify_ctx(Phase::Connect, is_ssl_hello), &e);
            return RoundOutcome::Done { status, code: 0, desc: e.to_string() };
        }
    };

    if check.config.kind == CheckKind::None {
        conn.force_close();
        return RoundOutcome::StillConnected;
    }

    match check.config.kind {
        CheckKind::Http => {
            if let Some(req) = &check.config.http_request {
                conn.bo.extend_from_slice(req);
                if check.config.send_state_header {
                    let metrics = hooks.server_state_metrics(server);
                    let header = render_state_header(check, server, &metrics, Clock::now());
                    conn.bo.extend_from_slice(header.as_bytes());
                    conn.bo.extend_from_slice(b"\r\n");
                }
                conn.bo.extend_from_slice(b"\r\n");
            }
        }
        CheckKind::Ssl3Hello => {
            let now_unix = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            conn.bo.extend_from_slice(&crate::probers::ssl::build_client_hello(now_unix));
        }
        _ => {}
    }

    if !conn.bo.is_empty() {
        if let Err(e) = conn.flush_bo().await {
            let status = classify_connection_error(classify_ctx(Phase::Established, is_ssl_hello), &e);
            conn.force_close();
            return RoundOutcome::Done { status, code: 0, desc: e.to_string() };
        }
    }

    loop {
        let done = conn.bi_full() || conn.flags().contains(crate::connection::ConnFlags::READ_SHUT);
        let outcome = dispatch_probe(check, server, hooks, &conn.bi, done);
        match outcome {
            ProbeOutcome::Done { status, code, desc } => {
                conn.shutdown_write().await;
                conn.force_close();
                return RoundOutcome::Done { status, code, desc };
            }
            ProbeOutcome::Pending => {
                if done {
                    conn.force_close();
                    return RoundOutcome::Done {
                        status: CheckStatus::L7Rsp,
                        code: 0,
                        desc: "truncated response".to_string(),
                    };
                }
            }
        }

        let phase = Phase::Established;
        tokio::select! {
            res = conn.read_into_bi() => {
                if let Err(e) = res {
                    let status = classify_connection_error(classify_ctx(phase, is_ssl_hello), &e);
                    conn.force_close();
                    return RoundOutcome::Done { status, code: 0, desc: e.to_string() };
                }
            }
            _ = task.wait() => {
                let now = Clock::now();
                if task.is_expired(now) {
                    conn.set_error();
                    conn.force_close();
                    return RoundOutcome::Done {
                        status: classify_expiry(classify_ctx(phase, is_ssl_hello)),
                        code: 0,
                        desc: "check timed out".to_string(),
                    };
                }
            }
        }
    }
}

fn dispatch_probe(check: &Check, server: &SharedBackend, hooks: &dyn LbHooks, bi: &[u8], done: bool) -> ProbeOutcome {
    match check.config.kind {
        CheckKind::Http => {
            let disable404_running = check.config.disable404 && server.state().contains(ServerStateFlags::RUNNING);
            probers::http::probe(bi, done, check.config.expect.as_ref(), disable404_running)
        }
        CheckKind::Ssl3Hello => probers::ssl::probe(bi, done),
        CheckKind::Smtp => probers::smtp::probe(bi, done),
        CheckKind::Pgsql => probers::pgsql::probe(bi, done),
        CheckKind::Redis => probers::redis::probe(bi, done),
        CheckKind::Mysql => probers::mysql::probe(bi, done, check.config.mysql_two_packet),
        CheckKind::Ldap => probers::ldap::probe(bi, done),
        CheckKind::AgentLine => match probers::agent::probe(bi, done, check.config.agent_enabled) {
            crate::probers::agent::AgentOutcome::Pending => ProbeOutcome::Pending,
            crate::probers::agent::AgentOutcome::WeightPercent(pct) => {
                hooks.set_server_weight_percent(server, pct);
                ProbeOutcome::done(CheckStatus::L7Ok, format!("agent weight {pct}%"))
            }
            crate::probers::agent::AgentOutcome::Forced { status, desc } => ProbeOutcome::done(status, desc),
            crate::probers::agent::AgentOutcome::Unrecognised { desc } => ProbeOutcome::done(CheckStatus::L7Rsp, desc),
        },
        CheckKind::None | CheckKind::TcpScript => ProbeOutcome::Pending,
    }
}

async fn run_tcp_script(check: &mut Check, target: std::net::SocketAddr, task: &CheckTask, env: &DriverEnv) -> RoundOutcome {
    let script_env = ScriptEnv {
        target,
        default_port: check.config.port,
        tls_connector: env.tls_connector.as_ref(),
        tls_server_name: env.tls_server_name.clone(),
    };
    let mut conn_slot: Option<CheckConnection> = None;
    let mut cursor = ScriptCursor {
        current_step: &mut check.current_step,
        last_started_step: &mut check.last_started_step,
    };

    let outcome = tokio::select! {
        o = tcpcheck::run(&check.config.tcp_script, &mut cursor, &mut conn_slot, &script_env) => o,
        _ = task.wait() => {
            let now = Clock::now();
            if task.is_expired(now) {
                ProbeOutcome::done(classify_expiry(classify_ctx(Phase::Established, false)), "check timed out")
            } else {
                ProbeOutcome::Pending
            }
        }
    };

    if let Some(conn) = conn_slot {
        conn.force_close();
    }

    match outcome {
        ProbeOutcome::Done { status, code, desc } => RoundOutcome::Done { status, code, desc },
        ProbeOutcome::Pending => RoundOutcome::Done {
            status: CheckStatus::L7Tout,
            code: 0,
            desc: "tcp-check timed out".to_string(),
        },
    }
}

/// Render the `X-Haproxy-Server-State` header (spec.md §6) for `server`,
/// using the proxy-wide figures `hooks.server_state_metrics` supplied.
pub fn render_state_header(check: &Check, server: &SharedBackend, metrics: &crate::hooks::ServerStateMetrics, now: Tick) -> String {
    let state = server.state();
    let enabled = check.state.contains(CheckStateFlags::ENABLED);
    let health = check.health;
    let rise = check.config.rise;
    let fall = check.config.fall;
    let max = rise + fall - 1;

    let body = if !enabled {
        "no check".to_string()
    } else if state.contains(ServerStateFlags::RUNNING) {
        let base = if health == max {
            if state.contains(ServerStateFlags::GOINGDOWN) { "NOLB".to_string() } else { "UP".to_string() }
        } else {
            let tag = if state.contains(ServerStateFlags::GOINGDOWN) { "NOLB" } else { "UP" };
            format!("{tag} {}/{}", health - rise + 1, fall)
        };
        base
    } else if health > 0 {
        format!("DOWN {health}/{rise}")
    } else {
        "DOWN".to_string()
    };

    let eweight = server.eweight.load(Ordering::Relaxed);
    let mut out = format!(
        "X-Haproxy-Server-State: {body}; name=px/{}; node={}; weight={eweight}/{}; scur={}/{}; qcur={}",
        server.id.0, metrics.node, metrics.total_weight, metrics.cur_sess, metrics.beconn_minus_pending, metrics.queued
    );

    if state.contains(ServerStateFlags::WARMINGUP) && server.slowstart_ms > 0 {
        let last_change = Tick::from_millis(server.last_change.load(Ordering::Relaxed));
        let elapsed = now.as_millis().saturating_sub(last_change.as_millis());
        if elapsed < server.slowstart_ms {
            let ratio = std::cmp::max(1, 100 * elapsed / server.slowstart_ms);
            out.push_str(&format!("; throttle={ratio}%"));
        }
    }

    out
}

/// Reschedule `task` after a completed round: `inter` (or `fastinter` /
/// `downinter` where configured and applicable) perturbed by a bounded
/// random spread, then stepped forward past any accumulated backlog.
fn reschedule(check: &Check, task: &CheckTask, env: &DriverEnv) {
    let mut base_inter = if check.result == CheckResult::Failed {
        check.config.downinter_ms.unwrap_or(check.config.inter_ms)
    } else {
        check.config.inter_ms
    };

    // A flapping server (health settled on neither the DOWN nor the fully-UP
    // boundary) uses `fastinter` in place of the base interval when it's
    // configured and tighter, mirroring `checks.c`'s `eb_..._inter` choice.
    let flapping = check.health > 0 && check.health < check.health_max();
    if flapping {
        if let Some(fastinter) = check.config.fastinter_ms {
            base_inter = std::cmp::min(base_inter, fastinter);
        }
    }

    let spread = if env.spread_checks_pct > 0 {
        let bound = (base_inter * env.spread_checks_pct as u64 / 100) as i64;
        if bound > 0 {
            rand::thread_rng().gen_range(-bound..=bound)
        } else {
            0
        }
    } else {
        0
    };

    let delay = (base_inter as i64 + spread).max(0) as u64;
    let mut expire = Clock::now().add_millis(delay);

    // Catch-up for a driver that fell behind (spec.md §9): step forward by
    // `inter` rather than snapping straight to `now + inter`, so a backlog
    // still lands on the check's regular cadence. Bounded so a pause of
    // days doesn't turn into a busy loop — past the cap, jump directly.
    const MAX_CATCHUP_STEPS: u32 = 64;
    let now = Clock::now();
    let mut steps = 0u32;
    while expire.is_expired(now) && steps < MAX_CATCHUP_STEPS {
        expire = expire.add_millis(base_inter.max(1));
        steps += 1;
    }
    if expire.is_expired(now) {
        expire = now.add_millis(base_inter.max(1));
    }
    task.set_expire(expire);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckConfig;

    fn config() -> CheckConfig {
        CheckConfig {
            kind: CheckKind::None,
            rise: 2,
            fall: 2,
            inter_ms: 1000,
            fastinter_ms: None,
            downinter_ms: None,
            timeout_check_ms: None,
            timeout_connect_ms: None,
            slowstart_ms: 0,
            port: None,
            http_request: None,
            send_state_header: false,
            expect: None,
            disable404: false,
            tcp_script: Vec::new(),
            agent_enabled: false,
            mysql_two_packet: false,
        }
    }

    fn env() -> DriverEnv {
        DriverEnv {
            tls_connector: None,
            tls_server_name: None,
            spread_checks_pct: 0,
        }
    }

    #[test]
    fn reschedule_without_spread_lands_on_inter() {
        let check = Check::new(config()).unwrap();
        let task = CheckTask::new();
        reschedule(&check, &task, &env());
        let delta = task.expire().as_millis() as i64 - Clock::now().as_millis() as i64;
        assert!((delta - 1000).abs() < 50);
    }

    #[test]
    fn reschedule_steps_forward_past_backlog() {
        let check = Check::new(config()).unwrap();
        let task = CheckTask::new();
        task.set_expire(Tick::ZERO);
        reschedule(&check, &task, &env());
        assert!(!task.expire().is_expired(Clock::now()));
    }

    #[test]
    fn state_header_reports_up_at_max_health() {
        let addr: std::net::SocketAddr = "127.0.0.1:80".parse().unwrap();
        let server: SharedBackend = std::sync::Arc::new(vortex_core::domain::backend::Backend::new(
            vortex_core::domain::backend::BackendId(1),
            vortex_core::domain::backend::ProxyId(1),
            addr,
        ));
        let mut check = Check::new(config()).unwrap();
        check.health = check.health_max();
        let metrics = crate::hooks::ServerStateMetrics::default();
        let header = render_state_header(&check, &server, &metrics, Tick::ZERO);
        assert!(header.starts_with("X-Haproxy-Server-State: UP;"));
    }
}
