//! The verdict engine (spec.md §4.2): turns a completed round's
//! [`CheckResult`] into health-counter movement, UP/DOWN/DRAIN transitions,
//! and (for the passive observe-mode analyser) `onerror` reactions.
//!
//! The gating here mirrors the real rise/fall state machine closely rather
//! than the simplified "decrement else zero" sketch: a failure only zeroes
//! `health` and runs the DOWN side effects when the server was actually
//! sitting on the rise/fall boundary (or is itself a tracker being notified
//! of its tracked server's transition) — otherwise it's a harmless decrement
//! still on the UP side. The same asymmetry applies in reverse for UP.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use vortex_core::domain::backend::{BackendId, OnError, ServerStateFlags, SharedBackend};

use crate::check::{Check, CheckResult, CheckStatus};
use crate::clock::Tick;
use crate::hooks::LbHooks;

/// Maps a server to the [`Check`] driving it, so tracker propagation can
/// reach a tracked server's check without the domain layer (which has no
/// notion of a `Check`) carrying the reference itself.
#[derive(Default)]
pub struct CheckRegistry {
    inner: Mutex<HashMap<BackendId, Arc<Mutex<Check>>>>,
}

impl CheckRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the check driving `id`.
    pub fn register(&self, id: BackendId, check: Arc<Mutex<Check>>) {
        self.inner.lock().expect("registry lock poisoned").insert(id, check);
    }

    /// Look up the check driving `id`, if any is registered.
    pub fn get(&self, id: BackendId) -> Option<Arc<Mutex<Check>>> {
        self.inner.lock().expect("registry lock poisoned").get(&id).cloned()
    }
}

/// Apply the verdict of a just-finished round to `server`'s health counters
/// and state, mirroring `process_chk`'s post-round branch.
pub fn apply_round(
    check: &mut Check,
    server: &SharedBackend,
    registry: &CheckRegistry,
    hooks: &dyn LbHooks,
    now: Tick,
    disable404: bool,
) {
    match check.result {
        CheckResult::Failed => check_failed(check, server, registry, hooks, now),
        CheckResult::Passed | CheckResult::CondPass => {
            if disable404 && server.state().contains(ServerStateFlags::RUNNING) {
                let draining = server.state().contains(ServerStateFlags::GOINGDOWN);
                if draining && check.result != CheckResult::CondPass {
                    set_server_enabled(server, registry, hooks);
                } else if !draining && check.result == CheckResult::CondPass {
                    set_server_disabled(server, registry, hooks);
                }
            }

            if !server.is_maintain() && check.health < check.health_max() {
                check.health += 1;
            }
            set_server_up(check, server, registry, hooks, now, false);
        }
        CheckResult::Unknown => {}
    }
}

/// `check_failed` (spec.md §4.2): the agent's secondary check only counts a
/// failure when it produced an explicit `L7STS` verdict; a mere failure to
/// connect to the agent is never a reason to mark the primary server down.
fn check_failed(check: &mut Check, server: &SharedBackend, registry: &CheckRegistry, hooks: &dyn LbHooks, now: Tick) {
    if check.is_agent() && check.status != CheckStatus::L7Sts {
        return;
    }

    if check.health > check.config.rise {
        check.health -= 1;
        server.counters.failed_checks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    } else {
        set_server_down(check, server, registry, hooks, now, false);
    }
}

/// `set_server_down`: only performs the DOWN transition (state bits, hooks,
/// tracker propagation, counters) when the server was actually RUNNING at
/// exactly the rise boundary, or this call is itself a tracker-propagation
/// notification (`forced`); either way `health` is unconditionally zeroed.
pub fn set_server_down(
    check: &mut Check,
    server: &SharedBackend,
    registry: &CheckRegistry,
    hooks: &dyn LbHooks,
    now: Tick,
    forced: bool,
) {
    if server.is_maintain() {
        check.health = check.config.rise;
    }

    let at_boundary = server.state().contains(ServerStateFlags::RUNNING) && check.health == check.config.rise;
    if at_boundary || forced {
        let was_usable = hooks.server_state_metrics(server).total_weight > 0;

        server.with_state_mut(|s| {
            s.remove(ServerStateFlags::RUNNING);
            s.remove(ServerStateFlags::GOINGDOWN);
        });
        server.last_change.store(now.as_millis(), std::sync::atomic::Ordering::Relaxed);
        hooks.set_server_status_down(server);

        if server.onmarkeddown.contains(vortex_core::domain::backend::OnMarkedDown::SHUTDOWN_SESSIONS) {
            hooks.shutdown_sessions(server);
        }

        let xferred = hooks.redistribute_pending(server);
        server.counters.down_trans.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // Set-DOWN step 7: the proxy had at least one usable server before
        // this transition and has none now. There's no `Proxy` struct in
        // this crate to carry `last_change`/`down_trans` at the proxy level
        // (see DESIGN.md), so only the hook notification fires.
        let now_usable = hooks.server_state_metrics(server).total_weight > 0;
        if was_usable && !now_usable {
            hooks.no_server_available(server.proxy_id);
        }

        tracing::warn!(
            server = server.id.0,
            proxy = server.proxy_id.0,
            backup = server.state().contains(ServerStateFlags::BACKUP),
            maintain = server.state().contains(ServerStateFlags::MAINTAIN),
            redistributed = xferred,
            status = check.status.tag(),
            desc = %check.desc,
            "server is DOWN",
        );

        for tracker in server.trackers() {
            if tracker.is_maintain() {
                continue;
            }
            if let Some(tracker_check) = registry.get(tracker.id) {
                let mut guard = tracker_check.lock().expect("tracker check lock poisoned");
                set_server_down(&mut guard, &tracker, registry, hooks, now, true);
            }
        }
    }

    check.health = 0;
}

/// `set_server_up`: the mirror-image guard — transitions when the server
/// tracks another (`forced`) or its own health just reached the rise
/// boundary from below. The final clamp to `health_max()` always runs,
/// independent of whether a transition happened.
pub fn set_server_up(
    check: &mut Check,
    server: &SharedBackend,
    registry: &CheckRegistry,
    hooks: &dyn LbHooks,
    now: Tick,
    forced: bool,
) {
    let was_maintain = server.is_maintain();
    if was_maintain {
        check.health = check.config.rise;
    }

    let at_boundary = check.state.contains(crate::check::CheckStateFlags::ENABLED) && check.health == check.config.rise;
    if forced || at_boundary {
        // Set-UP step 2: accrue the time just spent DOWN before `last_change`
        // is overwritten with `now`.
        let last_change = Tick::from_millis(server.last_change.load(std::sync::atomic::Ordering::Relaxed));
        let down_elapsed = now.as_millis().saturating_sub(last_change.as_millis());
        server.counters.down_time.fetch_add(down_elapsed, std::sync::atomic::Ordering::Relaxed);

        server.last_change.store(now.as_millis(), std::sync::atomic::Ordering::Relaxed);
        server.with_state_mut(|s| {
            s.insert(ServerStateFlags::RUNNING);
            s.remove(ServerStateFlags::MAINTAIN);
        });

        if server.slowstart_ms > 0 {
            server.with_state_mut(|s| s.insert(ServerStateFlags::WARMINGUP));
        }

        hooks.set_server_status_up(server);

        let is_backup = server.state().contains(ServerStateFlags::BACKUP);
        let eweight = server.eweight.load(std::sync::atomic::Ordering::Relaxed);
        if server.onmarkedup.contains(vortex_core::domain::backend::OnMarkedUp::SHUTDOWN_BACKUP_SESSIONS)
            && !is_backup
            && eweight > 0
        {
            hooks.shutdown_backup_sessions(server.proxy_id);
        }

        let xferred = hooks.requeue_from_proxy(server);

        tracing::warn!(
            server = server.id.0,
            proxy = server.proxy_id.0,
            leaving_maintenance = was_maintain,
            requeued = xferred,
            status = check.status.tag(),
            desc = %check.desc,
            "server is UP",
        );

        for tracker in server.trackers() {
            if tracker.is_maintain() {
                continue;
            }
            if let Some(tracker_check) = registry.get(tracker.id) {
                let mut guard = tracker_check.lock().expect("tracker check lock poisoned");
                set_server_up(&mut guard, &tracker, registry, hooks, now, true);
            }
        }
    }

    if check.health >= check.config.rise {
        check.health = check.health_max();
    }
}

/// `set_server_disabled` (DISABLE404 entering drain): marks the server
/// GOINGDOWN without touching RUNNING, and propagates unconditionally to
/// every tracker (no MAINTAIN guard — drain is advisory, not a health fact).
pub fn set_server_disabled(server: &SharedBackend, registry: &CheckRegistry, hooks: &dyn LbHooks) {
    server.with_state_mut(|s| s.insert(ServerStateFlags::GOINGDOWN));
    hooks.notify_drain_changed(server, true);
    let xferred = hooks.redistribute_pending(server);
    tracing::info!(server = server.id.0, redistributed = xferred, "load-balancing disabled (draining)");

    for tracker in server.trackers() {
        set_server_disabled(&tracker, registry, hooks);
    }
}

/// `set_server_enabled` (DISABLE404 leaving drain).
pub fn set_server_enabled(server: &SharedBackend, registry: &CheckRegistry, hooks: &dyn LbHooks) {
    server.with_state_mut(|s| s.remove(ServerStateFlags::GOINGDOWN));
    hooks.notify_drain_changed(server, false);
    let xferred = hooks.requeue_from_proxy(server);
    tracing::info!(server = server.id.0, requeued = xferred, "load-balancing re-enabled");

    for tracker in server.trackers() {
        set_server_enabled(&tracker, registry, hooks);
    }
}

/// `__health_adjust`: the passive observe-mode analyser. `failed` is the
/// analyser's binary verdict for `status` under the server's configured
/// [`vortex_core::domain::backend::ObserveMode`] (the `analyze_statuses`
/// lookup table lives with the analyser, not here).
pub fn observe_adjust(
    check: &mut Check,
    server: &SharedBackend,
    registry: &CheckRegistry,
    hooks: &dyn LbHooks,
    now: Tick,
    failed: bool,
) {
    if !failed {
        server.counters.consecutive_errors.store(0, std::sync::atomic::Ordering::Relaxed);
        return;
    }

    let errors = server.counters.consecutive_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
    if errors < server.consecutive_errors_limit {
        return;
    }

    let desc = format!("Detected {errors} consecutive errors");

    match server.onerror {
        OnError::FastInter => {}
        OnError::SuddenDeath => {
            if check.health > check.config.rise {
                check.health = check.config.rise + 1;
            }
            check.set_status(CheckStatus::Hana, desc, now);
            check_failed(check, server, registry, hooks, now);
        }
        OnError::FailChk => {
            check.set_status(CheckStatus::Hana, desc, now);
            check_failed(check, server, registry, hooks, now);
        }
        OnError::MarkDown => {
            check.health = check.config.rise;
            check.set_status(CheckStatus::Hana, desc, now);
            set_server_down(check, server, registry, hooks, now, false);
        }
    }

    server.counters.consecutive_errors.store(0, std::sync::atomic::Ordering::Relaxed);
    server.counters.failed_hana.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use vortex_core::domain::backend::{Backend, BackendId, ProxyId};

    use super::*;
    use crate::check::{CheckConfig, CheckKind};
    use crate::hooks::{NullLbHooks, ServerStateMetrics};

    /// Records `no_server_available` calls and reports `total_weight` from
    /// the server's own RUNNING bit, the way a real `LbHooks` adapter would
    /// (unlike [`NullLbHooks`], whose `eweight` readback never changes on a
    /// DOWN transition).
    #[derive(Default)]
    struct RecordingHooks {
        no_server_available_calls: std::sync::atomic::AtomicU32,
    }

    impl LbHooks for RecordingHooks {
        fn set_server_status_down(&self, _server: &SharedBackend) {}
        fn set_server_status_up(&self, _server: &SharedBackend) {}
        fn notify_drain_changed(&self, _server: &SharedBackend, _draining: bool) {}
        fn redistribute_pending(&self, _server: &SharedBackend) -> usize {
            0
        }
        fn requeue_from_proxy(&self, _server: &SharedBackend) -> usize {
            0
        }
        fn shutdown_sessions(&self, _server: &SharedBackend) {}
        fn shutdown_backup_sessions(&self, _proxy_id: vortex_core::domain::backend::ProxyId) {}
        fn no_server_available(&self, _proxy_id: vortex_core::domain::backend::ProxyId) {
            self.no_server_available_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        fn set_server_weight_percent(&self, _server: &SharedBackend, _pct: u32) {}
        fn server_state_metrics(&self, server: &SharedBackend) -> ServerStateMetrics {
            let total_weight = if server.state().contains(ServerStateFlags::RUNNING) {
                server.eweight.load(std::sync::atomic::Ordering::Relaxed)
            } else {
                0
            };
            ServerStateMetrics { node: "", total_weight, cur_sess: 0, beconn_minus_pending: 0, queued: 0 }
        }
    }

    fn backend() -> SharedBackend {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        Arc::new(Backend::new(BackendId(1), ProxyId(1), addr))
    }

    fn config(rise: u32, fall: u32) -> CheckConfig {
        CheckConfig {
            kind: CheckKind::None,
            rise,
            fall,
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

    #[test]
    fn health_stays_within_bounds_across_many_rounds() {
        let server = backend();
        let mut check = Check::new(config(2, 3)).unwrap();
        let registry = CheckRegistry::new();
        let hooks = NullLbHooks;
        let now = Tick::ZERO;

        let pattern = [
            CheckResult::Passed,
            CheckResult::Passed,
            CheckResult::Failed,
            CheckResult::Failed,
            CheckResult::Failed,
            CheckResult::Passed,
            CheckResult::Passed,
            CheckResult::Passed,
        ];
        for result in pattern {
            check.result = result;
            apply_round(&mut check, &server, &registry, &hooks, now, false);
            assert!(check.health <= check.health_max());
        }
    }

    #[test]
    fn repeated_failure_at_boundary_marks_down_and_zeroes_health() {
        let server = backend();
        let mut check = Check::new(config(2, 2)).unwrap();
        let registry = CheckRegistry::new();
        let hooks = NullLbHooks;

        assert!(server.state().contains(ServerStateFlags::RUNNING));
        check.result = CheckResult::Failed;
        apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, false);

        assert_eq!(check.health, 0);
        assert!(!server.state().contains(ServerStateFlags::RUNNING));
    }

    #[test]
    fn failure_above_boundary_just_decrements() {
        let server = backend();
        let mut check = Check::new(config(1, 3)).unwrap();
        let registry = CheckRegistry::new();
        let hooks = NullLbHooks;

        check.result = CheckResult::Passed;
        apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, false);
        assert!(check.health > check.config.rise);

        check.result = CheckResult::Failed;
        apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, false);
        assert!(server.state().contains(ServerStateFlags::RUNNING));
        assert!(check.health >= check.config.rise);
    }

    #[test]
    fn recovery_after_down_requires_full_rise_count() {
        let server = backend();
        let mut check = Check::new(config(3, 2)).unwrap();
        let registry = CheckRegistry::new();
        let hooks = NullLbHooks;

        check.result = CheckResult::Failed;
        apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, false);
        assert!(!server.state().contains(ServerStateFlags::RUNNING));

        for _ in 0..2 {
            check.result = CheckResult::Passed;
            apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, false);
            assert!(!server.state().contains(ServerStateFlags::RUNNING));
        }

        check.result = CheckResult::Passed;
        apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, false);
        assert!(server.state().contains(ServerStateFlags::RUNNING));
    }

    #[test]
    fn maintain_server_ignores_failures() {
        let server = backend();
        server.with_state_mut(|s| s.insert(ServerStateFlags::MAINTAIN));
        let mut check = Check::new(config(2, 2)).unwrap();
        let registry = CheckRegistry::new();
        let hooks = NullLbHooks;

        check.result = CheckResult::Failed;
        apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, false);
        assert!(server.is_maintain());
    }

    #[test]
    fn disable404_toggles_drain_without_clearing_running() {
        let server = backend();
        let mut check = Check::new(config(2, 2)).unwrap();
        check.health = check.config.rise + 1;
        let registry = CheckRegistry::new();
        let hooks = NullLbHooks;

        check.result = CheckResult::CondPass;
        apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, true);
        assert!(server.state().contains(ServerStateFlags::GOINGDOWN));
        assert!(server.state().contains(ServerStateFlags::RUNNING));

        check.result = CheckResult::Passed;
        apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, true);
        assert!(!server.state().contains(ServerStateFlags::GOINGDOWN));
    }

    #[test]
    fn observe_mode_marks_down_after_consecutive_errors() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let mut raw = Backend::new(BackendId(1), ProxyId(1), addr);
        raw.consecutive_errors_limit = 2;
        let server: SharedBackend = Arc::new(raw);
        let mut check = Check::new(config(2, 2)).unwrap();
        let registry = CheckRegistry::new();
        let hooks = NullLbHooks;

        observe_adjust(&mut check, &server, &registry, &hooks, Tick::ZERO, true);
        assert!(server.state().contains(ServerStateFlags::RUNNING));
        observe_adjust(&mut check, &server, &registry, &hooks, Tick::ZERO, true);
        assert!(!server.state().contains(ServerStateFlags::RUNNING));
        assert_eq!(check.status, CheckStatus::Hana);
    }

    #[test]
    fn tracker_mirrors_target_down_transition() {
        let target = backend();
        let tracker = backend();
        target.add_tracker(Arc::downgrade(&tracker));

        let mut target_check = Check::new(config(2, 2)).unwrap();
        let tracker_check = Arc::new(Mutex::new(Check::new(config(2, 2)).unwrap()));
        let registry = CheckRegistry::new();
        registry.register(tracker.id, tracker_check.clone());
        let hooks = NullLbHooks;

        target_check.result = CheckResult::Failed;
        apply_round(&mut target_check, &target, &registry, &hooks, Tick::ZERO, false);

        assert!(!target.state().contains(ServerStateFlags::RUNNING));
        assert!(!tracker.state().contains(ServerStateFlags::RUNNING));
        assert_eq!(tracker_check.lock().unwrap().health, 0);
    }

    #[test]
    fn down_transition_signals_no_server_available_when_proxy_empties() {
        let server = backend();
        let mut check = Check::new(config(2, 2)).unwrap();
        let registry = CheckRegistry::new();
        let hooks = RecordingHooks::default();

        check.result = CheckResult::Failed;
        apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, false);

        assert_eq!(hooks.no_server_available_calls.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn up_transition_accrues_down_time() {
        let server = backend();
        server.with_state_mut(|s| s.remove(ServerStateFlags::RUNNING));
        server.last_change.store(0, std::sync::atomic::Ordering::Relaxed);
        let mut check = Check::new(config(1, 2)).unwrap();
        check.health = 0;
        let registry = CheckRegistry::new();
        let hooks = NullLbHooks;

        check.result = CheckResult::Passed;
        apply_round(&mut check, &server, &registry, &hooks, Tick::from_millis(5_000), false);

        assert!(server.state().contains(ServerStateFlags::RUNNING));
        assert_eq!(server.counters.down_time.load(std::sync::atomic::Ordering::Relaxed), 5_000);
    }

    proptest::proptest! {
        #[test]
        fn health_never_leaves_its_bounds(
            rise in 1u32..6,
            fall in 1u32..6,
            results in proptest::collection::vec(proptest::bool::ANY, 0..200),
        ) {
            let server = backend();
            let mut check = Check::new(config(rise, fall)).unwrap();
            let registry = CheckRegistry::new();
            let hooks = NullLbHooks;

            for passed in results {
                check.result = if passed { CheckResult::Passed } else { CheckResult::Failed };
                apply_round(&mut check, &server, &registry, &hooks, Tick::ZERO, false);
                prop_assert!(check.health <= check.health_max());
            }
        }
    }
}
