//! Slow-start warmup (spec.md §4.7), mirroring `server_warmup`: a task that
//! ramps a server's effective weight back up to nominal over `slowstart_ms`,
//! then stops itself.

use std::sync::atomic::Ordering;

use vortex_core::domain::backend::{ServerStateFlags, SharedBackend};

use crate::clock::{Clock, Tick};
use crate::task::CheckTask;

/// How often the warmup task re-evaluates its ramp, as a fraction of
/// `slowstart_ms`: every `max(1000, slowstart_ms / 20)` milliseconds, giving
/// ~20 steps of roughly 5% each.
fn poll_interval_ms(slowstart_ms: u64) -> u64 {
    std::cmp::max(1000, slowstart_ms / 20)
}

/// Recompute `server.eweight` from its ramp progress, mirroring
/// `server_recalc_eweight`: linear in elapsed time since `last_change`,
/// clamped to `[1, uweight]`, reaching nominal weight exactly at
/// `slowstart_ms`.
pub fn recalc_eweight(server: &SharedBackend, now: Tick) {
    let uweight = server.uweight.load(Ordering::Relaxed);
    if !server.state().contains(ServerStateFlags::WARMINGUP) || server.slowstart_ms == 0 {
        server.eweight.store(uweight, Ordering::Relaxed);
        return;
    }

    let last_change = Tick::from_millis(server.last_change.load(Ordering::Relaxed));
    let elapsed = now.as_millis().saturating_sub(last_change.as_millis());
    if elapsed >= server.slowstart_ms {
        server.eweight.store(uweight, Ordering::Relaxed);
        server.with_state_mut(|s| s.remove(ServerStateFlags::WARMINGUP));
        return;
    }

    let ratio = std::cmp::max(1, 100 * elapsed / server.slowstart_ms);
    let eweight = std::cmp::max(1, uweight * ratio as u32 / 100);
    server.eweight.store(eweight, Ordering::Relaxed);
}

/// The warmup ramp as a long-lived task: polls on `task` at
/// [`poll_interval_ms`], recomputing the effective weight each time and
/// pulling pending connections back onto the server, until the ramp
/// completes, the server leaves WARMINGUP, or it's pulled back into
/// MAINTAIN.
pub async fn run(server: SharedBackend, task: std::sync::Arc<CheckTask>, hooks: std::sync::Arc<dyn crate::hooks::LbHooks>) {
    loop {
        let still_ramping = {
            let state = server.state();
            state.contains(ServerStateFlags::RUNNING)
                && state.contains(ServerStateFlags::WARMINGUP)
                && !state.contains(ServerStateFlags::MAINTAIN)
        };
        if !still_ramping {
            task.set_expire(Tick::ETERNITY);
            return;
        }

        recalc_eweight(&server, Clock::now());
        hooks.requeue_from_proxy(&server);

        if !server.state().contains(ServerStateFlags::WARMINGUP) {
            return;
        }

        task.set_expire(Clock::now().add_millis(poll_interval_ms(server.slowstart_ms)));
        task.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use vortex_core::domain::backend::{Backend, BackendId, ProxyId};

    use super::*;

    fn warming_backend(slowstart_ms: u64) -> SharedBackend {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let backend = Backend::new(BackendId(1), ProxyId(1), addr);
        backend.uweight.store(100, Ordering::Relaxed);
        backend.with_state_mut(|s| {
            s.insert(ServerStateFlags::RUNNING);
            s.insert(ServerStateFlags::WARMINGUP);
        });
        backend.last_change.store(0, Ordering::Relaxed);
        let mut raw = backend;
        raw.slowstart_ms = slowstart_ms;
        Arc::new(raw)
    }

    #[test]
    fn eweight_ramps_linearly_then_reaches_nominal() {
        let server = warming_backend(10_000);

        recalc_eweight(&server, Tick::from_millis(1_000));
        let mid = server.eweight.load(Ordering::Relaxed);
        assert!(mid >= 1 && mid < 100);

        recalc_eweight(&server, Tick::from_millis(10_000));
        assert_eq!(server.eweight.load(Ordering::Relaxed), 100);
        assert!(!server.state().contains(ServerStateFlags::WARMINGUP));
    }

    #[test]
    fn zero_slowstart_jumps_straight_to_nominal() {
        let server = warming_backend(0);
        recalc_eweight(&server, Tick::from_millis(0));
        assert_eq!(server.eweight.load(Ordering::Relaxed), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_once_warmup_clears() {
        let server = warming_backend(1_000);
        let task = Arc::new(CheckTask::new());
        let hooks: Arc<dyn crate::hooks::LbHooks> = Arc::new(crate::hooks::NullLbHooks);

        tokio::time::timeout(std::time::Duration::from_secs(5), run(server.clone(), task, hooks))
            .await
            .expect("warmup task should terminate on its own");

        assert!(!server.state().contains(ServerStateFlags::WARMINGUP));
        assert_eq!(server.eweight.load(Ordering::Relaxed), 100);
    }
}
