//! The three external collaborators the verdict engine talks to (spec.md §9):
//! the load-balancer map, the pending-connection queue, and the session-task
//! wake primitive. All three are out of scope for this crate — callers
//! supply a concrete [`LbHooks`] implementation wired to their own LB map
//! and queue.

use vortex_core::domain::backend::{ProxyId, SharedBackend};

/// The proxy-wide figures the `X-Haproxy-Server-State` header reports
/// alongside a server's own health fields (spec.md §6); none of these are
/// owned by this crate, so they're fetched through a hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStateMetrics {
    /// This node's configured name, for the `node=` field.
    pub node: &'static str,
    /// Sum of `eweight` across every usable server on the proxy.
    pub total_weight: u32,
    /// Sessions currently bound to this server.
    pub cur_sess: u32,
    /// Proxy-wide connections minus pending, for the `scur` denominator.
    pub beconn_minus_pending: u32,
    /// Sessions queued at the proxy level.
    pub queued: u32,
}

/// Capability object the verdict engine uses to reach the load-balancer map
/// and pending-connection queue, without owning either.
pub trait LbHooks: Send + Sync {
    /// The server has transitioned to DOWN; recompute LB weights/maps.
    fn set_server_status_down(&self, server: &SharedBackend);

    /// The server has transitioned to UP; recompute LB weights/maps.
    fn set_server_status_up(&self, server: &SharedBackend);

    /// The server's DRAIN bit changed; recompute LB maps accordingly.
    fn notify_drain_changed(&self, server: &SharedBackend, draining: bool);

    /// Detach and requeue every pending session bound to `server`, returning
    /// how many were moved (for logging).
    fn redistribute_pending(&self, server: &SharedBackend) -> usize;

    /// Pull pending sessions from the proxy-level queue onto `server` while
    /// capacity allows, returning how many were moved (for logging).
    fn requeue_from_proxy(&self, server: &SharedBackend) -> usize;

    /// Forcibly terminate every session currently bound to `server`.
    fn shutdown_sessions(&self, server: &SharedBackend);

    /// Forcibly terminate every session on every backup server of `proxy_id`.
    fn shutdown_backup_sessions(&self, proxy_id: ProxyId);

    /// The proxy that owns `server` had at least one usable server before
    /// this transition and now has none.
    fn no_server_available(&self, proxy_id: ProxyId);

    /// Apply a weight-percentage update received over the agent line
    /// protocol (spec.md §4.3): recompute `eweight` from `pct` and update
    /// DRAIN (a `pct` of 0 drains the server, same as the `drain` keyword).
    fn set_server_weight_percent(&self, server: &SharedBackend, pct: u32);

    /// Figures needed to render `server`'s `X-Haproxy-Server-State` header.
    fn server_state_metrics(&self, server: &SharedBackend) -> ServerStateMetrics;
}

/// A no-op [`LbHooks`] that only logs, for tests and standalone use.
#[derive(Debug, Default)]
pub struct NullLbHooks;

impl LbHooks for NullLbHooks {
    fn set_server_status_down(&self, server: &SharedBackend) {
        tracing::debug!(server = server.id.0, "lb hook: status down (null)");
    }

    fn set_server_status_up(&self, server: &SharedBackend) {
        tracing::debug!(server = server.id.0, "lb hook: status up (null)");
    }

    fn notify_drain_changed(&self, server: &SharedBackend, draining: bool) {
        tracing::debug!(server = server.id.0, draining, "lb hook: drain changed (null)");
    }

    fn redistribute_pending(&self, _server: &SharedBackend) -> usize {
        0
    }

    fn requeue_from_proxy(&self, _server: &SharedBackend) -> usize {
        0
    }

    fn shutdown_sessions(&self, server: &SharedBackend) {
        tracing::debug!(server = server.id.0, "lb hook: shutdown sessions (null)");
    }

    fn shutdown_backup_sessions(&self, proxy_id: ProxyId) {
        tracing::debug!(proxy = proxy_id.0, "lb hook: shutdown backup sessions (null)");
    }

    fn no_server_available(&self, proxy_id: ProxyId) {
        tracing::warn!(proxy = proxy_id.0, "no server available");
    }

    fn set_server_weight_percent(&self, server: &SharedBackend, pct: u32) {
        let uweight = server.uweight.load(std::sync::atomic::Ordering::Relaxed);
        let eweight = uweight * pct.min(100) / 100;
        server.eweight.store(eweight, std::sync::atomic::Ordering::Relaxed);
        let was_draining = server.state().contains(vortex_core::domain::backend::ServerStateFlags::GOINGDOWN);
        if pct == 0 {
            server.with_state_mut(|s| s.insert(vortex_core::domain::backend::ServerStateFlags::GOINGDOWN));
        } else if was_draining {
            server.with_state_mut(|s| s.remove(vortex_core::domain::backend::ServerStateFlags::GOINGDOWN));
        }
        tracing::debug!(server = server.id.0, pct, eweight, "lb hook: weight percent (null)");
    }

    fn server_state_metrics(&self, server: &SharedBackend) -> ServerStateMetrics {
        ServerStateMetrics {
            node: "",
            total_weight: server.eweight.load(std::sync::atomic::Ordering::Relaxed),
            cur_sess: 0,
            beconn_minus_pending: 0,
            queued: 0,
        }
    }
}
