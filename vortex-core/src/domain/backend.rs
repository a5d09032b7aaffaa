//! Backend server models.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;

use crate::load_balancer::ewma::PeakEwma;

/// A unique identifier for a backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(pub u32);

/// A unique identifier for the proxy (backend group) a server belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId(pub u32);

bitflags! {
    /// Runtime state bits of a server, mirroring HAProxy's `SRV_*` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServerStateFlags: u8 {
        /// The server is currently considered up and receiving traffic.
        const RUNNING    = 0b0000_0001;
        /// The server is up but being drained (CONDPASS / DISABLE404).
        const GOINGDOWN  = 0b0000_0010;
        /// The server is a backup server.
        const BACKUP     = 0b0000_0100;
        /// The server is ramping up its effective weight after a transition to UP.
        const WARMINGUP  = 0b0000_1000;
        /// The server is administratively forced, ignoring check results.
        const MAINTAIN   = 0b0001_0000;
    }
}

bitflags! {
    /// Which layer's errors feed `consecutive_errors` for a server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObserveMode: u8 {
        /// Count errors observed at layer 4 (raw connection).
        const L4 = 0b01;
        /// Count errors observed at layer 7 (application protocol).
        const L7 = 0b10;
    }
}

/// The reaction applied once `consecutive_errors` reaches the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Tighten the next check interval only.
    FastInter,
    /// Simulate a single failed check at the current health.
    FailChk,
    /// Jump health to one step above the DOWN boundary, then simulate a failure.
    SuddenDeath,
    /// Force the server down immediately.
    MarkDown,
}

bitflags! {
    /// Session-shutdown side effects applied on a DOWN transition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OnMarkedDown: u8 {
        /// Forcibly terminate every session bound to this server.
        const SHUTDOWN_SESSIONS = 0b01;
    }
}

bitflags! {
    /// Session-shutdown side effects applied on an UP transition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OnMarkedUp: u8 {
        /// Terminate sessions on all backup servers of the same proxy.
        const SHUTDOWN_BACKUP_SESSIONS = 0b01;
    }
}

/// Health-subsystem counters tracked on a server, separate from load-balancing state.
#[derive(Debug, Default)]
pub struct HealthCounters {
    /// Number of times this server has transitioned to DOWN.
    pub down_trans: AtomicU64,
    /// Cumulative milliseconds spent DOWN.
    pub down_time: AtomicU64,
    /// Number of checks that ended FAILED.
    pub failed_checks: AtomicU64,
    /// Number of times an observe-mode `onerror` reaction fired.
    pub failed_hana: AtomicU64,
    /// Consecutive errors observed by the passive `observe` analyser.
    pub consecutive_errors: AtomicU32,
}

/// Represents a single upstream backend server
#[derive(Debug)]
pub struct Backend {
    /// The unique ID of the backend
    pub id: BackendId,
    /// The id of the owning proxy (backend group).
    pub proxy_id: ProxyId,
    /// The socket address of the backend
    pub addr: SocketAddr,
    /// Optional dedicated check address, overriding `addr` for health checks.
    pub check_addr: Option<SocketAddr>,
    /// Optional dedicated check port, overriding the port of `check_addr`/`addr`.
    pub check_port: Option<u16>,
    /// Whether the backend is currently considered healthy
    healthy: AtomicBool,
    /// Runtime state bits (RUNNING / GOINGDOWN / BACKUP / WARMINGUP / MAINTAIN).
    state: Mutex<ServerStateFlags>,
    /// Configured (nominal) weight.
    pub uweight: AtomicU32,
    /// Effective weight, adjusted during slow-start.
    pub eweight: AtomicU32,
    /// Slow-start ramp duration in milliseconds; 0 disables warmup.
    pub slowstart_ms: u64,
    /// Last health-state transition, in clock ticks since the process epoch.
    pub last_change: AtomicU64,
    /// Health-subsystem counters.
    pub counters: HealthCounters,
    /// Which layer feeds the observe-mode error counter, if any.
    pub observe: Option<ObserveMode>,
    /// Reaction once `consecutive_errors` hits `consecutive_errors_limit`.
    pub onerror: OnError,
    /// Threshold for the observe-mode reaction.
    pub consecutive_errors_limit: u32,
    /// Session-shutdown behaviour on DOWN.
    pub onmarkeddown: OnMarkedDown,
    /// Session-shutdown behaviour on UP.
    pub onmarkedup: OnMarkedUp,
    /// Other servers whose health mirrors this one (the tracker chain).
    trackers: Mutex<Vec<Weak<Backend>>>,
    /// Peak-EWMA latency tracker feeding the load-balancer selector.
    pub ewma: PeakEwma,
}

impl Backend {
    /// Create a new generic backend with default health-subsystem settings.
    pub fn new(id: BackendId, proxy_id: ProxyId, addr: SocketAddr) -> Self {
        Self {
            id,
            proxy_id,
            addr,
            check_addr: None,
            check_port: None,
            healthy: AtomicBool::new(true), // assume healthy initially
            state: Mutex::new(ServerStateFlags::RUNNING),
            uweight: AtomicU32::new(1),
            eweight: AtomicU32::new(1),
            slowstart_ms: 0,
            last_change: AtomicU64::new(0),
            counters: HealthCounters::default(),
            observe: None,
            onerror: OnError::FastInter,
            consecutive_errors_limit: 1,
            onmarkeddown: OnMarkedDown::empty(),
            onmarkedup: OnMarkedUp::empty(),
            trackers: Mutex::new(Vec::new()),
            ewma: PeakEwma::new(0.0, 0.5),
        }
    }

    /// The address a health check should connect to.
    pub fn check_target(&self) -> SocketAddr {
        let mut target = self.check_addr.unwrap_or(self.addr);
        if let Some(port) = self.check_port {
            target.set_port(port);
        }
        target
    }

    /// Check if the backend is marked healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Update the health status of the backend
    pub fn set_healthy(&self, is_healthy: bool) {
        self.healthy.store(is_healthy, Ordering::Release);
    }

    /// Snapshot the current runtime state flags.
    pub fn state(&self) -> ServerStateFlags {
        *self.state.lock().expect("server state lock poisoned")
    }

    /// Mutate the runtime state flags under the lock.
    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut ServerStateFlags) -> R) -> R {
        let mut guard = self.state.lock().expect("server state lock poisoned");
        f(&mut guard)
    }

    /// Whether this server is administratively forced out of the health state machine.
    pub fn is_maintain(&self) -> bool {
        self.state().contains(ServerStateFlags::MAINTAIN)
    }

    /// Register `tracker` as a server whose state should mirror this one's transitions.
    pub fn add_tracker(&self, tracker: Weak<Backend>) {
        self.trackers
            .lock()
            .expect("tracker list lock poisoned")
            .push(tracker);
    }

    /// Return the currently live trackers (dropping any that no longer exist).
    pub fn trackers(&self) -> Vec<Arc<Backend>> {
        let mut guard = self.trackers.lock().expect("tracker list lock poisoned");
        guard.retain(|w| w.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }
}

/// A thread-safe reference to a Backend.
pub type SharedBackend = Arc<Backend>;
