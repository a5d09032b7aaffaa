//! Monotonic millisecond clock and tick comparator.
//!
//! Mirrors HAProxy's `now_ms` / `tick_is_expired` pair: a single process-wide
//! monotonic epoch, and a lightweight integer "tick" derived from it so that
//! expiry comparisons never touch the OS clock directly.

use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// A point in time, expressed in milliseconds since the process epoch.
///
/// [`Tick::ETERNITY`] is a sentinel meaning "never expires" — it is always
/// ordered after every real tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(u64);

impl Tick {
    /// A tick that is never considered expired.
    pub const ETERNITY: Tick = Tick(u64::MAX);

    /// A tick that is always already expired.
    pub const ZERO: Tick = Tick(0);

    /// Build a tick from a raw millisecond count.
    pub const fn from_millis(ms: u64) -> Self {
        Tick(ms)
    }

    /// The raw millisecond count, or `u64::MAX` for [`Tick::ETERNITY`].
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Whether this tick is the eternity sentinel.
    pub const fn is_eternity(self) -> bool {
        self.0 == u64::MAX
    }

    /// Whether `self` has expired relative to `now` (`self <= now`), treating
    /// [`Tick::ETERNITY`] as never expiring.
    pub const fn is_expired(self, now: Tick) -> bool {
        !self.is_eternity() && self.0 <= now.0
    }

    /// Add a millisecond offset, saturating at [`Tick::ETERNITY`].
    pub fn add_millis(self, ms: u64) -> Tick {
        if self.is_eternity() {
            return self;
        }
        Tick(self.0.saturating_add(ms))
    }
}

/// The process-wide monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
    /// The current tick.
    pub fn now() -> Tick {
        Tick(epoch().elapsed().as_millis() as u64)
    }

    /// Convert a tick back into a [`std::time::Instant`], for scheduling with
    /// `tokio::time::sleep_until`. Returns `None` for [`Tick::ETERNITY`].
    pub fn to_instant(tick: Tick) -> Option<Instant> {
        if tick.is_eternity() {
            return None;
        }
        Some(epoch() + std::time::Duration::from_millis(tick.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eternity_never_expires() {
        assert!(!Tick::ETERNITY.is_expired(Tick::from_millis(u64::MAX - 1)));
    }

    #[test]
    fn zero_is_always_expired() {
        assert!(Tick::ZERO.is_expired(Clock::now()));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let t = Tick::from_millis(100);
        assert!(t.is_expired(Tick::from_millis(100)));
        assert!(!t.is_expired(Tick::from_millis(99)));
    }

    #[test]
    fn add_millis_saturates_at_eternity() {
        assert_eq!(Tick::ETERNITY.add_millis(50), Tick::ETERNITY);
    }
}
