//! Boot/fanout staggering (spec.md §4.8): spread the fleet's first probe
//! rounds out over one interval instead of firing them all at once.

use crate::clock::Clock;
use crate::task::CheckTask;

/// A check counted by [`Fanout`] for staggering, carrying just enough to
/// compute its first-fire offset.
#[derive(Debug, Clone, Copy)]
pub struct FanoutEntry {
    /// The check's configured `inter`, in milliseconds.
    pub inter_ms: u64,
}

/// The minimum interval considered "slow enough to matter" for fanout —
/// checks faster than this fire on their own cadence and don't skew the
/// stagger (spec.md §4.8, "e.g. 1s").
pub const FANOUT_THRESHOLD_MS: u64 = 1_000;

/// Compute, for each entry in enumeration order, the millisecond offset from
/// now its task's first expiry should be armed at: `min_interval * i / n`
/// where `min_interval` is the smallest `inter_ms` at or above
/// [`FANOUT_THRESHOLD_MS`] among all entries (or `None` if none qualify, in
/// which case every check just fires immediately). `max_spread_checks_ms`
/// is `global.max_spread_checks`: when nonzero, it caps `min_interval`
/// before the stagger is computed, matching `checks.c`'s `mininter` cap at
/// boot (a value of 0 means no cap, same as the HAProxy default).
pub fn stagger_offsets(entries: &[FanoutEntry], max_spread_checks_ms: u64) -> Vec<u64> {
    let n = entries.len() as u64;
    if n == 0 {
        return Vec::new();
    }

    let min_interval = entries
        .iter()
        .map(|e| e.inter_ms)
        .filter(|&ms| ms >= FANOUT_THRESHOLD_MS)
        .min();

    let min_interval = if max_spread_checks_ms > 0 {
        min_interval.map(|mi| std::cmp::min(mi, max_spread_checks_ms))
    } else {
        min_interval
    };

    match min_interval {
        Some(min_interval) => (0..n).map(|i| min_interval * i / n).collect(),
        None => vec![0; entries.len()],
    }
}

/// Arm `task`'s first expiry per [`stagger_offsets`], given its position `i`
/// among `n` total checks and the fleet's chosen `min_interval_ms`.
pub fn arm_first_expiry(task: &CheckTask, offset_ms: u64) {
    task.set_expire(Clock::now().add_millis(offset_ms));
}

/// Arm the whole fleet's first expiries at once, matching `entries`
/// positionally with `tasks`.
pub fn fanout(entries: &[FanoutEntry], tasks: &[std::sync::Arc<CheckTask>], max_spread_checks_ms: u64) {
    debug_assert_eq!(entries.len(), tasks.len());
    let offsets = stagger_offsets(entries, max_spread_checks_ms);
    for (task, offset) in tasks.iter().zip(offsets) {
        arm_first_expiry(task, offset);
    }
}
