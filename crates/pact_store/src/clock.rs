//! Process-local HLC generator.
//!
//! Stamps are strictly increasing in `(millis, counter)` for the lifetime of
//! the clock, whatever the wall clock does. Remote stamps fed to
//! [`HlcClock::observe`] are folded in so the next local stamp dominates
//! everything this replica has seen. Stamps further ahead of the local
//! wall clock than the allowed drift are refused, so one bad peer cannot
//! drag the clock into the far future.

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;

use pact_proto::Hlc;

type WallClock = Box<dyn Fn() -> u64 + Send + Sync>;

/// How far ahead of the local wall clock a remote stamp may run.
pub const DEFAULT_MAX_DRIFT_MS: u64 = 60 * 60 * 1000;

/// Stamps are stored in a signed 64-bit column.
const MAX_MILLIS: u64 = i64::MAX as u64;

pub struct HlcClock {
    node: u32,
    last: Mutex<Hlc>,
    wall: WallClock,
    max_drift_ms: u64,
}

impl HlcClock {
    /// System wall clock with a random tiebreaker.
    pub fn new() -> Self {
        Self::with_wall_clock(rand::thread_rng().gen(), || Utc::now().timestamp_millis().max(0) as u64)
    }

    pub fn with_wall_clock(node: u32, wall: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            node,
            last: Mutex::new(Hlc::ZERO),
            wall: Box::new(wall),
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
        }
    }

    pub fn with_max_drift(mut self, max_drift_ms: u64) -> Self {
        self.max_drift_ms = max_drift_ms;
        self
    }

    pub fn node(&self) -> u32 {
        self.node
    }

    pub fn now(&self) -> Hlc {
        let wall = (self.wall)();
        let mut last = self.last.lock();
        let next = if wall > last.millis {
            Hlc::new(wall, 0, self.node)
        } else {
            match last.counter.checked_add(1) {
                Some(counter) => Hlc::new(last.millis, counter, self.node),
                // Observed stamps are capped at MAX_MILLIS, so this never saturates
                None => Hlc::new(last.millis.saturating_add(1), 0, self.node),
            }
        };
        *last = next;
        next
    }

    /// Whether a remote stamp is within the allowed drift of the wall clock.
    pub fn admits(&self, remote: &Hlc) -> bool {
        let limit = (self.wall)().saturating_add(self.max_drift_ms).min(MAX_MILLIS);
        remote.millis <= limit
    }

    /// Fold in a remote stamp. Returns false, leaving the clock untouched,
    /// when the stamp is not [admitted](Self::admits).
    pub fn observe(&self, remote: &Hlc) -> bool {
        if !self.admits(remote) {
            return false;
        }
        let mut last = self.last.lock();
        if remote.is_after(&last) {
            last.millis = remote.millis;
            last.counter = remote.counter;
        }
        true
    }
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::new()
    }
}
