//! Timer identity and entry types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use evmux_core::Timestamp;

/// Opaque timer token, safe to copy across threads and hand back to
/// `cancel` at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl TimerId {
    /// Upper bound used as a range sentinel; the generator never hands it out.
    pub(crate) const MAX: TimerId = TimerId(u64::MAX);

    /// Generate the next unique id.
    #[inline]
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

/// One scheduled timer, owned by the queue once posted to the loop.
pub(crate) struct TimerEntry {
    id: TimerId,
    when: Timestamp,
    interval: Duration,
    callback: TimerCallback,
}

impl TimerEntry {
    pub(crate) fn new(when: Timestamp, interval: Duration, callback: TimerCallback) -> Self {
        TimerEntry {
            id: TimerId::next(),
            when,
            interval,
            callback,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> TimerId {
        self.id
    }

    #[inline]
    pub(crate) fn when(&self) -> Timestamp {
        self.when
    }

    #[inline]
    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// A zero interval means one-shot.
    #[inline]
    pub(crate) fn repeats(&self) -> bool {
        !self.interval.is_zero()
    }

    pub(crate) fn set_when(&mut self, when: Timestamp) {
        self.when = when;
    }

    pub(crate) fn run(&mut self) {
        (self.callback)();
    }
}
