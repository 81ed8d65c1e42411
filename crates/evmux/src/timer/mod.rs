//! Timer queue backed by a single timerfd.
//!
//! All pending timers live in one ordered map keyed by `(expiry, id)`; the
//! timerfd is kept armed to the earliest pending expiry. When it fires, its
//! channel's read callback extracts everything due, runs the callbacks in
//! expiry order, reinserts live repeaters, and re-arms.
//!
//! `add` and `cancel` may be called from any thread; both post the real work
//! to the owning loop, so the map itself is only ever touched on the loop
//! thread. Cancellation issued while the callback batch is running (including
//! a timer cancelling itself) is deferred to a `cancelled_soon` list that is
//! honored before repeaters are re-armed.

mod entry;

pub use entry::TimerId;
pub(crate) use entry::{TimerCallback, TimerEntry};

use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use evmux_core::{elog_error, elog_syserr, elog_trace, elog_warn, Timestamp};

use crate::channel::Channel;
use crate::error::{last_errno, Error, Result};
use crate::event_loop::EventLoop;

/// Floor applied when arming a timer whose expiry has already passed at add
/// time, so it still fires on the next loop iteration.
const MIN_ARM_DELAY: Duration = Duration::from_micros(100);

/// Map key: expiry order, identity tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    when: Timestamp,
    id: TimerId,
}

struct TimerState {
    timers: BTreeMap<TimerKey, TimerEntry>,
    /// id -> current expiry, so `cancel` can find the map key from the
    /// opaque token. Entries for timers that are mid-dispatch stay here
    /// until the re-arm decision is made.
    index: HashMap<TimerId, Timestamp>,
    /// Cancellations issued while the callback batch was running.
    cancelled_soon: Vec<TimerId>,
    /// True while the expiry handler is invoking callbacks.
    handling: bool,
}

pub(crate) struct TimerQueue {
    timer_fd: RawFd,
    channel: Mutex<Option<Channel>>,
    state: Mutex<TimerState>,
}

impl TimerQueue {
    pub(crate) fn new() -> Result<TimerQueue> {
        let timer_fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_REALTIME,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if timer_fd < 0 {
            return Err(Error::TimerFdCreate(last_errno()));
        }
        Ok(TimerQueue {
            timer_fd,
            channel: Mutex::new(None),
            state: Mutex::new(TimerState {
                timers: BTreeMap::new(),
                index: HashMap::new(),
                cancelled_soon: Vec::new(),
                handling: false,
            }),
        })
    }

    /// Register the timerfd's channel with the owning loop. Called once
    /// during loop construction, on the loop thread.
    pub(crate) fn install(&self, owner: &std::sync::Arc<EventLoop>) {
        let channel = Channel::new(owner, self.timer_fd);
        let weak = std::sync::Arc::downgrade(owner);
        channel.set_read_callback(move |_| {
            if let Some(lp) = weak.upgrade() {
                lp.timers.handle_expired(&lp);
            }
        });
        channel.enable_reading();
        *self.channel.lock().unwrap() = Some(channel);
    }

    /// Schedule `callback` at `when`, repeating every `interval` if the
    /// interval is non-zero. Safe to call from any thread; the id is handed
    /// back before the insertion lands on the loop.
    pub(crate) fn add(
        &self,
        owner: &EventLoop,
        when: Timestamp,
        interval: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        let entry = TimerEntry::new(when, interval, callback);
        let id = entry.id();
        let weak = owner.weak_self().clone();
        owner.run(move || {
            if let Some(lp) = weak.upgrade() {
                lp.timers.add_in_loop(entry);
            }
        });
        id
    }

    /// Best-effort cancellation from any thread. A callback already running
    /// when this lands completes; a repeating timer cancelled from inside
    /// its own callback is not re-armed.
    pub(crate) fn cancel(&self, owner: &EventLoop, id: TimerId) {
        let weak = owner.weak_self().clone();
        owner.run(move || {
            if let Some(lp) = weak.upgrade() {
                lp.timers.cancel_in_loop(id);
            }
        });
    }

    fn add_in_loop(&self, entry: TimerEntry) {
        let when = entry.when();
        let id = entry.id();
        let earliest_changed = {
            let mut state = self.state.lock().unwrap();
            let earliest_changed = match state.timers.keys().next() {
                None => true,
                Some(first) => when < first.when,
            };
            state.index.insert(id, when);
            state.timers.insert(TimerKey { when, id }, entry);
            earliest_changed
        };
        if earliest_changed {
            self.arm_floored(when);
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        let mut state = self.state.lock().unwrap();
        let Some(&when) = state.index.get(&id) else {
            return;
        };
        if state.handling {
            // Deciding now would either invalidate the batch being
            // dispatched or race the repeater re-arm; defer.
            state.cancelled_soon.push(id);
        } else {
            state.timers.remove(&TimerKey { when, id });
            state.index.remove(&id);
        }
    }

    /// Read callback of the timerfd channel.
    fn handle_expired(&self, owner: &EventLoop) {
        owner.assert_in_loop_thread();
        self.drain_timer_fd();
        let now = Timestamp::now();

        let mut due = {
            let mut state = self.state.lock().unwrap();
            let pending = state.timers.split_off(&TimerKey {
                when: now,
                id: TimerId::MAX,
            });
            let due_map = std::mem::replace(&mut state.timers, pending);
            state.handling = true;
            due_map.into_values().collect::<Vec<_>>()
        };

        // The state lock is released while user callbacks run: a callback
        // may add or cancel timers, which re-enters this queue on the same
        // thread through the synchronous `run` path.
        for timer in &mut due {
            timer.run();
        }

        let mut state = self.state.lock().unwrap();
        state.handling = false;
        self.reschedule(&mut state, due, now);
    }

    fn reschedule(
        &self,
        state: &mut TimerState,
        fired: Vec<TimerEntry>,
        now: Timestamp,
    ) {
        // Repeaters go back in unless cancelled mid-dispatch; everything
        // else leaves the id index.
        for mut timer in fired {
            let id = timer.id();
            if timer.repeats() && !state.cancelled_soon.contains(&id) {
                let when = now + timer.interval();
                timer.set_when(when);
                state.index.insert(id, when);
                state.timers.insert(TimerKey { when, id }, timer);
            } else {
                state.index.remove(&id);
            }
        }

        // Deferred cancellations of timers that were still pending.
        let cancelled: Vec<TimerId> = state.cancelled_soon.drain(..).collect();
        for id in cancelled {
            if let Some(when) = state.index.remove(&id) {
                state.timers.remove(&TimerKey { when, id });
            }
        }

        // Re-arm to the new earliest expiry. If that expiry already passed
        // (clock jump, long callback batch), the timer missed its slot:
        // drop it, or push a repeater one interval out, and try the next.
        loop {
            let Some((&key, _)) = state.timers.iter().next() else {
                break;
            };
            if self.arm(key.when).is_ok() {
                break;
            }
            elog_warn!(
                "timer id = {} expiry {} already passed, dropping",
                key.id.raw(),
                key.when
            );
            let Some(mut timer) = state.timers.remove(&key) else {
                break;
            };
            state.index.remove(&key.id);
            if timer.repeats() {
                let when = Timestamp::now() + timer.interval();
                let id = timer.id();
                timer.set_when(when);
                state.index.insert(id, when);
                state.timers.insert(TimerKey { when, id }, timer);
            }
        }
    }

    fn drain_timer_fd(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timer_fd,
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n == std::mem::size_of::<u64>() as isize {
            elog_trace!("timerfd fired, expirations = {}", count);
        } else {
            elog_error!("timerfd read returned {} bytes instead of 8", n);
        }
    }

    /// Arm the timerfd for `when`. Fails if `when` is not in the future.
    fn arm(&self, when: Timestamp) -> std::result::Result<(), ()> {
        let delta = Timestamp::now().micros_until(when);
        if delta <= 0 {
            return Err(());
        }
        self.settime(delta as u64);
        Ok(())
    }

    /// Arm the timerfd for `when`, clamping to a small positive delay if
    /// the expiry already passed.
    fn arm_floored(&self, when: Timestamp) {
        let delta = Timestamp::now()
            .micros_until(when)
            .max(MIN_ARM_DELAY.as_micros() as i64);
        self.settime(delta as u64);
    }

    fn settime(&self, delta_micros: u64) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (delta_micros / 1_000_000) as libc::time_t,
                tv_nsec: ((delta_micros % 1_000_000) * 1_000) as libc::c_long,
            },
        };
        let rc = unsafe { libc::timerfd_settime(self.timer_fd, 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            elog_syserr!("timerfd_settime fd = {}", self.timer_fd);
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.state.lock().unwrap().timers.len()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_thread::LoopThread;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[test]
    fn test_one_shot_fires_once_in_window() {
        let mut thread = LoopThread::new(None, "timer-test");
        let lp = thread.start();

        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        lp.run_after(Duration::from_millis(50), move || {
            let _ = tx.send(started.elapsed());
        });

        let elapsed = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("timer never fired");
        assert!(elapsed >= Duration::from_millis(45), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(200), "fired late: {:?}", elapsed);

        // One-shot: no second firing.
        assert!(rx.recv_timeout(Duration::from_millis(120)).is_err());
    }

    #[test]
    fn test_timers_fire_in_expiry_order() {
        let mut thread = LoopThread::new(None, "timer-order");
        let lp = thread.start();

        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        for (label, delay_ms) in [("c", 60u64), ("a", 20), ("b", 40)] {
            let order = order.clone();
            let tx = tx.clone();
            lp.run_after(Duration::from_millis(delay_ms), move || {
                order.lock().unwrap().push(label);
                let _ = tx.send(());
            });
        }
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(2)).expect("missing firing");
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cancel_before_fire() {
        let mut thread = LoopThread::new(None, "timer-cancel");
        let lp = thread.start();

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let id = lp.run_after(Duration::from_millis(80), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        lp.cancel(id);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(lp.timers.pending_count(), 0);
    }

    #[test]
    fn test_repeating_cancelled_from_own_callback() {
        let mut thread = LoopThread::new(None, "timer-self-cancel");
        let lp = thread.start();

        let count = Arc::new(AtomicU32::new(0));
        let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

        let c = count.clone();
        let slot = id_slot.clone();
        let loop_for_cancel = lp.clone();
        let id = lp.run_every(Duration::from_millis(10), move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                let id = slot.lock().unwrap().expect("id published before first fire");
                loop_for_cancel.cancel(id);
            }
        });
        *id_slot.lock().unwrap() = Some(id);

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(lp.timers.pending_count(), 0);
    }

    #[test]
    fn test_repeating_fires_repeatedly() {
        let mut thread = LoopThread::new(None, "timer-repeat");
        let lp = thread.start();

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let id = lp.run_every(Duration::from_millis(15), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(200));
        lp.cancel(id);
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several firings, saw {}", seen);

        let after_cancel = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert!(count.load(Ordering::SeqCst) <= after_cancel + 1);
    }

    #[test]
    fn test_past_expiry_fires_immediately_once() {
        let mut thread = LoopThread::new(None, "timer-past");
        let lp = thread.start();

        let (tx, rx) = mpsc::channel();
        let past = Timestamp::from_micros(Timestamp::now().micros() - 1_000_000);
        lp.run_at(past, move || {
            let _ = tx.send(());
        });

        rx.recv_timeout(Duration::from_millis(500))
            .expect("past-expiry timer never fired");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(lp.timers.pending_count(), 0);
    }

    #[test]
    fn test_cancel_unknown_id_is_noop() {
        let mut thread = LoopThread::new(None, "timer-unknown");
        let lp = thread.start();

        lp.cancel(TimerId::next());
        let (tx, rx) = mpsc::channel();
        lp.run_after(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(2)).expect("timer lost");
    }
}
