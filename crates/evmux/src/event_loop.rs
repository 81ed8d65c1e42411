//! Per-thread event loop.
//!
//! One `EventLoop` per OS thread, enforced through a thread-local slot. The
//! loop owns its poller, its timer queue, and an eventfd wakeup channel, and
//! everything that mutates them runs on the owning thread: other threads get
//! in only through `run` / `queue_task` (and the timer entry points built on
//! them), which enqueue work and poke the eventfd.
//!
//! Each iteration blocks in the poller (bounded by `POLL_TIMEOUT_MS` or the
//! earliest timer, whichever comes first), dispatches ready channels, then
//! drains the pending-task queue.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::time::Duration;

use evmux_core::elog::{self, LogLevel};
use evmux_core::{elog_debug, elog_error, elog_fatal, elog_trace, tid, Timestamp};

use crate::channel::Channel;
use crate::error::{last_errno, Error, Result};
use crate::poller::Poller;
use crate::timer::{TimerId, TimerQueue};

/// Upper bound on one poller wait; timers and wakeups cut it short.
const POLL_TIMEOUT_MS: i32 = 10_000;

/// A unit of deferred work posted to a loop.
pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    /// The loop constructed on this thread, if any.
    static CURRENT_LOOP: std::cell::RefCell<Weak<EventLoop>> =
        const { std::cell::RefCell::new(Weak::new()) };
}

/// Writing to a peer-closed socket must surface as an error return, not a
/// process kill; done once, before any loop can dispatch socket callbacks.
fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

fn create_eventfd() -> Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::EventFdCreate(last_errno()));
    }
    Ok(fd)
}

pub struct EventLoop {
    weak_self: Weak<EventLoop>,
    tid: libc::pid_t,
    looping: AtomicBool,
    quit: AtomicBool,
    /// True while ready channels are being dispatched.
    handling_events: AtomicBool,
    /// True while the pending-task queue is being drained.
    running_queued: AtomicBool,
    loop_count: AtomicU64,
    poll_return: AtomicI64,
    wakeup_fd: RawFd,
    pub(crate) poller: Mutex<Poller>,
    pub(crate) timers: TimerQueue,
    tasks: Mutex<Vec<Task>>,
    wakeup_channel: Mutex<Option<Channel>>,
}

impl EventLoop {
    /// Build a loop bound to the calling thread. Constructing a second loop
    /// on the same thread is a programmer error and aborts.
    pub fn new() -> Result<Arc<EventLoop>> {
        ignore_sigpipe();
        CURRENT_LOOP.with(|slot| {
            if slot.borrow().upgrade().is_some() {
                elog_fatal!("another EventLoop already exists in thread {}", tid());
            }
        });

        let poller = Poller::new()?;
        let timers = TimerQueue::new()?;
        let wakeup_fd = create_eventfd()?;

        let lp = Arc::new_cyclic(|weak| EventLoop {
            weak_self: weak.clone(),
            tid: tid(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            handling_events: AtomicBool::new(false),
            running_queued: AtomicBool::new(false),
            loop_count: AtomicU64::new(0),
            poll_return: AtomicI64::new(0),
            wakeup_fd,
            poller: Mutex::new(poller),
            timers,
            tasks: Mutex::new(Vec::new()),
            wakeup_channel: Mutex::new(None),
        });

        CURRENT_LOOP.with(|slot| *slot.borrow_mut() = Arc::downgrade(&lp));

        let wakeup = Channel::new(&lp, wakeup_fd);
        let weak = lp.weak_self.clone();
        wakeup.set_read_callback(move |_| {
            if let Some(lp) = weak.upgrade() {
                lp.drain_wakeup();
            }
        });
        wakeup.enable_reading();
        *lp.wakeup_channel.lock().unwrap() = Some(wakeup);

        lp.timers.install(&lp);

        elog_debug!(
            "EventLoop {:p} created in thread {}",
            Arc::as_ptr(&lp),
            lp.tid
        );
        Ok(lp)
    }

    /// The loop constructed on the calling thread, if any.
    pub fn of_this_thread() -> Option<Arc<EventLoop>> {
        CURRENT_LOOP.with(|slot| slot.borrow().upgrade())
    }

    /// Run until `quit`. Must be called on the owning thread.
    pub fn run_loop(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        elog_trace!("EventLoop {:p} start looping", self);

        let mut active: Vec<Channel> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let now = self
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIMEOUT_MS, &mut active);
            self.poll_return.store(now.micros(), Ordering::Release);
            self.loop_count.fetch_add(1, Ordering::Relaxed);

            if elog::enabled(LogLevel::Trace) {
                for channel in &active {
                    elog_trace!("{{{}}}", channel.ready_string());
                }
            }

            self.handling_events.store(true, Ordering::Release);
            for channel in &active {
                channel.handle_event(now);
            }
            self.handling_events.store(false, Ordering::Release);

            self.run_queued_tasks();
        }

        elog_trace!("EventLoop {:p} stop looping", self);
        self.looping.store(false, Ordering::Release);
    }

    /// Stop the loop after its current iteration. Callable from any thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the owning thread: immediately when already there,
    /// otherwise through the pending queue.
    pub fn run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.in_loop_thread() {
            task();
        } else {
            self.queue_task(task);
        }
    }

    /// Enqueue `task` for the owning thread's next drain, even when called
    /// from that thread.
    pub fn queue_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(Box::new(task));
        }
        // A mid-drain submission would otherwise sit until the next poll
        // times out or some fd turns ready.
        if !self.in_loop_thread() || self.running_queued.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Number of tasks waiting in the pending queue.
    pub fn queued_task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Run `callback` at `when`. Callable from any thread.
    pub fn run_at<F>(&self, when: Timestamp, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timers
            .add(self, when, Duration::ZERO, Box::new(callback))
    }

    /// Run `callback` once, `delay` from now. Callable from any thread.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Timestamp::now() + delay, callback)
    }

    /// Run `callback` every `interval`, first firing one interval from now.
    /// Callable from any thread.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timers
            .add(self, Timestamp::now() + interval, interval, Box::new(callback))
    }

    /// Best-effort timer cancellation. Callable from any thread.
    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(self, id);
    }

    /// Break the loop out of its poller wait.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            elog_error!("wakeup write returned {} bytes instead of 8", n);
        }
    }

    pub fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().has_channel(channel)
    }

    #[inline]
    pub fn in_loop_thread(&self) -> bool {
        self.tid == tid()
    }

    /// Abort on wrong-thread access; every loop-affine mutator goes through
    /// here first.
    pub fn assert_in_loop_thread(&self) {
        if !self.in_loop_thread() {
            elog_fatal!(
                "EventLoop {:p} was created in thread {} but accessed from thread {}",
                self,
                self.tid,
                tid()
            );
        }
    }

    /// True while ready-channel callbacks are running.
    #[inline]
    pub fn is_handling_events(&self) -> bool {
        self.handling_events.load(Ordering::Acquire)
    }

    /// Kernel thread id of the owning thread.
    #[inline]
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    /// Time the poller last returned.
    #[inline]
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::from_micros(self.poll_return.load(Ordering::Acquire))
    }

    /// Total loop iterations so far.
    #[inline]
    pub fn loop_count(&self) -> u64 {
        self.loop_count.load(Ordering::Relaxed)
    }

    pub(crate) fn weak_self(&self) -> &Weak<EventLoop> {
        &self.weak_self
    }

    fn drain_wakeup(&self) {
        let mut one: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd,
                &mut one as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            elog_error!("wakeup read returned {} bytes instead of 8", n);
        }
    }

    fn run_queued_tasks(&self) {
        self.running_queued.store(true, Ordering::Release);

        let mut tasks = Vec::new();
        {
            let mut queued = self.tasks.lock().unwrap();
            std::mem::swap(&mut *queued, &mut tasks);
        }
        // The swap keeps the lock out of user code: tasks may queue further
        // tasks, which land in the fresh vector and run next iteration.
        for task in tasks {
            task();
        }

        self.running_queued.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        elog_debug!(
            "EventLoop {:p} of thread {} destructs in thread {}",
            self,
            self.tid,
            tid()
        );
        unsafe {
            libc::close(self.wakeup_fd);
        }
        if tid() == self.tid {
            CURRENT_LOOP.with(|slot| *slot.borrow_mut() = Weak::new());
        }
    }
}
