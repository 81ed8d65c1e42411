//! Per-descriptor event registration and callback dispatch.
//!
//! A `Channel` binds one file descriptor to a set of callbacks and tracks
//! what the owning loop's poller currently knows about it. The fd itself is
//! opened and closed by whoever owns the channel; the channel never closes
//! it.
//!
//! `Channel` is a cheap handle over shared inner state. The poller's
//! fd table holds weak references to the same inner state, so the table
//! never extends a channel's lifetime.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use evmux_core::{elog_fatal, elog_warn, Timestamp};

use crate::event_loop::EventLoop;

/// Readable interest: data, urgent data.
pub(crate) const EVENT_READ: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
/// Writable interest.
pub(crate) const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;
pub(crate) const EVENT_NONE: u32 = 0;

const EPOLL_IN: u32 = libc::EPOLLIN as u32;
const EPOLL_PRI: u32 = libc::EPOLLPRI as u32;
const EPOLL_OUT: u32 = libc::EPOLLOUT as u32;
const EPOLL_HUP: u32 = libc::EPOLLHUP as u32;
const EPOLL_RDHUP: u32 = libc::EPOLLRDHUP as u32;
const EPOLL_ERR: u32 = libc::EPOLLERR as u32;

/// Where the poller believes this channel stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ChannelState {
    /// Never registered, or explicitly removed from the loop.
    New = 0,
    /// In the fd table and armed in the kernel.
    Added = 1,
    /// In the fd table but disarmed in the kernel (empty interest).
    Deleted = 2,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ChannelState::Added,
            2 => ChannelState::Deleted,
            _ => ChannelState::New,
        }
    }
}

pub type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
pub type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

pub(crate) struct ChannelInner {
    fd: RawFd,
    owner: Weak<EventLoop>,
    /// Events registered with the kernel.
    interest: AtomicU32,
    /// Events the poller last reported ready.
    ready: AtomicU32,
    state: AtomicU8,
    log_hup: AtomicBool,
    tied: AtomicBool,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    callbacks: Mutex<Callbacks>,
}

/// Handle to one descriptor's registration in an event loop.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel for `fd` on `owner`'s loop. The fd stays owned by
    /// the caller.
    pub fn new(owner: &Arc<EventLoop>, fd: RawFd) -> Self {
        Channel {
            inner: Arc::new(ChannelInner {
                fd,
                owner: Arc::downgrade(owner),
                interest: AtomicU32::new(EVENT_NONE),
                ready: AtomicU32::new(EVENT_NONE),
                state: AtomicU8::new(ChannelState::New as u8),
                log_hup: AtomicBool::new(true),
                tied: AtomicBool::new(false),
                tie: Mutex::new(None),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// The loop this channel was created on. Outliving the loop is a
    /// programmer error.
    pub fn owner_loop(&self) -> Arc<EventLoop> {
        match self.inner.owner.upgrade() {
            Some(lp) => lp,
            None => elog_fatal!("channel fd = {} outlived its event loop", self.inner.fd),
        }
    }

    pub fn set_read_callback<F>(&self, callback: F)
    where
        F: FnMut(Timestamp) + Send + 'static,
    {
        self.inner.callbacks.lock().unwrap().read = Some(Box::new(callback));
    }

    pub fn set_write_callback<F>(&self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.callbacks.lock().unwrap().write = Some(Box::new(callback));
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.callbacks.lock().unwrap().close = Some(Box::new(callback));
    }

    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.callbacks.lock().unwrap().error = Some(Box::new(callback));
    }

    /// Tie dispatch to `owner`'s liveness: once every strong reference to
    /// `owner` is gone, `handle_event` becomes a no-op. Used by callers
    /// whose callbacks borrow from an object the loop does not own.
    pub fn tie<T>(&self, owner: &Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let erased: Arc<dyn Any + Send + Sync> = owner.clone();
        *self.inner.tie.lock().unwrap() = Some(Arc::downgrade(&erased));
        self.inner.tied.store(true, Ordering::Release);
    }

    /// Whether to log an EPOLLHUP without readable data (on by default).
    pub fn set_log_hup(&self, enabled: bool) {
        self.inner.log_hup.store(enabled, Ordering::Relaxed);
    }

    pub fn enable_reading(&self) {
        self.inner.interest.fetch_or(EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.inner.interest.fetch_and(!EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.inner.interest.fetch_or(EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.inner.interest.fetch_and(!EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(&self) {
        self.inner.interest.store(EVENT_NONE, Ordering::Release);
        self.update();
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest() & EVENT_READ != 0
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest() & EVENT_WRITE != 0
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.interest() == EVENT_NONE
    }

    /// Drop this channel from its loop entirely: the fd leaves both the
    /// kernel and the fd table, and the state returns to `New`.
    pub fn remove(&self) {
        self.owner_loop().remove_channel(self);
    }

    /// Dispatch the last-reported ready set to the callbacks.
    ///
    /// Close fires before read and error before read, so a callback tearing
    /// down the fd is never followed by a spurious readable dispatch; read
    /// fires before write to favor draining.
    pub fn handle_event(&self, timestamp: Timestamp) {
        let _guard;
        if self.inner.tied.load(Ordering::Acquire) {
            let tie = self.inner.tie.lock().unwrap().clone();
            match tie.and_then(|weak| weak.upgrade()) {
                Some(strong) => _guard = strong,
                None => return,
            }
        }
        self.handle_event_guarded(timestamp);
    }

    fn handle_event_guarded(&self, timestamp: Timestamp) {
        let ready = self.ready();
        if ready & EPOLL_HUP != 0 && ready & EPOLL_IN == 0 {
            if self.inner.log_hup.load(Ordering::Relaxed) {
                elog_warn!("fd = {} got EPOLLHUP with no data", self.inner.fd);
            }
            self.fire_close();
        }
        if ready & EPOLL_ERR != 0 {
            self.fire_error();
        }
        if ready & (EPOLL_IN | EPOLL_PRI | EPOLL_RDHUP) != 0 {
            self.fire_read(timestamp);
        }
        if ready & EPOLL_OUT != 0 {
            self.fire_write();
        }
    }

    // Each callback is taken out of its slot and invoked with no lock held,
    // so it may freely re-enter the channel (re-arm interest, replace
    // callbacks, remove itself). The slot is restored afterwards unless the
    // callback installed a replacement.
    fn fire_read(&self, timestamp: Timestamp) {
        let taken = self.inner.callbacks.lock().unwrap().read.take();
        if let Some(mut callback) = taken {
            callback(timestamp);
            let mut slots = self.inner.callbacks.lock().unwrap();
            if slots.read.is_none() {
                slots.read = Some(callback);
            }
        }
    }

    fn fire_write(&self) {
        let taken = self.inner.callbacks.lock().unwrap().write.take();
        if let Some(mut callback) = taken {
            callback();
            let mut slots = self.inner.callbacks.lock().unwrap();
            if slots.write.is_none() {
                slots.write = Some(callback);
            }
        }
    }

    fn fire_close(&self) {
        let taken = self.inner.callbacks.lock().unwrap().close.take();
        if let Some(mut callback) = taken {
            callback();
            let mut slots = self.inner.callbacks.lock().unwrap();
            if slots.close.is_none() {
                slots.close = Some(callback);
            }
        }
    }

    fn fire_error(&self) {
        let taken = self.inner.callbacks.lock().unwrap().error.take();
        if let Some(mut callback) = taken {
            callback();
            let mut slots = self.inner.callbacks.lock().unwrap();
            if slots.error.is_none() {
                slots.error = Some(callback);
            }
        }
    }

    fn update(&self) {
        self.owner_loop().update_channel(self);
    }

    #[inline]
    pub(crate) fn interest(&self) -> u32 {
        self.inner.interest.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn ready(&self) -> u32 {
        self.inner.ready.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_ready(&self, ready: u32) {
        self.inner.ready.store(ready, Ordering::Release);
    }

    #[inline]
    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ChannelState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Channel { inner }
    }

    pub(crate) fn same_channel(&self, weak: &Weak<ChannelInner>) -> bool {
        Weak::ptr_eq(&Arc::downgrade(&self.inner), weak)
    }

    /// Human-readable ready set, for trace logging.
    pub(crate) fn ready_string(&self) -> String {
        events_to_string(self.inner.fd, self.ready())
    }

    /// Human-readable interest set, for trace logging.
    pub(crate) fn interest_string(&self) -> String {
        events_to_string(self.inner.fd, self.interest())
    }
}

fn events_to_string(fd: RawFd, events: u32) -> String {
    let mut out = format!("{}:", fd);
    if events & EPOLL_IN != 0 {
        out.push_str(" IN");
    }
    if events & EPOLL_PRI != 0 {
        out.push_str(" PRI");
    }
    if events & EPOLL_OUT != 0 {
        out.push_str(" OUT");
    }
    if events & EPOLL_HUP != 0 {
        out.push_str(" HUP");
    }
    if events & EPOLL_RDHUP != 0 {
        out.push_str(" RDHUP");
    }
    if events & EPOLL_ERR != 0 {
        out.push_str(" ERR");
    }
    out
}
