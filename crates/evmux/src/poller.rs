//! epoll wrapper and the fd → channel table.
//!
//! The poller owns the epoll instance and an ordered map from fd to the
//! channel registered for it. The map entry is a weak reference: channels
//! are owned by external collaborators, never by the loop. The epoll payload
//! carries the fd, and readiness resolution goes back through the table.
//!
//! Every method here runs on the owning loop's thread; the `EventLoop`
//! asserts that before forwarding.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::Weak;

use evmux_core::{elog_error, elog_syserr, elog_sysfatal, elog_trace, elog_warn, Timestamp};

use crate::channel::{Channel, ChannelInner, ChannelState};
use crate::error::{last_errno, Error, Result};

/// Initial ready-event buffer size; doubled whenever a poll fills it.
const INIT_EVENT_LIST_SIZE: usize = 16;

const OP_ADD: i32 = libc::EPOLL_CTL_ADD;
const OP_MOD: i32 = libc::EPOLL_CTL_MOD;
const OP_DEL: i32 = libc::EPOLL_CTL_DEL;

fn operation_string(op: i32) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "???",
    }
}

pub(crate) struct Poller {
    epoll_fd: RawFd,
    channels: BTreeMap<RawFd, Weak<ChannelInner>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> Result<Poller> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::EpollCreate(last_errno()));
        }
        Ok(Poller {
            epoll_fd,
            channels: BTreeMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
        })
    }

    /// Wait for readiness, at most `timeout_ms`. Ready channels are appended
    /// to `active` with their ready sets pre-populated. Returns the time
    /// right after the wait ended.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp {
        elog_trace!("polling {} registered fds", self.channels.len());
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        let errno = last_errno();
        let now = Timestamp::now();

        if n > 0 {
            elog_trace!("{} events ready", n);
            self.fill_active(n as usize, active);
            if n as usize == self.events.len() {
                let doubled = self.events.len() * 2;
                self.events
                    .resize(doubled, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if n == 0 {
            elog_trace!("nothing ready");
        } else if errno != libc::EINTR {
            elog_error!("epoll_wait on fd = {}: errno {}", self.epoll_fd, errno);
        }
        now
    }

    fn fill_active(&self, n: usize, active: &mut Vec<Channel>) {
        for event in &self.events[..n] {
            let fd = event.u64 as RawFd;
            let Some(weak) = self.channels.get(&fd) else {
                elog_warn!("epoll reported fd = {} with no table entry", fd);
                continue;
            };
            let Some(inner) = weak.upgrade() else {
                elog_warn!("epoll reported fd = {} whose channel is gone", fd);
                continue;
            };
            let channel = Channel::from_inner(inner);
            channel.set_ready(event.events);
            active.push(channel);
        }
    }

    /// Reconcile the channel's interest with the kernel and the fd table.
    pub(crate) fn update_channel(&mut self, channel: &Channel) {
        let state = channel.state();
        elog_trace!("update {{{}}} state = {:?}", channel.interest_string(), state);
        match state {
            ChannelState::New | ChannelState::Deleted => {
                if state == ChannelState::New {
                    self.channels.insert(channel.fd(), channel.downgrade());
                }
                // A Deleted channel is still in the table; both re-arm.
                channel.set_state(ChannelState::Added);
                self.ctl(OP_ADD, channel);
            }
            ChannelState::Added => {
                if channel.is_none_event() {
                    self.ctl(OP_DEL, channel);
                    channel.set_state(ChannelState::Deleted);
                } else {
                    self.ctl(OP_MOD, channel);
                }
            }
        }
    }

    /// Drop the channel from the table (and the kernel if still armed).
    pub(crate) fn remove_channel(&mut self, channel: &Channel) {
        elog_trace!("remove fd = {}", channel.fd());
        self.channels.remove(&channel.fd());
        if channel.state() == ChannelState::Added {
            self.ctl(OP_DEL, channel);
        }
        channel.set_state(ChannelState::New);
    }

    /// True iff the table maps the channel's fd to exactly this channel.
    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(weak) => channel.same_channel(weak),
            None => false,
        }
    }

    fn ctl(&self, op: i32, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.interest(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) } < 0 {
            if op == OP_DEL {
                // The fd was likely closed already; nothing left to unhook.
                elog_syserr!("epoll_ctl op = DEL fd = {}", fd);
            } else {
                elog_sysfatal!("epoll_ctl op = {} fd = {}", operation_string(op), fd);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::event_loop::EventLoop;

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close_pipe(fds: (RawFd, RawFd)) {
        unsafe {
            libc::close(fds.0);
            libc::close(fds.1);
        }
    }

    fn write_byte(fd: RawFd) {
        let byte = [1u8];
        let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    #[test]
    fn test_registration_state_machine() {
        let lp = EventLoop::new().unwrap();
        let fds = make_pipe();
        let ch = Channel::new(&lp, fds.0);

        assert_eq!(ch.state(), ChannelState::New);
        assert!(!lp.has_channel(&ch));

        ch.enable_reading();
        assert_eq!(ch.state(), ChannelState::Added);
        assert!(lp.has_channel(&ch));

        // Empty interest leaves the kernel but stays in the table.
        ch.disable_all();
        assert_eq!(ch.state(), ChannelState::Deleted);
        assert!(lp.has_channel(&ch));

        // Re-arming goes straight back to Added.
        ch.enable_reading();
        assert_eq!(ch.state(), ChannelState::Added);

        ch.disable_all();
        ch.remove();
        assert_eq!(ch.state(), ChannelState::New);
        assert!(!lp.has_channel(&ch));

        close_pipe(fds);
    }

    #[test]
    fn test_has_channel_checks_identity_not_just_fd() {
        let lp = EventLoop::new().unwrap();
        let fds = make_pipe();
        let first = Channel::new(&lp, fds.0);
        let second = Channel::new(&lp, fds.0);

        first.enable_reading();
        assert!(lp.has_channel(&first));
        assert!(!lp.has_channel(&second));

        first.disable_all();
        first.remove();
        close_pipe(fds);
    }

    #[test]
    fn test_poll_reports_readable_channel() {
        let lp = EventLoop::new().unwrap();
        let fds = make_pipe();
        let ch = Channel::new(&lp, fds.0);
        ch.enable_reading();

        write_byte(fds.1);

        let mut active = Vec::new();
        let now = lp.poller.lock().unwrap().poll(100, &mut active);
        assert!(now.is_valid());
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].fd(), fds.0);
        assert!(active[0].ready() & libc::EPOLLIN as u32 != 0);

        ch.disable_all();
        ch.remove();
        close_pipe(fds);
    }

    #[test]
    fn test_poll_timeout_reports_nothing() {
        let lp = EventLoop::new().unwrap();
        let fds = make_pipe();
        let ch = Channel::new(&lp, fds.0);
        ch.enable_reading();

        let mut active = Vec::new();
        lp.poller.lock().unwrap().poll(0, &mut active);
        assert!(active.is_empty());

        ch.disable_all();
        ch.remove();
        close_pipe(fds);
    }

    #[test]
    fn test_event_buffer_doubles_when_saturated() {
        let lp = EventLoop::new().unwrap();
        let mut pipes = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..INIT_EVENT_LIST_SIZE + 4 {
            let fds = make_pipe();
            let ch = Channel::new(&lp, fds.0);
            ch.enable_reading();
            write_byte(fds.1);
            pipes.push(fds);
            channels.push(ch);
        }

        // First poll can only report a full buffer's worth and must grow it.
        let mut active = Vec::new();
        lp.poller.lock().unwrap().poll(100, &mut active);
        assert_eq!(active.len(), INIT_EVENT_LIST_SIZE);
        assert_eq!(
            lp.poller.lock().unwrap().events.len(),
            INIT_EVENT_LIST_SIZE * 2
        );

        // Level-triggered: the next poll has room for everything.
        active.clear();
        lp.poller.lock().unwrap().poll(100, &mut active);
        assert_eq!(active.len(), INIT_EVENT_LIST_SIZE + 4);

        for ch in &channels {
            ch.disable_all();
            ch.remove();
        }
        for fds in pipes {
            close_pipe(fds);
        }
    }

    #[test]
    fn test_operation_string() {
        assert_eq!(operation_string(OP_ADD), "ADD");
        assert_eq!(operation_string(OP_MOD), "MOD");
        assert_eq!(operation_string(OP_DEL), "DEL");
    }
}
