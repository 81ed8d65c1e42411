//! Reactor error types.
//!
//! Only construction can fail recoverably; everything after setup is either
//! absorbed (transient OS errors), downgraded with a warning (best-effort
//! operations), or fatal (programmer errors, which log and abort).

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// `epoll_create1` failed.
    EpollCreate(i32),
    /// `eventfd` failed.
    EventFdCreate(i32),
    /// `timerfd_create` failed.
    TimerFdCreate(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EpollCreate(e) => write!(f, "epoll_create1: errno {}", e),
            Self::EventFdCreate(e) => write!(f, "eventfd: errno {}", e),
            Self::TimerFdCreate(e) => write!(f, "timerfd_create: errno {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The calling thread's current errno.
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
