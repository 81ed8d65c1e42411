//! Cached kernel thread ids.
//!
//! The reactor pins every loop to the thread that built it and asserts that
//! affinity on each mutating call, so the thread id lookup sits on a hot
//! path. `gettid` is a syscall; the first call on each thread caches the
//! result in a thread-local.

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<libc::pid_t> = const { Cell::new(0) };
}

/// Kernel thread id of the calling thread.
#[inline]
pub fn tid() -> libc::pid_t {
    CACHED_TID.with(|cell| {
        let cached = cell.get();
        if cached != 0 {
            return cached;
        }
        let t = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
        cell.set(t);
        t
    })
}
