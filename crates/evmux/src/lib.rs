//! # evmux
//!
//! A Linux reactor core: many file descriptors multiplexed onto a small pool
//! of I/O threads.
//!
//! Each [`EventLoop`] is pinned to one OS thread and owns an epoll instance,
//! a timerfd-backed timer queue, and an eventfd wakeup channel. Descriptors
//! join a loop through a [`Channel`] carrying per-event callbacks; any thread
//! may inject work into any loop with [`EventLoop::run`] /
//! [`EventLoop::queue_task`] or schedule timers with
//! [`EventLoop::run_at`] / [`EventLoop::run_after`] / [`EventLoop::run_every`].
//! [`LoopThreadPool`] bootstraps N loops on N threads.
//!
//! ## Quick Start
//!
//! ```ignore
//! use evmux::{EventLoop, LoopThreadPool};
//! use std::time::Duration;
//!
//! let base = EventLoop::new()?;
//! let mut pool = LoopThreadPool::new(base.clone(), "io");
//! pool.set_thread_count(3);
//! pool.start(None);
//!
//! let worker = pool.next_loop();
//! worker.run_every(Duration::from_secs(1), || println!("tick"));
//!
//! base.run_loop();
//! ```
//!
//! ## Threading model
//!
//! Loops are single-threaded-cooperative inside: every channel, poller, and
//! timer mutation happens on the owning thread, and cross-thread callers are
//! funneled through the task queue. Wrong-thread access is a programmer
//! error and aborts.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod channel;
        pub mod error;
        pub mod event_loop;
        pub mod loop_thread;
        pub mod timer;

        mod poller;

        pub use channel::Channel;
        pub use error::{Error, Result};
        pub use event_loop::{EventLoop, Task};
        pub use loop_thread::{InitCallback, LoopThread, LoopThreadPool};
        pub use timer::TimerId;
    } else {
        compile_error!("evmux requires a Linux kernel (epoll, eventfd, timerfd)");
    }
}
