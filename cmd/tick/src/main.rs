//! Minimal evmux walkthrough: a base loop, a two-thread pool, a periodic
//! timer on a worker, tasks injected across threads, and a timed shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evmux::{EventLoop, LoopThreadPool};
use evmux_core::elog_info;

fn main() {
    let base = EventLoop::new().expect("event loop setup failed");
    let mut pool = LoopThreadPool::new(base.clone(), "tick-io");
    pool.set_thread_count(2);
    pool.start(None);

    let worker = pool.next_loop();
    let ticks = Arc::new(AtomicU32::new(0));

    let counted = ticks.clone();
    let base_for_timer = base.clone();
    worker.run_every(Duration::from_millis(200), move || {
        let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
        elog_info!("tick {} on thread {}", n, evmux_core::tid());
        // Cross-loop injection: report back on the base loop's thread.
        base_for_timer.queue_task(move || {
            elog_info!("tick {} observed on base thread {}", n, evmux_core::tid());
        });
    });

    let base_for_quit = base.clone();
    base.run_after(Duration::from_secs(1), move || {
        base_for_quit.quit();
    });

    base.run_loop();
    elog_info!("base loop exited, total ticks = {}", ticks.load(Ordering::SeqCst));
}
