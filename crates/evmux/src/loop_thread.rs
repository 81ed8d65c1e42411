//! Loop-per-thread bootstrapping.
//!
//! `LoopThread` spawns one named OS thread, builds an `EventLoop` on it, and
//! hands the loop back to the caller before entering `run_loop`.
//! `LoopThreadPool` stamps out N of them and offers round-robin / random /
//! all-loops distribution to callers, falling back to the base loop when no
//! workers were configured.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use rand::Rng;

use crate::event_loop::EventLoop;

/// Per-thread initialization hook, invoked on the new loop's thread before
/// it starts looping. Shared across a pool's workers.
pub type InitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

struct SharedSlot {
    loop_: Mutex<Option<Arc<EventLoop>>>,
    ready: Condvar,
}

/// One OS thread running one event loop.
pub struct LoopThread {
    name: String,
    init: Option<InitCallback>,
    shared: Arc<SharedSlot>,
    thread: Option<JoinHandle<()>>,
}

impl LoopThread {
    pub fn new(init: Option<InitCallback>, name: impl Into<String>) -> Self {
        LoopThread {
            name: name.into(),
            init,
            shared: Arc::new(SharedSlot {
                loop_: Mutex::new(None),
                ready: Condvar::new(),
            }),
            thread: None,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the thread and block until its loop is constructed and
    /// initialized.
    pub fn start(&mut self) -> Arc<EventLoop> {
        let shared = self.shared.clone();
        let init = self.init.take();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let lp = EventLoop::new().expect("event loop setup failed");
                if let Some(init) = &init {
                    init(&lp);
                }
                {
                    let mut slot = shared.loop_.lock().unwrap();
                    *slot = Some(lp.clone());
                    shared.ready.notify_one();
                }
                lp.run_loop();
                *shared.loop_.lock().unwrap() = None;
            })
            .expect("failed to spawn loop thread");
        self.thread = Some(handle);

        let mut slot = self.shared.loop_.lock().unwrap();
        while slot.is_none() {
            slot = self.shared.ready.wait(slot).unwrap();
        }
        slot.clone().unwrap()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(lp) = self.shared.loop_.lock().unwrap().clone() {
            lp.quit();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// A fixed set of loop threads fronted by distribution policies.
///
/// All distribution methods run on the base loop's thread; the pool itself
/// is not handed across threads.
pub struct LoopThreadPool {
    base: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    thread_count: usize,
    next: AtomicUsize,
    threads: Vec<LoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl LoopThreadPool {
    pub fn new(base: Arc<EventLoop>, name: impl Into<String>) -> Self {
        LoopThreadPool {
            base,
            name: name.into(),
            started: AtomicBool::new(false),
            thread_count: 0,
            next: AtomicUsize::new(0),
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_count(&mut self, count: usize) {
        self.thread_count = count;
    }

    /// Spawn the configured threads, running `init` on each new loop's
    /// thread. With zero threads, `init` runs on the base loop instead.
    pub fn start(&mut self, init: Option<InitCallback>) {
        self.base.assert_in_loop_thread();
        self.started.store(true, Ordering::Release);

        for i in 0..self.thread_count {
            let mut thread = LoopThread::new(init.clone(), format!("{}{}", self.name, i));
            let lp = thread.start();
            self.threads.push(thread);
            self.loops.push(lp);
        }
        if self.thread_count == 0 {
            if let Some(init) = init {
                init(&self.base);
            }
        }
    }

    /// Round-robin pick; the base loop when the pool is empty.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        self.base.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[i].clone()
    }

    /// Uniform random pick; the base loop when the pool is empty.
    pub fn random_loop(&self) -> Arc<EventLoop> {
        self.base.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let i = rand::rng().random_range(0..self.loops.len());
        self.loops[i].clone()
    }

    /// Every worker loop, or just the base loop when the pool is empty.
    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        self.base.assert_in_loop_thread();
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }

    #[inline]
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_loop_thread_runs_on_other_thread() {
        let mut thread = LoopThread::new(None, "lt-test");
        let lp = thread.start();
        assert_ne!(lp.tid(), evmux_core::tid());
        assert!(!lp.in_loop_thread());
    }

    #[test]
    fn test_loop_thread_init_runs_first() {
        let init_count = Arc::new(AtomicUsize::new(0));
        let c = init_count.clone();
        let init: InitCallback = Arc::new(move |_lp| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mut thread = LoopThread::new(Some(init), "lt-init");
        let _lp = thread.start();
        // start() waits for publication, which happens after init.
        assert_eq!(init_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_round_robin() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base.clone(), "rr");
        pool.set_thread_count(3);
        pool.start(None);
        assert!(pool.started());

        let all = pool.all_loops();
        assert_eq!(all.len(), 3);

        // Seven picks walk 0,1,2,0,1,2,0.
        let expected = [0usize, 1, 2, 0, 1, 2, 0];
        for &slot in &expected {
            let picked = pool.next_loop();
            assert!(Arc::ptr_eq(&picked, &all[slot]));
            assert!(!Arc::ptr_eq(&picked, &base));
        }
    }

    #[test]
    fn test_empty_pool_falls_back_to_base() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base.clone(), "empty");
        pool.start(None);

        assert!(Arc::ptr_eq(&pool.next_loop(), &base));
        assert!(Arc::ptr_eq(&pool.random_loop(), &base));
        let all = pool.all_loops();
        assert_eq!(all.len(), 1);
        assert!(Arc::ptr_eq(&all[0], &base));
    }

    #[test]
    fn test_empty_pool_runs_init_on_base() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base.clone(), "init0");
        let ran_on = Arc::new(Mutex::new(None));
        let slot = ran_on.clone();
        let init: InitCallback = Arc::new(move |lp| {
            *slot.lock().unwrap() = Some(lp.tid());
        });
        pool.start(Some(init));
        assert_eq!(*ran_on.lock().unwrap(), Some(base.tid()));
    }

    #[test]
    fn test_pool_init_runs_on_each_worker() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base.clone(), "init");
        pool.set_thread_count(2);

        let tids = Arc::new(Mutex::new(Vec::new()));
        let sink = tids.clone();
        let init: InitCallback = Arc::new(move |lp| {
            sink.lock().unwrap().push(lp.tid());
        });
        pool.start(Some(init));

        let tids = tids.lock().unwrap();
        assert_eq!(tids.len(), 2);
        assert_ne!(tids[0], tids[1]);
        assert!(!tids.contains(&base.tid()));
    }

    #[test]
    fn test_random_loop_comes_from_pool() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base.clone(), "rand");
        pool.set_thread_count(3);
        pool.start(None);

        let all = pool.all_loops();
        for _ in 0..20 {
            let picked = pool.random_loop();
            assert!(all.iter().any(|lp| Arc::ptr_eq(lp, &picked)));
        }
    }

    #[test]
    fn test_pool_drop_joins_workers() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base, "drop");
        pool.set_thread_count(2);
        pool.start(None);
        let workers = pool.all_loops();
        drop(pool);

        // Workers were quit and joined; their loops are no longer looping.
        std::thread::sleep(Duration::from_millis(20));
        for lp in workers {
            assert_eq!(lp.queued_task_count(), 0);
        }
    }
}
