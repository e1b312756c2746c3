use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use flux_utils::ThreadPriority;

use crate::event_loop::{EventLoop, LoopHandle};

struct Inner {
    base_loop: LoopHandle,
    name: String,
    num_threads: Mutex<usize>,
    loops: Mutex<Vec<LoopHandle>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
    started: AtomicBool,
}

/// Spawns zero or more OS threads, each running its own [`EventLoop`], and
/// hands out loop handles round-robin so a `TcpServer` can spread accepted
/// connections across them.
///
/// With zero threads (the default), [`LoopThreadPool::next_loop`] always
/// returns the base loop passed to [`LoopThreadPool::new`), so a server runs
/// single-threaded unless [`LoopThreadPool::set_num_threads`] says otherwise.
#[derive(Clone)]
pub struct LoopThreadPool(Arc<Inner>);

impl LoopThreadPool {
    #[must_use]
    pub fn new(base_loop: LoopHandle, name: impl Into<String>) -> Self {
        Self(Arc::new(Inner {
            base_loop,
            name: name.into(),
            num_threads: Mutex::new(0),
            loops: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }))
    }

    /// Must be called before [`LoopThreadPool::start`].
    pub fn set_num_threads(&self, n: usize) {
        *self.0.num_threads.lock().unwrap() = n;
    }

    pub fn start(&self) -> io::Result<()> {
        if self.0.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let n = *self.0.num_threads.lock().unwrap();
        let mut loops = Vec::with_capacity(n);
        let mut threads = Vec::with_capacity(n);

        for i in 0..n {
            let (tx, rx) = std::sync::mpsc::channel();
            let thread_name = format!("{}-io-{i}", self.0.name);
            let handle = std::thread::Builder::new().name(thread_name).spawn(move || {
                flux_utils::thread_boot(None, ThreadPriority::OSDefault);
                let event_loop = EventLoop::new().expect("failed to create io thread event loop");
                tx.send(event_loop.handle()).expect("pool thread's loop handle receiver was dropped before it started");
                event_loop.run();
            })?;
            let loop_handle = rx.recv().expect("io thread exited before publishing its loop handle");
            loops.push(loop_handle);
            threads.push(handle);
        }

        *self.0.loops.lock().unwrap() = loops;
        *self.0.threads.lock().unwrap() = threads;
        Ok(())
    }

    #[must_use]
    pub fn next_loop(&self) -> LoopHandle {
        let loops = self.0.loops.lock().unwrap();
        if loops.is_empty() {
            return self.0.base_loop.clone();
        }
        let i = self.0.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[i].clone()
    }

    #[must_use]
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        let loops = self.0.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.0.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}

impl Drop for Inner {
    /// Ask every pool thread's loop to quit and wait for its thread to
    /// exit. Only the last `Arc<Inner>` (the pool itself, never a loop
    /// handed out by `next_loop`/`all_loops`, since those are plain
    /// `LoopHandle`s) ever runs this.
    fn drop(&mut self) {
        for loop_handle in self.loops.lock().unwrap().drain(..) {
            loop_handle.quit();
        }
        for thread in self.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
    }
}
