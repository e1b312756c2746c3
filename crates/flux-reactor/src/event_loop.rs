use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use mio::Token;

use crate::channel::{Channel, RawFdSource, Readiness};
use crate::poller::Demultiplexer;
use crate::timer::{TimerCallback, TimerId, TimerQueue};

pub(crate) type Task = Box<dyn FnOnce() + Send>;
pub(crate) type DispatchFn = Arc<dyn Fn(Readiness, Instant) + Send + Sync>;

thread_local! {
    static LOOP_IN_THIS_THREAD: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

struct EventLoopInner {
    demux: Mutex<Demultiplexer>,
    timers: Mutex<TimerQueue>,
    tasks: Mutex<VecDeque<Task>>,
    executing_tasks: AtomicBool,
    quit: AtomicBool,
    thread_id: ThreadId,
    next_token: AtomicUsize,
    next_timer_id: AtomicU64,
    wakeup_fd: RawFd,
    wakeup_channel: Arc<Mutex<Channel<RawFdSource>>>,
}

impl EventLoopInner {
    fn wakeup(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wakeup_fd, (&raw const one).cast(), std::mem::size_of::<u64>());
        }
    }
}

/// Cheaply-cloneable, thread-safe reference to an [`EventLoop`].
///
/// Operations that can legitimately originate off the owning thread
/// (`run_in_loop`, `queue_in_loop`, the timer API, `quit`) queue themselves
/// and wake the loop via its eventfd. Operations that must only ever touch
/// loop-owned state directly (a `Channel`'s `enable_*`/`disable_*`/`remove`)
/// abort the process if invoked from any other thread, matching the
/// original's `abortNotInLoopThread`.
#[derive(Clone)]
pub struct LoopHandle(Weak<EventLoopInner>);

impl LoopHandle {
    fn inner(&self) -> Option<Arc<EventLoopInner>> {
        self.0.upgrade()
    }

    #[must_use]
    pub fn is_in_loop_thread(&self) -> bool {
        self.inner().is_some_and(|inner| inner.thread_id == std::thread::current().id())
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        if let Some(inner) = self.inner() {
            if std::thread::current().id() != inner.thread_id {
                tracing::error!("reactor object touched from a thread other than its owning event loop");
                std::process::abort();
            }
        }
    }

    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        let Some(inner) = self.inner() else { return };
        inner.tasks.lock().unwrap().push_back(Box::new(f));
        if std::thread::current().id() != inner.thread_id || inner.executing_tasks.load(Ordering::Acquire) {
            inner.wakeup();
        }
    }

    pub fn run_at(&self, when: Instant, f: impl FnOnce() + Send + 'static) -> TimerId {
        let Some(inner) = self.inner() else { return TimerId(0) };
        let id = inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let handle = self.clone();
        self.run_in_loop(move || {
            if let Some(inner) = handle.inner() {
                inner.timers.lock().unwrap().insert(id, when, None, TimerCallback::Once(Box::new(f)));
            }
        });
        TimerId(id)
    }

    pub fn run_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, f)
    }

    pub fn run_every(&self, interval: Duration, f: impl FnMut() + Send + 'static) -> TimerId {
        let Some(inner) = self.inner() else { return TimerId(0) };
        let id = inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let when = Instant::now() + interval;
        let handle = self.clone();
        self.run_in_loop(move || {
            if let Some(inner) = handle.inner() {
                inner.timers.lock().unwrap().insert(id, when, Some(interval), TimerCallback::Repeating(Box::new(f)));
            }
        });
        TimerId(id)
    }

    pub fn cancel(&self, id: TimerId) {
        let handle = self.clone();
        self.run_in_loop(move || {
            if let Some(inner) = handle.inner() {
                inner.timers.lock().unwrap().cancel(id.0);
            }
        });
    }

    pub fn quit(&self) {
        let Some(inner) = self.inner() else { return };
        inner.quit.store(true, Ordering::Release);
        if std::thread::current().id() != inner.thread_id {
            inner.wakeup();
        }
    }

    pub(crate) fn next_token(&self) -> Token {
        let inner = self.inner().expect("loop handle used after its event loop was dropped");
        Token(inner.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register_source(
        &self,
        source: &mut impl mio::event::Source,
        token: Token,
        interest: mio::Interest,
    ) -> io::Result<()> {
        let inner = self.inner().expect("loop handle used after its event loop was dropped");
        inner.demux.lock().unwrap().registry().register(source, token, interest)
    }

    pub(crate) fn reregister_source(
        &self,
        source: &mut impl mio::event::Source,
        token: Token,
        interest: mio::Interest,
    ) -> io::Result<()> {
        let inner = self.inner().expect("loop handle used after its event loop was dropped");
        inner.demux.lock().unwrap().registry().reregister(source, token, interest)
    }

    pub(crate) fn deregister_source(&self, source: &mut impl mio::event::Source) -> io::Result<()> {
        let inner = self.inner().expect("loop handle used after its event loop was dropped");
        inner.demux.lock().unwrap().registry().deregister(source)
    }

    pub(crate) fn track_dispatch(&self, token: Token, f: DispatchFn) {
        if let Some(inner) = self.inner() {
            inner.demux.lock().unwrap().track(token, f);
        }
    }

    pub(crate) fn untrack_dispatch(&self, token: Token) {
        if let Some(inner) = self.inner() {
            inner.demux.lock().unwrap().untrack(token);
        }
    }
}

/// One reactor, one OS thread. Construct it on the thread that will call
/// [`EventLoop::run`]; a second `EventLoop` on the same thread is a
/// programmer error and aborts the process, just as attempting to mutate a
/// channel from any thread but this one does.
pub struct EventLoop {
    inner: Arc<EventLoopInner>,
}

impl EventLoop {
    pub fn new() -> crate::error::Result<Self> {
        if LOOP_IN_THIS_THREAD.with(std::cell::Cell::get) {
            tracing::error!("attempted to construct a second EventLoop on a thread that already owns one");
            std::process::abort();
        }

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(crate::error::Error::FatalInit(format!("eventfd creation failed: {}", io::Error::last_os_error())));
        }

        // Tokens for the loop's own timer and wakeup channels are minted
        // from this counter before `Arc::new_cyclic` hands out a usable
        // `Weak` — `LoopHandle::next_token` can't upgrade that `Weak` until
        // the `Arc` it closes over has finished construction, so those two
        // channels take their tokens directly instead.
        let next_token = AtomicUsize::new(1);
        let timer_token = Token(next_token.fetch_add(1, Ordering::Relaxed));
        let wakeup_token = Token(next_token.fetch_add(1, Ordering::Relaxed));

        let inner = Arc::new_cyclic(|weak_self| {
            let handle = LoopHandle(weak_self.clone());
            let demux = Demultiplexer::new().expect("failed to create kernel demultiplexer");
            let timers = TimerQueue::new(handle.clone(), timer_token).expect("failed to create timerfd");
            let wakeup_channel = Channel::with_token(handle, RawFdSource::new(wakeup_fd), wakeup_token);

            EventLoopInner {
                demux: Mutex::new(demux),
                timers: Mutex::new(timers),
                tasks: Mutex::new(VecDeque::new()),
                executing_tasks: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                thread_id: std::thread::current().id(),
                next_token,
                next_timer_id: AtomicU64::new(1),
                wakeup_fd,
                wakeup_channel,
            }
        });

        let timer_channel = inner.timers.lock().unwrap().channel();
        let weak_for_timers = Arc::downgrade(&inner);
        timer_channel.lock().unwrap().set_read_callback(move |now| {
            let Some(inner) = weak_for_timers.upgrade() else { return };
            let fired = inner.timers.lock().unwrap().handle_read(now);
            let mut to_reinsert = Vec::new();
            for fired_timer in fired {
                match fired_timer.callback {
                    TimerCallback::Once(f) => f(),
                    TimerCallback::Repeating(mut f) => {
                        f();
                        if let Some(interval) = fired_timer.interval {
                            to_reinsert.push((fired_timer.id, interval, TimerCallback::Repeating(f)));
                        }
                    }
                }
            }
            inner.timers.lock().unwrap().finish_firing(to_reinsert);
        });
        Channel::enable_reading(&timer_channel);

        let wakeup_fd_for_drain = wakeup_fd;
        inner.wakeup_channel.lock().unwrap().set_read_callback(move |_now| {
            let mut buf = [0u8; 8];
            unsafe {
                libc::read(wakeup_fd_for_drain, buf.as_mut_ptr().cast(), buf.len());
            }
        });
        Channel::enable_reading(&inner.wakeup_channel);

        LOOP_IN_THIS_THREAD.with(|f| f.set(true));
        Ok(Self { inner })
    }

    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle(Arc::downgrade(&self.inner))
    }

    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Run the reactor until [`EventLoop::quit`] is called. Named `run`
    /// rather than the original's `loop` because that identifier is
    /// reserved in Rust.
    pub fn run(&self) {
        tracing::debug!(thread = ?self.inner.thread_id, "event loop starting");
        while !self.inner.quit.load(Ordering::Acquire) {
            let poll_result = self.inner.demux.lock().unwrap().poll(Some(Duration::from_secs(10)));
            let (receive_time, active) = match poll_result {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(error = %e, "demultiplexer poll failed");
                    continue;
                }
            };

            for (token, readiness) in active {
                let dispatch_fn = self.inner.demux.lock().unwrap().dispatch_fn(token);
                if let Some(f) = dispatch_fn {
                    f(readiness, receive_time);
                }
            }

            self.run_pending_tasks();
        }
        tracing::debug!(thread = ?self.inner.thread_id, "event loop stopping");
    }

    fn run_pending_tasks(&self) {
        self.inner.executing_tasks.store(true, Ordering::Release);
        let tasks: VecDeque<Task> = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            task();
        }
        self.inner.executing_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        LOOP_IN_THIS_THREAD.with(|f| f.set(false));
        unsafe {
            libc::close(self.inner.wakeup_fd);
        }
    }
}
