use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use mio::{Interest, Token};

use crate::event_loop::{DispatchFn, LoopHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    New,
    Added,
    Ignored,
}

/// A snapshot of what a poll returned for one fd, translated from mio's
/// `Event` into the four conditions `Channel::dispatch` checks in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub priority: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(ev: &mio::event::Event) -> Self {
        Self {
            readable: ev.is_readable(),
            writable: ev.is_writable(),
            error: ev.is_error(),
            read_closed: ev.is_read_closed(),
            priority: ev.is_priority(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WantedInterest {
    read: bool,
    write: bool,
}

impl WantedInterest {
    fn to_mio(self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

type ReadCb = Box<dyn FnMut(Instant) + Send>;
type EventCb = Box<dyn FnMut() + Send>;

/// One file descriptor registered with the reactor's demultiplexer.
///
/// Tracks the NEW / ADDED / IGNORED state machine: a channel starts
/// unregistered (`New`), moves to `Added` the first time interest is
/// expressed, and falls back to `Ignored` (deregistered, but still known so
/// a later re-enable is a MOD rather than a fresh ADD) once interest drops
/// back to none. `Acceptor`, `Connector`, `TcpConnection`, `TimerQueue` and
/// the event loop's own wakeup fd all drive one of these each.
pub struct Channel<S> {
    loop_handle: LoopHandle,
    token: Token,
    source: S,
    interest: WantedInterest,
    state: ChannelState,
    handling_events: bool,
    read_cb: Option<ReadCb>,
    write_cb: Option<EventCb>,
    close_cb: Option<EventCb>,
    error_cb: Option<EventCb>,
}

impl<S> fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("token", &self.token)
            .field("state", &self.state)
            .field("interest", &self.interest)
            .finish_non_exhaustive()
    }
}

impl<S> Channel<S>
where
    S: mio::event::Source + AsRawFd + Send + 'static,
{
    pub(crate) fn new(loop_handle: LoopHandle, source: S) -> Arc<Mutex<Self>> {
        let token = loop_handle.next_token();
        Self::with_token(loop_handle, source, token)
    }

    /// Build with a token minted by the caller instead of
    /// `loop_handle.next_token()`. Needed for the event loop's own wakeup
    /// and timer channels, which are constructed while the loop's `Arc` is
    /// still being built (inside `Arc::new_cyclic`) and so cannot yet
    /// upgrade a `Weak` back to themselves the way `next_token()` would.
    pub(crate) fn with_token(loop_handle: LoopHandle, source: S, token: Token) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            loop_handle,
            token,
            source,
            interest: WantedInterest::default(),
            state: ChannelState::New,
            handling_events: false,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.source.as_raw_fd()
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_reading(&self) -> bool {
        self.interest.read
    }

    pub fn is_writing(&self) -> bool {
        self.interest.write
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(Instant) + Send + 'static) {
        self.read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.error_cb = Some(Box::new(cb));
    }

    pub fn enable_reading(this: &Arc<Mutex<Self>>) {
        this.lock().unwrap().interest.read = true;
        Self::sync(this);
    }

    pub fn disable_reading(this: &Arc<Mutex<Self>>) {
        this.lock().unwrap().interest.read = false;
        Self::sync(this);
    }

    pub fn enable_writing(this: &Arc<Mutex<Self>>) {
        this.lock().unwrap().interest.write = true;
        Self::sync(this);
    }

    pub fn disable_writing(this: &Arc<Mutex<Self>>) {
        this.lock().unwrap().interest.write = false;
        Self::sync(this);
    }

    pub fn disable_all(this: &Arc<Mutex<Self>>) {
        {
            this.lock().unwrap().interest = WantedInterest::default();
        }
        Self::sync(this);
    }

    fn sync(this: &Arc<Mutex<Self>>) {
        let (token, state, wanted) = {
            let g = this.lock().unwrap();
            (g.token, g.state, g.interest)
        };
        let loop_handle = this.lock().unwrap().loop_handle.clone();
        loop_handle.assert_in_loop_thread();
        let interest = wanted.to_mio();

        match state {
            ChannelState::New | ChannelState::Ignored => {
                if let Some(interest) = interest {
                    {
                        let mut g = this.lock().unwrap();
                        loop_handle
                            .register_source(&mut g.source, token, interest)
                            .expect("channel registration should not fail under normal operation");
                    }
                    this.lock().unwrap().state = ChannelState::Added;
                    loop_handle.track_dispatch(token, make_dispatch_fn(Arc::downgrade(this)));
                }
            }
            ChannelState::Added => match interest {
                None => {
                    {
                        let mut g = this.lock().unwrap();
                        loop_handle
                            .deregister_source(&mut g.source)
                            .expect("channel deregistration should not fail under normal operation");
                    }
                    this.lock().unwrap().state = ChannelState::Ignored;
                    loop_handle.untrack_dispatch(token);
                }
                Some(interest) => {
                    let mut g = this.lock().unwrap();
                    loop_handle
                        .reregister_source(&mut g.source, token, interest)
                        .expect("channel reregistration should not fail under normal operation");
                }
            },
        }
    }

    /// Deregister (if still `Added`) and drop the dispatch-table entry.
    /// Calling this on a channel still dispatching its own events, or one
    /// that was never added/already removed, is a contract violation.
    pub fn remove(this: &Arc<Mutex<Self>>) {
        let (token, state, handling) = {
            let g = this.lock().unwrap();
            (g.token, g.state, g.handling_events)
        };
        flux_utils::safe_assert!(!handling, "channel removed while dispatching its own events");
        flux_utils::safe_assert!(
            matches!(state, ChannelState::Added | ChannelState::Ignored),
            "channel removed from state {:?}",
            state
        );

        let loop_handle = this.lock().unwrap().loop_handle.clone();
        loop_handle.assert_in_loop_thread();
        loop_handle.untrack_dispatch(token);
        if state == ChannelState::Added {
            let mut g = this.lock().unwrap();
            let _ = loop_handle.deregister_source(&mut g.source);
        }
        this.lock().unwrap().state = ChannelState::New;
    }

    /// Consume the channel and recover its underlying source, if this call
    /// holds the last strong reference. Used when handing a socket off to a
    /// new owner after the channel has already been removed (the connector
    /// handing a completed `TcpStream` to the connection callback).
    pub(crate) fn take_source(this: Arc<Mutex<Self>>) -> Option<S> {
        Arc::try_unwrap(this)
            .ok()
            .map(|m| m.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner).source)
    }

    /// Dispatch one readiness notification in the fixed order: close, then
    /// error, then read, then write. Callbacks are detached from the
    /// channel before being invoked, and restored afterwards, so that a
    /// callback is free to call `enable_*`/`disable_*`/`remove` on this
    /// same channel without deadlocking on its own mutex.
    pub(crate) fn dispatch(this: &Arc<Mutex<Self>>, readiness: Readiness, receive_time: Instant) {
        let (mut close_cb, mut error_cb, mut read_cb, mut write_cb) = {
            let mut g = this.lock().unwrap();
            g.handling_events = true;
            (g.close_cb.take(), g.error_cb.take(), g.read_cb.take(), g.write_cb.take())
        };

        if readiness.read_closed && !readiness.readable {
            if let Some(cb) = &mut close_cb {
                cb();
            }
        }
        if readiness.error {
            if let Some(cb) = &mut error_cb {
                cb();
            }
        }
        if readiness.readable || readiness.priority {
            if let Some(cb) = &mut read_cb {
                cb(receive_time);
            }
        }
        if readiness.writable {
            if let Some(cb) = &mut write_cb {
                cb();
            }
        }

        let mut g = this.lock().unwrap();
        g.handling_events = false;
        if g.close_cb.is_none() {
            g.close_cb = close_cb;
        }
        if g.error_cb.is_none() {
            g.error_cb = error_cb;
        }
        if g.read_cb.is_none() {
            g.read_cb = read_cb;
        }
        if g.write_cb.is_none() {
            g.write_cb = write_cb;
        }
    }
}

fn make_dispatch_fn<S>(weak: Weak<Mutex<Channel<S>>>) -> DispatchFn
where
    S: mio::event::Source + AsRawFd + Send + 'static,
{
    Arc::new(move |readiness: Readiness, receive_time: Instant| {
        if let Some(this) = weak.upgrade() {
            Channel::dispatch(&this, readiness, receive_time);
        }
    })
}

/// Adapts a bare file descriptor (timerfd, eventfd) as a [`mio::event::Source`]
/// so it can go through the same `Channel` machinery as sockets.
pub struct RawFdSource(RawFd);

impl RawFdSource {
    pub fn new(fd: RawFd) -> Self {
        Self(fd)
    }
}

impl AsRawFd for RawFdSource {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl mio::event::Source for RawFdSource {
    fn register(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        mio::unix::SourceFd(&self.0).register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        mio::unix::SourceFd(&self.0).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        mio::unix::SourceFd(&self.0).deregister(registry)
    }
}
