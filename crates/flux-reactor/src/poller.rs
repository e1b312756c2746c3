use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry, Token};

use crate::channel::Readiness;
use crate::event_loop::DispatchFn;

const INITIAL_EVENTS_CAPACITY: usize = 16;

/// Wraps the kernel demultiplexer (`mio::Poll`, i.e. epoll on Linux) plus
/// the `Token -> dispatch closure` table used to route a readiness
/// notification back to the `Channel` that registered it.
pub(crate) struct Demultiplexer {
    poll: Poll,
    events: Events,
    capacity: usize,
    dispatch: HashMap<Token, DispatchFn>,
}

impl Demultiplexer {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(INITIAL_EVENTS_CAPACITY),
            capacity: INITIAL_EVENTS_CAPACITY,
            dispatch: HashMap::new(),
        })
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Block for up to `timeout` waiting for readiness, returning the
    /// active tokens with a receive time sampled right after the wait (so
    /// every channel dispatched from the same poll sees the same instant,
    /// matching the original's `pollReturnTime_`).
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<(Instant, Vec<(Token, Readiness)>)> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok((Instant::now(), Vec::new()));
            }
            Err(e) => return Err(e),
        }
        let receive_time = Instant::now();

        let active: Vec<(Token, Readiness)> = self.events.iter().map(|ev| (ev.token(), Readiness::from(ev))).collect();

        if active.len() == self.capacity {
            self.grow();
        }

        Ok((receive_time, active))
    }

    fn grow(&mut self) {
        self.capacity *= 2;
        self.events = Events::with_capacity(self.capacity);
    }

    pub(crate) fn track(&mut self, token: Token, f: DispatchFn) {
        self.dispatch.insert(token, f);
    }

    pub(crate) fn untrack(&mut self, token: Token) {
        self.dispatch.remove(&token);
    }

    pub(crate) fn dispatch_fn(&self, token: Token) -> Option<DispatchFn> {
        self.dispatch.get(&token).cloned()
    }
}
