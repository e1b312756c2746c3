use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::Token;

use crate::channel::{Channel, RawFdSource};
use crate::event_loop::LoopHandle;

/// Rearming below this floor would make the timerfd spin; the original
/// clamps the same way when the next expiration is imminent or already
/// past.
const MIN_REARM_INTERVAL: Duration = Duration::from_micros(100);

/// Opaque handle to a scheduled timer, returned by `LoopHandle::run_at` and
/// friends. Carries no ownership of the timer itself (unlike a pointer it
/// can be copied freely); canceling an id that already fired is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) enum TimerCallback {
    Once(Box<dyn FnOnce() + Send>),
    Repeating(Box<dyn FnMut() + Send>),
}

struct TimerEntry {
    id: u64,
    interval: Option<Duration>,
    callback: TimerCallback,
}

pub(crate) struct FiredTimer {
    pub id: u64,
    pub interval: Option<Duration>,
    pub callback: TimerCallback,
}

/// Ordered set of pending timers backed by a `timerfd`, mirroring the
/// original `TimerQueue`: one kernel timer armed for the earliest
/// expiration rather than one per registered timer.
pub(crate) struct TimerQueue {
    timerfd: RawFd,
    channel: Arc<Mutex<Channel<RawFdSource>>>,
    active: BTreeMap<(Instant, u64), TimerEntry>,
    by_id: HashMap<u64, Instant>,
    currently_firing: bool,
    pending_fire_ids: HashSet<u64>,
    canceled_during_fire: HashSet<u64>,
}

impl TimerQueue {
    /// `token` is minted by the caller (rather than via `loop_handle`'s own
    /// counter) so this can run while the owning `EventLoop`'s `Arc` is
    /// still under construction; see `Channel::with_token`.
    pub(crate) fn new(loop_handle: LoopHandle, token: Token) -> io::Result<Self> {
        let timerfd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
        if timerfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let channel = Channel::with_token(loop_handle, RawFdSource::new(timerfd), token);
        Ok(Self {
            timerfd,
            channel,
            active: BTreeMap::new(),
            by_id: HashMap::new(),
            currently_firing: false,
            pending_fire_ids: HashSet::new(),
            canceled_during_fire: HashSet::new(),
        })
    }

    pub(crate) fn channel(&self) -> Arc<Mutex<Channel<RawFdSource>>> {
        self.channel.clone()
    }

    /// Insert a newly scheduled timer. Must run on the loop thread; callers
    /// route through `run_in_loop`.
    pub(crate) fn insert(&mut self, id: u64, when: Instant, interval: Option<Duration>, callback: TimerCallback) {
        let earliest_changed = self.active.keys().next().is_none_or(|&(t, _)| when < t);
        self.active.insert((when, id), TimerEntry { id, interval, callback });
        self.by_id.insert(id, when);
        if earliest_changed {
            self.rearm(when);
        }
    }

    pub(crate) fn cancel(&mut self, id: u64) {
        if self.currently_firing && self.pending_fire_ids.contains(&id) {
            self.canceled_during_fire.insert(id);
            return;
        }
        let Some(when) = self.by_id.remove(&id) else {
            return;
        };
        self.active.remove(&(when, id));
        match self.active.keys().next() {
            Some(&(next_when, _)) => self.rearm(next_when),
            None => self.disarm(),
        }
    }

    /// Drain the timerfd's expiration counter and pull every timer whose
    /// deadline is at or before `now` out of the active set, returning them
    /// without invoking their callbacks. Callers are expected to invoke the
    /// callbacks with no lock on the queue held, then call
    /// [`TimerQueue::finish_firing`].
    pub(crate) fn handle_read(&mut self, now: Instant) -> Vec<FiredTimer> {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.timerfd, buf.as_mut_ptr().cast(), buf.len());
        }

        let sentinel = (now, u64::MAX);
        let expired_keys: Vec<(Instant, u64)> = self.active.range(..=sentinel).map(|(k, _)| *k).collect();

        self.currently_firing = true;
        self.pending_fire_ids = expired_keys.iter().map(|(_, id)| *id).collect();
        self.canceled_during_fire.clear();

        let mut fired = Vec::with_capacity(expired_keys.len());
        for key in &expired_keys {
            if let Some(entry) = self.active.remove(key) {
                self.by_id.remove(&entry.id);
                fired.push(FiredTimer { id: entry.id, interval: entry.interval, callback: entry.callback });
            }
        }
        fired
    }

    /// Reinsert repeating timers that fired in the batch just processed and
    /// weren't canceled from within their own callback, then rearm for the
    /// new earliest deadline.
    pub(crate) fn finish_firing(&mut self, to_reinsert: Vec<(u64, Duration, TimerCallback)>) {
        for (id, interval, callback) in to_reinsert {
            if self.canceled_during_fire.contains(&id) {
                continue;
            }
            let next = Instant::now() + interval;
            self.active.insert((next, id), TimerEntry { id, interval: Some(interval), callback });
            self.by_id.insert(id, next);
        }

        self.currently_firing = false;
        self.pending_fire_ids.clear();
        self.canceled_during_fire.clear();

        match self.active.keys().next() {
            Some(&(next_when, _)) => self.rearm(next_when),
            None => self.disarm(),
        }
    }

    fn rearm(&self, when: Instant) {
        let mut delay = when.saturating_duration_since(Instant::now());
        if delay < MIN_REARM_INTERVAL {
            delay = MIN_REARM_INTERVAL;
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: delay.as_secs() as i64, tv_nsec: i64::from(delay.subsec_nanos()) },
        };
        unsafe {
            libc::timerfd_settime(self.timerfd, 0, &spec, std::ptr::null_mut());
        }
    }

    fn disarm(&self) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        };
        unsafe {
            libc::timerfd_settime(self.timerfd, 0, &spec, std::ptr::null_mut());
        }
    }
}
