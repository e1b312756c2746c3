use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::TcpStream;

use crate::address::Address;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::timer::TimerId;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

struct ConnectorState {
    loop_handle: LoopHandle,
    server_addr: Address,
    wants_connect: bool,
    phase: Phase,
    channel: Option<Arc<Mutex<Channel<TcpStream>>>>,
    retry_delay: Duration,
    retry_timer: Option<TimerId>,
    on_connected: Box<dyn FnMut(TcpStream) + Send>,
}

/// Actively connects out to a server address, retrying with exponential
/// backoff (500ms initial, doubling, capped at 30s) until a connection
/// completes or [`Connector::stop`] is called.
///
/// Cheap to clone; every clone refers to the same underlying connect
/// attempt, the way `TcpClient` and the connector's own retry timer closure
/// both need a handle back to it.
#[derive(Clone)]
pub struct Connector(Arc<Mutex<ConnectorState>>);

impl Connector {
    pub fn new(loop_handle: LoopHandle, server_addr: Address, on_connected: impl FnMut(TcpStream) + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(ConnectorState {
            loop_handle,
            server_addr,
            wants_connect: false,
            phase: Phase::Disconnected,
            channel: None,
            retry_delay: INITIAL_RETRY_DELAY,
            retry_timer: None,
            on_connected: Box::new(on_connected),
        })))
    }

    pub fn start(&self) {
        self.0.lock().unwrap().wants_connect = true;
        let loop_handle = self.0.lock().unwrap().loop_handle.clone();
        let this = self.clone();
        loop_handle.run_in_loop(move || this.connect_in_loop());
    }

    pub fn stop(&self) {
        let (timer, loop_handle) = {
            let mut s = self.0.lock().unwrap();
            s.wants_connect = false;
            (s.retry_timer.take(), s.loop_handle.clone())
        };
        if let Some(id) = timer {
            loop_handle.cancel(id);
        }
    }

    /// Reset backoff and connect again, used after a connection that had
    /// succeeded is later closed and the owner wants to reconnect.
    pub fn restart(&self) {
        {
            let mut s = self.0.lock().unwrap();
            s.wants_connect = true;
            s.phase = Phase::Disconnected;
            s.retry_delay = INITIAL_RETRY_DELAY;
        }
        self.start();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.0.lock().unwrap().phase, Phase::Connected)
    }

    fn connect_in_loop(&self) {
        let (addr, wants) = {
            let s = self.0.lock().unwrap();
            (s.server_addr, s.wants_connect)
        };
        if !wants {
            return;
        }

        match TcpStream::connect(addr.socket_addr()) {
            Ok(stream) => self.connecting(stream),
            Err(e) => {
                tracing::warn!(error = %e, %addr, "connect failed synchronously");
                match classify_connect_error(&e) {
                    ConnectOutcome::Retry => self.retry(),
                    ConnectOutcome::Abandon => {
                        self.0.lock().unwrap().phase = Phase::Disconnected;
                        let abandoned = crate::error::Error::ConnectAbandoned { addr: addr.socket_addr(), source: e };
                        tracing::error!(error = %abandoned, "giving up on connection, error will not clear on retry");
                    }
                }
            }
        }
    }

    fn connecting(&self, stream: TcpStream) {
        let loop_handle = self.0.lock().unwrap().loop_handle.clone();
        let channel = Channel::new(loop_handle, stream);

        let this_for_write = self.clone();
        let channel_for_write = channel.clone();
        channel.lock().unwrap().set_write_callback(move || this_for_write.handle_write(&channel_for_write));

        let this_for_error = self.clone();
        channel.lock().unwrap().set_error_callback(move || this_for_error.handle_error());

        {
            let mut s = self.0.lock().unwrap();
            s.phase = Phase::Connecting;
            s.channel = Some(channel.clone());
        }
        Channel::enable_writing(&channel);
    }

    fn handle_write(&self, channel: &Arc<Mutex<Channel<TcpStream>>>) {
        if !matches!(self.0.lock().unwrap().phase, Phase::Connecting) {
            return;
        }

        let fd = channel.lock().unwrap().fd();
        if let Err(e) = socket_error(fd) {
            tracing::warn!(error = %e, "connector socket error while connecting");
            self.reset_channel();
            self.retry();
            return;
        }

        let self_connect = is_self_connect(channel.lock().unwrap().source());
        if self_connect {
            tracing::warn!("detected self-connect, retrying");
            self.reset_channel();
            self.retry();
            return;
        }

        Channel::disable_all(channel);
        Channel::remove(channel);
        self.0.lock().unwrap().channel = None;

        if let Some(stream) = Channel::take_source(channel.clone()) {
            let mut s = self.0.lock().unwrap();
            s.phase = Phase::Connected;
            (s.on_connected)(stream);
        }
    }

    fn handle_error(&self) {
        if matches!(self.0.lock().unwrap().phase, Phase::Connecting) {
            tracing::warn!("connector channel error while connecting");
            self.reset_channel();
            self.retry();
        }
    }

    fn reset_channel(&self) {
        let channel = self.0.lock().unwrap().channel.take();
        if let Some(channel) = channel {
            Channel::disable_all(&channel);
            Channel::remove(&channel);
        }
    }

    fn retry(&self) {
        let (delay, loop_handle, wants) = {
            let mut s = self.0.lock().unwrap();
            s.phase = Phase::Disconnected;
            let delay = s.retry_delay;
            s.retry_delay = (s.retry_delay * 2).min(MAX_RETRY_DELAY);
            (delay, s.loop_handle.clone(), s.wants_connect)
        };
        if !wants {
            return;
        }
        let this = self.clone();
        let id = loop_handle.run_after(delay, move || this.connect_in_loop());
        self.0.lock().unwrap().retry_timer = Some(id);
    }
}

enum ConnectOutcome {
    Retry,
    Abandon,
}

/// mio's non-blocking `connect` absorbs the usual `EINPROGRESS` success
/// path; what reaches us as an `Err` here is either a transient local
/// resource condition (worth retrying) or a malformed request that will
/// never succeed (not worth retrying).
fn classify_connect_error(err: &io::Error) -> ConnectOutcome {
    match err.raw_os_error() {
        Some(libc::EAGAIN | libc::EADDRINUSE | libc::EADDRNOTAVAIL | libc::ECONNREFUSED | libc::ENETUNREACH | libc::EINTR) => {
            ConnectOutcome::Retry
        }
        _ => ConnectOutcome::Abandon,
    }
}

pub(crate) fn socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe { libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, (&raw mut err).cast(), &raw mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

fn is_self_connect(stream: &TcpStream) -> bool {
    matches!((stream.local_addr(), stream.peer_addr()), (Ok(local), Ok(peer)) if local == peer)
}
