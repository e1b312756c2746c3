use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mio::net::TcpStream;

use crate::address::Address;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::connector::socket_error;
use crate::event_loop::LoopHandle;

/// Beyond this many queued-but-unwritten output bytes, `send` fires the
/// high water mark callback once per upward crossing.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

type ConnectionCb = Box<dyn FnMut(&TcpConnection) + Send>;
type MessageCb = Box<dyn FnMut(&TcpConnection, &mut Buffer, Instant) + Send>;
type HighWaterMarkCb = Box<dyn FnMut(&TcpConnection, usize) + Send>;

struct ConnectionState {
    loop_handle: LoopHandle,
    name: String,
    local_addr: Address,
    peer_addr: Address,
    state: ConnState,
    channel: Arc<Mutex<Channel<TcpStream>>>,
    input_buf: Buffer,
    output_buf: Buffer,
    high_water_mark: usize,
    connection_cb: Option<ConnectionCb>,
    message_cb: Option<MessageCb>,
    write_complete_cb: Option<ConnectionCb>,
    high_water_mark_cb: Option<HighWaterMarkCb>,
    close_cb: Option<ConnectionCb>,
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        flux_utils::safe_assert!(
            matches!(self.state, ConnState::Disconnected),
            "connection {} dropped in state {:?}",
            self.name,
            self.state
        );
    }
}

/// One established or in-progress TCP connection.
///
/// Moves through the same four states as the original: `Connecting` until
/// [`TcpConnection::connection_established`] is called by whatever accepted
/// or dialed it, `Connected` while readable/writable, `Disconnecting` once
/// [`TcpConnection::shutdown`] has asked for a half-close but pending output
/// remains, and finally `Disconnected`.
///
/// Cheap to clone; clones share the same underlying state and are what keep
/// the connection alive after its owner (`TcpServer`/`TcpClient`) drops its
/// own reference during a close callback, mirroring the reference a
/// `shared_ptr` gives the original's close handler.
#[derive(Clone)]
pub struct TcpConnection(Arc<Mutex<ConnectionState>>);

impl TcpConnection {
    pub(crate) fn new(loop_handle: LoopHandle, name: String, stream: TcpStream, local_addr: Address, peer_addr: Address) -> Self {
        let channel = Channel::new(loop_handle.clone(), stream);
        let fd = channel.lock().unwrap().fd();
        set_keepalive(fd, true);
        let _ = channel.lock().unwrap().source().set_nodelay(true);

        let conn = Self(Arc::new(Mutex::new(ConnectionState {
            loop_handle,
            name,
            local_addr,
            peer_addr,
            state: ConnState::Connecting,
            channel: channel.clone(),
            input_buf: Buffer::new(),
            output_buf: Buffer::new(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            connection_cb: None,
            message_cb: None,
            write_complete_cb: None,
            high_water_mark_cb: None,
            close_cb: None,
        })));

        let read_conn = conn.clone();
        channel.lock().unwrap().set_read_callback(move |now| read_conn.handle_read(now));
        let write_conn = conn.clone();
        channel.lock().unwrap().set_write_callback(move || write_conn.handle_write());
        let close_conn = conn.clone();
        channel.lock().unwrap().set_close_callback(move || close_conn.handle_close());
        let error_conn = conn.clone();
        channel.lock().unwrap().set_error_callback(move || error_conn.handle_error());

        conn
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.0.lock().unwrap().name.clone()
    }

    #[must_use]
    pub fn local_addr(&self) -> Address {
        self.0.lock().unwrap().local_addr
    }

    #[must_use]
    pub fn peer_addr(&self) -> Address {
        self.0.lock().unwrap().peer_addr
    }

    #[must_use]
    pub fn connected(&self) -> bool {
        matches!(self.0.lock().unwrap().state, ConnState::Connected)
    }

    #[must_use]
    pub fn disconnected(&self) -> bool {
        matches!(self.0.lock().unwrap().state, ConnState::Disconnected)
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        let channel = self.0.lock().unwrap().channel.clone();
        let _ = channel.lock().unwrap().source().set_nodelay(on);
    }

    pub fn set_message_callback(&self, cb: impl FnMut(&TcpConnection, &mut Buffer, Instant) + Send + 'static) {
        self.0.lock().unwrap().message_cb = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(&TcpConnection) + Send + 'static) {
        self.0.lock().unwrap().write_complete_cb = Some(Box::new(cb));
    }

    pub fn set_high_water_mark_callback(&self, cb: impl FnMut(&TcpConnection, usize) + Send + 'static, mark: usize) {
        let mut s = self.0.lock().unwrap();
        s.high_water_mark_cb = Some(Box::new(cb));
        s.high_water_mark = mark;
    }

    pub(crate) fn set_connection_callback(&self, cb: impl FnMut(&TcpConnection) + Send + 'static) {
        self.0.lock().unwrap().connection_cb = Some(Box::new(cb));
    }

    pub(crate) fn set_close_callback(&self, cb: impl FnMut(&TcpConnection) + Send + 'static) {
        self.0.lock().unwrap().close_cb = Some(Box::new(cb));
    }

    pub(crate) fn connection_established(&self) {
        let channel = {
            let mut s = self.0.lock().unwrap();
            flux_utils::safe_assert!(matches!(s.state, ConnState::Connecting), "connection_established from state {:?}", s.state);
            s.state = ConnState::Connected;
            s.channel.clone()
        };
        Channel::enable_reading(&channel);
        self.invoke_connection_cb();
    }

    /// Called once by the owning `TcpServer`/`TcpClient` after the
    /// connection has already gone through `handle_close` and been dropped
    /// from its connection map; tears the channel down for good.
    pub(crate) fn connection_destroyed(&self) {
        let channel = {
            let mut s = self.0.lock().unwrap();
            if matches!(s.state, ConnState::Connected) {
                s.state = ConnState::Disconnected;
                Channel::disable_all(&s.channel);
            }
            s.channel.clone()
        };
        Channel::remove(&channel);
    }

    pub fn send(&self, data: &[u8]) {
        let loop_handle = self.0.lock().unwrap().loop_handle.clone();
        if loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = self.clone();
            let owned = data.to_vec();
            loop_handle.queue_in_loop(move || this.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        let (state, channel) = {
            let s = self.0.lock().unwrap();
            (s.state, s.channel.clone())
        };
        if state == ConnState::Disconnected {
            tracing::warn!("giving up, connection is disconnected");
            return;
        }

        let currently_writing = channel.lock().unwrap().is_writing();
        let buf_empty = self.0.lock().unwrap().output_buf.readable_bytes() == 0;

        let mut wrote = 0usize;
        let mut fault_error = false;

        if !currently_writing && buf_empty {
            let fd = channel.lock().unwrap().fd();
            match write_nonblocking(fd, data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        let this = self.clone();
                        let loop_handle = self.0.lock().unwrap().loop_handle.clone();
                        loop_handle.queue_in_loop(move || this.invoke_write_complete_cb());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    if matches!(e.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) {
                        fault_error = true;
                    } else {
                        tracing::warn!(error = %e, "write failed");
                    }
                }
            }
        }

        if !fault_error && wrote < data.len() {
            let remaining = &data[wrote..];
            let (crosses_high_water_mark, new_len) = {
                let mut s = self.0.lock().unwrap();
                let old_len = s.output_buf.readable_bytes();
                s.output_buf.append(remaining);
                let new_len = s.output_buf.readable_bytes();
                (old_len < s.high_water_mark && new_len >= s.high_water_mark, new_len)
            };
            if crosses_high_water_mark {
                let this = self.clone();
                let loop_handle = self.0.lock().unwrap().loop_handle.clone();
                loop_handle.queue_in_loop(move || this.invoke_high_water_mark_cb(new_len));
            }
            if !channel.lock().unwrap().is_writing() {
                Channel::enable_writing(&channel);
            }
        }
    }

    pub fn shutdown(&self) {
        let loop_handle = self.0.lock().unwrap().loop_handle.clone();
        let this = self.clone();
        loop_handle.run_in_loop(move || this.shutdown_in_loop());
    }

    fn shutdown_in_loop(&self) {
        let channel = {
            let mut s = self.0.lock().unwrap();
            if s.state != ConnState::Connected {
                return;
            }
            s.state = ConnState::Disconnecting;
            s.channel.clone()
        };
        if !channel.lock().unwrap().is_writing() {
            let fd = channel.lock().unwrap().fd();
            unsafe {
                libc::shutdown(fd, libc::SHUT_WR);
            }
        }
    }

    /// Tear the connection down immediately, discarding any unwritten
    /// output, regardless of what `shutdown` would have waited for. Always
    /// posted via `queue_in_loop`, even when already on the loop thread, so
    /// it never runs underneath the event dispatch that triggered it.
    pub fn force_close(&self) {
        let loop_handle = self.0.lock().unwrap().loop_handle.clone();
        let this = self.clone();
        loop_handle.queue_in_loop(move || this.force_close_in_loop());
    }

    fn force_close_in_loop(&self) {
        let state = self.0.lock().unwrap().state;
        if matches!(state, ConnState::Connected | ConnState::Disconnecting) {
            self.handle_close();
        }
    }

    fn handle_read(&self, receive_time: Instant) {
        let channel = self.0.lock().unwrap().channel.clone();
        let read_result = {
            let mut s = self.0.lock().unwrap();
            let mut ch = channel.lock().unwrap();
            s.input_buf.read_from(ch.source_mut())
        };

        match read_result {
            Ok(0) => self.handle_close(),
            Ok(_n) => {
                let mut buf = std::mem::take(&mut self.0.lock().unwrap().input_buf);
                let mut cb = self.0.lock().unwrap().message_cb.take();
                match &mut cb {
                    Some(f) => f(self, &mut buf, receive_time),
                    None => buf.retrieve_all(),
                }
                let mut s = self.0.lock().unwrap();
                s.input_buf = buf;
                if s.message_cb.is_none() {
                    s.message_cb = cb;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::warn!(error = %e, "connection read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        let channel = self.0.lock().unwrap().channel.clone();
        if !channel.lock().unwrap().is_writing() {
            tracing::debug!("connection is down, no more writing");
            return;
        }

        let remaining = self.0.lock().unwrap().output_buf.peek().to_vec();
        let fd = channel.lock().unwrap().fd();
        match write_nonblocking(fd, &remaining) {
            Ok(n) => {
                let (empty, state) = {
                    let mut s = self.0.lock().unwrap();
                    s.output_buf.retrieve(n);
                    (s.output_buf.readable_bytes() == 0, s.state)
                };
                if empty {
                    Channel::disable_writing(&channel);
                    let has_cb = self.0.lock().unwrap().write_complete_cb.is_some();
                    if has_cb {
                        let this = self.clone();
                        let loop_handle = self.0.lock().unwrap().loop_handle.clone();
                        loop_handle.queue_in_loop(move || this.invoke_write_complete_cb());
                    }
                    if state == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "connection write failed"),
        }
    }

    fn handle_close(&self) {
        let channel = {
            let mut s = self.0.lock().unwrap();
            flux_utils::safe_assert!(
                matches!(s.state, ConnState::Connected | ConnState::Disconnecting),
                "handle_close on state {:?}",
                s.state
            );
            s.state = ConnState::Disconnected;
            s.channel.clone()
        };
        Channel::disable_all(&channel);

        // `self` keeps the connection alive through both callbacks even if
        // the server/client has already forgotten its own reference, the
        // way a shared_ptr capture keeps the original's close handler alive.
        self.invoke_connection_cb();
        self.invoke_close_cb();
    }

    fn handle_error(&self) {
        let fd = self.0.lock().unwrap().channel.lock().unwrap().fd();
        if let Err(e) = socket_error(fd) {
            tracing::error!(error = %e, "tcp connection socket error");
        }
    }

    fn invoke_connection_cb(&self) {
        let mut cb = self.0.lock().unwrap().connection_cb.take();
        if let Some(f) = &mut cb {
            f(self);
        }
        let mut s = self.0.lock().unwrap();
        if s.connection_cb.is_none() {
            s.connection_cb = cb;
        }
    }

    fn invoke_close_cb(&self) {
        let mut cb = self.0.lock().unwrap().close_cb.take();
        if let Some(f) = &mut cb {
            f(self);
        }
        let mut s = self.0.lock().unwrap();
        if s.close_cb.is_none() {
            s.close_cb = cb;
        }
    }

    fn invoke_write_complete_cb(&self) {
        let mut cb = self.0.lock().unwrap().write_complete_cb.take();
        if let Some(f) = &mut cb {
            f(self);
        }
        let mut s = self.0.lock().unwrap();
        if s.write_complete_cb.is_none() {
            s.write_complete_cb = cb;
        }
    }

    fn invoke_high_water_mark_cb(&self, len: usize) {
        let mut cb = self.0.lock().unwrap().high_water_mark_cb.take();
        if let Some(f) = &mut cb {
            f(self, len);
        }
        let mut s = self.0.lock().unwrap();
        if s.high_water_mark_cb.is_none() {
            s.high_water_mark_cb = cb;
        }
    }
}

fn write_nonblocking(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

fn set_keepalive(fd: RawFd, on: bool) {
    let val: libc::c_int = i32::from(on);
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            (&raw const val).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

impl AsRawFd for TcpConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.0.lock().unwrap().channel.lock().unwrap().fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::event_loop::EventLoop;

    /// A connected loopback pair: the first socket is handed to the caller
    /// as an `mio` stream for wrapping in a `TcpConnection`, the second is
    /// kept alive (but never read from) as its silent peer.
    fn connected_pair() -> (TcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        (TcpStream::from_std(client), server)
    }

    #[test]
    fn send_past_high_water_mark_fires_callback_once() {
        let (tx, rx) = mpsc::channel();

        let join = std::thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let handle = event_loop.handle();
            let (mio_stream, _silent_peer) = connected_pair();

            // Shrink the kernel send buffer so a few megabytes actually
            // overflows it instead of draining straight through.
            let fd = mio_stream.as_raw_fd();
            let bufsize: libc::c_int = 1024;
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDBUF,
                    (&raw const bufsize).cast(),
                    size_of::<libc::c_int>() as libc::socklen_t,
                );
            }

            let local = Address::new(mio_stream.local_addr().unwrap());
            let peer = Address::new(mio_stream.peer_addr().unwrap());
            let conn = TcpConnection::new(handle.clone(), "test".to_string(), mio_stream, local, peer);
            conn.connection_established();

            let tx_cb = tx.clone();
            let quit_handle = handle.clone();
            conn.set_high_water_mark_callback(
                move |_c, len| {
                    tx_cb.send(len).ok();
                    quit_handle.quit();
                },
                2048,
            );

            // Safety net in case the callback never fires.
            let fallback_quit = handle.clone();
            handle.run_after(Duration::from_secs(5), move || fallback_quit.quit());

            // Never read by the peer, so most of this has to queue up in
            // the output buffer rather than going straight out the socket.
            let payload = vec![b'x'; 4 * 1024 * 1024];
            conn.send(&payload);

            event_loop.run();
        });

        let crossed_len = rx.recv_timeout(Duration::from_secs(3)).expect("high water mark callback never fired");
        assert!(crossed_len >= 2048, "callback fired with len {crossed_len} below the configured mark");
        join.join().unwrap();
    }
}
