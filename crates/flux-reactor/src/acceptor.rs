use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};

use crate::address::Address;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;

/// Listens on one address and hands accepted sockets to a callback.
///
/// Holds a spare `/dev/null` descriptor so that hitting the process file
/// descriptor limit (`EMFILE`) during `accept` doesn't leave the listening
/// socket permanently readable-but-unable-to-accept: the idle descriptor is
/// closed to free a slot, the pending connection is accepted and
/// immediately dropped, and a fresh idle descriptor is opened to keep the
/// reserve in place for next time.
pub struct Acceptor {
    channel: Arc<Mutex<Channel<TcpListener>>>,
    idle_fd: Arc<Mutex<RawFd>>,
}

impl Acceptor {
    pub fn new(
        loop_handle: LoopHandle,
        addr: Address,
        mut on_new_connection: impl FnMut(TcpStream, SocketAddr) + Send + 'static,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr.socket_addr())?;
        let idle_fd = Arc::new(Mutex::new(open_dev_null()));
        let channel = Channel::new(loop_handle, listener);

        let channel_for_cb = channel.clone();
        let idle_fd_for_cb = idle_fd.clone();
        channel.lock().unwrap().set_read_callback(move |_now| {
            let accept_result = { channel_for_cb.lock().unwrap().source_mut().accept() };
            match accept_result {
                Ok((stream, peer)) => on_new_connection(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    recover_from_emfile(&channel_for_cb, &idle_fd_for_cb);
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        });

        Ok(Self { channel, idle_fd })
    }

    pub fn listen(&self) {
        Channel::enable_reading(&self.channel);
    }

    #[must_use]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.channel.lock().unwrap().source().local_addr()
    }
}

fn recover_from_emfile(channel: &Arc<Mutex<Channel<TcpListener>>>, idle_fd: &Arc<Mutex<RawFd>>) {
    let mut idle = idle_fd.lock().unwrap();
    if *idle >= 0 {
        unsafe {
            libc::close(*idle);
        }
    }

    let listener_fd = channel.lock().unwrap().fd();
    let accepted = unsafe {
        let mut addr: libc::sockaddr_storage = std::mem::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        libc::accept(listener_fd, (&raw mut addr).cast(), &raw mut len)
    };
    if accepted >= 0 {
        unsafe {
            libc::close(accepted);
        }
    }

    *idle = open_dev_null();
    tracing::warn!("accept failed with EMFILE; dropped a pending connection to recover a file descriptor");
}

fn open_dev_null() -> RawFd {
    unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        Channel::remove(&self.channel);
        let fd = *self.idle_fd.lock().unwrap();
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
