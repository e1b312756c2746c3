use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::acceptor::Acceptor;
use crate::address::Address;
use crate::buffer::Buffer;
use crate::event_loop::LoopHandle;
use crate::loop_thread_pool::LoopThreadPool;
use crate::tcp_connection::TcpConnection;

type ConnectionCb = Box<dyn FnMut(&TcpConnection) + Send>;
type MessageCb = Box<dyn FnMut(&TcpConnection, &mut Buffer, Instant) + Send>;

/// Accepts inbound connections on one address and spreads them, round-robin,
/// across an I/O thread pool.
///
/// The acceptor itself always runs on the loop `TcpServer` was constructed
/// with; every accepted connection is handed to one of the pool's loops (or
/// back to that same loop, with a zero-size pool). A connection's `close`
/// callback never captures a strong `TcpConnection` reference back into the
/// server — only its name — so a connection that outlives the server's
/// interest in it isn't kept alive by the server's own bookkeeping.
pub struct TcpServer {
    loop_handle: LoopHandle,
    local_addr: Address,
    name: String,
    acceptor: Option<Acceptor>,
    thread_pool: LoopThreadPool,
    connections: Arc<Mutex<HashMap<String, TcpConnection>>>,
    next_conn_id: Arc<AtomicU64>,
    connection_cb: Arc<Mutex<Option<ConnectionCb>>>,
    message_cb: Arc<Mutex<Option<MessageCb>>>,
    started: AtomicBool,
}

impl TcpServer {
    pub fn new(loop_handle: LoopHandle, addr: Address, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            thread_pool: LoopThreadPool::new(loop_handle.clone(), name.clone()),
            loop_handle,
            local_addr: addr,
            name,
            acceptor: None,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            connection_cb: Arc::new(Mutex::new(None)),
            message_cb: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
        }
    }

    /// Must be called before [`TcpServer::start`].
    pub fn set_num_threads(&self, n: usize) {
        self.thread_pool.set_num_threads(n);
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&TcpConnection) + Send + 'static) {
        *self.connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl FnMut(&TcpConnection, &mut Buffer, Instant) + Send + 'static) {
        *self.message_cb.lock().unwrap() = Some(Box::new(cb));
    }

    #[must_use]
    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn start(&mut self) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.thread_pool.start()?;

        let loop_handle = self.loop_handle.clone();
        let thread_pool = self.thread_pool.clone();
        let connections = self.connections.clone();
        let next_conn_id = self.next_conn_id.clone();
        let connection_cb = self.connection_cb.clone();
        let message_cb = self.message_cb.clone();
        let server_name = self.name.clone();

        let acceptor = Acceptor::new(loop_handle.clone(), self.local_addr, move |stream, peer| {
            let io_loop = thread_pool.next_loop();
            let id = next_conn_id.fetch_add(1, Ordering::Relaxed);
            let conn_name = format!("{server_name}-{peer}#{id}");
            let local_addr = stream.local_addr().map(Address::new).unwrap_or(Address::new(peer));

            let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), stream, local_addr, Address::new(peer));

            let connection_cb_for_conn = connection_cb.clone();
            conn.set_connection_callback(move |c| {
                if let Some(f) = connection_cb_for_conn.lock().unwrap().as_mut() {
                    f(c);
                }
            });

            let message_cb_for_conn = message_cb.clone();
            conn.set_message_callback(move |c, buf, t| {
                if let Some(f) = message_cb_for_conn.lock().unwrap().as_mut() {
                    f(c, buf, t);
                }
            });

            let connections_for_close = connections.clone();
            let server_loop_for_close = loop_handle.clone();
            let io_loop_for_close = io_loop.clone();
            let name_for_close = conn_name.clone();
            conn.set_close_callback(move |c| {
                let c = c.clone();
                let connections = connections_for_close.clone();
                let name = name_for_close.clone();
                let io_loop = io_loop_for_close.clone();
                server_loop_for_close.run_in_loop(move || {
                    connections.lock().unwrap().remove(&name);
                    let c = c.clone();
                    io_loop.run_in_loop(move || c.connection_destroyed());
                });
            });

            connections.lock().unwrap().insert(conn_name, conn.clone());
            let established = conn.clone();
            io_loop.run_in_loop(move || established.connection_established());
        })?;
        acceptor.listen();
        if let Ok(bound) = acceptor.local_addr() {
            self.local_addr = Address::new(bound);
        }
        self.acceptor = Some(acceptor);

        tracing::info!(name = %self.name, addr = %self.local_addr, "tcp server listening");
        Ok(())
    }
}
