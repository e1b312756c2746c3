use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::address::Address;
use crate::buffer::Buffer;
use crate::connector::Connector;
use crate::event_loop::LoopHandle;
use crate::tcp_connection::TcpConnection;

type ConnectionCb = Box<dyn FnMut(&TcpConnection) + Send>;
type MessageCb = Box<dyn FnMut(&TcpConnection, &mut Buffer, Instant) + Send>;

/// Dials a single remote address and keeps at most one live connection at a
/// time, optionally reconnecting (with the same exponential backoff a
/// [`Connector`] applies to its first attempt) whenever that connection
/// closes.
///
/// Unlike the original, dropping a `TcpClient` does not pin a live connection
/// alive for a second past its owner's lifetime. `Drop` cancels any pending
/// retry and force-closes whatever connection is live, so teardown is
/// immediate and doesn't depend on another iteration of the event loop
/// outliving the client.
pub struct TcpClient {
    loop_handle: LoopHandle,
    name: String,
    connector: Connector,
    connection: Arc<Mutex<Option<TcpConnection>>>,
    retry: Arc<AtomicBool>,
    wants_connect: Arc<AtomicBool>,
    connection_cb: Arc<Mutex<Option<ConnectionCb>>>,
    message_cb: Arc<Mutex<Option<MessageCb>>>,
}

impl TcpClient {
    #[must_use]
    pub fn new(loop_handle: LoopHandle, server_addr: Address, name: impl Into<String>) -> Self {
        let name = name.into();
        let connection: Arc<Mutex<Option<TcpConnection>>> = Arc::new(Mutex::new(None));
        let connection_cb: Arc<Mutex<Option<ConnectionCb>>> = Arc::new(Mutex::new(None));
        let message_cb: Arc<Mutex<Option<MessageCb>>> = Arc::new(Mutex::new(None));
        let retry = Arc::new(AtomicBool::new(false));
        let wants_connect = Arc::new(AtomicBool::new(false));
        let next_conn_id = Arc::new(AtomicU64::new(1));
        // The on-connected closure below needs to call back into the
        // `Connector` that will own it, which doesn't exist yet; filled in
        // immediately after `Connector::new` returns, well before any
        // connection attempt could complete and invoke the closure.
        let connector_cell: Arc<Mutex<Option<Connector>>> = Arc::new(Mutex::new(None));

        let conn_slot = connection.clone();
        let connection_cb_outer = connection_cb.clone();
        let message_cb_outer = message_cb.clone();
        let retry_flag = retry.clone();
        let wants_connect_flag = wants_connect.clone();
        let client_name = name.clone();
        let client_loop = loop_handle.clone();

        // `Connector::new` takes this closure once and reuses it for every
        // successful dial, including ones fired by an automatic reconnect.
        let connector = Connector::new(loop_handle.clone(), server_addr, move |stream| {
            let this_loop = client_loop.clone();
            let peer = stream.peer_addr().unwrap_or_else(|_| server_addr.socket_addr());
            let local = stream.local_addr().map(Address::new).unwrap_or_else(|_| Address::new(peer));
            let id = next_conn_id.fetch_add(1, Ordering::Relaxed);
            let conn_name = format!("{client_name}-{peer}#{id}");

            let conn = TcpConnection::new(this_loop.clone(), conn_name, stream, local, Address::new(peer));

            let connection_cb_for_conn = connection_cb_outer.clone();
            conn.set_connection_callback(move |c| {
                if let Some(f) = connection_cb_for_conn.lock().unwrap().as_mut() {
                    f(c);
                }
            });

            let message_cb_for_conn = message_cb_outer.clone();
            conn.set_message_callback(move |c, buf, t| {
                if let Some(f) = message_cb_for_conn.lock().unwrap().as_mut() {
                    f(c, buf, t);
                }
            });

            let conn_slot_for_close = conn_slot.clone();
            let retry_for_close = retry_flag.clone();
            let wants_connect_for_close = wants_connect_flag.clone();
            let io_loop_for_close = this_loop.clone();
            let connector_for_close = connector_cell.clone();
            conn.set_close_callback(move |c| {
                *conn_slot_for_close.lock().unwrap() = None;
                let c = c.clone();
                io_loop_for_close.run_in_loop(move || c.connection_destroyed());

                if retry_for_close.load(Ordering::Relaxed) && wants_connect_for_close.load(Ordering::Relaxed) {
                    if let Some(connector) = connector_for_close.lock().unwrap().as_ref() {
                        connector.restart();
                    }
                }
            });

            *conn_slot.lock().unwrap() = Some(conn.clone());
            let established = conn.clone();
            this_loop.run_in_loop(move || established.connection_established());
        });
        *connector_cell.lock().unwrap() = Some(connector.clone());

        Self { loop_handle, name, connector, connection, retry, wants_connect, connection_cb, message_cb }
    }

    #[must_use]
    pub fn loop_handle(&self) -> LoopHandle {
        self.loop_handle.clone()
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&TcpConnection) + Send + 'static) {
        *self.connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl FnMut(&TcpConnection, &mut Buffer, Instant) + Send + 'static) {
        *self.message_cb.lock().unwrap() = Some(Box::new(cb));
    }

    /// Reconnect automatically (with backoff) whenever the live connection
    /// closes, as long as [`TcpClient::connect`] hasn't been followed by
    /// [`TcpClient::disconnect`] or [`TcpClient::stop`] in the meantime.
    pub fn enable_retry(&self, on: bool) {
        self.retry.store(on, Ordering::Relaxed);
    }

    pub fn connect(&self) {
        self.wants_connect.store(true, Ordering::Relaxed);
        self.connector.start();
        tracing::info!(name = %self.name, "tcp client connecting");
    }

    /// Half-close the live connection, if any. Leaves auto-retry armed; call
    /// [`TcpClient::stop`] to also give up on reconnecting.
    pub fn disconnect(&self) {
        if let Some(conn) = self.connection.lock().unwrap().clone() {
            conn.shutdown();
        }
    }

    pub fn stop(&self) {
        self.wants_connect.store(false, Ordering::Relaxed);
        self.connector.stop();
    }

    #[must_use]
    pub fn connection(&self) -> Option<TcpConnection> {
        self.connection.lock().unwrap().clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.lock().unwrap().as_ref().is_some_and(TcpConnection::connected)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.wants_connect.store(false, Ordering::Relaxed);
        self.connector.stop();
        if let Some(conn) = self.connection.lock().unwrap().take() {
            conn.force_close();
        }
    }
}
