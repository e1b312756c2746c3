//! Single-threaded reactor TCP networking core.
//!
//! One [`EventLoop`] per OS thread multiplexes any number of file
//! descriptors through `epoll` via `mio`; [`Acceptor`] and [`Connector`]
//! bring sockets up, [`TcpConnection`] carries an established one through
//! its read/write/close lifecycle, and [`TcpServer`]/[`TcpClient`] wire the
//! pieces together into the two shapes most callers need: a listener that
//! spreads connections across an I/O thread pool, and a single outbound
//! connection with optional auto-reconnect.
//!
//! Every type anchored to a particular loop - `Channel`, `Connector`,
//! `TcpConnection` - is safe to hand to another thread (they're all
//! `Arc<Mutex<_>>` underneath) but must only be *driven* from its owning
//! loop's thread; doing otherwise aborts the process rather than racing.

mod acceptor;
mod address;
mod buffer;
mod channel;
mod connector;
mod error;
mod event_loop;
mod loop_thread_pool;
mod poller;
mod tcp_client;
mod tcp_connection;
mod tcp_server;
mod timer;

pub use acceptor::Acceptor;
pub use address::Address;
pub use buffer::Buffer;
pub use channel::Readiness;
pub use connector::Connector;
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use loop_thread_pool::LoopThreadPool;
pub use tcp_client::TcpClient;
pub use tcp_connection::TcpConnection;
pub use tcp_server::TcpServer;
pub use timer::TimerId;
