use thiserror::Error;

/// Errors surfaced by the public API.
///
/// Contract violations (wrong-thread channel mutation, double `EventLoop`
/// construction on one thread, destroying an `Added` channel) are not part
/// of this enum: per the spec's error taxonomy those abort the process
/// (`flux_utils::safe_panic!`/`std::process::abort`), they are programmer
/// errors and not something a caller can recover from.
#[derive(Error, Debug)]
pub enum Error {
    #[error("fatal init failure: {0}")]
    FatalInit(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("connect to {addr} abandoned: {source}")]
    ConnectAbandoned { addr: std::net::SocketAddr, source: std::io::Error },

    #[error("address {0:?} could not be parsed")]
    BadAddress(String),
}

pub type Result<T> = std::result::Result<T, Error>;
