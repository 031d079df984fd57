use std::{io, sync::Arc};

use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T> = anyhow::Result<T>;

pub type Result<T> = std::result::Result<T, RpcError>;

/// Every way a call, a connection or a server operation can fail.
///
/// The error is `Clone` so the same value can be kept by a [`Controller`](crate::Controller)
/// and handed to the completion of the call it describes.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("connection is not connected")]
    NotConnected,
    #[error("connection is already connected")]
    AlreadyConnected,
    #[error("server is already listening")]
    AlreadyListening,
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),
    #[error("services must be registered before connect or listen")]
    LateRegistration,
    #[error("call cancelled")]
    Cancelled,
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("unknown method {service}.{method}")]
    UnknownMethod { service: String, method: String },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("handler failed: {0}")]
    HandlerFailed(String),
    #[error("peer overloaded: {0}")]
    Overloaded(String),
    #[error("payload codec error: {0}")]
    Codec(String),
    #[error("blocking wait is not allowed on a reactor thread")]
    BlockingOnReactor,
    #[error("blocking wait is not allowed on a worker that runs its own completion")]
    BlockingOnWorker,
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<io::Error> for RpcError {
    fn from(value: io::Error) -> Self {
        Self::Transport(Arc::new(value))
    }
}

impl RpcError {
    pub(crate) fn timed_out(what: &str) -> Self {
        Self::Transport(Arc::new(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        )))
    }
}

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("pool {0} is not running")]
    NotRunning(String),
    #[error("pool {name} backlog of {backlog} tasks is full")]
    QueueFull { name: String, backlog: usize },
    #[error("spawn pool thread failed: {0}")]
    Spawn(Arc<io::Error>),
    #[error("build reactor runtime failed: {0}")]
    Runtime(Arc<io::Error>),
}
