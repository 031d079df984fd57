//! Bidirectional RPC over one persistent connection.
//!
//! Either peer of a connection may call the other, and a handler may call
//! back over the connection its request arrived on before replying. Socket
//! I/O runs on the reactors of an [`IoServicePool`]; handlers and call
//! completions run on a [`ThreadPool`].

mod error;
pub use error::{AnyError, AnyResult, PoolError, Result, RpcError};

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod controller;
pub mod message;
pub mod pool;
pub mod server;
pub mod service;
pub mod transport;
pub mod util;

pub use channel::{Channel, Completion, RpcChannel, Stub};
pub use connection::{
    ClientConnection, Connection, ConnectionId, ConnectionState, CorrelationId, Role,
};
pub use controller::Controller;
pub use message::{Message, MethodId};
pub use pool::{IoServicePool, ThreadPool};
pub use server::Server;
pub use service::{Done, Handler, Reply, Service, ServiceRegistry};
pub use transport::Endpoint;
