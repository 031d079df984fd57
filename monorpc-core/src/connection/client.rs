use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use futures_channel::oneshot;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::{Connection, ConnectionState, CorrelationId, Role, Session};
use crate::{
    channel::{Completion, RpcChannel},
    config::{ConnectionConfig, RuntimeConfig},
    controller::Controller,
    error::{Result, RpcError},
    message::MethodId,
    pool::{on_reactor_thread, IoServicePool, ThreadPool},
    service::{Service, ServiceRegistry},
    transport::{Endpoint, Transport},
};

/// The dialing side of a connection.
///
/// Owns a reactor pool and a worker pool unless shared ones are supplied
/// with [`set_io_service_pool`](Self::set_io_service_pool) and
/// [`set_thread_pool`](Self::set_thread_pool) before connecting. Owned pools
/// are stopped when the client is dropped.
pub struct ClientConnection {
    conn: Connection,
    endpoint: Endpoint,
    config: ConnectionConfig,
    io_pool: RwLock<IoServicePool>,
    owns_io_pool: AtomicBool,
    owns_thread_pool: AtomicBool,
}

impl ClientConnection {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, RuntimeConfig::default(), ConnectionConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, runtime: RuntimeConfig, config: ConnectionConfig) -> Self {
        let io_pool = IoServicePool::with_config(config.name.as_str(), runtime.clone());
        let thread_pool = ThreadPool::with_config(config.name.as_str(), &runtime);
        Self {
            conn: Connection::new(
                Role::Client,
                &config.name,
                Arc::new(ServiceRegistry::default()),
                thread_pool,
            ),
            endpoint,
            config,
            io_pool: RwLock::new(io_pool),
            owns_io_pool: AtomicBool::new(true),
            owns_thread_pool: AtomicBool::new(true),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn name(&self) -> Arc<str> {
        self.conn.name()
    }

    pub fn set_name(&self, name: &str) {
        self.conn.set_name(name)
    }

    /// Run handlers and completions on a shared worker pool. Before connect only.
    pub fn set_thread_pool(&self, pool: ThreadPool) -> Result<()> {
        let previous = self.conn.thread_pool();
        self.conn.set_thread_pool(pool)?;
        if self.owns_thread_pool.swap(false, Ordering::AcqRel) {
            previous.stop();
        }
        Ok(())
    }

    /// Run I/O on a shared reactor pool. Before connect only.
    pub fn set_io_service_pool(&self, pool: IoServicePool) -> Result<()> {
        if self.conn.state() != ConnectionState::Disconnected {
            return Err(RpcError::AlreadyConnected);
        }
        let previous = std::mem::replace(&mut *self.io_pool.write(), pool);
        if self.owns_io_pool.swap(false, Ordering::AcqRel) {
            previous.stop();
        }
        Ok(())
    }

    pub fn register_service(&self, service: Service) -> Result<()> {
        self.conn.register_service(service)
    }

    /// Establish the transport. Blocks until connected or failed.
    pub fn connect(&self) -> Result<()> {
        if on_reactor_thread() {
            return Err(RpcError::BlockingOnReactor);
        }
        self.conn.begin_connect()?;
        match self.dial() {
            Ok(()) => {
                info!(conn = self.conn.id(), name = %self.conn.name(), "connected to {}", self.endpoint);
                Ok(())
            }
            Err(e) => {
                warn!(conn = self.conn.id(), "connect to {} failed: {e}", self.endpoint);
                self.conn.abandon_connect();
                Err(e)
            }
        }
    }

    fn dial(&self) -> Result<()> {
        self.conn.thread_pool().start()?;
        let io_pool = self.io_pool.read().clone();
        io_pool.start()?;
        let reactor = io_pool.next_reactor()?;

        let (tx, rx) = oneshot::channel::<Result<()>>();
        let conn = self.conn.clone();
        let endpoint = self.endpoint.clone();
        let connect_timeout = self.config.connect_timeout();
        let max_frame_length = self.config.max_frame_length;
        let session_reactor = reactor.clone();
        reactor.spawn(move || async move {
            let transport =
                match monoio::time::timeout(connect_timeout, Transport::connect(&endpoint)).await {
                    Ok(Ok(transport)) => transport,
                    Ok(Err(e)) => {
                        let _ = tx.send(Err(e.into()));
                        return;
                    }
                    Err(_) => {
                        let _ = tx.send(Err(RpcError::timed_out("connect")));
                        return;
                    }
                };
            match Session::open(&conn, session_reactor, transport, max_frame_length) {
                Some(session) => {
                    let _ = tx.send(Ok(()));
                    session.run().await;
                }
                None => {
                    let _ = tx.send(Err(RpcError::ConnectionClosed));
                }
            }
        })?;
        futures::executor::block_on(rx).unwrap_or(Err(RpcError::ConnectionClosed))
    }

    pub fn disconnect(&self) {
        self.conn.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn pending_calls(&self) -> usize {
        self.conn.pending_calls()
    }
}

impl RpcChannel for ClientConnection {
    fn invoke(
        &self,
        method: MethodId,
        request: Bytes,
        controller: &Controller,
        done: Completion,
    ) -> Result<CorrelationId> {
        self.conn.invoke(method, request, controller, done)
    }

    fn completion_pool(&self) -> Option<ThreadPool> {
        Some(self.conn.thread_pool())
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.conn.disconnect();
        if self.owns_io_pool.load(Ordering::Acquire) {
            self.io_pool.read().stop();
        }
        if self.owns_thread_pool.load(Ordering::Acquire) {
            self.conn.thread_pool().stop();
        }
    }
}
