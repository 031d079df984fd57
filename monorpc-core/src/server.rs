//! Accepting side: one accept loop per reactor, every accepted socket
//! becomes a server-role [`Connection`] sharing the server's dispatch table.

use std::{
    collections::HashMap,
    fmt::Display,
    io,
    sync::{Arc, Weak},
};

use futures_channel::oneshot::{self, Receiver as OReceiver, Sender as OSender};
use monoio::io::stream::Stream;
use parking_lot::Mutex;
use service_async::Service as AsyncService;
use tracing::{debug, error, info, warn};

use crate::{
    config::{ConnectionConfig, RuntimeConfig},
    connection::{Connection, ConnectionId, Role, Session},
    error::{Result, RpcError},
    pool::{on_reactor_thread, IoServicePool, Reactor, ThreadPool},
    service::{Service, ServiceRegistry},
    transport::{Endpoint, ListenerBuilder, PeerAddr, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Listening,
    Stopped,
}

pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ConnectionConfig,
    services: Mutex<ServiceRegistry>,
    io_pool: IoServicePool,
    thread_pool: ThreadPool,
    owns_pools: bool,
    state: Mutex<ServerState>,
}

struct ServerState {
    phase: Phase,
    live: HashMap<ConnectionId, Connection>,
    // dropping these stops the accept loops
    stops: Vec<OReceiver<()>>,
    local: Option<Endpoint>,
}

impl Server {
    /// A server owning `reactor_threads` reactors and `worker_threads` workers.
    pub fn new(reactor_threads: usize, worker_threads: usize) -> Self {
        Self::with_config(
            RuntimeConfig::with_threads(reactor_threads, worker_threads),
            ConnectionConfig::default(),
        )
    }

    pub fn with_config(runtime: RuntimeConfig, config: ConnectionConfig) -> Self {
        let io_pool = IoServicePool::with_config(format!("{}-server", config.name), runtime.clone());
        let thread_pool = ThreadPool::with_config(format!("{}-server", config.name), &runtime);
        Self::build(io_pool, thread_pool, config, true)
    }

    /// A server running on shared pools, which [`stop`](Self::stop) leaves running.
    pub fn with_pools(io_pool: IoServicePool, thread_pool: ThreadPool, config: ConnectionConfig) -> Self {
        Self::build(io_pool, thread_pool, config, false)
    }

    fn build(
        io_pool: IoServicePool,
        thread_pool: ThreadPool,
        config: ConnectionConfig,
        owns_pools: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                services: Mutex::new(ServiceRegistry::default()),
                io_pool,
                thread_pool,
                owns_pools,
                state: Mutex::new(ServerState {
                    phase: Phase::Idle,
                    live: HashMap::new(),
                    stops: Vec::new(),
                    local: None,
                }),
            }),
        }
    }

    pub fn register_service(&self, service: Service) -> Result<()> {
        let state = self.inner.state.lock();
        if state.phase == Phase::Listening {
            return Err(RpcError::LateRegistration);
        }
        self.inner.services.lock().register(service);
        Ok(())
    }

    /// Bind `endpoint` and start accepting on every reactor.
    ///
    /// Returns the bound endpoint, which carries the real port when `endpoint`
    /// asked for port 0.
    pub fn listen(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        if on_reactor_thread() {
            return Err(RpcError::BlockingOnReactor);
        }
        let (local, ready) = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Listening {
                return Err(RpcError::AlreadyListening);
            }
            self.inner.thread_pool.start()?;
            self.inner.io_pool.start()?;

            let builder = Arc::new(ListenerBuilder::bind(endpoint)?);
            let local = builder.local_endpoint()?;
            let dispatch = Arc::new(self.inner.services.lock().clone());

            let mut stops = Vec::new();
            let mut ready = Vec::new();
            for reactor in self.inner.io_pool.reactors() {
                let (stop_tx, stop_rx) = oneshot::channel();
                let (ready_tx, ready_rx) = oneshot::channel::<io::Result<()>>();
                let builder = builder.clone();
                let svc = AcceptService {
                    server: Arc::downgrade(&self.inner),
                    reactor: reactor.clone(),
                    dispatch: dispatch.clone(),
                    max_frame_length: self.inner.config.max_frame_length,
                };
                reactor.spawn(move || async move {
                    match builder.build() {
                        Ok(listener) => {
                            let _ = ready_tx.send(Ok(()));
                            serve(listener, svc, stop_tx).await;
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })?;
                stops.push(stop_rx);
                ready.push(ready_rx);
            }
            state.phase = Phase::Listening;
            state.stops = stops;
            state.local = Some(local.clone());
            (local, ready)
        };

        for ready_rx in ready {
            let result = futures::executor::block_on(ready_rx).unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    "reactor stopped before the listener was built",
                ))
            });
            if let Err(e) = result {
                error!("build listener for {local} failed: {e}");
                self.stop();
                return Err(e.into());
            }
        }

        info!(
            "server listening on {local} with {} reactors",
            self.inner.io_pool.size()
        );
        Ok(local)
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.state.lock().local.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.inner.state.lock().phase == Phase::Listening
    }

    /// Number of live accepted connections.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().live.len()
    }

    /// Stop accepting, disconnect every live connection and stop the pools the
    /// server owns. Calling it again does nothing.
    pub fn stop(&self) {
        let (stops, live, local) = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Listening {
                return;
            }
            state.phase = Phase::Stopped;
            (
                std::mem::take(&mut state.stops),
                std::mem::take(&mut state.live),
                state.local.take(),
            )
        };
        drop(stops);
        let count = live.len();
        for conn in live.into_values() {
            conn.disconnect();
        }
        if self.inner.owns_pools {
            self.inner.io_pool.stop();
            self.inner.thread_pool.stop();
        }
        remove_socket_file(local.as_ref());
        match local {
            Some(local) => info!("server on {local} stopped, {count} connections closed"),
            None => info!("server stopped, {count} connections closed"),
        }
    }
}

#[cfg(unix)]
fn remove_socket_file(local: Option<&Endpoint>) {
    if let Some(Endpoint::Unix(path)) = local {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(not(unix))]
fn remove_socket_file(_local: Option<&Endpoint>) {}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerInner {
    /// Track `conn` as live; refused once the server stops listening.
    fn adopt(&self, conn: &Connection) -> bool {
        let mut state = self.state.lock();
        if state.phase != Phase::Listening {
            return false;
        }
        state.live.insert(conn.id(), conn.clone());
        true
    }

    fn forget(&self, id: ConnectionId) {
        self.state.lock().live.remove(&id);
    }

    /// A tracked server-role connection in `Connecting`, or `None` once the
    /// server stops listening.
    fn accept(self: &Arc<Self>, dispatch: Arc<ServiceRegistry>) -> Option<Connection> {
        let conn = Connection::new(
            Role::Server,
            &self.config.name,
            dispatch,
            self.thread_pool.clone(),
        );
        // Connecting before it is tracked, so a concurrent stop tears it down
        // and `Session::open` refuses it
        conn.begin_connect().ok()?;
        if !self.adopt(&conn) {
            conn.abandon_connect();
            return None;
        }
        let weak = Arc::downgrade(self);
        conn.on_close(move |id| {
            if let Some(server) = weak.upgrade() {
                server.forget(id);
            }
        });
        Some(conn)
    }
}

/// Turns an accepted socket into a server-role connection and drives it.
#[derive(Clone)]
struct AcceptService {
    server: Weak<ServerInner>,
    reactor: Reactor,
    dispatch: Arc<ServiceRegistry>,
    max_frame_length: usize,
}

impl AsyncService<(Transport, PeerAddr)> for AcceptService {
    type Response = ();
    type Error = RpcError;

    async fn call(&self, (transport, peer): (Transport, PeerAddr)) -> Result<()> {
        let session = {
            let Some(server) = self.server.upgrade() else {
                return Ok(());
            };
            let Some(conn) = server.accept(self.dispatch.clone()) else {
                debug!("server is stopping, connection from {peer} refused");
                return Ok(());
            };
            match Session::open(&conn, self.reactor.clone(), transport, self.max_frame_length) {
                Some(session) => session,
                None => {
                    server.forget(conn.id());
                    debug!("connection from {peer} closed while being set up");
                    return Ok(());
                }
            }
        };
        info!("accepted connection from {peer}");
        session.run().await;
        Ok(())
    }
}

/// Accept connections from `listener` and hand them to `svc` until `stop`
/// is cancelled or the listener closes.
async fn serve<S, Svc, A, E>(mut listener: S, svc: Svc, mut stop: OSender<()>)
where
    S: Stream<Item = std::result::Result<A, E>> + 'static,
    E: Display,
    Svc: AsyncService<A> + Clone + 'static,
    Svc::Error: Display,
    A: 'static,
{
    let mut cancellation = stop.cancellation();
    loop {
        monoio::select! {
            _ = &mut cancellation => {
                debug!("server is notified to stop");
                break;
            }
            accept_opt = listener.next() => {
                let accept = match accept_opt {
                    Some(accept) => accept,
                    None => {
                        info!("listener is closed, serve stopped");
                        return;
                    }
                };
                match accept {
                    Ok(accept) => {
                        let svc = svc.clone();
                        monoio::spawn(async move {
                            if let Err(e) = svc.call(accept).await {
                                error!("connection error: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("accept connection failed: {e}"),
                }
            }
        }
    }
}
