//! The bidirectional connection: correlation, dispatch and teardown.
//!
//! Both roles share [`Connection`]. Either side may call the other: request
//! frames are looked up in the dispatch table and run on the worker pool,
//! response frames are matched against the outstanding calls by correlation
//! id. Socket I/O lives in [`io`], the client-side connect logic in
//! [`client`].

use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use futures_channel::{mpsc::UnboundedSender, oneshot::Sender as OSender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::{
    channel::{Completion, RpcChannel},
    codec::{Frame, FrameKind, Status},
    controller::Controller,
    error::{Result, RpcError},
    message::MethodId,
    pool::{on_reactor_thread, Attachment, Reactor, Task, ThreadPool},
    service::{DispatchScope, Done, Handler, Service, ServiceRegistry},
    util::{panic_message, Latch},
};

mod client;
mod io;

pub use client::ClientConnection;
pub(crate) use io::Session;

pub type CorrelationId = u64;
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

type CloseHook = Box<dyn FnOnce(ConnectionId) + Send + 'static>;

/// How teardown hands the completions of outstanding calls to the worker pool.
#[derive(Debug, Clone, Copy)]
enum Settle {
    /// Queue them and return.
    Queue,
    /// Queue them and wait until they have run.
    Wait,
}

/// One end of a persistent connection.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    role: Role,
    name: RwLock<Arc<str>>,
    // lock order: state, then pending
    state: Mutex<ConnState>,
    next_call: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
    // handlers registered so far, snapshotted into `dispatch` on connect
    services: Mutex<Arc<ServiceRegistry>>,
    dispatch: RwLock<Option<Arc<ServiceRegistry>>>,
    thread_pool: RwLock<ThreadPool>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

struct ConnState {
    lifecycle: ConnectionState,
    link: Option<Link>,
}

/// What a connected connection holds on its reactor.
pub(crate) struct Link {
    pub(crate) outbound: UnboundedSender<Frame>,
    pub(crate) close: Option<OSender<()>>,
    pub(crate) reactor: Reactor,
}

struct PendingCall {
    completion: Completion,
    method: MethodId,
    controller: Controller,
}

/// Non-owning handle, kept by controllers of outgoing calls.
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    pub(crate) fn new(
        role: Role,
        name: &str,
        services: Arc<ServiceRegistry>,
        thread_pool: ThreadPool,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                role,
                name: RwLock::new(Arc::from(name)),
                state: Mutex::new(ConnState {
                    lifecycle: ConnectionState::Disconnected,
                    link: None,
                }),
                next_call: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                services: Mutex::new(services),
                dispatch: RwLock::new(None),
                thread_pool: RwLock::new(thread_pool),
                close_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn name(&self) -> Arc<str> {
        self.inner.name.read().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.inner.name.write() = Arc::from(name);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().lifecycle
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of calls issued on this connection still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Add `service` to the dispatch table. Only allowed while disconnected.
    pub fn register_service(&self, service: Service) -> Result<()> {
        let state = self.inner.state.lock();
        if state.lifecycle != ConnectionState::Disconnected {
            return Err(RpcError::LateRegistration);
        }
        let mut services = self.inner.services.lock();
        Arc::make_mut(&mut services).register(service);
        Ok(())
    }

    pub fn thread_pool(&self) -> ThreadPool {
        self.inner.thread_pool.read().clone()
    }

    pub(crate) fn set_thread_pool(&self, pool: ThreadPool) -> Result<()> {
        let state = self.inner.state.lock();
        if state.lifecycle != ConnectionState::Disconnected {
            return Err(RpcError::AlreadyConnected);
        }
        *self.inner.thread_pool.write() = pool;
        Ok(())
    }

    /// Tear the connection down. Outstanding calls resolve with
    /// `ConnectionClosed`, or `Cancelled` when their controller was cancelled.
    ///
    /// Returns once their completions have run, except on a reactor thread,
    /// where they are only queued.
    pub fn disconnect(&self) {
        let settle = if on_reactor_thread() {
            Settle::Queue
        } else {
            Settle::Wait
        };
        self.inner.teardown("disconnect requested", RpcError::ConnectionClosed, settle);
    }

    /// Issue a call. See [`RpcChannel::invoke`].
    pub fn invoke(
        &self,
        method: MethodId,
        request: Bytes,
        controller: &Controller,
        done: Completion,
    ) -> Result<CorrelationId> {
        if controller.is_canceled() {
            return Err(RpcError::Cancelled);
        }
        let state = self.inner.state.lock();
        let link = match &state.link {
            Some(link) if state.lifecycle == ConnectionState::Connected => link,
            _ => {
                controller.set_error(RpcError::NotConnected);
                return Err(RpcError::NotConnected);
            }
        };

        let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        trace!(conn = self.inner.id, correlation_id = id, %method, "invoke");
        let frame = Frame::request(id, method.clone(), request);
        self.inner.pending.lock().insert(
            id,
            PendingCall {
                completion: done,
                method,
                controller: controller.clone(),
            },
        );
        controller.bind(WeakConnection(Arc::downgrade(&self.inner)), id);
        if controller.is_canceled() {
            // cancelled concurrently; if cancel already resolved the call, report it sent
            return match self.inner.pending.lock().remove(&id) {
                Some(_) => Err(RpcError::Cancelled),
                None => Ok(id),
            };
        }

        if link.outbound.unbounded_send(frame).is_err() {
            self.inner.pending.lock().remove(&id);
            controller.set_error(RpcError::ConnectionClosed);
            return Err(RpcError::ConnectionClosed);
        }

        if let Some(timeout) = controller.timeout() {
            let weak = Arc::downgrade(&self.inner);
            let scheduled = link.reactor.spawn(move || async move {
                monoio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    if inner.abort_call(id, RpcError::DeadlineExceeded) {
                        debug!(conn = inner.id, correlation_id = id, "call deadline exceeded");
                    }
                }
            });
            if let Err(e) = scheduled {
                warn!(conn = self.inner.id, correlation_id = id, "schedule deadline failed: {e}");
            }
        }
        Ok(id)
    }

    /// Resolve outstanding call `id` with `err`. Returns whether it was still
    /// outstanding.
    pub(crate) fn abort_call(&self, id: CorrelationId, err: RpcError) -> bool {
        self.inner.abort_call(id, err)
    }

    pub(crate) fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(ConnectionId) + Send + 'static,
    {
        self.inner.close_hooks.lock().push(Box::new(hook));
    }

    pub(crate) fn begin_connect(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.lifecycle {
            ConnectionState::Disconnected => {
                state.lifecycle = ConnectionState::Connecting;
                Ok(())
            }
            _ => Err(RpcError::AlreadyConnected),
        }
    }

    pub(crate) fn abandon_connect(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == ConnectionState::Connecting {
            state.lifecycle = ConnectionState::Disconnected;
        }
    }

    /// Move to `Connected` over `link`. Fails when the connection was torn
    /// down while the transport was being set up.
    pub(crate) fn establish(&self, link: Link) -> bool {
        let mut state = self.inner.state.lock();
        if state.lifecycle != ConnectionState::Connecting {
            return false;
        }
        let services = self.inner.services.lock().clone();
        debug!(
            conn = self.inner.id,
            methods = services.len(),
            reactor = link.reactor.index(),
            "connection established"
        );
        *self.inner.dispatch.write() = Some(services);
        let strong: Arc<dyn Attachment> = self.inner.clone();
        link.reactor.attach(self.inner.id, Arc::downgrade(&strong));
        state.link = Some(link);
        state.lifecycle = ConnectionState::Connected;
        true
    }

    pub(crate) fn teardown(&self, reason: &str) {
        self.inner.teardown(reason, RpcError::ConnectionClosed, Settle::Queue)
    }

    /// Tear down after the peer sent an unreadable frame; outstanding calls
    /// resolve with `MalformedFrame`.
    pub(crate) fn teardown_malformed(&self, detail: String) {
        self.inner.teardown(
            "malformed frame",
            RpcError::MalformedFrame(detail),
            Settle::Queue,
        )
    }

    /// Queue `frame` to the writer; dropped when the connection is gone.
    pub(crate) fn send_frame(&self, frame: Frame) {
        let state = self.inner.state.lock();
        let sent = match &state.link {
            Some(link) => link.outbound.unbounded_send(frame).is_ok(),
            None => false,
        };
        if !sent {
            debug!(conn = self.inner.id, "connection gone, frame dropped");
        }
    }

    /// Dispatch one frame read from the transport. Runs on the reactor.
    pub(crate) fn on_frame(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Request => self.on_request(frame),
            FrameKind::Response => self.on_response(frame),
        }
    }

    /// A frame the writer could not encode; nothing of it reached the wire.
    pub(crate) fn on_unsendable(&self, kind: FrameKind, id: CorrelationId, reason: String) {
        warn!(conn = self.inner.id, correlation_id = id, "frame not sent: {reason}");
        match kind {
            FrameKind::Request => {
                self.inner.abort_call(id, RpcError::Codec(reason));
            }
            FrameKind::Response => {
                self.send_frame(Frame::error(id, Status::BadPayload, reason));
            }
        }
    }

    fn on_request(&self, frame: Frame) {
        let id = frame.correlation_id;
        let Some(method) = frame.method else {
            return;
        };
        let handler = self
            .inner
            .dispatch
            .read()
            .as_ref()
            .and_then(|dispatch| dispatch.lookup(&method.service, &method.method));
        let Some(handler) = handler else {
            debug!(conn = self.inner.id, correlation_id = id, %method, "unknown method");
            self.send_frame(Frame::error(
                id,
                Status::UnknownMethod,
                format!("unknown method {method}"),
            ));
            return;
        };
        trace!(conn = self.inner.id, correlation_id = id, %method, "dispatch request");

        let conn = self.clone();
        let payload = frame.payload;
        let task = Box::new(move || run_handler(conn, handler, id, method, payload));
        let pool = self.thread_pool();
        if let Err((e, _task)) = pool.try_push(task) {
            warn!(conn = self.inner.id, correlation_id = id, "reject request: {e}");
            self.send_frame(Frame::error(id, Status::Overloaded, e.to_string()));
        }
    }

    fn on_response(&self, frame: Frame) {
        let id = frame.correlation_id;
        let Some(call) = self.inner.pending.lock().remove(&id) else {
            debug!(conn = self.inner.id, correlation_id = id, "late response dropped");
            return;
        };
        let result = match frame.status {
            Status::Ok => Ok(frame.payload),
            Status::UnknownMethod => Err(RpcError::UnknownMethod {
                service: call.method.service.clone(),
                method: call.method.method.clone(),
            }),
            Status::HandlerFailed => Err(RpcError::HandlerFailed(frame.error_text())),
            Status::Overloaded => Err(RpcError::Overloaded(frame.error_text())),
            Status::BadPayload => Err(RpcError::Codec(frame.error_text())),
        };
        trace!(conn = self.inner.id, correlation_id = id, status = ?frame.status, "response");
        self.inner.complete(call, result, None);
    }
}

fn run_handler(
    conn: Connection,
    handler: Arc<dyn Handler>,
    id: CorrelationId,
    method: MethodId,
    payload: Bytes,
) {
    let controller = Controller::inbound(conn.clone());
    let replied = Arc::new(AtomicBool::new(false));
    let done = Done::new(conn.clone(), id, controller.clone(), replied.clone());
    let _scope = DispatchScope::enter(conn.id(), id);
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.call(controller, payload, done))) {
        let message = panic_message(&panic);
        error!(conn = conn.id(), correlation_id = id, %method, "handler panicked: {message}");
        if !replied.swap(true, Ordering::AcqRel) {
            conn.send_frame(Frame::error(id, Status::HandlerFailed, message));
        }
    }
}

impl ConnectionInner {
    fn abort_call(&self, id: CorrelationId, err: RpcError) -> bool {
        let call = self.pending.lock().remove(&id);
        match call {
            Some(call) => {
                self.complete(call, Err(err), None);
                true
            }
            None => false,
        }
    }

    /// Run the completion of `call` on the worker pool. With `latch`, the
    /// completion holds a token of it until it has run.
    fn complete(&self, call: PendingCall, result: Result<Bytes>, latch: Option<&Latch>) {
        let PendingCall {
            completion,
            controller,
            ..
        } = call;
        if let Err(e) = &result {
            controller.set_error(e.clone());
        }
        let pool = self.thread_pool.read().clone();
        if latch.is_some() && pool.is_worker_thread() {
            // waiting on our own pool could starve it
            self.run_inline(Box::new(move || completion(result)));
            return;
        }
        let token = latch.map(Latch::token);
        let task = Box::new(move || {
            completion(result);
            drop(token);
        });
        if let Err((e, task)) = pool.try_push(task) {
            // the call must still resolve exactly once
            warn!(conn = self.id, "completion runs inline: {e}");
            self.run_inline(task);
        }
    }

    fn run_inline(&self, task: Task) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
            error!(conn = self.id, "completion panicked: {}", panic_message(&panic));
        }
    }

    fn teardown(&self, reason: &str, cause: RpcError, settle: Settle) {
        let link = {
            let mut state = self.state.lock();
            match state.lifecycle {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => return,
                ConnectionState::Connecting | ConnectionState::Connected => {}
            }
            state.lifecycle = ConnectionState::Disconnecting;
            state.link.take()
        };
        if let Some(mut link) = link {
            if let Some(close) = link.close.take() {
                let _ = close.send(());
            }
            link.outbound.close_channel();
            link.reactor.detach(self.id);
        }

        let calls: Vec<_> = self.pending.lock().drain().map(|(_, call)| call).collect();
        let outstanding = calls.len();
        let latch = match settle {
            Settle::Wait => Some(Latch::default()),
            Settle::Queue => None,
        };
        for call in calls {
            let err = if call.controller.is_canceled() {
                RpcError::Cancelled
            } else {
                cause.clone()
            };
            self.complete(call, Err(err), latch.as_ref());
        }
        *self.dispatch.write() = None;
        self.state.lock().lifecycle = ConnectionState::Disconnected;
        info!(
            conn = self.id,
            name = %self.name.read(),
            role = ?self.role,
            outstanding,
            "connection closed: {reason}"
        );

        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            hook(self.id);
        }
        if let Some(latch) = latch {
            latch.wait();
        }
    }
}

impl Attachment for ConnectionInner {
    fn abort(&self) {
        self.teardown("reactor stopped", RpcError::ConnectionClosed, Settle::Queue);
    }
}

impl RpcChannel for Connection {
    fn invoke(
        &self,
        method: MethodId,
        request: Bytes,
        controller: &Controller,
        done: Completion,
    ) -> Result<CorrelationId> {
        Connection::invoke(self, method, request, controller, done)
    }

    fn completion_pool(&self) -> Option<ThreadPool> {
        Some(self.thread_pool())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::*;

    fn detached(pool: &ThreadPool) -> Connection {
        Connection::new(
            Role::Client,
            "test",
            Arc::new(ServiceRegistry::default()),
            pool.clone(),
        )
    }

    #[test]
    fn test_invoke_when_disconnected() {
        let pool = ThreadPool::new("invoke", 1);
        let conn = detached(&pool);
        let controller = Controller::new();
        let (tx, rx) = mpsc::channel::<()>();
        let err = conn
            .invoke(
                MethodId::new("S", "m"),
                Bytes::new(),
                &controller,
                Box::new(move |_| tx.send(()).unwrap()),
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::NotConnected));
        assert!(matches!(controller.error(), Some(RpcError::NotConnected)));
        assert_eq!(0, conn.pending_calls());
        // the completion was dropped, never run
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_registration_lifecycle() {
        let pool = ThreadPool::new("register", 1);
        let conn = detached(&pool);
        conn.register_service(Service::new("S").method("m", |_: Controller, _: Bytes, _: Done| {}))
            .unwrap();
        conn.begin_connect().unwrap();
        assert!(matches!(conn.begin_connect(), Err(RpcError::AlreadyConnected)));
        assert!(matches!(
            conn.register_service(Service::new("T")),
            Err(RpcError::LateRegistration)
        ));
        conn.abandon_connect();
        assert_eq!(ConnectionState::Disconnected, conn.state());
        conn.register_service(Service::new("T")).unwrap();
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let pool = ThreadPool::new("idempotent", 1);
        let conn = detached(&pool);
        let (tx, rx) = mpsc::channel();
        conn.on_close(move |id| tx.send(id).unwrap());
        conn.disconnect();
        conn.disconnect();
        assert_eq!(ConnectionState::Disconnected, conn.state());
        // never connected, so nothing was torn down
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_frame_resolves_outstanding() {
        use futures_channel::mpsc::unbounded;

        use crate::{
            config::{RuntimeConfig, RuntimeType},
            pool::IoServicePool,
        };

        let io_pool = IoServicePool::with_config(
            "malformed",
            RuntimeConfig {
                runtime_type: RuntimeType::Legacy,
                ..RuntimeConfig::with_threads(1, 1)
            },
        );
        io_pool.start().unwrap();
        let pool = ThreadPool::new("malformed", 1);
        pool.start().unwrap();
        let conn = detached(&pool);

        let (outbound, mut written) = unbounded();
        conn.begin_connect().unwrap();
        assert!(conn.establish(Link {
            outbound,
            close: None,
            reactor: io_pool.next_reactor().unwrap(),
        }));
        assert!(conn.is_connected());

        let (tx, rx) = mpsc::channel();
        let id = conn
            .invoke(
                MethodId::new("S", "m"),
                Bytes::from_static(b"ping"),
                &Controller::new(),
                Box::new(move |result| tx.send(result).unwrap()),
            )
            .unwrap();
        let frame = written.try_next().unwrap().unwrap();
        assert_eq!(id, frame.correlation_id);
        assert_eq!(1, conn.pending_calls());

        conn.teardown_malformed("bad kind".to_string());
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(RpcError::MalformedFrame(_))
        ));
        assert_eq!(ConnectionState::Disconnected, conn.state());
        assert_eq!(0, conn.pending_calls());
        pool.stop();
        io_pool.stop();
    }

    #[test]
    fn test_reactor_stop_aborts_attached_connection() {
        use futures_channel::mpsc::unbounded;

        use crate::{
            config::{RuntimeConfig, RuntimeType},
            pool::IoServicePool,
        };

        let io_pool = IoServicePool::with_config(
            "abort",
            RuntimeConfig {
                runtime_type: RuntimeType::Legacy,
                ..RuntimeConfig::with_threads(1, 1)
            },
        );
        io_pool.start().unwrap();
        let pool = ThreadPool::new("abort", 1);
        pool.start().unwrap();
        let conn = detached(&pool);

        let reactor = io_pool.next_reactor().unwrap();
        let (outbound, _written) = unbounded();
        conn.begin_connect().unwrap();
        assert!(conn.establish(Link {
            outbound,
            close: None,
            reactor: reactor.clone(),
        }));
        assert_eq!(1, reactor.attachments());

        let (tx, rx) = mpsc::channel();
        conn.invoke(
            MethodId::new("S", "m"),
            Bytes::new(),
            &Controller::new(),
            Box::new(move |result| tx.send(result).unwrap()),
        )
        .unwrap();

        io_pool.stop();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(RpcError::ConnectionClosed)
        ));
        assert_eq!(ConnectionState::Disconnected, conn.state());
        pool.stop();
    }

    #[test]
    fn test_name() {
        let pool = ThreadPool::new("name", 1);
        let conn = detached(&pool);
        assert_eq!("test", &*conn.name());
        conn.set_name("renamed");
        assert_eq!("renamed", &*conn.name());
        assert_eq!(Role::Client, conn.role());
    }
}
