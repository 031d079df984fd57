use std::{
    cell::Cell,
    collections::HashMap,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tracing::{trace, warn};

use crate::{
    codec::{Frame, Status},
    connection::{Connection, ConnectionId},
    controller::Controller,
    message::Message,
    CorrelationId,
};

/// Serves one method.
///
/// Runs on a worker thread. The handler may reply inline or move `done`
/// elsewhere and reply later; dropping `done` without replying answers the
/// caller with a `HandlerFailed` error.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, controller: Controller, request: Bytes, done: Done);
}

impl<F> Handler for F
where
    F: Fn(Controller, Bytes, Done) + Send + Sync + 'static,
{
    fn call(&self, controller: Controller, request: Bytes, done: Done) {
        self(controller, request, done)
    }
}

/// Completion token of an incoming call. Exactly one reply is sent per call.
pub struct Done {
    conn: Connection,
    id: CorrelationId,
    controller: Controller,
    replied: Arc<AtomicBool>,
}

impl Done {
    pub(crate) fn new(
        conn: Connection,
        id: CorrelationId,
        controller: Controller,
        replied: Arc<AtomicBool>,
    ) -> Self {
        Self {
            conn,
            id,
            controller,
            replied,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Send `response`, or a `HandlerFailed` error if the controller was
    /// marked failed.
    pub fn reply(self, response: Bytes) {
        let frame = if self.controller.failed() {
            Frame::error(self.id, Status::HandlerFailed, self.controller.error_text())
        } else {
            Frame::response(self.id, response)
        };
        self.send(frame);
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.respond_error(Status::HandlerFailed, reason);
    }

    pub(crate) fn respond_error(self, status: Status, text: impl Into<String>) {
        let frame = Frame::error(self.id, status, text);
        self.send(frame);
    }

    fn send(&self, frame: Frame) {
        if self.replied.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(
            conn = self.conn.id(),
            correlation_id = self.id,
            status = ?frame.status,
            "reply"
        );
        self.conn.send_frame(frame);
    }
}

thread_local! {
    static DISPATCHING: Cell<Option<(ConnectionId, CorrelationId)>> = const { Cell::new(None) };
}

/// Marks the handler call of `(conn, id)` running on this thread.
pub(crate) struct DispatchScope {
    previous: Option<(ConnectionId, CorrelationId)>,
}

impl DispatchScope {
    pub(crate) fn enter(conn: ConnectionId, id: CorrelationId) -> Self {
        Self {
            previous: DISPATCHING.with(|current| current.replace(Some((conn, id)))),
        }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|current| current.set(self.previous));
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if self.replied.load(Ordering::Acquire) {
            return;
        }
        // unwinding out of its own handler call: the dispatcher answers with the
        // panic message
        if std::thread::panicking()
            && DISPATCHING.with(Cell::get) == Some((self.conn.id(), self.id))
        {
            return;
        }
        warn!(
            conn = self.conn.id(),
            correlation_id = self.id,
            "handler dropped its completion without replying"
        );
        self.send(Frame::error(
            self.id,
            Status::HandlerFailed,
            "handler dropped the call without replying",
        ));
    }
}

/// Typed completion handed to [`Service::unary`] handlers.
pub struct Reply<Resp> {
    done: Done,
    _marker: PhantomData<fn(Resp)>,
}

impl<Resp: Message> Reply<Resp> {
    pub fn controller(&self) -> &Controller {
        self.done.controller()
    }

    pub fn send(self, response: &Resp) {
        match response.encode() {
            Ok(raw) => self.done.reply(raw),
            Err(e) => self.done.respond_error(Status::BadPayload, e.to_string()),
        }
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.done.fail(reason)
    }
}

/// A named group of methods, registered on a connection or server as a unit.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<dyn Handler>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method<H: Handler>(mut self, name: impl Into<String>, handler: H) -> Self {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register a method whose request and response are [`Message`]s.
    ///
    /// A request that fails to decode is answered with a `BadPayload` error
    /// without calling `handler`.
    pub fn unary<Req, Resp, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Controller, Req, Reply<Resp>) + Send + Sync + 'static,
    {
        self.method(
            name,
            move |controller: Controller, raw: Bytes, done: Done| match Req::decode(&raw) {
                Ok(request) => handler(
                    controller,
                    request,
                    Reply {
                        done,
                        _marker: PhantomData,
                    },
                ),
                Err(e) => done.respond_error(Status::BadPayload, e.to_string()),
            },
        )
    }
}

/// Handlers keyed by service name then method name.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, HashMap<String, Arc<dyn Handler>>>,
}

impl ServiceRegistry {
    pub fn register(&mut self, service: Service) {
        let methods = self.services.entry(service.name.clone()).or_default();
        for (method, handler) in service.methods {
            if methods.insert(method.clone(), handler).is_some() {
                warn!("method {}.{method} registered twice, the last one wins", service.name);
            }
        }
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<Arc<dyn Handler>> {
        self.services.get(service)?.get(method).cloned()
    }

    /// Number of registered methods across all services.
    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
