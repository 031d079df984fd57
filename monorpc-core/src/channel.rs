use std::sync::Arc;

use bytes::Bytes;
use derive_more::{From, Into};
use futures_channel::oneshot;

use crate::{
    connection::Connection,
    controller::Controller,
    error::{Result, RpcError},
    message::{Message, MethodId},
    pool::{on_reactor_thread, ThreadPool},
    CorrelationId,
};

/// Single-use continuation of an outgoing call, run on a worker thread.
pub type Completion = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

/// Anything that can issue calls to a peer.
pub trait RpcChannel: Send + Sync {
    /// Send `request` to `method`.
    ///
    /// On success `done` runs exactly once with the response or the failure of
    /// the call. On error the call was never sent and `done` is dropped unrun.
    fn invoke(
        &self,
        method: MethodId,
        request: Bytes,
        controller: &Controller,
        done: Completion,
    ) -> Result<CorrelationId>;

    /// The worker pool completions of this channel run on, if known.
    fn completion_pool(&self) -> Option<ThreadPool> {
        None
    }
}

impl<T: RpcChannel + ?Sized> RpcChannel for &T {
    fn invoke(
        &self,
        method: MethodId,
        request: Bytes,
        controller: &Controller,
        done: Completion,
    ) -> Result<CorrelationId> {
        (**self).invoke(method, request, controller, done)
    }

    fn completion_pool(&self) -> Option<ThreadPool> {
        (**self).completion_pool()
    }
}

impl<T: RpcChannel + ?Sized> RpcChannel for Arc<T> {
    fn invoke(
        &self,
        method: MethodId,
        request: Bytes,
        controller: &Controller,
        done: Completion,
    ) -> Result<CorrelationId> {
        (**self).invoke(method, request, controller, done)
    }

    fn completion_pool(&self) -> Option<ThreadPool> {
        (**self).completion_pool()
    }
}

/// The connection an incoming call arrived on, as seen by its handler.
#[derive(Clone, From, Into)]
pub struct Channel {
    conn: Connection,
}

impl Channel {
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RpcChannel for Channel {
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

/// Typed client of one service over any [`RpcChannel`].
pub struct Stub<C> {
    channel: C,
    service: String,
}

impl<C: RpcChannel> Stub<C> {
    pub fn new(channel: C, service: impl Into<String>) -> Self {
        Self {
            channel,
            service: service.into(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Issue a call; `done` receives the decoded response on a worker thread.
    pub fn call<Req, Resp, F>(
        &self,
        method: &str,
        request: &Req,
        controller: &Controller,
        done: F,
    ) -> Result<CorrelationId>
    where
        Req: Message,
        Resp: Message,
        F: FnOnce(Result<Resp>) + Send + 'static,
    {
        let payload = match request.encode() {
            Ok(payload) => payload,
            Err(e) => {
                controller.set_error(e.clone());
                return Err(e);
            }
        };
        let call_controller = controller.clone();
        self.channel.invoke(
            MethodId::new(self.service.as_str(), method),
            payload,
            controller,
            Box::new(move |result| {
                let response = result.and_then(|raw| Resp::decode(&raw));
                if let Err(e) = &response {
                    call_controller.set_error(e.clone());
                }
                done(response)
            }),
        )
    }

    /// Issue a call and wait for its outcome.
    ///
    /// Refused on reactor threads, whose blocking would stall every connection
    /// they drive, and on workers of the pool the completion would run on,
    /// which could wait for a free worker forever. A handler calling back
    /// over its own connection uses [`call`](Self::call) instead.
    pub fn call_blocking<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        controller: &Controller,
    ) -> Result<Resp>
    where
        Req: Message,
        Resp: Message,
    {
        if on_reactor_thread() {
            return Err(RpcError::BlockingOnReactor);
        }
        if let Some(pool) = self.channel.completion_pool() {
            if pool.is_worker_thread() {
                return Err(RpcError::BlockingOnWorker);
            }
        }
        let (tx, rx) = oneshot::channel();
        self.call(method, request, controller, move |result: Result<Resp>| {
            let _ = tx.send(result);
        })?;
        futures::executor::block_on(rx).unwrap_or(Err(RpcError::ConnectionClosed))
    }
}
