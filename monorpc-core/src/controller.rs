use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    channel::Channel,
    connection::{Connection, WeakConnection},
    error::RpcError,
    CorrelationId,
};

type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

/// Per-call state shared between the caller, the connection and the handler.
///
/// A caller creates one with [`Controller::new`] and passes it to every
/// invoke; an incoming call gets a fresh one bound to the connection it
/// arrived on, usable through [`Controller::as_channel`] for nested calls.
#[derive(Clone, Default)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

#[derive(Default)]
struct ControllerInner {
    canceled: AtomicBool,
    error: Mutex<Option<RpcError>>,
    binding: Mutex<Option<(WeakConnection, CorrelationId)>>,
    channel: Option<Connection>,
    timeout: Mutex<Option<Duration>>,
    on_cancel: Mutex<Vec<CancelCallback>>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inbound(conn: Connection) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                channel: Some(conn),
                ..Default::default()
            }),
        }
    }

    /// Request cancellation of the call.
    ///
    /// Cancellation is advisory: bytes already written are not recalled, but a
    /// call still outstanding resolves with [`RpcError::Cancelled`] and its late
    /// response is dropped.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.inner.on_cancel.lock());
        for callback in callbacks {
            callback();
        }
        let binding = self.inner.binding.lock().take();
        if let Some((conn, id)) = binding {
            if let Some(conn) = conn.upgrade() {
                trace!(conn = conn.id(), correlation_id = id, "cancel outstanding call");
                conn.abort_call(id, RpcError::Cancelled);
            }
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Run `callback` once the call is cancelled, immediately if it already is.
    pub fn notify_on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self.inner.on_cancel.lock();
        if self.is_canceled() {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(Box::new(callback));
    }

    pub fn failed(&self) -> bool {
        self.inner.error.lock().is_some()
    }

    pub fn error(&self) -> Option<RpcError> {
        self.inner.error.lock().clone()
    }

    /// Human readable failure, empty when the call did not fail.
    pub fn error_text(&self) -> String {
        match &*self.inner.error.lock() {
            Some(RpcError::HandlerFailed(reason)) => reason.clone(),
            Some(err) => err.to_string(),
            None => String::new(),
        }
    }

    /// Mark the call failed. On the serving side the reply becomes a
    /// `HandlerFailed` error carrying `reason`.
    pub fn set_failed(&self, reason: impl Into<String>) {
        self.set_error(RpcError::HandlerFailed(reason.into()));
    }

    pub(crate) fn set_error(&self, err: RpcError) {
        *self.inner.error.lock() = Some(err);
    }

    /// Resolve the call with [`RpcError::DeadlineExceeded`] unless a response
    /// arrives within `timeout`. Takes effect on the next invoke.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.lock() = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        *self.inner.timeout.lock()
    }

    /// Clear all per-call state so the controller can drive another call.
    pub fn reset(&self) {
        self.inner.canceled.store(false, Ordering::Release);
        *self.inner.error.lock() = None;
        *self.inner.binding.lock() = None;
        *self.inner.timeout.lock() = None;
        self.inner.on_cancel.lock().clear();
    }

    /// The connection an incoming call arrived on, for nested calls back to
    /// the caller. `None` for caller-side controllers.
    pub fn as_channel(&self) -> Option<Channel> {
        self.inner.channel.clone().map(Channel::from)
    }

    pub(crate) fn bind(&self, conn: WeakConnection, id: CorrelationId) {
        *self.inner.binding.lock() = Some((conn, id));
    }
}
