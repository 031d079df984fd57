//! Echo service exercising calls in both directions.
//!
//! `Echo1` answers the caller and then calls `Echo2` back over the same
//! connection; `Echo2` simply answers. Registering the service on both peers
//! lets either side play either role.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use monorpc_core::{Controller, Reply, Result, Service, Stub};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const SERVICE: &str = "Hello.EchoService2";
pub const ECHO1: &str = "Echo1";
pub const ECHO2: &str = "Echo2";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub question: String,
}

impl EchoRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub text: String,
    pub echoed: i32,
    pub close: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest2 {
    pub question: String,
}

impl EchoRequest2 {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse2 {
    pub text: String,
    pub echoed: i32,
    pub close: bool,
}

type Observer = Box<dyn Fn(bool) + Send + Sync + 'static>;

/// Shared state of the echo service; clones count into the same counters.
#[derive(Clone, Default)]
pub struct EchoService {
    state: Arc<EchoState>,
}

#[derive(Default)]
struct EchoState {
    handled: AtomicUsize,
    called: AtomicUsize,
    nested: AtomicU64,
    observer: Option<Observer>,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// `observer` learns about every finished nested call and whether its
    /// answer matched the question.
    pub fn with_observer<F>(observer: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(EchoState {
                observer: Some(Box::new(observer)),
                ..Default::default()
            }),
        }
    }

    /// `Echo1` calls served.
    pub fn handled(&self) -> usize {
        self.state.handled.load(Ordering::SeqCst)
    }

    /// Nested `Echo2` calls completed.
    pub fn called(&self) -> usize {
        self.state.called.load(Ordering::SeqCst)
    }

    pub fn service(&self) -> Service {
        let echo1 = self.state.clone();
        let echo2 = self.state.clone();
        Service::new(SERVICE)
            .unary(
                ECHO1,
                move |controller: Controller, request: EchoRequest, reply: Reply<EchoResponse>| {
                    echo1.echo1(controller, request, reply)
                },
            )
            .unary(
                ECHO2,
                move |_: Controller, request: EchoRequest2, reply: Reply<EchoResponse2>| {
                    echo2.echo2(request, reply)
                },
            )
    }
}

impl EchoState {
    fn echo1(self: &Arc<Self>, controller: Controller, request: EchoRequest, reply: Reply<EchoResponse>) {
        info!("Echo1 called with {}", request.question);
        self.handled.fetch_add(1, Ordering::SeqCst);
        reply.send(&EchoResponse {
            text: format!("server->{}", request.question),
            echoed: 1,
            close: false,
        });

        let Some(channel) = controller.as_channel() else {
            return;
        };
        let n = self.nested.fetch_add(1, Ordering::SeqCst);
        let question = format!("server question{n}");
        let stub = Stub::new(channel, SERVICE);
        let state = self.clone();
        let expected = format!("client->{question}");
        let issued = stub.call(
            ECHO2,
            &EchoRequest2::new(question.as_str()),
            &Controller::new(),
            move |result: Result<EchoResponse2>| state.echo2_done(&expected, result),
        );
        match issued {
            Ok(id) => debug!(correlation_id = id, "Echo2 request: {question}"),
            Err(e) => {
                warn!("Echo2 request failed: {e}");
                self.notify(false);
            }
        }
    }

    fn echo2(&self, request: EchoRequest2, reply: Reply<EchoResponse2>) {
        let text = format!("client->{}", request.question);
        info!("Echo2 called, response with: {text}");
        reply.send(&EchoResponse2 {
            text,
            echoed: 2,
            close: false,
        });
    }

    fn echo2_done(&self, expected: &str, result: Result<EchoResponse2>) {
        let matched = match result {
            Ok(response) if response.text == expected => true,
            Ok(response) => {
                warn!("Echo2 answered {:?}, expected {expected:?}", response.text);
                false
            }
            Err(e) => {
                warn!("Echo2 failed: {e}");
                false
            }
        };
        let called = self.called.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Echo2 completed: {called}");
        self.notify(matched);
    }

    fn notify(&self, matched: bool) {
        if let Some(observer) = &self.observer {
            observer(matched);
        }
    }
}

#[cfg(test)]
mod tests {
    use monorpc_core::{Message, ServiceRegistry};

    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let response = EchoResponse {
            text: "server->client question".to_string(),
            echoed: 1,
            close: false,
        };
        let raw = response.encode().unwrap();
        assert_eq!(response, EchoResponse::decode(&raw).unwrap());
    }

    #[test]
    fn test_service_methods() {
        let mut registry = ServiceRegistry::default();
        registry.register(EchoService::new().service());
        assert_eq!(2, registry.len());
        assert!(registry.lookup(SERVICE, ECHO1).is_some());
        assert!(registry.lookup(SERVICE, ECHO2).is_some());
    }

    #[test]
    fn test_counters_start_at_zero() {
        let echo = EchoService::new();
        assert_eq!(0, echo.handled());
        assert_eq!(0, echo.called());
    }
}
