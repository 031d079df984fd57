use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use monorpc_core::{
    config::{ConnectionConfig, RuntimeConfig, RuntimeType},
    ClientConnection, Controller, Done, Endpoint, IoServicePool, MethodId, Reply, Result,
    RpcChannel, RpcError, Server, Service, Stub, ThreadPool,
};
use monorpc_services::echo::{
    EchoRequest, EchoRequest2, EchoResponse, EchoResponse2, EchoService, ECHO1, ECHO2, SERVICE,
};

const TIMEOUT: Duration = Duration::from_secs(10);
const PARKING: &str = "Parking";

type Parked = Arc<Mutex<Vec<Done>>>;

fn runtime(reactor_threads: usize, worker_threads: usize) -> RuntimeConfig {
    RuntimeConfig {
        runtime_type: RuntimeType::Legacy,
        ..RuntimeConfig::with_threads(reactor_threads, worker_threads)
    }
}

fn observed_echo() -> (EchoService, mpsc::Receiver<bool>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let echo = EchoService::with_observer(move |matched| {
        let _ = tx.lock().unwrap().send(matched);
    });
    (echo, rx)
}

fn start_server(services: Vec<Service>) -> (Server, Endpoint) {
    let server = Server::with_config(runtime(2, 2), ConnectionConfig::named("Server"));
    for service in services {
        server.register_service(service).unwrap();
    }
    let endpoint = server
        .listen(&Endpoint::tcp("127.0.0.1", 0).unwrap())
        .unwrap();
    (server, endpoint)
}

fn new_client(endpoint: &Endpoint) -> ClientConnection {
    let client = ClientConnection::with_config(
        endpoint.clone(),
        runtime(1, 2),
        ConnectionConfig::named("Client"),
    );
    client.register_service(EchoService::new().service()).unwrap();
    client
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn parking_service(parked: Parked) -> Service {
    Service::new(PARKING)
        .method("Park", move |_: Controller, _: Bytes, done: Done| {
            parked.lock().unwrap().push(done)
        })
        .method("Panic", |_: Controller, _: Bytes, _: Done| {
            panic!("handler exploded");
        })
        .method("Drop", |_: Controller, _: Bytes, done: Done| drop(done))
        .method("Deferred", |_: Controller, _: Bytes, done: Done| {
            thread::spawn(move || {
                let _done = done;
                panic!("deferred reply exploded");
            });
        })
        .method("Fail", |controller: Controller, _: Bytes, done: Done| {
            controller.set_failed("nope");
            done.reply(Bytes::from_static(b"ignored"));
        })
}

/// Answers `Ask` from the completion of a nested `Echo2` call to the caller.
fn relay_service() -> Service {
    Service::new("Relay")
        .unary(
            "Ask",
            |controller: Controller, request: EchoRequest, reply: Reply<EchoResponse>| {
                let Some(channel) = controller.as_channel() else {
                    reply.fail("no channel");
                    return;
                };
                // on error the completion is dropped with `reply`, which
                // answers HandlerFailed
                let _ = Stub::new(channel, SERVICE).call(
                    ECHO2,
                    &EchoRequest2::new(request.question),
                    &Controller::new(),
                    move |result: Result<EchoResponse2>| match result {
                        Ok(nested) => reply.send(&EchoResponse {
                            text: nested.text,
                            echoed: nested.echoed,
                            close: false,
                        }),
                        Err(e) => reply.fail(e.to_string()),
                    },
                );
            },
        )
        .unary(
            "AskBlocking",
            |controller: Controller, request: EchoRequest, reply: Reply<EchoResponse>| {
                let Some(channel) = controller.as_channel() else {
                    reply.fail("no channel");
                    return;
                };
                let nested: Result<EchoResponse2> = Stub::new(channel, SERVICE).call_blocking(
                    ECHO2,
                    &EchoRequest2::new(request.question),
                    &Controller::new(),
                );
                match nested {
                    Ok(nested) => reply.send(&EchoResponse {
                        text: nested.text,
                        echoed: nested.echoed,
                        close: false,
                    }),
                    Err(e) => reply.fail(e.to_string()),
                }
            },
        )
}

fn call_raw(
    client: &ClientConnection,
    service: &str,
    method: &str,
    payload: Bytes,
    controller: &Controller,
) -> mpsc::Receiver<Result<Bytes>> {
    let (tx, rx) = mpsc::channel();
    client
        .invoke(
            MethodId::new(service, method),
            payload,
            controller,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    rx
}

#[test]
fn test_echo_with_nested_call() {
    let (echo, observations) = observed_echo();
    let (_server, endpoint) = start_server(vec![echo.service()]);
    let client = new_client(&endpoint);
    client.connect().unwrap();
    assert!(client.is_connected());

    let stub = Stub::new(&client, SERVICE);
    let response: EchoResponse = stub
        .call_blocking(ECHO1, &EchoRequest::new("client question"), &Controller::new())
        .unwrap();
    assert_eq!("server->client question", response.text);
    assert_eq!(1, response.echoed);
    assert!(!response.close);

    assert_eq!(Ok(true), observations.recv_timeout(TIMEOUT));
    assert_eq!(1, echo.handled());
    assert_eq!(1, echo.called());
}

#[test]
fn test_concurrent_callers() {
    let (echo, observations) = observed_echo();
    let (_server, endpoint) = start_server(vec![echo.service()]);
    let client = Arc::new(new_client(&endpoint));
    client.connect().unwrap();

    let callers: Vec<_> = (0..4)
        .map(|i| {
            let client = client.clone();
            thread::spawn(move || {
                let question = format!("client question{i}");
                let response: EchoResponse = Stub::new(client, SERVICE)
                    .call_blocking(ECHO1, &EchoRequest::new(question.as_str()), &Controller::new())
                    .unwrap();
                assert_eq!(format!("server->{question}"), response.text);
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    for _ in 0..4 {
        assert_eq!(Ok(true), observations.recv_timeout(TIMEOUT));
    }
    assert_eq!(4, echo.handled());
    assert_eq!(4, echo.called());
}

#[test]
fn test_shared_pools() {
    let (echo, observations) = observed_echo();
    let (_server, endpoint) = start_server(vec![echo.service()]);

    let pool = ThreadPool::new("Test", 4);
    let io_pool = IoServicePool::with_config("TestIO", runtime(2, 4));
    pool.start().unwrap();

    let clients: Vec<Arc<ClientConnection>> = (0..4)
        .map(|_| {
            let client = new_client(&endpoint);
            client.set_thread_pool(pool.clone()).unwrap();
            client.set_io_service_pool(io_pool.clone()).unwrap();
            client.connect().unwrap();
            Arc::new(client)
        })
        .collect();

    let (tx, rx) = mpsc::channel::<Result<bool>>();
    for (i, client) in clients.iter().enumerate() {
        for j in 0..4 {
            let client = client.clone();
            let tx = tx.clone();
            pool.push_task(move || {
                let question = format!("client{i} question{j}");
                let expected = format!("server->{question}");
                let failed = tx.clone();
                let issued = Stub::new(client, SERVICE).call(
                    ECHO1,
                    &EchoRequest::new(question),
                    &Controller::new(),
                    move |result: Result<EchoResponse>| {
                        let _ = tx.send(result.map(|response| response.text == expected));
                    },
                );
                if let Err(e) = issued {
                    let _ = failed.send(Err(e));
                }
            })
            .unwrap();
        }
    }

    for _ in 0..16 {
        assert!(matches!(rx.recv_timeout(TIMEOUT), Ok(Ok(true))));
    }
    for _ in 0..16 {
        assert_eq!(Ok(true), observations.recv_timeout(TIMEOUT));
    }
    assert_eq!(16, echo.handled());
    assert_eq!(16, echo.called());

    for client in &clients {
        client.disconnect();
        assert!(!client.is_connected());
        assert_eq!(0, client.pending_calls());
    }
    drop(clients);
    pool.stop();
    io_pool.stop();
    assert!(!pool.is_running());
    assert!(!io_pool.is_running());
}

#[test]
fn test_unknown_method() {
    let (_server, endpoint) = start_server(vec![EchoService::new().service()]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let controller = Controller::new();
    let result: Result<EchoResponse> =
        Stub::new(&client, "Nope").call_blocking("Missing", &EchoRequest::new("?"), &controller);
    match result {
        Err(RpcError::UnknownMethod { service, method }) => {
            assert_eq!("Nope", service);
            assert_eq!("Missing", method);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(controller.failed());

    // the connection survives
    let response: EchoResponse = Stub::new(&client, SERVICE)
        .call_blocking(ECHO1, &EchoRequest::new("again"), &Controller::new())
        .unwrap();
    assert_eq!("server->again", response.text);
}

#[test]
fn test_disconnect_resolves_outstanding_calls() {
    let parked = Parked::default();
    let (_server, endpoint) = start_server(vec![parking_service(parked.clone())]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let controller = Controller::new();
    let results: Vec<_> = (0..5)
        .map(|_| call_raw(&client, PARKING, "Park", Bytes::new(), &controller))
        .collect();
    assert!(wait_until(|| parked.lock().unwrap().len() == 5));
    assert_eq!(5, client.pending_calls());

    client.disconnect();
    client.disconnect();
    for rx in results {
        assert!(matches!(
            rx.recv_timeout(TIMEOUT),
            Ok(Err(RpcError::ConnectionClosed))
        ));
    }
    assert_eq!(0, client.pending_calls());
    assert!(!client.is_connected());
}

#[test]
fn test_cancel_outstanding_call() {
    let parked = Parked::default();
    let (_server, endpoint) = start_server(vec![parking_service(parked.clone())]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let controller = Controller::new();
    let rx = call_raw(&client, PARKING, "Park", Bytes::new(), &controller);
    assert!(wait_until(|| parked.lock().unwrap().len() == 1));

    controller.cancel();
    assert!(matches!(rx.recv_timeout(TIMEOUT), Ok(Err(RpcError::Cancelled))));
    assert!(controller.is_canceled());
    assert_eq!(0, client.pending_calls());

    // the late reply is dropped
    parked.lock().unwrap().pop().unwrap().reply(Bytes::new());
    assert!(client.is_connected());

    // a cancelled controller is refused until reset
    let refused = client.invoke(
        MethodId::new(PARKING, "Park"),
        Bytes::new(),
        &controller,
        Box::new(|_| {}),
    );
    assert!(matches!(refused, Err(RpcError::Cancelled)));
    controller.reset();
    assert!(!controller.is_canceled());
}

#[test]
fn test_deadline_exceeded() {
    let parked = Parked::default();
    let (_server, endpoint) = start_server(vec![parking_service(parked.clone())]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let controller = Controller::new();
    controller.set_timeout(Duration::from_millis(100));
    let rx = call_raw(&client, PARKING, "Park", Bytes::new(), &controller);
    assert!(matches!(
        rx.recv_timeout(TIMEOUT),
        Ok(Err(RpcError::DeadlineExceeded))
    ));
    assert!(matches!(controller.error(), Some(RpcError::DeadlineExceeded)));
    assert_eq!(0, client.pending_calls());
}

#[test]
fn test_handler_failures() {
    let (_server, endpoint) = start_server(vec![
        parking_service(Parked::default()),
        EchoService::new().service(),
    ]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let rx = call_raw(&client, PARKING, "Panic", Bytes::new(), &Controller::new());
    match rx.recv_timeout(TIMEOUT) {
        Ok(Err(RpcError::HandlerFailed(reason))) => assert!(reason.contains("handler exploded")),
        other => panic!("unexpected {other:?}"),
    }

    let rx = call_raw(&client, PARKING, "Drop", Bytes::new(), &Controller::new());
    assert!(matches!(
        rx.recv_timeout(TIMEOUT),
        Ok(Err(RpcError::HandlerFailed(_)))
    ));

    let controller = Controller::new();
    let rx = call_raw(&client, PARKING, "Fail", Bytes::new(), &controller);
    match rx.recv_timeout(TIMEOUT) {
        Ok(Err(RpcError::HandlerFailed(reason))) => assert_eq!("nope", reason),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!("nope", controller.error_text());

    let rx = call_raw(
        &client,
        SERVICE,
        ECHO1,
        Bytes::from_static(b"not json"),
        &Controller::new(),
    );
    assert!(matches!(rx.recv_timeout(TIMEOUT), Ok(Err(RpcError::Codec(_)))));

    assert!(client.is_connected());
}

#[test]
fn test_overloaded_worker_pool() {
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock().unwrap();

    let server = Server::with_config(
        RuntimeConfig {
            task_backlog: Some(1),
            ..runtime(1, 1)
        },
        ConnectionConfig::named("Server"),
    );
    let blocker = gate.clone();
    server
        .register_service(Service::new("Slow").method(
            "Wait",
            move |_: Controller, _: Bytes, done: Done| {
                drop(blocker.lock());
                done.reply(Bytes::new());
            },
        ))
        .unwrap();
    let endpoint = server
        .listen(&Endpoint::tcp("127.0.0.1", 0).unwrap())
        .unwrap();
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let calls: Vec<_> = (0..3)
        .map(|_| call_raw(&client, "Slow", "Wait", Bytes::new(), &Controller::new()))
        .collect();

    // the first request is always queued, a later one finds the backlog full
    assert!(matches!(
        calls[2].recv_timeout(TIMEOUT),
        Ok(Err(RpcError::Overloaded(_)))
    ));
    drop(held);

    assert!(matches!(calls[0].recv_timeout(TIMEOUT), Ok(Ok(_))));
    assert!(calls[1].recv_timeout(TIMEOUT).is_ok());
}

#[test]
fn test_not_connected() {
    let endpoint = Endpoint::tcp("127.0.0.1", 1).unwrap();
    let client = new_client(&endpoint);
    let controller = Controller::new();
    let result: Result<EchoResponse> =
        Stub::new(&client, SERVICE).call_blocking(ECHO1, &EchoRequest::new("hi"), &controller);
    assert!(matches!(result, Err(RpcError::NotConnected)));
    assert!(matches!(controller.error(), Some(RpcError::NotConnected)));
    assert_eq!(0, client.pending_calls());
}

#[test]
fn test_connect_refused() {
    let (server, endpoint) = start_server(Vec::new());
    server.stop();

    let client = new_client(&endpoint);
    assert!(matches!(client.connect(), Err(RpcError::Transport(_))));
    assert!(!client.is_connected());
}

#[test]
fn test_late_registration() {
    let (server, endpoint) = start_server(vec![EchoService::new().service()]);
    assert!(matches!(
        server.register_service(parking_service(Parked::default())),
        Err(RpcError::LateRegistration)
    ));

    let client = new_client(&endpoint);
    client.connect().unwrap();
    assert!(matches!(
        client.register_service(parking_service(Parked::default())),
        Err(RpcError::LateRegistration)
    ));
    assert!(matches!(client.connect(), Err(RpcError::AlreadyConnected)));
    assert!(matches!(
        client.set_thread_pool(ThreadPool::new("late", 1)),
        Err(RpcError::AlreadyConnected)
    ));
}

#[test]
fn test_reconnect() {
    let (_server, endpoint) = start_server(vec![EchoService::new().service()]);
    let client = new_client(&endpoint);
    let stub = Stub::new(&client, SERVICE);

    for round in 0..2 {
        client.connect().unwrap();
        let question = format!("round{round}");
        let response: EchoResponse = stub
            .call_blocking(ECHO1, &EchoRequest::new(question.as_str()), &Controller::new())
            .unwrap();
        assert_eq!(format!("server->{question}"), response.text);
        client.disconnect();
        assert!(!client.is_connected());
    }
}

#[test]
fn test_server_lifecycle() {
    let (server, endpoint) = start_server(vec![EchoService::new().service()]);
    assert!(server.is_listening());
    assert_eq!(Some(endpoint.clone()), server.local_endpoint());
    assert!(matches!(
        server.listen(&endpoint),
        Err(RpcError::AlreadyListening)
    ));

    let client = new_client(&endpoint);
    client.connect().unwrap();
    assert!(wait_until(|| server.connection_count() == 1));

    server.stop();
    server.stop();
    assert!(!server.is_listening());
    assert_eq!(0, server.connection_count());
    assert!(wait_until(|| !client.is_connected()));
}

#[cfg(unix)]
#[test]
fn test_unix_socket() {
    let path = std::env::temp_dir().join(format!("monorpc-test-{}.sock", std::process::id()));
    let server = Server::with_config(runtime(1, 2), ConnectionConfig::named("Server"));
    server.register_service(EchoService::new().service()).unwrap();
    let endpoint = server.listen(&Endpoint::Unix(path.clone())).unwrap();
    assert!(path.exists());

    let client = new_client(&endpoint);
    client.connect().unwrap();
    let response: EchoResponse = Stub::new(&client, SERVICE)
        .call_blocking(ECHO1, &EchoRequest::new("over uds"), &Controller::new())
        .unwrap();
    assert_eq!("server->over uds", response.text);

    drop(client);
    server.stop();
    assert!(!path.exists());
}

#[test]
fn test_nested_call_before_reply() {
    let (_server, endpoint) = start_server(vec![relay_service()]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    for i in 0..3 {
        let question = format!("q{i}");
        let response: EchoResponse = Stub::new(&client, "Relay")
            .call_blocking("Ask", &EchoRequest::new(question.as_str()), &Controller::new())
            .unwrap();
        assert_eq!(format!("client->{question}"), response.text);
        assert_eq!(2, response.echoed);
    }
    assert_eq!(0, client.pending_calls());
}

#[test]
fn test_blocking_call_refused_on_own_worker() {
    let (_server, endpoint) = start_server(vec![relay_service()]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let result: Result<EchoResponse> = Stub::new(&client, "Relay").call_blocking(
        "AskBlocking",
        &EchoRequest::new("q"),
        &Controller::new(),
    );
    match result {
        Err(RpcError::HandlerFailed(reason)) => {
            assert_eq!(RpcError::BlockingOnWorker.to_string(), reason)
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_deferred_reply_panicking_elsewhere() {
    let (_server, endpoint) = start_server(vec![parking_service(Parked::default())]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let rx = call_raw(&client, PARKING, "Deferred", Bytes::new(), &Controller::new());
    assert!(matches!(
        rx.recv_timeout(TIMEOUT),
        Ok(Err(RpcError::HandlerFailed(_)))
    ));
    assert_eq!(0, client.pending_calls());
    assert!(client.is_connected());
}

#[test]
fn test_disconnect_waits_for_completions() {
    let parked = Parked::default();
    let (_server, endpoint) = start_server(vec![parking_service(parked.clone())]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let finished = finished.clone();
        client
            .invoke(
                MethodId::new(PARKING, "Park"),
                Bytes::new(),
                &Controller::new(),
                Box::new(move |result| {
                    if matches!(result, Err(RpcError::ConnectionClosed)) {
                        thread::sleep(Duration::from_millis(20));
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
    }
    assert!(wait_until(|| parked.lock().unwrap().len() == 8));

    client.disconnect();
    assert_eq!(8, finished.load(Ordering::SeqCst));
}

#[test]
fn test_unsendable_request_keeps_connection_usable() {
    let (_server, endpoint) = start_server(vec![EchoService::new().service()]);
    let client = new_client(&endpoint);
    client.connect().unwrap();

    let long = "s".repeat(70_000);
    let rx = call_raw(
        &client,
        &long,
        ECHO1,
        Bytes::from_static(b"{}"),
        &Controller::new(),
    );
    assert!(matches!(rx.recv_timeout(TIMEOUT), Ok(Err(RpcError::Codec(_)))));

    let response: EchoResponse = Stub::new(&client, SERVICE)
        .call_blocking(ECHO1, &EchoRequest::new("after"), &Controller::new())
        .unwrap();
    assert_eq!("server->after", response.text);
    assert!(client.is_connected());
}
