use std::{
    cell::Cell,
    collections::HashMap,
    future::Future,
    io,
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use futures::future::LocalBoxFuture;
use futures_channel::{
    mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use futures_util::StreamExt;
use monoio::utils::bind_to_cpu_set;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::RuntimeWrapper;
use crate::{config::RuntimeConfig, error::PoolError};

type ReactorTask = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>;

thread_local! {
    static ON_REACTOR: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is a reactor thread of any pool.
pub fn on_reactor_thread() -> bool {
    ON_REACTOR.with(Cell::get)
}

/// Something bound to a reactor that has to be torn down when the reactor stops.
pub trait Attachment: Send + Sync {
    fn abort(&self);
}

/// Handle to one reactor thread of an [`IoServicePool`].
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

struct ReactorInner {
    index: usize,
    pool: String,
    tasks: UnboundedSender<ReactorTask>,
    attachments: Mutex<HashMap<u64, Weak<dyn Attachment>>>,
}

impl Reactor {
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Run the future built by `f` on this reactor.
    ///
    /// `f` is sent to the reactor thread and called there, so the future
    /// itself does not need to be `Send`.
    pub fn spawn<F, Fut>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let task: ReactorTask = Box::new(move || Box::pin(f()));
        self.inner
            .tasks
            .unbounded_send(task)
            .map_err(|_| PoolError::NotRunning(self.name()))
    }

    pub fn attach(&self, id: u64, attachment: Weak<dyn Attachment>) {
        self.inner.attachments.lock().insert(id, attachment);
    }

    pub fn detach(&self, id: u64) {
        self.inner.attachments.lock().remove(&id);
    }

    pub fn attachments(&self) -> usize {
        self.inner.attachments.lock().len()
    }

    fn name(&self) -> String {
        format!("{}-io-{}", self.inner.pool, self.inner.index)
    }

    fn shutdown(&self) {
        let attached: Vec<_> = self
            .inner
            .attachments
            .lock()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        if !attached.is_empty() {
            debug!("reactor {} aborts {} attachments", self.name(), attached.len());
        }
        for attachment in attached {
            attachment.abort();
        }
        self.inner.tasks.close_channel();
    }
}

/// A set of reactor threads, each driving its own monoio runtime.
///
/// Connections are pinned to one reactor for their whole life. The pool can be
/// shared by several connections and servers; cloning yields another handle.
#[derive(Clone)]
pub struct IoServicePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    config: RuntimeConfig,
    state: Mutex<PoolState>,
    next: AtomicUsize,
}

#[derive(Default)]
struct PoolState {
    reactors: Vec<Reactor>,
    handles: Vec<JoinHandle<()>>,
}

impl IoServicePool {
    pub fn new(name: impl Into<String>, threads: usize) -> Self {
        Self::with_config(name, RuntimeConfig::with_threads(threads, 1))
    }

    pub fn with_config(name: impl Into<String>, mut config: RuntimeConfig) -> Self {
        config.reactor_threads = config.reactor_threads.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                state: Mutex::new(PoolState::default()),
                next: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.config.reactor_threads
    }

    pub fn is_running(&self) -> bool {
        !self.inner.state.lock().reactors.is_empty()
    }

    /// Spawn the reactor threads and wait until every runtime is built.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        if !state.reactors.is_empty() {
            return Ok(());
        }

        let config = &self.inner.config;
        let cores = if config.cpu_affinity {
            std::thread::available_parallelism().ok().map(usize::from)
        } else {
            None
        };

        let mut ready = Vec::with_capacity(config.reactor_threads);
        let mut failure = None;
        for index in 0..config.reactor_threads {
            let (tx, rx) = unbounded();
            let (ready_tx, ready_rx) = oneshot::channel();
            let reactor = Reactor {
                inner: Arc::new(ReactorInner {
                    index,
                    pool: self.inner.name.clone(),
                    tasks: tx,
                    attachments: Mutex::new(HashMap::new()),
                }),
            };
            let thread_config = config.clone();
            let spawned = std::thread::Builder::new()
                .name(reactor.name())
                .spawn(move || run_reactor(index, thread_config, cores, rx, ready_tx));
            match spawned {
                Ok(handle) => {
                    state.handles.push(handle);
                    state.reactors.push(reactor);
                    ready.push(ready_rx);
                }
                Err(e) => {
                    failure = Some(PoolError::Spawn(Arc::new(e)));
                    break;
                }
            }
        }

        for ready_rx in ready {
            let result = match futures::executor::block_on(ready_rx) {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::Other,
                    "reactor thread exited during startup",
                )),
            };
            if let Err(e) = result {
                failure.get_or_insert(PoolError::Runtime(Arc::new(e)));
            }
        }

        if let Some(e) = failure {
            error!("start io service pool {} failed: {e}", self.inner.name);
            let reactors = std::mem::take(&mut state.reactors);
            let handles = std::mem::take(&mut state.handles);
            drop(state);
            reactors.iter().for_each(Reactor::shutdown);
            handles.into_iter().for_each(|h| {
                let _ = h.join();
            });
            return Err(e);
        }

        info!(
            "io service pool {} started with {} reactors ({:?})",
            self.inner.name,
            config.reactor_threads,
            RuntimeWrapper::effective_type(config)
        );
        Ok(())
    }

    /// Pick a reactor round-robin.
    pub fn next_reactor(&self) -> Result<Reactor, PoolError> {
        let state = self.inner.state.lock();
        if state.reactors.is_empty() {
            return Err(PoolError::NotRunning(self.inner.name.clone()));
        }
        let index = self.inner.next.fetch_add(1, Ordering::Relaxed) % state.reactors.len();
        Ok(state.reactors[index].clone())
    }

    pub fn reactors(&self) -> Vec<Reactor> {
        self.inner.state.lock().reactors.clone()
    }

    /// Abort every attachment, close the task queues and join the reactors.
    pub fn stop(&self) {
        let (reactors, handles) = {
            let mut state = self.inner.state.lock();
            (
                std::mem::take(&mut state.reactors),
                std::mem::take(&mut state.handles),
            )
        };
        if reactors.is_empty() && handles.is_empty() {
            return;
        }
        reactors.iter().for_each(Reactor::shutdown);

        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("reactor of pool {} exited abnormally", self.inner.name);
            }
        }
        info!("io service pool {} stopped", self.inner.name);
    }
}

fn run_reactor(
    index: usize,
    config: RuntimeConfig,
    cores: Option<usize>,
    rx: UnboundedReceiver<ReactorTask>,
    ready: oneshot::Sender<io::Result<()>>,
) {
    // bind thread to cpu core
    if let Some(cores) = cores {
        let core = index % cores;
        if let Err(e) = bind_to_cpu_set([core]) {
            warn!("bind reactor {index} to core {core} failed: {e}");
        }
    }

    let mut runtime = match RuntimeWrapper::new(&config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("build runtime for reactor {index} failed: {e}");
            let _ = ready.send(Err(e));
            return;
        }
    };
    ON_REACTOR.with(|on| on.set(true));
    let _ = ready.send(Ok(()));

    runtime.block_on(serve_tasks(rx, config.drain_timeout()));
    debug!("reactor {index} exits");
}

struct LiveGuard(Rc<Cell<usize>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

async fn serve_tasks(mut rx: UnboundedReceiver<ReactorTask>, drain: Duration) {
    let live = Rc::new(Cell::new(0usize));
    while let Some(task) = rx.next().await {
        live.set(live.get() + 1);
        let guard = LiveGuard(live.clone());
        monoio::spawn(async move {
            task().await;
            drop(guard);
        });
    }

    let deadline = Instant::now() + drain;
    while live.get() > 0 {
        if Instant::now() >= deadline {
            warn!("reactor stops with {} tasks still running", live.get());
            break;
        }
        monoio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, mpsc};

    use super::*;
    use crate::config::RuntimeType;

    fn legacy_pool(name: &str, threads: usize) -> IoServicePool {
        IoServicePool::with_config(
            name,
            RuntimeConfig {
                reactor_threads: threads,
                runtime_type: RuntimeType::Legacy,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_spawn_runs_on_reactor() {
        let pool = legacy_pool("spawn", 2);
        pool.start().unwrap();
        let (tx, rx) = mpsc::channel();
        let reactor = pool.next_reactor().unwrap();
        reactor
            .spawn(move || async move {
                monoio::time::sleep(Duration::from_millis(1)).await;
                tx.send((
                    on_reactor_thread(),
                    std::thread::current().name().map(str::to_string),
                ))
                .unwrap();
            })
            .unwrap();
        let (on_reactor, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(on_reactor);
        assert_eq!(Some("spawn-io-0".to_string()), name);
        assert!(!on_reactor_thread());
        pool.stop();
    }

    #[test]
    fn test_next_reactor_round_robin() {
        let pool = legacy_pool("rr", 3);
        assert!(pool.next_reactor().is_err());
        pool.start().unwrap();
        let picked: Vec<_> = (0..6)
            .map(|_| pool.next_reactor().unwrap().index())
            .collect();
        assert_eq!(vec![0, 1, 2, 0, 1, 2], picked);
        pool.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_restartable() {
        let pool = legacy_pool("restart", 1);
        pool.stop();
        pool.start().unwrap();
        pool.start().unwrap();
        assert_eq!(1, pool.reactors().len());
        let reactor = pool.next_reactor().unwrap();
        pool.stop();
        pool.stop();
        assert!(!pool.is_running());
        assert!(reactor.spawn(|| async {}).is_err());

        pool.start().unwrap();
        let (tx, rx) = mpsc::channel();
        pool.next_reactor()
            .unwrap()
            .spawn(move || async move { tx.send(()).unwrap() })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.stop();
    }

    struct Flag(AtomicBool);

    impl Attachment for Flag {
        fn abort(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_aborts_attachments() {
        let pool = legacy_pool("attach", 1);
        pool.start().unwrap();
        let reactor = pool.next_reactor().unwrap();
        let kept = Arc::new(Flag(AtomicBool::new(false)));
        let detached = Arc::new(Flag(AtomicBool::new(false)));
        let kept_dyn: Arc<dyn Attachment> = kept.clone();
        let detached_dyn: Arc<dyn Attachment> = detached.clone();
        reactor.attach(1, Arc::downgrade(&kept_dyn));
        reactor.attach(2, Arc::downgrade(&detached_dyn));
        reactor.detach(2);
        assert_eq!(1, reactor.attachments());
        pool.stop();
        assert!(kept.0.load(Ordering::SeqCst));
        assert!(!detached.0.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_drains_running_tasks() {
        let pool = legacy_pool("drain", 1);
        pool.start().unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        pool.next_reactor()
            .unwrap()
            .spawn(move || async move {
                monoio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        pool.stop();
        assert!(finished.load(Ordering::SeqCst));
    }
}
