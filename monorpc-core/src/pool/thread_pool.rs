use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{JoinHandle, ThreadId},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    config::{RuntimeConfig, StopPolicy},
    error::PoolError,
};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads sharing one FIFO queue.
///
/// Handlers and call completions run here, never on a reactor thread.
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    size: usize,
    backlog: Option<usize>,
    stop_policy: StopPolicy,
    queue: Mutex<Queue>,
    available: Condvar,
    workers: Mutex<Workers>,
}

struct Queue {
    tasks: VecDeque<Task>,
    accepting: bool,
    // bumped on every start so workers left over from a previous run exit
    generation: u64,
}

#[derive(Default)]
struct Workers {
    handles: Vec<JoinHandle<()>>,
    ids: Vec<ThreadId>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self::build(name.into(), size, None, StopPolicy::Drain)
    }

    pub fn with_config(name: impl Into<String>, config: &RuntimeConfig) -> Self {
        Self::build(
            name.into(),
            config.worker_threads,
            config.task_backlog,
            config.stop_policy,
        )
    }

    fn build(name: String, size: usize, backlog: Option<usize>, stop_policy: StopPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                size: size.max(1),
                backlog,
                stop_policy,
                queue: Mutex::new(Queue {
                    tasks: VecDeque::new(),
                    accepting: false,
                    generation: 0,
                }),
                available: Condvar::new(),
                workers: Mutex::new(Workers::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Spawn the workers. Calling it on a running pool does nothing.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut workers = self.shared.workers.lock();
        let generation = {
            let mut queue = self.shared.queue.lock();
            if queue.accepting {
                return Ok(());
            }
            queue.accepting = true;
            queue.generation += 1;
            queue.generation
        };

        for index in 0..self.shared.size {
            let shared = self.shared.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-worker-{index}", self.shared.name))
                .spawn(move || shared.work(generation));
            match spawned {
                Ok(handle) => {
                    workers.ids.push(handle.thread().id());
                    workers.handles.push(handle);
                }
                Err(e) => {
                    error!("spawn worker {index} of pool {} failed: {e}", self.shared.name);
                    drop(workers);
                    self.stop();
                    return Err(PoolError::Spawn(Arc::new(e)));
                }
            }
        }
        info!(
            "thread pool {} started with {} workers",
            self.shared.name, self.shared.size
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().accepting
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Queue `task` for execution. Never blocks.
    pub fn push_task<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_push(Box::new(task)).map_err(|(err, _)| err)
    }

    /// Like [`push_task`](Self::push_task) but hands the task back on rejection.
    pub(crate) fn try_push(&self, task: Task) -> Result<(), (PoolError, Task)> {
        let mut queue = self.shared.queue.lock();
        if !queue.accepting {
            return Err((PoolError::NotRunning(self.shared.name.clone()), task));
        }
        if let Some(backlog) = self.shared.backlog {
            if queue.tasks.len() >= backlog {
                return Err((
                    PoolError::QueueFull {
                        name: self.shared.name.clone(),
                        backlog,
                    },
                    task,
                ));
            }
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Stop accepting tasks and join the workers.
    ///
    /// Queued tasks are run or dropped according to the configured
    /// [`StopPolicy`]. A worker calling `stop` on its own pool is not joined.
    pub fn stop(&self) {
        let mut workers = self.shared.workers.lock();
        let discarded = {
            let mut queue = self.shared.queue.lock();
            if !queue.accepting && workers.handles.is_empty() {
                return;
            }
            queue.accepting = false;
            match self.shared.stop_policy {
                StopPolicy::Drain => 0,
                StopPolicy::Discard => {
                    let n = queue.tasks.len();
                    queue.tasks.clear();
                    n
                }
            }
        };
        if discarded > 0 {
            warn!(
                "thread pool {} discarded {discarded} queued tasks",
                self.shared.name
            );
        }
        self.shared.available.notify_all();

        let current = std::thread::current().id();
        let handles = std::mem::take(&mut workers.handles);
        workers.ids.clear();
        drop(workers);
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("worker of pool {} exited abnormally", self.shared.name);
            }
        }
        info!("thread pool {} stopped", self.shared.name);
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn is_worker_thread(&self) -> bool {
        let current = std::thread::current().id();
        self.shared.workers.lock().ids.contains(&current)
    }
}

impl Shared {
    fn work(&self, generation: u64) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                loop {
                    if queue.generation != generation {
                        break None;
                    }
                    if let Some(task) = queue.tasks.pop_front() {
                        break Some(task);
                    }
                    if !queue.accepting {
                        break None;
                    }
                    self.available.wait(&mut queue);
                }
            };
            let Some(task) = task else {
                debug!("worker of pool {} exits", self.name);
                return;
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                error!(
                    "task on pool {} panicked: {}",
                    self.name,
                    crate::util::panic_message(&panic)
                );
            }
        }
    }
}
