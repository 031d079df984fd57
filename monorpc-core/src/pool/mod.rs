//! The two process-scoped pools every connection runs on.
//!
//! [`IoServicePool`] owns the reactor threads that perform socket I/O and
//! frame dispatch. [`ThreadPool`] owns the worker threads that run handlers
//! and completions. Both are started and stopped explicitly and may be
//! shared by any number of connections and servers.

mod io_service_pool;
mod runtime;
mod thread_pool;

pub use io_service_pool::{on_reactor_thread, Attachment, IoServicePool, Reactor};
pub use runtime::RuntimeWrapper;
pub use thread_pool::{Task, ThreadPool};
