use std::{future::Future, io};

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};
#[cfg(target_os = "linux")]
use tracing::warn;

#[cfg(target_os = "linux")]
use crate::config::MIN_SQPOLL_IDLE_TIME;
use crate::config::{RuntimeConfig, RuntimeType};

/// The monoio runtime driving one reactor thread.
pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl RuntimeWrapper {
    /// Build the runtime selected by `config`.
    ///
    /// io_uring is used only when requested and supported by the kernel; a
    /// ring that cannot be set up (locked memory limits, seccomp) degrades to
    /// the legacy driver.
    pub fn new(config: &RuntimeConfig) -> io::Result<Self> {
        match Self::effective_type(config) {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => match uring_runtime(config) {
                Ok(runtime) => Ok(Self::IoUring(runtime)),
                Err(e) => {
                    warn!("io_uring unavailable, using the legacy driver: {e}");
                    legacy_runtime().map(Self::Legacy)
                }
            },
            RuntimeType::Legacy => legacy_runtime().map(Self::Legacy),
        }
    }

    /// The driver [`new`](Self::new) tries first for `config`.
    pub fn effective_type(config: &RuntimeConfig) -> RuntimeType {
        match config.runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring if monoio::utils::detect_uring() => RuntimeType::IoUring,
            _ => RuntimeType::Legacy,
        }
    }

    /// The driver actually running.
    pub fn runtime_type(&self) -> RuntimeType {
        match self {
            #[cfg(target_os = "linux")]
            Self::IoUring(_) => RuntimeType::IoUring,
            Self::Legacy(_) => RuntimeType::Legacy,
        }
    }

    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        match self {
            #[cfg(target_os = "linux")]
            Self::IoUring(runtime) => runtime.block_on(future),
            Self::Legacy(runtime) => runtime.block_on(future),
        }
    }
}

#[cfg(target_os = "linux")]
fn uring_runtime(config: &RuntimeConfig) -> io::Result<Runtime<TimeDriver<IoUringDriver>>> {
    let mut builder = RuntimeBuilder::<IoUringDriver>::new().with_entries(config.entries);
    if let Some(idle) = config.sqpoll_idle {
        let mut ring = io_uring::IoUring::builder();
        ring.setup_sqpoll(idle.max(MIN_SQPOLL_IDLE_TIME));
        builder = builder.uring_builder(ring);
    }
    builder.enable_timer().build()
}

fn legacy_runtime() -> io::Result<Runtime<TimeDriver<LegacyDriver>>> {
    RuntimeBuilder::<LegacyDriver>::new().enable_timer().build()
}
