use std::{num::NonZeroUsize, path::Path, time::Duration};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::transport::Endpoint;

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: u64 = 16 * 1024 * 1024;
// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const DEFAULT_REACTOR_THREADS: usize = 2;
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 1000;
pub const MIN_SQPOLL_IDLE_TIME: u32 = 1000; // 1s idle time.
pub const FALLBACK_PARALLELISM: NonZeroUsize = match NonZeroUsize::new(1) {
    Some(n) => n,
    None => unreachable!(),
};

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

/// Top level configuration of the `monorpc` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub listener: ListenerConfig,
}

/// Sizing and behaviour of the reactor pool and the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default = "default_reactor_threads")]
    pub reactor_threads: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
    /// Upper bound of queued worker tasks; unbounded when absent.
    pub task_backlog: Option<usize>,
    #[serde(default)]
    pub stop_policy: StopPolicy,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            reactor_threads: default_reactor_threads(),
            worker_threads: default_worker_threads(),
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
            task_backlog: None,
            stop_policy: Default::default(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_threads(reactor_threads: usize, worker_threads: usize) -> Self {
        Self {
            reactor_threads,
            worker_threads,
            ..Default::default()
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

define_const!(default_reactor_threads, DEFAULT_REACTOR_THREADS, usize);
define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);
define_const!(default_drain_timeout_ms, DEFAULT_DRAIN_TIMEOUT_MS, u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

/// What a stopping worker pool does with tasks still queued.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    #[default]
    Drain,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    #[serde(default = "default_connection_name")]
    pub name: String,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: default_connection_name(),
            max_frame_length: default_max_frame_length(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_connection_name() -> String {
    "monorpc".to_string()
}

define_const!(default_max_frame_length, DEFAULT_MAX_FRAME_LENGTH, usize);
define_const!(default_connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS, u64);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ListenerConfig {
    SocketAddress { socket_addr: String },
    Uds { uds_path: String },
}

impl TryFrom<ListenerConfig> for Endpoint {
    type Error = std::io::Error;

    fn try_from(value: ListenerConfig) -> Result<Self, Self::Error> {
        match value {
            ListenerConfig::SocketAddress { socket_addr } => Endpoint::resolve(&socket_addr),
            #[cfg(unix)]
            ListenerConfig::Uds { uds_path } => Ok(Endpoint::Unix(uds_path.into())),
            #[cfg(not(unix))]
            ListenerConfig::Uds { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix domain sockets are not supported on this platform",
            )),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => bail!("Config: error open file {}: {:?}", path.display(), e),
        };
        if size > MAX_CONFIG_FILE_SIZE {
            bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
        }
        Self::from_slice(&std::fs::read(path)?)
    }

    pub fn from_slice(content: &[u8]) -> anyhow::Result<Self> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        match is_json {
            true => serde_json::from_slice::<Self>(content).map_err(Into::into),
            false => toml::from_str::<Self>(&String::from_utf8_lossy(content)).map_err(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_deserialize() {
        const TEST_CONFIG: &str = r#"
            {
                "runtime": { "reactor_threads": 4, "worker_threads": 8, "runtime_type": "legacy" },
                "connection": { "name": "echo" },
                "listener": { "socket_addr": "127.0.0.1:6789" }
            }
        "#;

        let config = Config::from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(4, config.runtime.reactor_threads);
        assert_eq!(8, config.runtime.worker_threads);
        assert_eq!(RuntimeType::Legacy, config.runtime.runtime_type);
        assert_eq!(DEFAULT_ENTRIES, config.runtime.entries);
        assert_eq!("echo", config.connection.name);
        assert_eq!(DEFAULT_MAX_FRAME_LENGTH, config.connection.max_frame_length);
        assert_eq!(
            ListenerConfig::SocketAddress {
                socket_addr: "127.0.0.1:6789".to_string()
            },
            config.listener
        );
    }

    #[test]
    fn test_toml_deserialize() {
        const TEST_CONFIG: &str = "
            listener = { uds_path = '/tmp/monorpc.sock' }

            [runtime]
            worker_threads = 3
            task_backlog = 128
            stop_policy = 'discard'
        ";

        let config = Config::from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(DEFAULT_REACTOR_THREADS, config.runtime.reactor_threads);
        assert_eq!(3, config.runtime.worker_threads);
        assert_eq!(Some(128), config.runtime.task_backlog);
        assert_eq!(StopPolicy::Discard, config.runtime.stop_policy);
        assert_eq!(ConnectionConfig::default(), config.connection);
        assert!(matches!(config.listener, ListenerConfig::Uds { .. }));
    }

    #[test]
    fn test_listener_config_to_endpoint() {
        let endpoint = Endpoint::try_from(ListenerConfig::SocketAddress {
            socket_addr: "127.0.0.1:6789".to_string(),
        })
        .unwrap();
        assert_eq!(
            Endpoint::Tcp("127.0.0.1:6789".parse().unwrap()),
            endpoint
        );
    }
}
