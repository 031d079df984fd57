use std::{
    fmt, io,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};
#[cfg(unix)]
use std::path::{Path, PathBuf};

use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{stream::Stream, AsyncReadRent, AsyncWriteRent, Split},
    net::{TcpListener, TcpStream},
    BufResult,
};

const UNIX_PREFIX: &str = "unix:";

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: &str, port: u16) -> io::Result<Self> {
        first_addr((host, port))
    }

    /// Resolve a `host:port` string, taking the first address.
    pub fn resolve(addr: &str) -> io::Result<Self> {
        first_addr(addr)
    }
}

fn first_addr(addr: impl ToSocketAddrs + fmt::Debug) -> io::Result<Endpoint> {
    match addr.to_socket_addrs()?.next() {
        Some(addr) => Ok(Endpoint::Tcp(addr)),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {addr:?}"),
        )),
    }
}

impl FromStr for Endpoint {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(UNIX_PREFIX) {
            #[cfg(unix)]
            Some(path) if !path.is_empty() => Ok(Endpoint::Unix(PathBuf::from(path))),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid unix endpoint {s}"),
            )),
            None => Endpoint::resolve(s),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(value: SocketAddr) -> Self {
        Self::Tcp(value)
    }
}

/// A bound but not yet served listening socket.
///
/// Every reactor builds its own [`Listener`] from a duplicate of the socket,
/// so the kernel spreads accepted connections across reactors.
pub enum ListenerBuilder {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener, PathBuf),
}

impl ListenerBuilder {
    pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => std::net::TcpListener::bind(addr).map(Self::Tcp),
            #[cfg(unix)]
            Endpoint::Unix(path) => Self::bind_unix(path),
        }
    }

    #[cfg(unix)]
    fn bind_unix(path: &Path) -> io::Result<Self> {
        // Try remove file first
        let _ = std::fs::remove_file(path);
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        Ok(Self::Unix(listener, path.to_path_buf()))
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            ListenerBuilder::Tcp(listener) => listener.local_addr().map(Endpoint::Tcp),
            #[cfg(unix)]
            ListenerBuilder::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Build the async listener. Must be called on a reactor thread.
    pub fn build(&self) -> io::Result<Listener> {
        // Because we build async listeners from std ones, we have to make
        // sure they are non_blocking under the legacy driver.
        let legacy = monoio::utils::is_legacy();
        match self {
            ListenerBuilder::Tcp(listener) => {
                let sys_listener = listener.try_clone()?;
                if legacy {
                    sys_listener.set_nonblocking(true)?;
                }
                TcpListener::from_std(sys_listener).map(Listener::Tcp)
            }
            #[cfg(unix)]
            ListenerBuilder::Unix(listener, _) => {
                let sys_listener = listener.try_clone()?;
                if legacy {
                    sys_listener.set_nonblocking(true)?;
                }
                monoio::net::UnixListener::from_std(sys_listener).map(Listener::Unix)
            }
        }
    }
}

/// Unified listener.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(monoio::net::UnixListener),
}

impl Stream for Listener {
    type Item = io::Result<(Transport, PeerAddr)>;

    async fn next(&mut self) -> Option<Self::Item> {
        match self {
            Listener::Tcp(l) => match l.next().await {
                Some(Ok((stream, addr))) => {
                    let _ = stream.set_nodelay(true);
                    Some(Ok((Transport::Tcp(stream), PeerAddr::Tcp(addr))))
                }
                Some(Err(e)) => Some(Err(e)),
                None => None,
            },
            #[cfg(unix)]
            Listener::Unix(l) => match l.next().await {
                Some(Ok((stream, addr))) => {
                    Some(Ok((Transport::Unix(stream), PeerAddr::Unix(addr))))
                }
                Some(Err(e)) => Some(Err(e)),
                None => None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(monoio::net::unix::SocketAddr),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            PeerAddr::Unix(addr) => write!(f, "{addr:?}"),
        }
    }
}

/// A connected byte stream carrying frames.
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(monoio::net::UnixStream),
}

unsafe impl Split for Transport {}

impl Transport {
    /// Connect to `endpoint`. Must be called on a reactor thread.
    pub async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect_addr(*addr).await?;
                let _ = stream.set_nodelay(true);
                Ok(Transport::Tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => monoio::net::UnixStream::connect(path)
                .await
                .map(Transport::Unix),
        }
    }
}

impl AsyncReadRent for Transport {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            Transport::Tcp(inner) => inner.read(buf).await,
            #[cfg(unix)]
            Transport::Unix(inner) => inner.read(buf).await,
        }
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            Transport::Tcp(inner) => inner.readv(buf).await,
            #[cfg(unix)]
            Transport::Unix(inner) => inner.readv(buf).await,
        }
    }
}

impl AsyncWriteRent for Transport {
    #[inline]
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            Transport::Tcp(inner) => inner.write(buf).await,
            #[cfg(unix)]
            Transport::Unix(inner) => inner.write(buf).await,
        }
    }

    #[inline]
    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        match self {
            Transport::Tcp(inner) => inner.writev(buf_vec).await,
            #[cfg(unix)]
            Transport::Unix(inner) => inner.writev(buf_vec).await,
        }
    }

    #[inline]
    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(inner) => inner.flush().await,
            #[cfg(unix)]
            Transport::Unix(inner) => inner.flush().await,
        }
    }

    #[inline]
    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(inner) => inner.shutdown().await,
            #[cfg(unix)]
            Transport::Unix(inner) => inner.shutdown().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_endpoint() {
        let endpoint: Endpoint = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(Endpoint::Tcp("127.0.0.1:8080".parse().unwrap()), endpoint);
        assert_eq!("127.0.0.1:8080", endpoint.to_string());
        assert_eq!(endpoint, Endpoint::tcp("127.0.0.1", 8080).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_unix_endpoint() {
        let endpoint: Endpoint = "unix:/tmp/monorpc.sock".parse().unwrap();
        assert_eq!(Endpoint::Unix(PathBuf::from("/tmp/monorpc.sock")), endpoint);
        assert_eq!("unix:/tmp/monorpc.sock", endpoint.to_string());
        assert!("unix:".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_parse_invalid_endpoint() {
        assert!("not an address".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_bind_port_zero_reports_real_port() {
        let builder = ListenerBuilder::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        match builder.local_endpoint().unwrap() {
            Endpoint::Tcp(addr) => assert_ne!(0, addr.port()),
            #[cfg(unix)]
            other => panic!("unexpected endpoint {other}"),
        }
    }
}
