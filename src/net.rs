//! Listeners over real sockets, and the trait they share with
//! [`PipeListener`](crate::pipe::PipeListener).
//!
//! Code that serves connections can be written against [`Listener`] and run
//! over TCP, a Unix socket, or an in-memory pipe in tests.
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// A source of inbound byte-stream connections.
pub trait Listener: Send + Sync {
    /// The connection type produced by [`accept`](Listener::accept).
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Waits for and accepts the next inbound connection.
    fn accept(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send + '_;

    /// Returns the address the listener is bound to.
    fn local_addr(&self) -> io::Result<Addr>;
}

/// The address of a listener or connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    /// An in-memory pipe.
    Pipe,
    /// A TCP socket.
    Tcp(SocketAddr),
    /// A Unix socket, `None` when unnamed.
    Unix(Option<PathBuf>),
}

impl Addr {
    /// Name of the network, as accepted by [`listen`].
    pub fn network(&self) -> &'static str {
        match self {
            Addr::Pipe => "pipe",
            Addr::Tcp(_) => "tcp",
            Addr::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Pipe => f.write_str("pipe"),
            Addr::Tcp(addr) => write!(f, "{addr}"),
            Addr::Unix(Some(path)) => write!(f, "{}", path.display()),
            Addr::Unix(None) => f.write_str("(unnamed)"),
        }
    }
}

/// Networks [`listen`] can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown network {s:?}"),
            )),
        }
    }
}

/// A parsed listen address.
///
/// - `"<network>:<address>"` when the prefix names a [`Network`], e.g.
///   `"tcp:127.0.0.1:8080"`, `"tcp6:[::1]:0"` or `"unix:/run/app.sock"`;
/// - otherwise a Unix socket path if the address contains a `/`;
/// - otherwise a TCP address. An empty host (`":8080"`) means every
///   interface.
///
/// Only stream networks are supported: `tcp`, `tcp4`, `tcp6` and `unix`.
/// Datagram and sequenced-packet networks such as `udp` or `unixpacket` are
/// not, and their prefix is not recognized as a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    network: Network,
    address: String,
}

impl ListenAddr {
    pub fn parse(addr: &str) -> io::Result<Self> {
        if let Some((network, address)) = addr.split_once(':') {
            if let Ok(network) = network.parse::<Network>() {
                return Self::new(network, address);
            }
        }
        if addr.contains('/') {
            return Self::new(Network::Unix, addr);
        }
        Self::new(Network::Tcp, addr)
    }

    fn new(network: Network, address: &str) -> io::Result<Self> {
        if address.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("missing {network} address"),
            ));
        }
        let address = match (network, address.strip_prefix(':')) {
            (Network::Tcp | Network::Tcp4, Some(port)) => format!("0.0.0.0:{port}"),
            (Network::Tcp6, Some(port)) => format!("[::]:{port}"),
            _ => address.to_owned(),
        };
        Ok(Self { network, address })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Binds a listener on this address. Must be called from a Tokio
    /// runtime.
    pub async fn bind(&self) -> io::Result<SocketListener> {
        let listener = match self.network {
            Network::Tcp => SocketListener::Tcp(TcpListener::bind(&self.address).await?),
            Network::Tcp4 | Network::Tcp6 => self.bind_family().await?,
            Network::Unix => bind_unix(&self.address)?,
        };
        tracing::debug!(network = %self.network, address = %self.address, "listening");
        Ok(listener)
    }

    async fn bind_family(&self) -> io::Result<SocketListener> {
        let want_v4 = self.network == Network::Tcp4;
        let mut last_err = None;
        for addr in tokio::net::lookup_host(&self.address).await? {
            if addr.is_ipv4() != want_v4 {
                continue;
            }
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(SocketListener::Tcp(listener)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for {}", self.network, self.address),
            )
        }))
    }
}

impl FromStr for ListenAddr {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

#[cfg(unix)]
fn bind_unix(path: &str) -> io::Result<SocketListener> {
    UnixListener::bind(path).map(SocketListener::Unix)
}

#[cfg(not(unix))]
fn bind_unix(path: &str) -> io::Result<SocketListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets are not supported here: {path}"),
    ))
}

/// Binds a TCP or Unix listener. See [`ListenAddr`] for the accepted forms.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// use promise_pipe::net::{listen, Listener};
///
/// let listener = listen("tcp:127.0.0.1:0").await?;
/// assert_eq!(listener.local_addr()?.network(), "tcp");
/// # Ok(())
/// # }
/// ```
pub async fn listen(addr: &str) -> io::Result<SocketListener> {
    ListenAddr::parse(addr)?.bind().await
}

/// A listener bound by [`listen`].
#[derive(Debug)]
pub enum SocketListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener for SocketListener {
    type Stream = SocketStream;

    fn accept(&self) -> impl Future<Output = io::Result<SocketStream>> + Send + '_ {
        async move {
            match self {
                SocketListener::Tcp(listener) => {
                    let (stream, _) = listener.accept().await?;
                    Ok(SocketStream::Tcp(stream))
                }
                #[cfg(unix)]
                SocketListener::Unix(listener) => {
                    let (stream, _) = listener.accept().await?;
                    Ok(SocketStream::Unix(stream))
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Addr> {
        match self {
            SocketListener::Tcp(listener) => listener.local_addr().map(Addr::Tcp),
            #[cfg(unix)]
            SocketListener::Unix(listener) => {
                let addr = listener.local_addr()?;
                Ok(Addr::Unix(addr.as_pathname().map(Into::into)))
            }
        }
    }
}

/// A connection accepted by a [`SocketListener`].
#[derive(Debug)]
pub enum SocketStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            SocketStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SocketStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            SocketStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            SocketStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            SocketStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
