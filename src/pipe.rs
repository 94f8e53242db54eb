//! An in-process listener that hands out in-memory duplex connections.
//!
//! A [`PipeListener`] pairs each `accept` with one `dial`. Whichever side
//! arrives second creates a fresh duplex pipe, gives one end to the waiting
//! side and keeps the other. Endpoints are never queued, only callers are,
//! so an endpoint reaches at most one caller.
//!
//! # Examples
//!
//! ```
//! use promise_pipe::pipe::PipeListener;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = PipeListener::new();
//! let dialer = listener.dialer();
//!
//! let server = tokio::spawn(async move {
//!     let mut conn = listener.accept().await?;
//!     let mut buf = [0u8; 5];
//!     conn.read_exact(&mut buf).await?;
//!     Ok::<_, std::io::Error>(buf)
//! });
//!
//! let mut conn = dialer.dial().await?;
//! conn.write_all(b"hello").await?;
//! assert_eq!(&server.await??, b"hello");
//! # Ok(())
//! # }
//! ```
use std::collections::VecDeque;
use std::future::{self, Future};
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use crate::{net::Addr, net::Listener, Error};

/// Bytes each direction of a pipe buffers before writes wait for the reader.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A listener that works over in-memory pipes.
///
/// `PipeListener` is not `Clone`; share it by reference or through an `Arc`
/// to accept from several tasks, and use [`dialer`](PipeListener::dialer) to
/// give other code the ability to connect. Dropping the listener closes it.
#[derive(Debug)]
pub struct PipeListener {
    shared: Arc<Shared>,
}

/// A handle that can only dial its [`PipeListener`].
///
/// Dialers are cheap to clone and can be moved into HTTP or RPC client
/// connectors. Once the listener is closed or dropped, dials are refused.
#[derive(Debug, Clone)]
pub struct Dialer {
    shared: Arc<Shared>,
}

/// One end of a connection made through a [`PipeListener`].
///
/// Bytes written on one end are read on the other. Dropping or shutting down
/// an end signals end-of-file to its peer and does not affect the listener.
#[derive(Debug)]
pub struct PipeStream {
    inner: DuplexStream,
    id: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    buffer_size: usize,
    next_id: AtomicU64,
}

#[derive(Debug, Default)]
struct State {
    closed: bool,
    accepters: VecDeque<oneshot::Sender<PipeStream>>,
    dialers: VecDeque<oneshot::Sender<PipeStream>>,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Accept,
    Dial,
}

enum Rendezvous {
    Paired(PipeStream),
    Waiting(oneshot::Receiver<PipeStream>),
}

impl Role {
    fn closed_error(self) -> Error {
        match self {
            Role::Accept => Error::Closed,
            Role::Dial => Error::ConnectionRefused,
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pairs with the oldest live peer, or queues the caller.
    fn rendezvous(&self, role: Role) -> Result<Rendezvous, Error> {
        let mut state = self.lock();
        if state.closed {
            return Err(role.closed_error());
        }
        let State { accepters, dialers, .. } = &mut *state;
        let (peers, waiting) = match role {
            Role::Accept => (dialers, accepters),
            Role::Dial => (accepters, dialers),
        };

        while let Some(peer) = peers.pop_front() {
            if peer.is_closed() {
                continue;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (local, remote) = tokio::io::duplex(self.buffer_size);
            // The peer may still give up between the check and the send, in
            // which case both ends are dropped here.
            if peer.send(PipeStream { inner: remote, id }).is_ok() {
                trace!(conn_id = id, ?role, "pipe connection paired");
                return Ok(Rendezvous::Paired(PipeStream { inner: local, id }));
            }
        }

        let (tx, rx) = oneshot::channel();
        waiting.retain(|tx| !tx.is_closed());
        waiting.push_back(tx);
        trace!(?role, waiting = waiting.len(), "waiting for a pipe peer");
        Ok(Rendezvous::Waiting(rx))
    }

    async fn accept(&self) -> Result<PipeStream, Error> {
        match self.rendezvous(Role::Accept)? {
            Rendezvous::Paired(stream) => Ok(stream),
            Rendezvous::Waiting(rx) => rx.await.map_err(|_| Error::Closed),
        }
    }

    async fn dial_with<C>(&self, cancel: C) -> Result<PipeStream, Error>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        if future::poll_fn(|cx| Poll::Ready(cancel.as_mut().poll(cx).is_ready())).await {
            return Err(Error::Cancelled);
        }

        let mut rx = match self.rendezvous(Role::Dial)? {
            Rendezvous::Paired(stream) => return Ok(stream),
            Rendezvous::Waiting(rx) => rx,
        };
        tokio::select! {
            biased;
            paired = &mut rx => paired.map_err(|_| Error::ConnectionRefused),
            () = &mut cancel => {
                rx.close();
                // A connection handed off before the close is still ours.
                rx.try_recv().map_err(|_| {
                    trace!("pipe dial cancelled");
                    Error::Cancelled
                })
            }
        }
    }

    async fn dial_timeout(&self, timeout: Duration) -> Result<PipeStream, Error> {
        match self.dial_with(tokio::time::sleep(timeout)).await {
            Err(Error::Cancelled) => Err(Error::TimedOut),
            other => other,
        }
    }

    fn close(&self) -> Result<(), Error> {
        let (accepters, dialers) = {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::AlreadyClosed);
            }
            state.closed = true;
            (mem::take(&mut state.accepters), mem::take(&mut state.dialers))
        };
        debug!(
            accepters = accepters.len(),
            dialers = dialers.len(),
            "pipe listener closed"
        );
        // Dropping the senders wakes every waiter.
        drop((accepters, dialers));
        Ok(())
    }
}

impl PipeListener {
    /// Creates an open listener with [`DEFAULT_BUFFER_SIZE`] pipes.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Creates an open listener whose pipes buffer `buffer_size` bytes in
    /// each direction.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                buffer_size,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Waits for a dial and returns the listener's end of the connection.
    ///
    /// Fails with [`Error::Closed`] once the listener is closed, including
    /// when it is closed while this call is waiting.
    pub async fn accept(&self) -> Result<PipeStream, Error> {
        self.shared.accept().await
    }

    /// Returns a cloneable handle for dialing this listener.
    pub fn dialer(&self) -> Dialer {
        Dialer {
            shared: self.shared.clone(),
        }
    }

    /// See [`Dialer::dial`].
    pub async fn dial(&self) -> Result<PipeStream, Error> {
        self.shared.dial_with(future::pending()).await
    }

    /// See [`Dialer::dial_with`].
    pub async fn dial_with<C>(&self, cancel: C) -> Result<PipeStream, Error>
    where
        C: Future<Output = ()>,
    {
        self.shared.dial_with(cancel).await
    }

    /// See [`Dialer::dial_timeout`].
    pub async fn dial_timeout(&self, timeout: Duration) -> Result<PipeStream, Error> {
        self.shared.dial_timeout(timeout).await
    }

    /// Closes the listener and wakes every pending accept and dial.
    ///
    /// Returns [`Error::AlreadyClosed`] if the listener was closed before.
    pub fn close(&self) -> Result<(), Error> {
        self.shared.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn local_addr(&self) -> Addr {
        Addr::Pipe
    }
}

impl Default for PipeListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = self.shared.close();
    }
}

impl Listener for PipeListener {
    type Stream = PipeStream;

    fn accept(&self) -> impl Future<Output = io::Result<PipeStream>> + Send + '_ {
        async move { self.shared.accept().await.map_err(io::Error::from) }
    }

    fn local_addr(&self) -> io::Result<Addr> {
        Ok(Addr::Pipe)
    }
}

impl Dialer {
    /// Waits for an accept and returns the dialing end of the connection.
    ///
    /// Fails with [`Error::ConnectionRefused`] once the listener is closed.
    pub async fn dial(&self) -> Result<PipeStream, Error> {
        self.shared.dial_with(future::pending()).await
    }

    /// Like [`dial`](Dialer::dial), but gives up with [`Error::Cancelled`]
    /// as soon as `cancel` completes.
    ///
    /// A `cancel` future that is already complete fails the dial without
    /// creating a pipe, even if an accept is waiting. If an accept handed
    /// over a connection before the cancellation was observed, the
    /// connection is returned.
    pub async fn dial_with<C>(&self, cancel: C) -> Result<PipeStream, Error>
    where
        C: Future<Output = ()>,
    {
        self.shared.dial_with(cancel).await
    }

    /// Like [`dial`](Dialer::dial), but gives up with [`Error::TimedOut`]
    /// after `timeout`. Requires a Tokio runtime with the time driver.
    pub async fn dial_timeout(&self, timeout: Duration) -> Result<PipeStream, Error> {
        self.shared.dial_timeout(timeout).await
    }
}

impl PipeStream {
    /// Identifier shared by both ends of a connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> Addr {
        Addr::Pipe
    }

    pub fn peer_addr(&self) -> Addr {
        Addr::Pipe
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
