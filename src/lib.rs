//! Single-assignment promises and an in-process pipe listener.
//!
//! - [`promise`]: a [`Producer`](promise::Producer) settles a value or an
//!   error exactly once, any number of [`Consumer`](promise::Consumer)s
//!   observe it.
//! - [`pipe`]: a [`PipeListener`](pipe::PipeListener) pairs each `accept`
//!   with one `dial` and hands both sides an end of an in-memory duplex
//!   stream, so a client can talk to a server without opening a socket.
//! - [`net`]: the [`Listener`](net::Listener) trait shared by the pipe
//!   listener and real TCP/Unix listeners, and [`listen`](net::listen) to
//!   bind the latter from an address string.
//!
//! # Examples
//!
//! ```
//! use promise_pipe::promise::Producer;
//! use futures::executor::block_on;
//! use std::thread;
//!
//! let (promise, consumer) = Producer::<String, String>::new();
//! let task = thread::spawn(move || block_on(consumer.value()));
//! promise.resolve("🍓".into()).unwrap();
//! assert_eq!(task.join().unwrap(), "🍓");
//! ```
use std::io;

pub mod net;
pub mod pipe;
pub mod promise;

pub use net::{listen, Addr, Listener};
pub use pipe::{Dialer, PipeListener, PipeStream};
pub use promise::{Consumer, Producer};

/// Errors reported by promises and pipe listeners.
///
/// None of them is fatal: each one describes why a single operation did not
/// take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The promise was resolved or rejected already.
    #[error("promise fulfilled already")]
    AlreadySettled,
    /// Every producer was dropped while the promise was still pending.
    #[error("producer dropped before fulfilling the promise")]
    ProducerDropped,
    /// The pipe listener was closed already.
    #[error("pipe listener closed already")]
    AlreadyClosed,
    /// Accept was called on a closed pipe listener.
    #[error("pipe listener is closed")]
    Closed,
    /// Dial was called on a closed pipe listener.
    #[error("connection refused")]
    ConnectionRefused,
    /// The dial was cancelled by the caller.
    #[error("dial cancelled")]
    Cancelled,
    /// The dial deadline expired before an accept picked it up.
    #[error("dial timed out")]
    TimedOut,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::AlreadySettled | Error::AlreadyClosed | Error::Closed => {
                io::ErrorKind::InvalidInput
            }
            Error::ProducerDropped => io::ErrorKind::BrokenPipe,
            Error::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::TimedOut => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, err)
    }
}
