//! Error types.
//!
//! Connection establishment never surfaces resolution or connect failures; those are
//! retried. What can escape construction is a malformed address, a fired
//! cancellation, or a failure to build the execution context ([`Error`]).
//!
//! Write failures are split into two classes. Errors in the [`BenignErrors`] set mean
//! the peer has closed the connection: the write reports zero bytes and the stream
//! stays usable. Every other error is a [`FatalTransportError`], which the owner of
//! the stream is expected to act on by shutting down.

use std::io;

use thiserror::Error;

use crate::address::AddressError;

/// Errors returned when creating a stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The destination string is malformed.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// The connect-retry loop was cancelled before a connection was made.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// The execution context for the stream could not be created.
    #[error("creating execution context")]
    Runtime(#[source] io::Error),
}

/// An unrecoverable error while sending to the peer.
///
/// Once this is returned the byte stream may be missing data; carrying on would
/// hand the peer a corrupt capture.
#[derive(Debug, Error)]
#[error("write to {destination} failed")]
pub struct FatalTransportError {
    destination: String,
    #[source]
    source: io::Error,
}

impl FatalTransportError {
    /// Create a fatal error for `destination` caused by `source`.
    pub fn new<D: Into<String>>(destination: D, source: io::Error) -> Self {
        Self {
            destination: destination.into(),
            source,
        }
    }

    /// The destination the failed write was addressed to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The transport error.
    pub fn io_error(&self) -> &io::Error {
        &self.source
    }

    /// Unwrap the transport error.
    pub fn into_io_error(self) -> io::Error {
        self.source
    }
}

/// The set of IO error kinds treated as a benign peer close during a write.
///
/// This decides whether a write failure ends the process, so the set is explicit.
/// The default holds [`io::ErrorKind::BrokenPipe`] and
/// [`io::ErrorKind::ConnectionReset`]: once the peer has closed its socket, the
/// first send after the reset arrives fails with `ECONNRESET` and every later
/// send with `EPIPE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenignErrors {
    kinds: Vec<io::ErrorKind>,
}

impl BenignErrors {
    /// An empty set: every write error is fatal.
    pub fn none() -> Self {
        Self { kinds: Vec::new() }
    }

    /// Only a broken pipe is benign.
    pub fn broken_pipe() -> Self {
        Self::none().with(io::ErrorKind::BrokenPipe)
    }

    /// Add `kind` to the set.
    pub fn with(mut self, kind: io::ErrorKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    /// The kinds in this set.
    pub fn kinds(&self) -> &[io::ErrorKind] {
        &self.kinds
    }

    /// Whether `error` belongs to this set.
    pub fn contains(&self, error: &io::Error) -> bool {
        self.kinds.contains(&error.kind())
    }

    /// Sort a write failure into the benign or fatal class.
    pub fn classify(&self, error: io::Error) -> WriteFailure {
        if self.contains(&error) {
            WriteFailure::Benign(error)
        } else {
            WriteFailure::Fatal(error)
        }
    }
}

impl Default for BenignErrors {
    fn default() -> Self {
        Self::broken_pipe().with(io::ErrorKind::ConnectionReset)
    }
}

/// A classified write failure.
#[derive(Debug)]
pub enum WriteFailure {
    /// The peer closed the connection.
    Benign(io::Error),

    /// Anything else.
    Fatal(io::Error),
}

impl WriteFailure {
    /// Whether this failure is benign.
    pub fn is_benign(&self) -> bool {
        matches!(self, WriteFailure::Benign(_))
    }
}
