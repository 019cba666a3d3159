//! # Outflow: blocking network output streams
//!
//! Outflow moves bytes from a producer, such as a capture pipeline serializing
//! frames as they happen, to a TCP peer in another process. It provides one
//! concrete stream, [`NetworkOutputStream`], behind a small [`OutputStream`] contract
//! so that it can be swapped for any other sink.
//!
//! ## Connecting
//!
//! A stream is created from a `host:port` string. The host is everything before the
//! *last* colon; the port may be a number or a service name such as `http`. Creation blocks the calling thread until the peer accepts a
//! connection: if the name does not resolve, or nothing is listening yet, the
//! failure is logged and the whole resolve-then-connect sequence is tried again one
//! second later. This lets a producer start before the process it reports to.
//!
//! Waiting can be abandoned by attaching a [`cancel::Cancellation`] through
//! [`NetworkOutputStream::builder`]; without one, creation only returns early for a
//! malformed address.
//!
//! ## Writing
//!
//! Writes may come from any number of threads. Each call sends its entire buffer
//! while holding the stream's write lock, so the peer sees whole buffers one after
//! another and never a mix of two. A write returns:
//!
//! - the buffer's length once every byte has been handed to the socket,
//! - `0` when the peer has closed the connection (see [`BenignErrors`]); the stream
//!   stays usable, and whether to keep writing is the caller's call,
//! - a [`FatalTransportError`] for anything else. The owner is expected to stop;
//!   [`OutputStreamExt::write_or_exit`] does so by exiting the process.
//!
//! Established connections are not re-established, and bytes are not framed.
//!
//! ## Logging
//!
//! Diagnostics are emitted with [`tracing`]. Every failed resolution, failed
//! connection and fatal write produces one `ERROR` event carrying the destination
//! and the transport error; lifecycle events are logged at `DEBUG` and `TRACE`.

use std::{fmt, pin::Pin};

pub mod address;
pub mod cancel;
pub mod connect;
pub mod error;
pub mod info;
mod lock;
pub mod network;
pub mod output;
pub mod resolve;

pub use self::address::{AddressError, Destination};
pub use self::error::{BenignErrors, Error, FatalTransportError};
pub use self::network::{Builder, NetworkOutputStream, StreamConfig};
pub use self::output::{OutputStream, OutputStreamExt};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Utility struct for formatting a `Display` type in a `Debug` context.
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
