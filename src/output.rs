//! The output-stream contract.
//!
//! Capture pipelines write serialized data through an [`OutputStream`] without
//! knowing where the bytes end up. [`NetworkOutputStream`][crate::NetworkOutputStream]
//! is one implementation; anything else satisfying the contract can stand in for it.

use std::sync::Arc;

use crate::error::FatalTransportError;

/// A sink for raw bytes, shared between writer threads.
///
/// Implementations serialize concurrent writes internally: the bytes of one
/// [`write`][OutputStream::write] call are never interleaved with those of another.
pub trait OutputStream: Send + Sync {
    /// Whether the stream can accept writes.
    fn is_valid(&self) -> bool;

    /// Write all of `buf`.
    ///
    /// Returns the number of bytes written. `Ok(0)` for a non-empty buffer means the
    /// receiving end has gone away and nothing was delivered; the stream is still
    /// usable and the caller decides whether to continue.
    fn write(&self, buf: &[u8]) -> Result<usize, FatalTransportError>;

    /// Flush any buffered data.
    fn flush(&self);
}

impl<S> OutputStream for Box<S>
where
    S: OutputStream + ?Sized,
{
    fn is_valid(&self) -> bool {
        (**self).is_valid()
    }

    fn write(&self, buf: &[u8]) -> Result<usize, FatalTransportError> {
        (**self).write(buf)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

impl<S> OutputStream for Arc<S>
where
    S: OutputStream + ?Sized,
{
    fn is_valid(&self) -> bool {
        (**self).is_valid()
    }

    fn write(&self, buf: &[u8]) -> Result<usize, FatalTransportError> {
        (**self).write(buf)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

/// Extension trait for [`OutputStream`]s.
pub trait OutputStreamExt: OutputStream {
    /// Write all of `buf`, terminating the process on a fatal transport error.
    ///
    /// The process exits with status 1. Streams log their own fatal failures, so
    /// nothing is logged here above debug level. Benign failures still return `0`.
    fn write_or_exit(&self, buf: &[u8]) -> usize {
        match self.write(buf) {
            Ok(written) => written,
            Err(error) => {
                tracing::debug!("exiting after {}", error);
                std::process::exit(1);
            }
        }
    }
}

impl<S> OutputStreamExt for S where S: OutputStream + ?Sized {}
