//! TCP connection establishment.
//!
//! This module opens sockets with [`socket2`], applies the options from a
//! [`TcpConnectConfig`], and connects to a set of candidate addresses one at a time,
//! in the order they were resolved. The first candidate that accepts the connection
//! wins; when every candidate fails, the error from the last attempt is returned.
//!
//! All of the futures here must be driven by a tokio runtime with IO (and, when a
//! connect timeout is configured, time) enabled.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{Instrument, trace, warn};

use crate::BoxError;
use crate::resolve::SocketAddrs;

/// Error type for TCP connections.
#[derive(Debug, Error)]
pub struct TcpConnectionError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl TcpConnectionError {
    pub(crate) fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        move |error| Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }

    /// The underlying IO error, if this failure was caused by one.
    pub fn io_error(&self) -> Option<&io::Error> {
        self.source
            .as_ref()
            .and_then(|source| source.downcast_ref::<io::Error>())
    }
}

impl fmt::Display for TcpConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Socket options applied to every connection attempt.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpConnectConfig {
    /// The timeout for a single connection attempt. `None` leaves the attempt to
    /// the operating system's own connect timeout.
    pub connect_timeout: Option<Duration>,

    /// Idle time before TCP keep-alive probes are sent. `None` disables keep-alive.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,
}

impl Default for TcpConnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            keep_alive_timeout: None,
            nodelay: true,
            send_buffer_size: None,
        }
    }
}

/// Connect to the candidates in `addrs`, sequentially and in order.
///
/// Returns the connected stream along with the candidate that accepted it.
pub async fn connect_to_addrs<A>(
    config: &TcpConnectConfig,
    addrs: A,
) -> Result<(TcpStream, SocketAddr), TcpConnectionError>
where
    A: IntoIterator<Item = SocketAddr>,
{
    let mut addrs = SocketAddrs::from_iter(addrs);
    trace!("starting {} connection attempts", addrs.len());

    let mut last_error = None;
    while let Some(address) = addrs.pop() {
        let span = tracing::trace_span!("connect", %address);
        let attempt = async { connect(&address, config)?.await };
        match attempt.instrument(span).await {
            Ok(stream) => return Ok((stream, address)),
            Err(error) => {
                trace!(%address, %error, "connection attempt failed");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| TcpConnectionError::new("exhausted connection candidates")))
}

/// Open a socket for `addr` and return a future which connects it.
///
/// Socket creation errors are returned immediately; errors from the connection
/// itself are returned by the future.
pub(crate) fn connect(
    addr: &SocketAddr,
    config: &TcpConnectConfig,
) -> Result<impl Future<Output = Result<TcpStream, TcpConnectionError>>, TcpConnectionError> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let domain = Domain::for_address(*addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(TcpConnectionError::msg("tcp open error"))?;
    trace!("tcp socket opened");

    let guard = tracing::trace_span!("socket::options").entered();

    // tokio requires O_NONBLOCK on sockets it adopts.
    socket
        .set_nonblocking(true)
        .map_err(TcpConnectionError::msg("tcp set_nonblocking error"))?;

    if let Some(dur) = config.keep_alive_timeout {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size) {
            warn!("tcp set_send_buffer_size error: {}", e);
        }
    }

    let socket = TcpSocket::from_std_stream(socket.into());
    drop(guard);

    let nodelay = config.nodelay;
    let connect_timeout = config.connect_timeout;
    let span = tracing::trace_span!("socket::connect", remote.addr = %addr);
    let connect = socket.connect(*addr).instrument(span);
    Ok(async move {
        let stream = match connect_timeout {
            Some(dur) => match tokio::time::timeout(dur, connect).await {
                Ok(result) => result,
                Err(e) => {
                    trace!(timeout = ?dur, "connection timed out");
                    Err(io::Error::new(io::ErrorKind::TimedOut, e))
                }
            },
            None => connect.await,
        }
        .map_err(TcpConnectionError::msg("tcp connect error"))?;

        if let Err(e) = stream.set_nodelay(nodelay) {
            warn!("tcp set_nodelay error: {}", e);
        }

        Ok(stream)
    })
}
