//! Blocking TCP output streams.
//!
//! [`NetworkOutputStream`] connects to a `host:port` destination and then accepts
//! writes from any number of threads. Construction blocks the calling thread until
//! a connection is established: resolution and connect failures are logged and
//! retried after [`StreamConfig::retry_delay`], with a fresh resolution on every
//! attempt, for as long as it takes (or until an attached [`Cancellation`] fires).
//!
//! Each stream owns a single-threaded tokio runtime as its execution context. The
//! runtime never runs tasks in the background: resolution, connection and sends are
//! driven in place on the calling thread with [`Runtime::block_on`]. For that reason
//! none of the blocking methods here may be called from within an async context.
//!
//! ```rust,no_run
//! use outflow::{NetworkOutputStream, OutputStream as _};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = NetworkOutputStream::connect("127.0.0.1:9999")?;
//! let written = stream.write(b"capture frame")?;
//! if written == 0 {
//!     // The peer went away.
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::{IntoFuture, poll_fn};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{Instrument as _, debug, error};

use crate::address::Destination;
use crate::cancel::Cancellation;
use crate::connect::{TcpConnectConfig, connect_to_addrs};
use crate::error::{BenignErrors, Error, FatalTransportError, WriteFailure};
use crate::info::ConnectionInfo;
use crate::lock::Exclusive;
use crate::output::OutputStream;
use crate::resolve::{GaiResolver, Resolver};

/// Configuration for a [`NetworkOutputStream`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct StreamConfig {
    /// How long to wait after a failed resolution or connection before retrying.
    pub retry_delay: Duration,

    /// Socket options for each connection attempt.
    pub tcp: TcpConnectConfig,

    /// Write errors which mean the peer has closed the connection.
    pub benign_errors: BenignErrors,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(1000),
            tcp: TcpConnectConfig::default(),
            benign_errors: BenignErrors::default(),
        }
    }
}

/// A blocking, thread-safe output stream to a single TCP peer.
///
/// A `NetworkOutputStream` only exists once it is connected: construction either
/// returns a live connection or keeps waiting. The connection is never
/// re-established after it drops; writes after a peer close report `0` bytes.
pub struct NetworkOutputStream {
    // Fields drop in order: the socket is closed before its runtime shuts down.
    sink: Sink<TcpStream>,
    info: ConnectionInfo,
    runtime: Runtime,
}

impl fmt::Debug for NetworkOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkOutputStream")
            .field("destination", &self.sink.destination)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl NetworkOutputStream {
    /// Connect to `address` (`host:port`) with the default configuration and the
    /// system resolver.
    ///
    /// Blocks the calling thread until the connection succeeds. Only a malformed
    /// address (or a failure to create the execution context) returns early.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime.
    pub fn connect(address: &str) -> Result<Self, Error> {
        Self::builder(address.parse()?).connect()
    }

    /// Start building a stream to `destination`.
    pub fn builder(destination: Destination) -> Builder {
        Builder::new(destination)
    }

    /// The destination this stream was created for.
    pub fn destination(&self) -> &Destination {
        &self.sink.destination
    }

    /// Addresses of the established connection.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Always `true`.
    ///
    /// The connection handle is stored before [`Builder::connect`] returns and is
    /// never taken back out of the write lock, so there is no unconnected state to
    /// observe. A peer close does not change this: writes then report `0` bytes.
    pub fn is_valid(&self) -> bool {
        true
    }

    /// Send all of `buf` to the peer, blocking until it has been handed to the
    /// transport.
    ///
    /// Concurrent calls are serialized; the bytes of one call are never interleaved
    /// with another's. Returns `buf.len()` on success and `0` when the peer has
    /// closed the connection. Any other transport error is returned as a
    /// [`FatalTransportError`].
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime.
    pub fn write(&self, buf: &[u8]) -> Result<usize, FatalTransportError> {
        self.sink.write(&self.runtime, buf)
    }

    /// Does nothing: there is no buffering above the socket.
    pub fn flush(&self) {}
}

impl OutputStream for NetworkOutputStream {
    fn is_valid(&self) -> bool {
        NetworkOutputStream::is_valid(self)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, FatalTransportError> {
        NetworkOutputStream::write(self, buf)
    }

    fn flush(&self) {
        NetworkOutputStream::flush(self)
    }
}

impl Drop for NetworkOutputStream {
    fn drop(&mut self) {
        debug!(destination = %self.sink.destination, "closing network output stream");
    }
}

/// The write side of a stream: the connection behind its lock, plus what is
/// needed to classify failures.
struct Sink<IO> {
    connection: Exclusive<IO>,
    destination: Destination,
    benign_errors: BenignErrors,
}

impl<IO> Sink<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn write(&self, runtime: &Runtime, buf: &[u8]) -> Result<usize, FatalTransportError> {
        let mut connection = self.connection.lock();

        match runtime.block_on(connection.write_all(buf)) {
            Ok(()) => Ok(buf.len()),
            Err(error) => match self.benign_errors.classify(error) {
                WriteFailure::Benign(error) => {
                    debug!("peer {} closed connection: {}", self.destination, error);
                    Ok(0)
                }
                WriteFailure::Fatal(error) => {
                    error!("write to {} failed due to {}", self.destination, error);
                    Err(FatalTransportError::new(
                        self.destination.to_string(),
                        error,
                    ))
                }
            },
        }
    }
}

/// Builder for a [`NetworkOutputStream`].
#[derive(Debug)]
pub struct Builder<R = GaiResolver> {
    destination: Destination,
    config: StreamConfig,
    resolver: R,
    cancellation: Option<Cancellation>,
}

impl Builder {
    /// Create a builder for `destination` with the default configuration.
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            config: StreamConfig::default(),
            resolver: GaiResolver::new(),
            cancellation: None,
        }
    }
}

impl<R> Builder<R> {
    /// Replace the whole configuration.
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the delay between connection attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set the socket options used for each connection attempt.
    pub fn tcp(mut self, tcp: TcpConnectConfig) -> Self {
        self.config.tcp = tcp;
        self
    }

    /// Set which write errors count as a peer close.
    pub fn benign_errors(mut self, benign_errors: BenignErrors) -> Self {
        self.config.benign_errors = benign_errors;
        self
    }

    /// Abandon the connect-retry loop when `cancellation` fires.
    pub fn cancel_on(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Use a different resolver.
    pub fn resolver<R2>(self, resolver: R2) -> Builder<R2> {
        Builder {
            destination: self.destination,
            config: self.config,
            resolver,
            cancellation: self.cancellation,
        }
    }
}

impl<R> Builder<R>
where
    R: Resolver<Destination>,
    R::Address: IntoIterator<Item = SocketAddr>,
    R::Error: fmt::Display,
{
    /// Connect, blocking the calling thread until the connection succeeds or the
    /// cancellation fires.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime.
    pub fn connect(self) -> Result<NetworkOutputStream, Error> {
        let Builder {
            destination,
            config,
            mut resolver,
            cancellation,
        } = self;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(Error::Runtime)?;

        let span = tracing::debug_span!("connect", %destination);
        let (stream, remote) = runtime.block_on(
            async {
                let establish = establish(&destination, &config, &mut resolver);
                match cancellation {
                    Some(cancellation) => tokio::select! {
                        biased;
                        _ = cancellation.into_future() => Err(Error::Cancelled),
                        connected = establish => Ok(connected),
                    },
                    None => Ok(establish.await),
                }
            }
            .instrument(span),
        )?;

        let info = ConnectionInfo::client(&stream, remote);
        debug!(%destination, local.addr = %info.local_addr, remote.addr = %info.remote_addr, "connected");

        Ok(NetworkOutputStream {
            sink: Sink {
                connection: Exclusive::new(stream),
                destination,
                benign_errors: config.benign_errors,
            },
            info,
            runtime,
        })
    }
}

/// Resolve and connect until a connection succeeds.
async fn establish<R>(
    destination: &Destination,
    config: &StreamConfig,
    resolver: &mut R,
) -> (TcpStream, SocketAddr)
where
    R: Resolver<Destination>,
    R::Address: IntoIterator<Item = SocketAddr>,
    R::Error: fmt::Display,
{
    let delay = config.retry_delay;
    loop {
        let addrs = match resolve(resolver, destination).await {
            Ok(addrs) => addrs,
            Err(error) => {
                error!(
                    "could not resolve to {} due to {}... waiting for {:?}",
                    destination, error, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        match connect_to_addrs(&config.tcp, addrs).await {
            Ok(connected) => return connected,
            Err(error) => {
                error!(
                    "could not connect to {} due to {}... waiting for {:?}",
                    destination, error, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn resolve<R>(resolver: &mut R, destination: &Destination) -> Result<R::Address, R::Error>
where
    R: Resolver<Destination>,
{
    poll_fn(|cx| resolver.poll_ready(cx)).await?;
    resolver.resolve(destination).await
}

#[cfg(test)]
mod tests {
    use std::future::{Ready, ready};
    use std::io::{self, Read as _};
    use std::net::TcpListener;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::thread;
    use std::time::Instant;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::address::AddressError;
    use crate::output::OutputStreamExt as _;
    use crate::resolve::SocketAddrs;

    assert_impl_all!(NetworkOutputStream: Send, Sync, fmt::Debug, OutputStream);
    assert_impl_all!(StreamConfig: Send, Sync, Clone, Default);
    assert_impl_all!(Builder: Send);

    const FAST_RETRY: Duration = Duration::from_millis(100);

    /// Fails the first `failures` lookups, then resolves to `addrs`.
    #[derive(Debug, Clone)]
    struct FlakyResolver {
        failures: usize,
        calls: Arc<AtomicUsize>,
        addrs: SocketAddrs,
    }

    impl FlakyResolver {
        fn new(failures: usize, addrs: SocketAddrs) -> Self {
            Self {
                failures,
                calls: Arc::new(AtomicUsize::new(0)),
                addrs,
            }
        }

        fn never() -> Self {
            Self::new(usize::MAX, SocketAddrs::default())
        }
    }

    impl tower::Service<&Destination> for FlakyResolver {
        type Response = SocketAddrs;
        type Error = io::Error;
        type Future = Ready<Result<SocketAddrs, io::Error>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _: &Destination) -> Self::Future {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                ready(Err(io::Error::new(io::ErrorKind::NotFound, "no such host")))
            } else {
                ready(Ok(self.addrs.clone()))
            }
        }
    }

    /// Log output captured from a scoped subscriber.
    #[derive(Debug, Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }

        fn lines_containing(&self, needle: &str) -> usize {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .filter(|line| line.contains(needle))
                .count()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture<T>(f: impl FnOnce() -> T) -> (T, Captured) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let output = tracing::subscriber::with_default(subscriber, f);
        (output, captured)
    }

    /// A loopback port with nothing listening on it.
    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Accept one connection and return everything the client sends.
    fn drain(listener: TcpListener) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).unwrap();
            received
        })
    }

    fn cancel_after(delay: Duration) -> Cancellation {
        let (handle, cancellation) = crate::cancel::channel();
        thread::spawn(move || {
            thread::sleep(delay);
            handle.cancel();
        });
        cancellation
    }

    #[test]
    fn connects_to_live_listener() {
        crate::fixtures::subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = drain(listener);

        let stream = NetworkOutputStream::connect(&addr.to_string()).unwrap();
        assert!(stream.is_valid());
        assert_eq!(stream.destination(), &Destination::new("127.0.0.1", addr.port()));
        assert_eq!(*stream.info().remote_addr(), addr);
        assert!(stream.info().local_addr().ip().is_loopback());

        assert_eq!(stream.write(b"hello").unwrap(), 5);
        stream.flush();
        drop(stream);

        assert_eq!(peer.join().unwrap(), b"hello");
    }

    #[test]
    fn rejects_malformed_address() {
        let err = NetworkOutputStream::connect("localhost").unwrap_err();
        assert!(matches!(
            err,
            Error::Address(AddressError::MissingSeparator(_))
        ));

        let err = NetworkOutputStream::connect(":9999").unwrap_err();
        assert!(matches!(err, Error::Address(AddressError::MissingHost(_))));
    }

    #[test]
    fn connects_by_host_name() {
        crate::fixtures::subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = drain(listener);

        let stream = NetworkOutputStream::connect(&format!("localhost:{port}")).unwrap();
        assert_eq!(stream.destination().service(), port.to_string());
        assert_eq!(stream.write(b"named").unwrap(), 5);
        drop(stream);

        assert_eq!(peer.join().unwrap(), b"named");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resolution_starts_no_threads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _peer = drain(listener);

        let stream = NetworkOutputStream::connect(&format!("localhost:{port}")).unwrap();
        assert_eq!(stream.write(b"x").unwrap(), 1);

        let tokio_threads: Vec<String> = std::fs::read_dir("/proc/self/task")
            .unwrap()
            .filter_map(|task| std::fs::read_to_string(task.ok()?.path().join("comm")).ok())
            .filter(|name| name.starts_with("tokio"))
            .collect();
        assert!(tokio_threads.is_empty(), "{tokio_threads:?}");
    }

    #[test]
    fn unknown_service_is_retried_not_rejected() {
        let destination: Destination = "127.0.0.1:no-such-service-name".parse().unwrap();

        let (result, logs) = capture(|| {
            NetworkOutputStream::builder(destination)
                .retry_delay(FAST_RETRY)
                .cancel_on(cancel_after(Duration::from_millis(250)))
                .connect()
        });

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(logs.lines_containing("could not resolve to 127.0.0.1:no-such-service-name") >= 2);
    }

    #[test]
    fn waits_for_listener_to_start() {
        crate::fixtures::subscribe();

        let port = free_port();
        let peer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
            drain(listener).join().unwrap()
        });

        let started = Instant::now();
        let stream = NetworkOutputStream::builder(Destination::new("127.0.0.1", port))
            .retry_delay(FAST_RETRY)
            .connect()
            .unwrap();
        let elapsed = started.elapsed();

        assert!(stream.is_valid());
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");

        assert_eq!(stream.write(b"late").unwrap(), 4);
        drop(stream);
        assert_eq!(peer.join().unwrap(), b"late");
    }

    #[test]
    fn resolves_again_after_each_failure() {
        crate::fixtures::subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _peer = drain(listener);

        let resolver = FlakyResolver::new(3, SocketAddrs::from_iter([addr]));
        let calls = resolver.calls.clone();

        let started = Instant::now();
        let (stream, logs) = capture(|| {
            NetworkOutputStream::builder(Destination::new("capture-server", addr.port()))
                .retry_delay(FAST_RETRY)
                .resolver(resolver)
                .connect()
                .unwrap()
        });

        assert!(stream.is_valid());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= FAST_RETRY * 3);
        assert_eq!(logs.lines_containing("could not resolve to capture-server"), 3);
        assert_eq!(logs.lines_containing("no such host"), 3);
    }

    #[test]
    fn unresolvable_destination_retries_until_cancelled() {
        let resolver = FlakyResolver::never();
        let calls = resolver.calls.clone();

        let started = Instant::now();
        let (result, logs) = capture(|| {
            NetworkOutputStream::builder(Destination::new("badhost", 1234))
                .retry_delay(FAST_RETRY)
                .resolver(resolver)
                .cancel_on(cancel_after(Duration::from_millis(550)))
                .connect()
        });

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() >= Duration::from_millis(500));

        // One attempt immediately, then one per retry delay.
        let lines = logs.lines_containing("could not resolve to badhost:1234");
        assert!((4..=8).contains(&lines), "{lines} log lines");
        assert_eq!(calls.load(Ordering::SeqCst), lines);
        assert_eq!(logs.lines_containing("ERROR"), lines);
    }

    #[test]
    fn refused_connection_is_retried_and_logged() {
        let addr = SocketAddr::from(([127, 0, 0, 1], free_port()));

        let (result, logs) = capture(|| {
            NetworkOutputStream::builder(Destination::new("127.0.0.1", addr.port()))
                .retry_delay(FAST_RETRY)
                .resolver(FlakyResolver::new(0, SocketAddrs::from_iter([addr])))
                .cancel_on(cancel_after(Duration::from_millis(350)))
                .connect()
        });

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(logs.lines_containing("could not connect to 127.0.0.1") >= 2);
        assert!(logs.lines_containing("tcp connect error") >= 2);
    }

    #[test]
    fn fired_cancellation_returns_immediately() {
        let (handle, cancellation) = crate::cancel::channel();
        handle.cancel();

        let result = NetworkOutputStream::builder(Destination::new("badhost", 1))
            .resolver(FlakyResolver::never())
            .cancel_on(cancellation)
            .connect();

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn large_write_transfers_everything() {
        crate::fixtures::subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = drain(listener);

        let stream = NetworkOutputStream::connect(&addr.to_string()).unwrap();
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

        assert_eq!(stream.write(&payload).unwrap(), 1_000_000);
        drop(stream);

        assert_eq!(peer.join().unwrap(), payload);
    }

    #[test]
    fn peer_reset_reports_zero_bytes() {
        crate::fixtures::subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            socket2::SockRef::from(&socket)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
        });

        let stream = NetworkOutputStream::connect(&addr.to_string()).unwrap();
        peer.join().unwrap();
        thread::sleep(Duration::from_millis(100));

        assert_eq!(stream.write(b"hello").unwrap(), 0);
        assert!(stream.is_valid());
        assert_eq!(stream.write(b"again").unwrap(), 0);
    }

    #[test]
    fn graceful_peer_close_reports_zero_bytes() {
        crate::fixtures::subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            listener.accept().unwrap();
        });

        let stream = NetworkOutputStream::connect(&addr.to_string()).unwrap();
        peer.join().unwrap();
        thread::sleep(Duration::from_millis(100));

        // A FIN only closes the peer's sending side; the first send is accepted
        // locally and answered with a reset.
        assert_eq!(stream.write(b"hello").unwrap(), 5);
        thread::sleep(Duration::from_millis(100));

        let (written, logs) = capture(|| stream.write(b"hello").unwrap());
        assert_eq!(written, 0);
        assert!(stream.is_valid());
        assert_eq!(logs.lines_containing("ERROR"), 0);
    }

    #[test]
    fn concurrent_writes_do_not_interleave() {
        crate::fixtures::subscribe();

        const WRITERS: u8 = 8;
        const WRITES: usize = 16;
        const CHUNK: usize = 64 * 1024;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = drain(listener);

        let stream = Arc::new(NetworkOutputStream::connect(&addr.to_string()).unwrap());

        let writers: Vec<_> = (0..WRITERS)
            .map(|id| {
                let stream = stream.clone();
                thread::spawn(move || {
                    let buf = vec![id; CHUNK];
                    for _ in 0..WRITES {
                        assert_eq!(stream.write(&buf).unwrap(), CHUNK);
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        drop(stream);

        let received = peer.join().unwrap();
        assert_eq!(received.len(), WRITERS as usize * WRITES * CHUNK);

        let mut counts = [0usize; WRITERS as usize];
        for chunk in received.chunks(CHUNK) {
            let id = chunk[0];
            assert!(chunk.iter().all(|b| *b == id), "interleaved write");
            counts[id as usize] += 1;
        }
        assert!(counts.iter().all(|c| *c == WRITES), "{counts:?}");
    }

    #[test]
    fn usable_as_dyn_output_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = drain(listener);

        let stream: Box<dyn OutputStream> =
            Box::new(NetworkOutputStream::connect(&addr.to_string()).unwrap());
        assert!(stream.is_valid());
        assert_eq!(stream.write(b"dyn").unwrap(), 3);
        stream.flush();
        drop(stream);

        assert_eq!(peer.join().unwrap(), b"dyn");
    }

    /// Accepts at most `chunk` bytes per poll.
    #[derive(Debug, Default)]
    struct Trickle {
        chunk: usize,
        accepted: Vec<u8>,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.chunk);
            self.accepted.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Fails every write with `kind`.
    #[derive(Debug)]
    struct Broken(io::ErrorKind);

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(self.0.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn sink_with<IO>(io: IO, benign_errors: BenignErrors) -> Sink<IO> {
        Sink {
            connection: Exclusive::new(io),
            destination: Destination::new("127.0.0.1", 9999),
            benign_errors,
        }
    }

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn sink_accumulates_partial_writes() {
        let rt = runtime();
        let sink = sink_with(
            Trickle {
                chunk: 3,
                ..Default::default()
            },
            BenignErrors::default(),
        );

        assert_eq!(sink.write(&rt, b"transfer all").unwrap(), 12);
        assert_eq!(sink.connection.lock().accepted, b"transfer all");
    }

    #[test]
    fn sink_benign_failure_is_zero() {
        let rt = runtime();
        for kind in [io::ErrorKind::BrokenPipe, io::ErrorKind::ConnectionReset] {
            let sink = sink_with(Broken(kind), BenignErrors::default());
            assert_eq!(sink.write(&rt, b"hello").unwrap(), 0);
            assert_eq!(sink.write(&rt, b"hello").unwrap(), 0);
        }
    }

    #[test]
    fn sink_fatal_failure_is_returned_and_logged() {
        let rt = runtime();
        let sink = sink_with(Broken(io::ErrorKind::PermissionDenied), BenignErrors::default());

        let (result, logs) = capture(|| sink.write(&rt, b"hello"));

        let err = result.unwrap_err();
        assert_eq!(err.destination(), "127.0.0.1:9999");
        assert_eq!(err.io_error().kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(logs.lines_containing("write to 127.0.0.1:9999 failed due to"), 1);
        assert_eq!(logs.lines_containing("ERROR"), 1);
        assert_eq!(logs.text().matches("127.0.0.1:9999").count(), 1);
    }

    /// Every write fails with a fatal error.
    struct Failing {
        sink: Sink<Broken>,
        runtime: Runtime,
    }

    impl OutputStream for Failing {
        fn is_valid(&self) -> bool {
            true
        }

        fn write(&self, buf: &[u8]) -> Result<usize, FatalTransportError> {
            self.sink.write(&self.runtime, buf)
        }

        fn flush(&self) {}
    }

    const FATAL_WRITE_CHILD: &str = "OUTFLOW_FATAL_WRITE_CHILD";

    #[test]
    fn fatal_write_exits_process() {
        if std::env::var_os(FATAL_WRITE_CHILD).is_some() {
            let stream = Failing {
                sink: sink_with(
                    Broken(io::ErrorKind::PermissionDenied),
                    BenignErrors::default(),
                ),
                runtime: runtime(),
            };
            let subscriber = tracing_subscriber::fmt()
                .with_writer(io::stderr)
                .with_ansi(false)
                .finish();
            tracing::subscriber::with_default(subscriber, || {
                stream.write_or_exit(b"hello");
            });
            unreachable!("write_or_exit returned after a fatal error");
        }

        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "network::tests::fatal_write_exits_process",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(FATAL_WRITE_CHILD, "1")
            .output()
            .unwrap();

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(output.status.code(), Some(1), "{stderr}");
        assert_eq!(
            stderr.lines().filter(|line| line.contains("ERROR")).count(),
            1,
            "{stderr}"
        );
        assert_eq!(
            stderr
                .lines()
                .filter(|line| line.contains("write to 127.0.0.1:9999 failed due to"))
                .count(),
            1,
            "{stderr}"
        );
    }

    #[test]
    fn sink_narrowed_benign_class() {
        let rt = runtime();
        let sink = sink_with(
            Broken(io::ErrorKind::ConnectionReset),
            BenignErrors::broken_pipe(),
        );

        assert!(sink.write(&rt, b"hello").is_err());
    }

    #[test]
    fn sink_benign_failure_is_not_logged_as_error() {
        let rt = runtime();
        let sink = sink_with(Broken(io::ErrorKind::BrokenPipe), BenignErrors::default());

        let (result, logs) = capture(|| sink.write(&rt, b"hello"));

        assert_eq!(result.unwrap(), 0);
        assert_eq!(logs.lines_containing("ERROR"), 0);
    }

    #[test]
    fn empty_write_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            listener.accept().unwrap();
        });

        let stream = NetworkOutputStream::connect(&addr.to_string()).unwrap();
        assert_eq!(stream.write(&[]).unwrap(), 0);
        peer.join().unwrap();
    }
}
