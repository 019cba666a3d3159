//! Resolution of destinations into candidate socket addresses.
//!
//! The system resolver runs `getaddrinfo` in place, on the thread that drives the
//! stream's runtime. It never hands the lookup to a helper thread, so a stream owns
//! no threads at all; the cost is that a slow lookup also delays cancellation until
//! it returns.

use std::collections::VecDeque;
use std::future::{Future, Ready, ready};
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use crate::address::Destination;

/// Candidate socket addresses, in the order the resolver produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketAddrs(VecDeque<SocketAddr>);

impl SocketAddrs {
    pub(crate) fn pop(&mut self) -> Option<SocketAddr> {
        self.0.pop_front()
    }

    /// Whether there are no candidates left.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of candidates left.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<SocketAddr> for SocketAddrs {
    fn from_iter<T: IntoIterator<Item = SocketAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for SocketAddrs {
    type Item = SocketAddr;
    type IntoIter = std::collections::vec_deque::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Turns a destination into candidate addresses.
///
/// Any [`tower::Service`] which accepts `&Request` is a resolver, so lookups can be
/// replaced without touching the connect loop.
pub trait Resolver<Request> {
    /// Address type returned
    type Address;

    /// Resolution error returned
    type Error;

    /// Future type that the resolver uses to work.
    type Future: Future<Output = Result<Self::Address, Self::Error>>;

    /// Check if the resolver is ready to resolve.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;

    /// Return a future representing the work the resolver does.
    fn resolve(&mut self, request: &Request) -> Self::Future;
}

impl<T, F, R, A, E> Resolver<R> for T
where
    T: for<'a> tower::Service<&'a R, Response = A, Error = E, Future = F>,
    F: Future<Output = Result<A, E>>,
{
    type Address = A;
    type Error = E;
    type Future = F;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        tower::Service::poll_ready(self, cx)
    }

    fn resolve(&mut self, request: &R) -> Self::Future {
        tower::Service::call(self, request)
    }
}

/// Resolver backed by the system's `getaddrinfo`.
///
/// The port segment is passed as the service, so both `9000` and `http` are
/// accepted. Every call performs a fresh lookup; nothing is cached between calls.
/// The lookup blocks inside [`call`][tower::Service::call] and the returned future
/// is already complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new system resolver.
    pub fn new() -> Self {
        Self::default()
    }
}

impl tower::Service<&Destination> for GaiResolver {
    type Response = SocketAddrs;
    type Error = io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, destination: &Destination) -> Self::Future {
        let result = lookup(destination.host(), destination.service());
        if let Ok(addrs) = &result {
            tracing::trace!(%destination, candidates = addrs.len(), "resolved");
        }
        ready(result)
    }
}

#[cfg(unix)]
fn lookup(host: &str, service: &str) -> io::Result<SocketAddrs> {
    use std::ffi::CString;
    use std::ptr;

    use nix::libc;

    let host = CString::new(host)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "host contains a nul byte"))?;
    let service = CString::new(service)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "port contains a nul byte"))?;

    // SAFETY: addrinfo is plain data; all-zero is the empty hint set.
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_protocol = libc::IPPROTO_TCP;

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: both strings are nul terminated and outlive the call.
    let code = unsafe { libc::getaddrinfo(host.as_ptr(), service.as_ptr(), &hints, &mut list) };
    if code != 0 {
        return Err(gai_error(code));
    }

    let mut addrs = VecDeque::new();
    let mut cursor = list;
    while !cursor.is_null() {
        // SAFETY: cursor walks the list getaddrinfo returned, which is freed below.
        let entry = unsafe { &*cursor };
        if let Some(addr) = socket_addr(entry) {
            addrs.push_back(addr);
        }
        cursor = entry.ai_next;
    }

    // SAFETY: list came from a successful getaddrinfo and is not used afterwards.
    unsafe { libc::freeaddrinfo(list) };
    Ok(SocketAddrs(addrs))
}

#[cfg(unix)]
fn socket_addr(entry: &nix::libc::addrinfo) -> Option<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};

    use nix::libc;

    if entry.ai_addr.is_null() {
        return None;
    }

    // SAFETY: ai_addr points at a sockaddr of the family it declares.
    unsafe {
        match i32::from((*entry.ai_addr).sa_family) {
            libc::AF_INET => {
                let sin = &*(entry.ai_addr as *const libc::sockaddr_in);
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = &*(entry.ai_addr as *const libc::sockaddr_in6);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

#[cfg(unix)]
fn gai_error(code: nix::libc::c_int) -> io::Error {
    use std::ffi::CStr;

    use nix::libc;

    if code == libc::EAI_SYSTEM {
        return io::Error::last_os_error();
    }

    // SAFETY: gai_strerror returns a static nul terminated message.
    let detail = unsafe { CStr::from_ptr(libc::gai_strerror(code)) };
    io::Error::other(format!(
        "failed to lookup address information: {}",
        detail.to_string_lossy()
    ))
}

#[cfg(not(unix))]
fn lookup(host: &str, service: &str) -> io::Result<SocketAddrs> {
    use std::net::ToSocketAddrs as _;

    let port: u16 = service.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported service {service:?}"),
        )
    })?;
    Ok((host, port).to_socket_addrs()?.collect())
}
