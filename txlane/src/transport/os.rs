//! Kernel-socket fallback implementing the [`Accelerator`] boundary.
//!
//! `OsAccelerator` carries txlane traffic over ordinary nonblocking TCP
//! sockets: rings are software identities, the kernel send buffer is the
//! transmit queue, and a send completes when its bytes have been written out
//! of the caller's registered buffer into the kernel. Memory registration
//! pins pages with `mlock` (best effort), mirroring what a protection-domain
//! registration does on real hardware.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Mutex;

use crate::error::Error;
use crate::registrar::MemoryRegion;
use crate::ring::RingId;
use crate::transport::{
    Accelerator, AcceptedSocket, CompletionSink, ConnectOutcome, RawCompletion, SendOp,
    TransportSocket,
};

struct OsSocket {
    fd: RawFd,
    listening: bool,
}

struct OsInner {
    next_socket: TransportSocket,
    next_ring: u64,
    next_hw_key: u32,
    sockets: HashMap<TransportSocket, OsSocket>,
    rings: HashMap<RingId, ()>,
    /// hw_key -> (ptr, len, pinned)
    regions: HashMap<u32, (usize, usize, bool)>,
}

/// Accelerator backed by kernel TCP sockets.
pub struct OsAccelerator {
    inner: Mutex<OsInner>,
    sink: Mutex<Option<CompletionSink>>,
}

impl OsAccelerator {
    pub fn new() -> Self {
        OsAccelerator {
            inner: Mutex::new(OsInner {
                next_socket: 1,
                next_ring: 1,
                next_hw_key: 1,
                sockets: HashMap::new(),
                rings: HashMap::new(),
                regions: HashMap::new(),
            }),
            sink: Mutex::new(None),
        }
    }

    fn fd_of(&self, socket: TransportSocket) -> Result<RawFd, Error> {
        let inner = self.inner.lock().unwrap();
        inner
            .sockets
            .get(&socket)
            .map(|s| s.fd)
            .ok_or(Error::InvalidSocket)
    }

    fn confirm(&self, txid: u64) {
        let sink = self.sink.lock().unwrap();
        if let Some(sink) = sink.as_ref() {
            sink(RawCompletion { txid });
        }
    }
}

impl Default for OsAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accelerator for OsAccelerator {
    fn context_id(&self) -> u64 {
        std::process::id() as u64
    }

    fn set_completion_sink(&self, sink: CompletionSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn open_socket(&self) -> Result<TransportSocket, Error> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_socket;
        inner.next_socket += 1;
        inner.sockets.insert(
            id,
            OsSocket {
                fd,
                listening: false,
            },
        );
        Ok(id)
    }

    fn close_socket(&self, socket: TransportSocket) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sock) = inner.sockets.remove(&socket) {
            unsafe {
                libc::close(sock.fd);
            }
        }
    }

    fn bind(&self, socket: TransportSocket, addr: SocketAddr) -> Result<(), Error> {
        let fd = self.fd_of(socket)?;
        let optval: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
        let ret =
            unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn listen(&self, socket: TransportSocket, backlog: usize) -> Result<(), Error> {
        let fd = self.fd_of(socket)?;
        // The listener stays nonblocking; blocking accept is a poll loop.
        set_nonblocking(fd)?;
        let ret = unsafe { libc::listen(fd, backlog as libc::c_int) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(sock) = inner.sockets.get_mut(&socket) {
            sock.listening = true;
        }
        Ok(())
    }

    fn connect(
        &self,
        socket: TransportSocket,
        addr: SocketAddr,
        nonblocking: bool,
    ) -> Result<ConnectOutcome, Error> {
        let fd = self.fd_of(socket)?;
        if nonblocking {
            set_nonblocking(fd)?;
        }
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
        let ret =
            unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
        if ret == 0 {
            return Ok(ConnectOutcome::Established);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) if nonblocking => Ok(ConnectOutcome::Pending),
            _ => Err(Error::Io(err)),
        }
    }

    fn accept(
        &self,
        socket: TransportSocket,
        nonblocking: bool,
    ) -> Result<AcceptedSocket, Error> {
        let fd = {
            let inner = self.inner.lock().unwrap();
            let sock = inner.sockets.get(&socket).ok_or(Error::InvalidSocket)?;
            if !sock.listening {
                return Err(Error::InvalidState);
            }
            sock.fd
        };
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addr_len =
                std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let accepted = unsafe {
                libc::accept4(
                    fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                    libc::SOCK_CLOEXEC,
                )
            };
            if accepted >= 0 {
                let peer = sockaddr_to_socket_addr(&storage)
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                let mut inner = self.inner.lock().unwrap();
                let id = inner.next_socket;
                inner.next_socket += 1;
                inner.sockets.insert(
                    id,
                    OsSocket {
                        fd: accepted,
                        listening: false,
                    },
                );
                return Ok(AcceptedSocket { socket: id, peer });
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) if nonblocking => return Err(Error::WouldBlock),
                Some(libc::EAGAIN) => {
                    poll_readable(fd)?;
                    continue;
                }
                _ => return Err(Error::Io(err)),
            }
        }
    }

    fn register_memory(&self, region: &MemoryRegion) -> Result<u32, Error> {
        // Pin the pages like a protection-domain registration would.
        // Best effort: a low RLIMIT_MEMLOCK downgrades to an unpinned
        // registration rather than failing the caller.
        let pinned =
            unsafe { libc::mlock(region.ptr as *const libc::c_void, region.len) } == 0;
        let mut inner = self.inner.lock().unwrap();
        let hw_key = inner.next_hw_key;
        inner.next_hw_key += 1;
        inner
            .regions
            .insert(hw_key, (region.ptr as usize, region.len, pinned));
        Ok(hw_key)
    }

    fn deregister_memory(&self, hw_key: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((ptr, len, pinned)) = inner.regions.remove(&hw_key)
            && pinned
        {
            unsafe {
                libc::munlock(ptr as *const libc::c_void, len);
            }
        }
    }

    fn create_ring(&self, _depth: u32) -> Result<RingId, Error> {
        // Software ring identity; the kernel send buffer is the queue.
        let mut inner = self.inner.lock().unwrap();
        let ring = RingId(inner.next_ring);
        inner.next_ring += 1;
        inner.rings.insert(ring, ());
        Ok(ring)
    }

    fn destroy_ring(&self, ring: RingId) {
        // Sends complete synchronously on this path, so there is nothing
        // queued to quiesce.
        let mut inner = self.inner.lock().unwrap();
        inner.rings.remove(&ring);
    }

    fn attach_socket(&self, socket: TransportSocket, ring: RingId) -> Result<(), Error> {
        let inner = self.inner.lock().unwrap();
        if !inner.rings.contains_key(&ring) {
            return Err(Error::InvalidState);
        }
        if !inner.sockets.contains_key(&socket) {
            return Err(Error::InvalidSocket);
        }
        Ok(())
    }

    fn post_send(&self, ring: RingId, op: SendOp, more: bool) -> Result<(), Error> {
        {
            let inner = self.inner.lock().unwrap();
            if !inner.regions.contains_key(&op.hw_key) {
                return Err(Error::InvalidKey);
            }
            if !inner.rings.contains_key(&ring) {
                return Err(Error::InvalidState);
            }
        }
        let fd = self.fd_of(op.socket)?;

        let mut flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
        if more {
            flags |= libc::MSG_MORE;
        }

        let mut written: usize = 0;
        let total = op.len as usize;
        while written < total {
            let ret = unsafe {
                libc::send(
                    fd,
                    op.ptr.add(written) as *const libc::c_void,
                    total - written,
                    flags,
                )
            };
            if ret >= 0 {
                written += ret as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // Queue full before any byte moved: classic backpressure.
                Some(libc::EAGAIN) if written == 0 => return Err(Error::WouldBlock),
                // Partial send: the descriptor is committed, so wait for
                // space and push the remainder to preserve stream order.
                Some(libc::EAGAIN) => {
                    poll_writable(fd)?;
                    continue;
                }
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => return Err(Error::SocketClosed),
                _ => return Err(Error::Io(err)),
            }
        }

        // The bytes have left the caller's buffer for the kernel.
        self.confirm(op.txid);
        Ok(())
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn poll_readable(fd: RawFd) -> Result<(), Error> {
    poll_fd(fd, libc::POLLIN)
}

fn poll_writable(fd: RawFd) -> Result<(), Error> {
    poll_fd(fd, libc::POLLOUT)
}

fn poll_fd(fd: RawFd, events: libc::c_short) -> Result<(), Error> {
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(Error::Io(err));
        }
    }
}

/// Write a SocketAddr into a sockaddr_storage, returning the address length.
fn socket_addr_to_sockaddr(addr: SocketAddr, storage: &mut libc::sockaddr_storage) -> u32 {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

/// Convert a sockaddr_storage filled by accept4 into a SocketAddr.
fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sa.sin6_port))))
        }
        _ => None,
    }
}
