//! In-process software device implementing the [`Accelerator`] boundary.
//!
//! `SoftAccelerator` models the transmit side of the hardware: bounded
//! per-ring queues, an address-keyed listener registry for in-process
//! connect/accept, and per-socket capture of the transmitted byte stream so
//! tests can assert on the logical wire order. Completion confirmation is
//! either automatic (on post) or driven by an explicit pump, which makes
//! backpressure and no-event-before-flush behavior deterministic under test.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::Error;
use crate::registrar::MemoryRegion;
use crate::ring::RingId;
use crate::transport::{
    Accelerator, AcceptedSocket, CompletionSink, ConnectOutcome, RawCompletion, SendOp,
    TransportSocket,
};

struct SoftSocket {
    local: Option<SocketAddr>,
    listening: bool,
    connected: bool,
    /// Producer/consumer pair for the accept backlog (listeners only).
    accept_tx: Option<Sender<AcceptedSocket>>,
    accept_rx: Option<Receiver<AcceptedSocket>>,
    /// Bytes the device has accepted for transmission, in wire order.
    stream: BytesMut,
    /// Ring the socket was attached to.
    #[allow(dead_code)]
    ring: Option<RingId>,
}

impl SoftSocket {
    fn new(local: Option<SocketAddr>, connected: bool) -> Self {
        SoftSocket {
            local,
            listening: false,
            connected,
            accept_tx: None,
            accept_rx: None,
            stream: BytesMut::new(),
            ring: None,
        }
    }
}

struct PostedSend {
    txid: u64,
}

struct SoftRing {
    depth: u32,
    queued: VecDeque<PostedSend>,
}

struct SoftInner {
    next_socket: TransportSocket,
    next_ring: u64,
    next_hw_key: u32,
    sockets: HashMap<TransportSocket, SoftSocket>,
    listeners: HashMap<SocketAddr, TransportSocket>,
    rings: HashMap<RingId, SoftRing>,
    regions: HashMap<u32, (usize, usize)>,
}

/// Deterministic software accelerator.
pub struct SoftAccelerator {
    ctx: u64,
    auto_complete: bool,
    inner: Mutex<SoftInner>,
    sink: Mutex<Option<CompletionSink>>,
}

impl SoftAccelerator {
    /// Auto-complete device: every posted send is confirmed as soon as it
    /// is accepted by the ring.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Manual-pump device: posted sends sit on their ring until
    /// [`pump`](Self::pump) confirms them. Queues can fill, so `WouldBlock`
    /// paths are testable.
    pub fn manual() -> Self {
        Self::build(false)
    }

    fn build(auto_complete: bool) -> Self {
        SoftAccelerator {
            ctx: 1,
            auto_complete,
            inner: Mutex::new(SoftInner {
                next_socket: 1,
                next_ring: 1,
                next_hw_key: 1,
                sockets: HashMap::new(),
                listeners: HashMap::new(),
                rings: HashMap::new(),
                regions: HashMap::new(),
            }),
            sink: Mutex::new(None),
        }
    }

    /// Confirm up to `max` queued sends on a ring, in post order.
    /// Returns the number confirmed.
    pub fn pump(&self, ring: RingId, max: usize) -> usize {
        let confirmed = {
            let mut inner = self.inner.lock().unwrap();
            let Some(entry) = inner.rings.get_mut(&ring) else {
                return 0;
            };
            let n = max.min(entry.queued.len());
            entry.queued.drain(..n).collect::<Vec<_>>()
        };
        let n = confirmed.len();
        self.confirm(confirmed);
        n
    }

    /// Confirm every queued send on every ring.
    pub fn pump_all(&self) -> usize {
        let confirmed = {
            let mut inner = self.inner.lock().unwrap();
            let mut all = Vec::new();
            for entry in inner.rings.values_mut() {
                all.extend(entry.queued.drain(..));
            }
            all
        };
        let n = confirmed.len();
        self.confirm(confirmed);
        n
    }

    /// Number of sends currently queued on a ring.
    pub fn queued(&self, ring: RingId) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.rings.get(&ring).map_or(0, |r| r.queued.len())
    }

    /// The byte stream the device has accepted from a socket, in wire order.
    pub fn transmitted(&self, socket: TransportSocket) -> Bytes {
        let inner = self.inner.lock().unwrap();
        inner
            .sockets
            .get(&socket)
            .map(|s| Bytes::copy_from_slice(&s.stream))
            .unwrap_or_default()
    }

    fn confirm(&self, sends: Vec<PostedSend>) {
        if sends.is_empty() {
            return;
        }
        let sink = self.sink.lock().unwrap();
        // A device without an installed sink drops confirmations; the
        // driver installs one before any send can be posted.
        if let Some(sink) = sink.as_ref() {
            for send in sends {
                sink(RawCompletion { txid: send.txid });
            }
        }
    }
}

impl Default for SoftAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accelerator for SoftAccelerator {
    fn context_id(&self) -> u64 {
        self.ctx
    }

    fn set_completion_sink(&self, sink: CompletionSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn open_socket(&self) -> Result<TransportSocket, Error> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_socket;
        inner.next_socket += 1;
        inner.sockets.insert(id, SoftSocket::new(None, false));
        Ok(id)
    }

    fn close_socket(&self, socket: TransportSocket) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sock) = inner.sockets.remove(&socket)
            && sock.listening
            && let Some(addr) = sock.local
        {
            inner.listeners.remove(&addr);
        }
    }

    fn bind(&self, socket: TransportSocket, addr: SocketAddr) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let sock = inner.sockets.get_mut(&socket).ok_or(Error::InvalidSocket)?;
        sock.local = Some(addr);
        Ok(())
    }

    fn listen(&self, socket: TransportSocket, _backlog: usize) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let sock = inner.sockets.get_mut(&socket).ok_or(Error::InvalidSocket)?;
        let addr = sock.local.ok_or(Error::InvalidState)?;
        if sock.listening {
            return Err(Error::InvalidState);
        }
        let (tx, rx) = unbounded();
        sock.listening = true;
        sock.accept_tx = Some(tx);
        sock.accept_rx = Some(rx);
        inner.listeners.insert(addr, socket);
        Ok(())
    }

    fn connect(
        &self,
        socket: TransportSocket,
        addr: SocketAddr,
        nonblocking: bool,
    ) -> Result<ConnectOutcome, Error> {
        let mut inner = self.inner.lock().unwrap();
        let sock = inner.sockets.get(&socket).ok_or(Error::InvalidSocket)?;
        if sock.listening || sock.connected {
            return Err(Error::InvalidState);
        }
        let peer_of_listener = sock
            .local
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));

        match inner.listeners.get(&addr).copied() {
            Some(listener) => {
                // Mint the server-side socket and queue it on the
                // listener's backlog.
                let accepted_id = inner.next_socket;
                inner.next_socket += 1;
                inner
                    .sockets
                    .insert(accepted_id, SoftSocket::new(Some(addr), true));
                let listener_sock = inner
                    .sockets
                    .get(&listener)
                    .ok_or(Error::InvalidState)?;
                let tx = listener_sock
                    .accept_tx
                    .clone()
                    .ok_or(Error::InvalidState)?;
                tx.send(AcceptedSocket {
                    socket: accepted_id,
                    peer: peer_of_listener,
                })
                .map_err(|_| Error::SocketClosed)?;
                let sock = inner
                    .sockets
                    .get_mut(&socket)
                    .ok_or(Error::InvalidSocket)?;
                sock.connected = true;
                Ok(ConnectOutcome::Established)
            }
            // No listener. A nonblocking initiation succeeds now and fails
            // later, like a SYN that will be refused; a blocking connect
            // fails immediately.
            None if nonblocking => Ok(ConnectOutcome::Pending),
            None => Err(Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused))),
        }
    }

    fn accept(
        &self,
        socket: TransportSocket,
        nonblocking: bool,
    ) -> Result<AcceptedSocket, Error> {
        let rx = {
            let inner = self.inner.lock().unwrap();
            let sock = inner.sockets.get(&socket).ok_or(Error::InvalidSocket)?;
            if !sock.listening {
                return Err(Error::InvalidState);
            }
            sock.accept_rx.clone().ok_or(Error::InvalidState)?
        };
        if nonblocking {
            rx.try_recv().map_err(|_| Error::WouldBlock)
        } else {
            // Blocks like POSIX accept; disconnects when the listener closes.
            rx.recv().map_err(|_| Error::SocketClosed)
        }
    }

    fn register_memory(&self, region: &MemoryRegion) -> Result<u32, Error> {
        let mut inner = self.inner.lock().unwrap();
        let hw_key = inner.next_hw_key;
        inner.next_hw_key += 1;
        inner
            .regions
            .insert(hw_key, (region.ptr as usize, region.len));
        Ok(hw_key)
    }

    fn deregister_memory(&self, hw_key: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.regions.remove(&hw_key);
    }

    fn create_ring(&self, depth: u32) -> Result<RingId, Error> {
        let mut inner = self.inner.lock().unwrap();
        let ring = RingId(inner.next_ring);
        inner.next_ring += 1;
        inner.rings.insert(
            ring,
            SoftRing {
                depth,
                queued: VecDeque::new(),
            },
        );
        Ok(ring)
    }

    fn destroy_ring(&self, ring: RingId) {
        // Quiesce: confirm everything still queued before the ring goes.
        let confirmed = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .rings
                .remove(&ring)
                .map(|r| r.queued.into_iter().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        self.confirm(confirmed);
    }

    fn attach_socket(&self, socket: TransportSocket, ring: RingId) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.rings.contains_key(&ring) {
            return Err(Error::InvalidState);
        }
        let sock = inner.sockets.get_mut(&socket).ok_or(Error::InvalidSocket)?;
        sock.ring = Some(ring);
        Ok(())
    }

    fn post_send(&self, ring: RingId, op: SendOp, _more: bool) -> Result<(), Error> {
        let auto = self.auto_complete;
        let confirmed = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.regions.contains_key(&op.hw_key) {
                return Err(Error::InvalidKey);
            }
            {
                let entry = inner.rings.get(&ring).ok_or(Error::InvalidState)?;
                if entry.queued.len() as u32 >= entry.depth {
                    return Err(Error::WouldBlock);
                }
            }

            // "DMA" the segment out of the caller's registered buffer into
            // the wire-order capture.
            // Safety: the segment was range-checked against a live
            // registration, whose owner keeps the memory alive until the
            // completion is confirmed.
            let data = unsafe { std::slice::from_raw_parts(op.ptr, op.len as usize) };
            let sock = inner
                .sockets
                .get_mut(&op.socket)
                .ok_or(Error::InvalidSocket)?;
            sock.stream.extend_from_slice(data);

            let entry = inner.rings.get_mut(&ring).expect("ring vanished");
            entry.queued.push_back(PostedSend { txid: op.txid });
            if auto {
                entry.queued.drain(..).collect::<Vec<_>>()
            } else {
                Vec::new()
            }
        };
        self.confirm(confirmed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn op(socket: TransportSocket, data: &[u8], hw_key: u32, txid: u64) -> SendOp {
        SendOp {
            socket,
            ptr: data.as_ptr(),
            len: data.len() as u32,
            hw_key,
            txid,
        }
    }

    fn counting_sink(counter: Arc<AtomicUsize>) -> CompletionSink {
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn auto_mode_confirms_on_post() {
        let accel = SoftAccelerator::new();
        let confirmed = Arc::new(AtomicUsize::new(0));
        accel.set_completion_sink(counting_sink(confirmed.clone()));

        let sock = accel.open_socket().unwrap();
        let ring = accel.create_ring(4).unwrap();
        let backing = *b"hello";
        let key = accel
            .register_memory(&MemoryRegion {
                ptr: backing.as_ptr() as *mut u8,
                len: backing.len(),
            })
            .unwrap();

        accel.post_send(ring, op(sock, &backing, key, 1), false).unwrap();
        assert_eq!(confirmed.load(Ordering::SeqCst), 1);
        assert_eq!(&accel.transmitted(sock)[..], b"hello");
    }

    #[test]
    fn manual_mode_fills_and_pumps() {
        let accel = SoftAccelerator::manual();
        let confirmed = Arc::new(AtomicUsize::new(0));
        accel.set_completion_sink(counting_sink(confirmed.clone()));

        let sock = accel.open_socket().unwrap();
        let ring = accel.create_ring(2).unwrap();
        let backing = *b"xy";
        let key = accel
            .register_memory(&MemoryRegion {
                ptr: backing.as_ptr() as *mut u8,
                len: backing.len(),
            })
            .unwrap();

        accel.post_send(ring, op(sock, &backing[..1], key, 1), false).unwrap();
        accel.post_send(ring, op(sock, &backing[1..], key, 2), false).unwrap();
        assert!(matches!(
            accel.post_send(ring, op(sock, &backing[..1], key, 3), false),
            Err(Error::WouldBlock)
        ));
        assert_eq!(confirmed.load(Ordering::SeqCst), 0);

        assert_eq!(accel.pump(ring, 1), 1);
        assert_eq!(confirmed.load(Ordering::SeqCst), 1);

        // A slot is free again.
        accel.post_send(ring, op(sock, &backing[..1], key, 3), false).unwrap();
        assert_eq!(accel.pump_all(), 2);
        assert_eq!(confirmed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn destroy_ring_quiesces() {
        let accel = SoftAccelerator::manual();
        let confirmed = Arc::new(AtomicUsize::new(0));
        accel.set_completion_sink(counting_sink(confirmed.clone()));

        let sock = accel.open_socket().unwrap();
        let ring = accel.create_ring(4).unwrap();
        let backing = *b"q";
        let key = accel
            .register_memory(&MemoryRegion {
                ptr: backing.as_ptr() as *mut u8,
                len: backing.len(),
            })
            .unwrap();
        accel.post_send(ring, op(sock, &backing, key, 9), false).unwrap();

        accel.destroy_ring(ring);
        assert_eq!(confirmed.load(Ordering::SeqCst), 1);
        assert_eq!(accel.queued(ring), 0);
    }

    #[test]
    fn connect_accept_round_trip() {
        let accel = SoftAccelerator::new();
        let addr: SocketAddr = "10.0.0.1:8080".parse().unwrap();

        let listener = accel.open_socket().unwrap();
        accel.bind(listener, addr).unwrap();
        accel.listen(listener, 8).unwrap();

        // Empty backlog, nonblocking.
        assert!(matches!(
            accel.accept(listener, true),
            Err(Error::WouldBlock)
        ));

        let client = accel.open_socket().unwrap();
        assert_eq!(
            accel.connect(client, addr, false).unwrap(),
            ConnectOutcome::Established
        );

        let accepted = accel.accept(listener, true).unwrap();
        assert_eq!(accepted.peer, SocketAddr::from(([127, 0, 0, 1], 0)));
    }

    #[test]
    fn nonblocking_connect_without_listener_pends() {
        let accel = SoftAccelerator::new();
        let addr: SocketAddr = "10.0.0.1:65535".parse().unwrap();
        let client = accel.open_socket().unwrap();

        assert_eq!(
            accel.connect(client, addr, true).unwrap(),
            ConnectOutcome::Pending
        );
        assert!(accel.connect(accel.open_socket().unwrap(), addr, false).is_err());
    }

    #[test]
    fn post_with_unknown_key_fails() {
        let accel = SoftAccelerator::new();
        let sock = accel.open_socket().unwrap();
        let ring = accel.create_ring(4).unwrap();
        let backing = *b"z";
        assert!(matches!(
            accel.post_send(ring, op(sock, &backing, 77, 1), false),
            Err(Error::InvalidKey)
        ));
    }
}
