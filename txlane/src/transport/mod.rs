//! The accelerated-transport collaborator boundary.
//!
//! txlane consumes — never implements — the kernel-bypass transport. The
//! [`Accelerator`] trait is the explicit capability handle for it: socket
//! lifecycle hooks, protection-domain memory registration, ring lifecycle,
//! the zero-copy send primitive, and completion-sink installation. Two
//! implementations ship with the crate: [`soft::SoftAccelerator`], a
//! deterministic in-process software device, and [`os::OsAccelerator`], a
//! kernel-socket fallback with software rings.

pub mod os;
pub mod soft;

use std::net::SocketAddr;

use crate::error::Error;
use crate::registrar::MemoryRegion;
use crate::ring::RingId;

/// Opaque per-socket handle minted by the accelerator.
pub type TransportSocket = u64;

/// Raw confirmation from the transmit path that a posted send's bytes have
/// left the local buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCompletion {
    /// The transmit identifier the send was posted under.
    pub txid: u64,
}

/// Sink invoked by the accelerator on its completion context for every
/// confirmed send. Must not block: it only routes into completion queues.
pub type CompletionSink = Box<dyn Fn(RawCompletion) + Send + Sync>;

/// Outcome of a connect initiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The connection is established and sends may be issued.
    Established,
    /// Nonblocking connect initiated; the outcome arrives later. Ring
    /// commitment has already happened.
    Pending,
}

/// A connection handed out by `accept`.
#[derive(Debug, Clone, Copy)]
pub struct AcceptedSocket {
    pub socket: TransportSocket,
    pub peer: SocketAddr,
}

/// A zero-copy send descriptor as posted to a ring: a segment of a
/// registered region plus the transmit identifier echoed back in the
/// completion.
pub struct SendOp {
    pub socket: TransportSocket,
    pub ptr: *const u8,
    pub len: u32,
    /// Hardware key of the registered region the segment lives in.
    pub hw_key: u32,
    pub txid: u64,
}

// Safety: the pointer references a registered region the caller keeps alive
// until the send completes; ops only travel to the accelerator boundary.
unsafe impl Send for SendOp {}

/// The consumed surface of the underlying accelerated-transport library.
///
/// All methods take `&self`; implementations are internally synchronized.
/// `register_memory` is the privileged slow path — it pins memory into the
/// protection domain and is never called per send.
pub trait Accelerator: Send + Sync + 'static {
    /// Identity of the device context / protection domain. Part of every
    /// ring co-location key.
    fn context_id(&self) -> u64;

    /// Install the completion sink. Called once, before any send is posted.
    fn set_completion_sink(&self, sink: CompletionSink);

    /// Open a transport socket.
    fn open_socket(&self) -> Result<TransportSocket, Error>;

    /// Close a transport socket.
    fn close_socket(&self, socket: TransportSocket);

    /// Record the socket's local address.
    fn bind(&self, socket: TransportSocket, addr: SocketAddr) -> Result<(), Error>;

    /// Start listening.
    fn listen(&self, socket: TransportSocket, backlog: usize) -> Result<(), Error>;

    /// Initiate a connection. Nonblocking initiation may report
    /// [`ConnectOutcome::Pending`].
    fn connect(
        &self,
        socket: TransportSocket,
        addr: SocketAddr,
        nonblocking: bool,
    ) -> Result<ConnectOutcome, Error>;

    /// Take one connection from the listener's backlog. Blocks unless
    /// `nonblocking`, in which case an empty backlog is `WouldBlock`.
    fn accept(&self, socket: TransportSocket, nonblocking: bool)
    -> Result<AcceptedSocket, Error>;

    /// Pin a memory region into the protection domain and return its
    /// hardware key.
    fn register_memory(&self, region: &MemoryRegion) -> Result<u32, Error>;

    /// Unpin a previously registered region.
    fn deregister_memory(&self, hw_key: u32);

    /// Create a hardware ring with the given transmit queue depth.
    fn create_ring(&self, depth: u32) -> Result<RingId, Error>;

    /// Destroy a ring. Implementations quiesce the ring first: every send
    /// still queued on it is confirmed through the sink before the ring
    /// disappears.
    fn destroy_ring(&self, ring: RingId);

    /// Attach a socket to the ring that will carry its traffic.
    fn attach_socket(&self, socket: TransportSocket, ring: RingId) -> Result<(), Error>;

    /// Post a send descriptor to a ring. `more` is the batch-hold hint: the
    /// device may delay the doorbell to coalesce with the next post.
    /// A full transmit queue is `WouldBlock`.
    fn post_send(&self, ring: RingId, op: SendOp, more: bool) -> Result<(), Error>;
}
