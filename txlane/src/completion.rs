use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::ring::RingId;
use crate::socket::SocketToken;

/// Operation kinds encoded in the upper 8 bits of a transmit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum OpKind {
    /// Zero-copy send descriptor.
    Send = 1,
}

impl OpKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(OpKind::Send),
            _ => None,
        }
    }
}

/// Transmit identifier carried across the accelerator boundary.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..56: OpKind (8 bits)
/// Bits 55..32: socket slot index (24 bits, max 16M sockets)
/// Bits 31..0:  per-socket sequence number (32 bits, wrapping)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxId(pub u64);

impl TxId {
    const KIND_SHIFT: u64 = 56;
    const SOCKET_SHIFT: u64 = 32;
    const KIND_MASK: u64 = 0xFF << Self::KIND_SHIFT;
    const SOCKET_MASK: u64 = 0x00FF_FFFF << Self::SOCKET_SHIFT;
    const SEQ_MASK: u64 = 0xFFFF_FFFF;

    /// Encode an operation kind, socket index, and sequence number.
    #[inline]
    pub fn encode(kind: OpKind, socket: u32, seq: u32) -> Self {
        debug_assert!(socket < (1 << 24), "socket index exceeds 24 bits");
        let v = ((kind as u64) << Self::KIND_SHIFT)
            | (((socket as u64) & 0x00FF_FFFF) << Self::SOCKET_SHIFT)
            | (seq as u64);
        TxId(v)
    }

    /// Decode the operation kind.
    #[inline]
    pub fn kind(self) -> Option<OpKind> {
        OpKind::from_u8(((self.0 & Self::KIND_MASK) >> Self::KIND_SHIFT) as u8)
    }

    /// Decode the socket slot index.
    #[inline]
    pub fn socket(self) -> u32 {
        ((self.0 & Self::SOCKET_MASK) >> Self::SOCKET_SHIFT) as u32
    }

    /// Decode the sequence number.
    #[inline]
    pub fn seq(self) -> u32 {
        (self.0 & Self::SEQ_MASK) as u32
    }

    /// Raw u64 value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Asynchronous notification that a send's bytes have left the local
/// buffer. Delivered exactly once per flushed send, in per-socket
/// submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    /// The socket the send was submitted on.
    pub socket: SocketToken,
    /// The socket's opaque user tag at completion time.
    pub socket_userdata: u64,
    /// The per-send tag supplied to `send`.
    pub tag: u64,
    /// Bytes confirmed out of the buffer.
    pub len: u32,
}

/// How `poll_completions` waits for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Return immediately, possibly with no events.
    NonBlocking,
    /// Wait until at least one event is ready or the timeout elapses.
    Blocking(Duration),
}

/// Callback invoked with each completion event when the driver runs in
/// dispatch mode.
///
/// Handlers run on a dedicated per-ring completion thread, never on the
/// thread that submitted the send. A handler that blocks stalls delivery
/// for its own ring only.
pub trait SendCompleteHandler: Send + Sync + 'static {
    fn on_send_complete(&self, event: CompletionEvent);
}

impl<F> SendCompleteHandler for F
where
    F: Fn(CompletionEvent) + Send + Sync + 'static,
{
    fn on_send_complete(&self, event: CompletionEvent) {
        self(event)
    }
}

/// Spawn the dispatcher thread for one ring's completion queue.
///
/// The thread drains events in order and exits when the queue disconnects,
/// which happens once the ring is destroyed and its last pending send has
/// completed.
pub(crate) fn spawn_dispatcher(
    ring: RingId,
    rx: Receiver<CompletionEvent>,
    handler: Arc<dyn SendCompleteHandler>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("txlane-cq-{}", ring.raw()))
        .spawn(move || {
            crate::counter::bind_thread_shard(ring.raw() as usize);
            for event in rx.iter() {
                crate::metrics::COMPLETIONS_DISPATCHED.increment();
                handler.on_send_complete(event);
            }
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn txid_round_trip() {
        let id = TxId::encode(OpKind::Send, 0x00AB_CDEF & 0x00FF_FFFF, 0xDEAD_BEEF);
        assert_eq!(id.kind(), Some(OpKind::Send));
        assert_eq!(id.socket(), 0x00AB_CDEF);
        assert_eq!(id.seq(), 0xDEAD_BEEF);
    }

    #[test]
    fn txid_zero_values() {
        let id = TxId::encode(OpKind::Send, 0, 0);
        assert_eq!(id.kind(), Some(OpKind::Send));
        assert_eq!(id.socket(), 0);
        assert_eq!(id.seq(), 0);
    }

    #[test]
    fn txid_max_socket() {
        let max_socket = (1u32 << 24) - 1;
        let id = TxId::encode(OpKind::Send, max_socket, u32::MAX);
        assert_eq!(id.socket(), max_socket);
        assert_eq!(id.seq(), u32::MAX);
    }

    #[test]
    fn txid_invalid_kind() {
        let id = TxId(0xFF << 56);
        assert_eq!(id.kind(), None);
    }

    #[test]
    fn dispatcher_delivers_in_order_and_exits() {
        let (tx, rx) = unbounded();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();

        spawn_dispatcher(
            RingId(42),
            rx,
            Arc::new(move |event: CompletionEvent| {
                seen_in_handler.lock().unwrap().push(event.tag);
            }),
        )
        .unwrap();

        for tag in 0..16u64 {
            tx.send(CompletionEvent {
                socket: SocketToken::new(0, 0),
                socket_userdata: 0,
                tag,
                len: 1,
            })
            .unwrap();
        }
        drop(tx);

        // The dispatcher drains the queue then exits on disconnect.
        for _ in 0..200 {
            if seen.lock().unwrap().len() == 16 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..16u64).collect::<Vec<_>>());
    }

    #[test]
    fn closure_handler_blanket_impl() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = hits.clone();
        let handler: Arc<dyn SendCompleteHandler> = Arc::new(move |_event: CompletionEvent| {
            hits_in_handler.fetch_add(1, Ordering::SeqCst);
        });
        handler.on_send_complete(CompletionEvent {
            socket: SocketToken::new(1, 0),
            socket_userdata: 7,
            tag: 9,
            len: 3,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
