use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::completion::CompletionEvent;
use crate::error::Error;
use crate::pipeline::SendStage;
use crate::ring::RingId;
use crate::transport::TransportSocket;

/// Opaque socket handle.
///
/// Encodes the slot index and a generation for stale detection: a token held
/// past `close` fails every operation instead of aliasing a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SocketToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        SocketToken { index, generation }
    }

    /// Returns the socket slot index. Useful for indexing per-socket arrays.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Lifecycle state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    /// Freshly opened, no address, no ring.
    Open,
    /// Local address recorded; still no ring commitment.
    Bound,
    /// Listening; ring assigned.
    Listening,
    /// Nonblocking connect initiated; ring assigned, outcome pending.
    Connecting,
    /// Established; ring assigned, sends allowed.
    Connected,
    /// Closed; slot released.
    Closed,
}

/// Isolation state of a socket.
///
/// Decided at most once, and only before a ring is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationState {
    /// No request yet; first ring use will settle on `Default`.
    Undecided,
    /// Explicitly or implicitly on shared ring infrastructure.
    Default,
    /// Elevated to dedicated-ring locality.
    Isolated,
}

/// Mutable per-socket state, guarded by the entry's mutex.
pub(crate) struct SocketState {
    pub lifecycle: Lifecycle,
    pub isolation: IsolationState,
    pub nonblocking: bool,
    pub local_addr: Option<SocketAddr>,
    /// Rings backing this socket. Assigned once, immutable after.
    pub rings: Vec<RingId>,
    /// Transmit ring plus its completion queue producer.
    pub tx_ring: Option<(RingId, Sender<CompletionEvent>)>,
    /// Accelerator-side socket handle.
    pub hw: TransportSocket,
    /// Batch-held sends awaiting flush.
    pub stage: SendStage,
    /// Sequence number of the next accepted send descriptor.
    pub next_seq: u32,
}

/// One live socket. Shared between the table, the pending-send table (which
/// keeps it alive for completions arriving after close), and the caller's
/// operations.
pub(crate) struct SocketEntry {
    pub token: SocketToken,
    /// Opaque caller tag reported in completion events.
    pub userdata: AtomicU64,
    /// Sends posted to hardware and not yet completed.
    pub in_flight: AtomicU32,
    /// Last completed sequence number, for order verification.
    /// `u32::MAX` until the first completion.
    pub last_completed_seq: AtomicU32,
    pub state: Mutex<SocketState>,
}

impl SocketEntry {
    fn new(token: SocketToken, hw: TransportSocket, max_held: usize) -> Self {
        SocketEntry {
            token,
            userdata: AtomicU64::new(0),
            in_flight: AtomicU32::new(0),
            last_completed_seq: AtomicU32::new(u32::MAX),
            state: Mutex::new(SocketState {
                lifecycle: Lifecycle::Open,
                isolation: IsolationState::Undecided,
                nonblocking: false,
                local_addr: None,
                rings: Vec::new(),
                tx_ring: None,
                hw,
                stage: SendStage::new(max_held),
                next_seq: 0,
            }),
        }
    }
}

struct Slot {
    generation: u32,
    entry: Option<Arc<SocketEntry>>,
}

/// Socket slot table with a free list for O(1) allocation.
pub(crate) struct SocketTable {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    max_held: usize,
}

impl SocketTable {
    pub fn new(max_sockets: u32, max_held: usize) -> Self {
        let mut slots = Vec::with_capacity(max_sockets as usize);
        for _ in 0..max_sockets {
            slots.push(Slot {
                generation: 0,
                entry: None,
            });
        }
        // Reverse order so pop hands out the lowest index first.
        let free_list: Vec<u32> = (0..max_sockets).rev().collect();
        SocketTable {
            slots,
            free_list,
            max_held,
        }
    }

    /// Allocate a slot for a freshly opened accelerator socket.
    pub fn allocate(&mut self, hw: TransportSocket) -> Result<Arc<SocketEntry>, Error> {
        let index = self.free_list.pop().ok_or(Error::SocketLimitReached)?;
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.entry.is_none());
        let entry = Arc::new(SocketEntry::new(
            SocketToken::new(index, slot.generation),
            hw,
            self.max_held,
        ));
        slot.entry = Some(entry.clone());
        Ok(entry)
    }

    /// Resolve a token, rejecting stale generations.
    pub fn get(&self, token: SocketToken) -> Result<Arc<SocketEntry>, Error> {
        let slot = self
            .slots
            .get(token.index as usize)
            .ok_or(Error::InvalidSocket)?;
        if slot.generation != token.generation {
            return Err(Error::InvalidSocket);
        }
        slot.entry.clone().ok_or(Error::InvalidSocket)
    }

    /// Release a slot back to the free list, bumping its generation.
    /// Returns the entry for teardown; completions already in flight keep
    /// their own reference through the pending table.
    pub fn release(&mut self, token: SocketToken) -> Result<Arc<SocketEntry>, Error> {
        let slot = self
            .slots
            .get_mut(token.index as usize)
            .ok_or(Error::InvalidSocket)?;
        if slot.generation != token.generation {
            return Err(Error::InvalidSocket);
        }
        let entry = slot.entry.take().ok_or(Error::InvalidSocket)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(token.index);
        Ok(entry)
    }

    /// Number of live sockets.
    #[allow(dead_code)]
    pub fn active_count(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// All live entries, for driver teardown.
    pub fn drain_entries(&mut self) -> Vec<Arc<SocketEntry>> {
        let mut entries = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
                entries.push(entry);
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_get_release() {
        let mut table = SocketTable::new(4, 8);
        let entry = table.allocate(11).unwrap();
        let token = entry.token;
        assert_eq!(token.index(), 0);
        assert_eq!(table.active_count(), 1);

        let fetched = table.get(token).unwrap();
        assert_eq!(fetched.state.lock().unwrap().hw, 11);

        table.release(token).unwrap();
        assert_eq!(table.active_count(), 0);
        assert!(matches!(table.get(token), Err(Error::InvalidSocket)));
    }

    #[test]
    fn stale_token_rejected_after_reuse() {
        let mut table = SocketTable::new(1, 8);
        let first = table.allocate(1).unwrap().token;
        table.release(first).unwrap();

        let second = table.allocate(2).unwrap().token;
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        assert!(matches!(table.get(first), Err(Error::InvalidSocket)));
        assert!(table.get(second).is_ok());
    }

    #[test]
    fn exhaustion() {
        let mut table = SocketTable::new(2, 8);
        table.allocate(1).unwrap();
        table.allocate(2).unwrap();
        assert!(matches!(table.allocate(3), Err(Error::SocketLimitReached)));
    }

    #[test]
    fn double_release_rejected() {
        let mut table = SocketTable::new(2, 8);
        let token = table.allocate(1).unwrap().token;
        table.release(token).unwrap();
        assert!(matches!(table.release(token), Err(Error::InvalidSocket)));
    }
}
