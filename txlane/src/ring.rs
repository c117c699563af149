use std::collections::HashMap;
use std::net::IpAddr;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::completion::CompletionEvent;
use crate::error::Error;
use crate::transport::Accelerator;

/// Identity of a hardware transmit/receive queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingId(pub(crate) u64);

impl RingId {
    /// Raw ring identity as minted by the accelerator.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Value carried by an isolation request, mirroring the socket-option ABI:
/// `Safe` opts the socket into a dedicated ring, `Default` pins it to shared
/// infrastructure. Either request decides the state; a second request in any
/// direction is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    Safe,
    Default,
}

/// Which population a ring serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RingClass {
    /// Shared infrastructure for non-isolated sockets.
    Shared,
    /// Dedicated to the isolated socket group of one key.
    Isolated,
}

/// Co-location key: accelerator context plus the socket's bound local
/// address. Ports do not split rings — isolated listeners on distinct ports
/// of one address co-locate, and unbound client sockets share the context's
/// unbound key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RingKey {
    pub ctx: u64,
    pub local: Option<IpAddr>,
    pub class: RingClass,
}

/// Outcome of a first-use ring assignment.
pub(crate) struct Assignment {
    pub ring: RingId,
    pub tx: Sender<CompletionEvent>,
    pub rx: Receiver<CompletionEvent>,
    /// Whether this call minted the ring (the caller spawns the dispatcher
    /// for newly created rings in dispatch mode).
    pub created: bool,
}

struct RingEntry {
    members: u32,
    /// Reverse key for cleanup; rings created for a key keep it until the
    /// last member leaves.
    key: RingKey,
    tx: Sender<CompletionEvent>,
    rx: Receiver<CompletionEvent>,
}

/// Keyed table mapping co-location keys to live rings.
///
/// Mutated only on first-use binding, membership changes, and teardown; the
/// allocate-vs-attach decision happens in one critical section so no two
/// racing first users can both mint a ring for the same key.
///
/// A destroyed ring's completion queue is retired, not dropped: sends that
/// were still in flight at teardown deliver their events exactly once
/// through the retired receiver, which is reaped once the queue disconnects.
pub(crate) struct RingDirectory {
    by_key: HashMap<RingKey, RingId>,
    rings: HashMap<RingId, RingEntry>,
    retired: HashMap<RingId, Receiver<CompletionEvent>>,
}

impl RingDirectory {
    pub fn new() -> Self {
        RingDirectory {
            by_key: HashMap::new(),
            rings: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    /// Resolve a key to its ring, minting one through the accelerator on
    /// first use and attaching on every subsequent use.
    pub fn assign(
        &mut self,
        key: RingKey,
        accel: &dyn Accelerator,
        depth: u32,
    ) -> Result<Assignment, Error> {
        if let Some(&ring) = self.by_key.get(&key) {
            let entry = self.rings.get_mut(&ring).expect("keyed ring missing");
            entry.members += 1;
            crate::metrics::RINGS_ATTACHED.increment();
            return Ok(Assignment {
                ring,
                tx: entry.tx.clone(),
                rx: entry.rx.clone(),
                created: false,
            });
        }

        let ring = accel.create_ring(depth)?;
        let (tx, rx) = unbounded();
        self.by_key.insert(key.clone(), ring);
        self.rings.insert(
            ring,
            RingEntry {
                members: 1,
                key,
                tx: tx.clone(),
                rx: rx.clone(),
            },
        );
        crate::metrics::RINGS_ALLOCATED.increment();
        crate::metrics::RINGS_ACTIVE.increment();
        Ok(Assignment {
            ring,
            tx,
            rx,
            created: true,
        })
    }

    /// Join an existing ring (listener-inheritance path for accepted
    /// sockets). Returns the ring's completion queue producer.
    pub fn attach(&mut self, ring: RingId) -> Result<Sender<CompletionEvent>, Error> {
        let entry = self.rings.get_mut(&ring).ok_or(Error::InvalidState)?;
        entry.members += 1;
        crate::metrics::RINGS_ATTACHED.increment();
        Ok(entry.tx.clone())
    }

    /// Drop one membership. The last member's departure destroys the ring
    /// through the accelerator and disconnects its completion queue.
    pub fn release(&mut self, ring: RingId, accel: &dyn Accelerator) {
        let Some(entry) = self.rings.get_mut(&ring) else {
            debug_assert!(false, "release of unknown ring");
            return;
        };
        entry.members -= 1;
        if entry.members == 0 {
            let entry = self.rings.remove(&ring).expect("ring entry vanished");
            self.by_key.remove(&entry.key);
            // Keep the consumer side alive for events still in flight; the
            // queue disconnects once the last pending send delivers.
            self.retired.insert(ring, entry.rx);
            accel.destroy_ring(ring);
            crate::metrics::RINGS_RELEASED.increment();
            crate::metrics::RINGS_ACTIVE.decrement();
        }
    }

    /// The completion queue consumer for a live or retired ring.
    pub fn receiver(&self, ring: RingId) -> Option<Receiver<CompletionEvent>> {
        self.rings
            .get(&ring)
            .map(|e| e.rx.clone())
            .or_else(|| self.retired.get(&ring).cloned())
    }

    /// Reap a retired ring whose queue has fully drained and disconnected.
    pub fn reap_retired(&mut self, ring: RingId) {
        self.retired.remove(&ring);
    }

    /// Number of live rings.
    #[allow(dead_code)]
    pub fn active_count(&self) -> usize {
        self.rings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::soft::SoftAccelerator;
    use std::net::Ipv4Addr;

    fn key(local: Option<IpAddr>, class: RingClass) -> RingKey {
        RingKey {
            ctx: 1,
            local,
            class,
        }
    }

    fn local() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
    }

    #[test]
    fn first_use_allocates_subsequent_attach() {
        let accel = SoftAccelerator::new();
        let mut dir = RingDirectory::new();

        let a = dir
            .assign(key(local(), RingClass::Isolated), &accel, 64)
            .unwrap();
        assert!(a.created);

        let b = dir
            .assign(key(local(), RingClass::Isolated), &accel, 64)
            .unwrap();
        assert!(!b.created);
        assert_eq!(a.ring, b.ring);
        assert_eq!(dir.active_count(), 1);
    }

    #[test]
    fn classes_do_not_share_rings() {
        let accel = SoftAccelerator::new();
        let mut dir = RingDirectory::new();

        let isolated = dir
            .assign(key(local(), RingClass::Isolated), &accel, 64)
            .unwrap();
        let shared = dir
            .assign(key(local(), RingClass::Shared), &accel, 64)
            .unwrap();
        assert_ne!(isolated.ring, shared.ring);
        assert_eq!(dir.active_count(), 2);
    }

    #[test]
    fn distinct_addresses_get_distinct_rings() {
        let accel = SoftAccelerator::new();
        let mut dir = RingDirectory::new();

        let a = dir
            .assign(key(local(), RingClass::Isolated), &accel, 64)
            .unwrap();
        let b = dir
            .assign(key(None, RingClass::Isolated), &accel, 64)
            .unwrap();
        assert_ne!(a.ring, b.ring);
    }

    #[test]
    fn last_member_release_destroys_ring() {
        let accel = SoftAccelerator::new();
        let mut dir = RingDirectory::new();

        let a = dir
            .assign(key(local(), RingClass::Isolated), &accel, 64)
            .unwrap();
        dir.assign(key(local(), RingClass::Isolated), &accel, 64)
            .unwrap();

        dir.release(a.ring, &accel);
        assert_eq!(dir.active_count(), 1);
        dir.release(a.ring, &accel);
        assert_eq!(dir.active_count(), 0);

        // The key is free again; a new first use mints a fresh ring.
        let again = dir
            .assign(key(local(), RingClass::Isolated), &accel, 64)
            .unwrap();
        assert!(again.created);
        assert_ne!(again.ring, a.ring);
    }

    #[test]
    fn attach_to_unknown_ring_fails() {
        let mut dir = RingDirectory::new();
        assert!(dir.attach(RingId(999)).is_err());
    }
}
