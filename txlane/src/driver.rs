use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::completion::{
    CompletionEvent, OpKind, PollMode, SendCompleteHandler, TxId, spawn_dispatcher,
};
use crate::config::{AcceptedRingPolicy, Config};
use crate::error::Error;
use crate::metrics;
use crate::pipeline::{SendFlags, StagedSend};
use crate::registrar::{BufferRegistrar, MemoryRegion, RegionKey};
use crate::ring::{IsolationMode, RingClass, RingDirectory, RingId, RingKey};
use crate::socket::{IsolationState, Lifecycle, SocketEntry, SocketState, SocketTable, SocketToken};
use crate::transport::{Accelerator, ConnectOutcome, RawCompletion, SendOp, TransportSocket};

/// A send posted to the hardware, parked until its confirmation arrives.
///
/// Holds the socket entry alive so completions for a since-closed socket
/// still deliver, and carries the ring queue producer so routing needs no
/// table lookups.
struct PendingSend {
    entry: Arc<SocketEntry>,
    key: RegionKey,
    tag: u64,
    len: u32,
    /// Per-socket sequence number, for order verification.
    seq: u32,
    tx: Sender<CompletionEvent>,
}

/// State shared between the driver and the accelerator's completion sink.
struct Shared {
    registrar: Mutex<BufferRegistrar>,
    rings: Mutex<RingDirectory>,
    pending: Mutex<HashMap<u64, PendingSend>>,
    /// Wire-identifier counter. Global, so a reused socket slot can never
    /// collide with a send still pending from the slot's previous life.
    next_txid: std::sync::atomic::AtomicU32,
}

/// Drain everything ready on a completion queue, noting disconnection.
fn drain_queue(
    rx: &crossbeam_channel::Receiver<CompletionEvent>,
    events: &mut Vec<CompletionEvent>,
    disconnected: &mut bool,
) {
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(crossbeam_channel::TryRecvError::Empty) => return,
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                *disconnected = true;
                return;
            }
        }
    }
}

/// Route one raw confirmation from the accelerator into its ring's
/// completion queue. Runs on the accelerator's completion context and never
/// blocks: lock scopes are short and the queues are unbounded.
fn route_completion(shared: &Shared, raw: RawCompletion) {
    let txid = TxId(raw.txid);
    debug_assert_eq!(txid.kind(), Some(OpKind::Send), "unexpected completion kind");

    let Some(pending) = shared.pending.lock().unwrap().remove(&raw.txid) else {
        debug_assert!(false, "completion for unknown txid");
        return;
    };
    shared.registrar.lock().unwrap().release(pending.key);

    let entry = &pending.entry;
    entry.in_flight.fetch_sub(1, Ordering::AcqRel);
    metrics::SENDS_IN_FLIGHT.decrement();

    // Per-socket completions arrive in submission order.
    let seq = pending.seq;
    let prev = entry.last_completed_seq.swap(seq, Ordering::AcqRel);
    debug_assert!(
        prev == u32::MAX || seq == prev.wrapping_add(1),
        "out-of-order completion: seq {seq} after {prev}"
    );

    let event = CompletionEvent {
        socket: entry.token,
        socket_userdata: entry.userdata.load(Ordering::Acquire),
        tag: pending.tag,
        len: pending.len,
    };
    metrics::COMPLETIONS_ENQUEUED.increment();
    // A disconnected queue means the driver is gone; nobody is left to
    // observe the event.
    let _ = pending.tx.send(event);
}

/// Builder for [`Driver`].
///
/// Completion delivery mode is fixed at build time: installing a
/// [`SendCompleteHandler`] selects dispatch mode (per-ring completion
/// threads invoke the handler); omitting it selects poll mode
/// ([`Driver::poll_completions`]).
pub struct DriverBuilder {
    config: Config,
    handler: Option<Arc<dyn SendCompleteHandler>>,
}

impl DriverBuilder {
    /// Create a builder with the given config.
    pub fn new(config: Config) -> Self {
        DriverBuilder {
            config,
            handler: None,
        }
    }

    /// Install a completion handler, selecting dispatch mode.
    pub fn send_complete_handler<H: SendCompleteHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Validate the config, install the completion sink, and assemble the
    /// driver around the injected accelerator.
    pub fn build(self, accelerator: Arc<dyn Accelerator>) -> Result<Driver, Error> {
        self.config.validate()?;
        let shared = Arc::new(Shared {
            registrar: Mutex::new(BufferRegistrar::new()),
            rings: Mutex::new(RingDirectory::new()),
            pending: Mutex::new(HashMap::new()),
            next_txid: std::sync::atomic::AtomicU32::new(0),
        });
        let sink_shared = Arc::clone(&shared);
        accelerator.set_completion_sink(Box::new(move |raw| route_completion(&sink_shared, raw)));
        Ok(Driver {
            sockets: Mutex::new(SocketTable::new(
                self.config.max_sockets,
                self.config.max_held_sends,
            )),
            shared,
            accel: accelerator,
            handler: self.handler,
            config: self.config,
        })
    }
}

/// The assembled send-completion core: socket lifecycle, memory
/// registration, the zero-copy send pipeline, ring-affinity isolation, and
/// completion delivery, all over an injected [`Accelerator`].
///
/// All operations take `&self`; distinct sockets may be driven from
/// distinct threads concurrently.
pub struct Driver {
    config: Config,
    accel: Arc<dyn Accelerator>,
    shared: Arc<Shared>,
    sockets: Mutex<SocketTable>,
    handler: Option<Arc<dyn SendCompleteHandler>>,
}

impl Driver {
    // ── Socket lifecycle ─────────────────────────────────────────────

    /// Open a socket. Isolation is undecided and no ring is assigned until
    /// first listen/connect.
    pub fn socket(&self) -> Result<SocketToken, Error> {
        let hw = self.accel.open_socket()?;
        let mut table = self.sockets.lock().unwrap();
        match table.allocate(hw) {
            Ok(entry) => {
                metrics::SOCKETS_ACTIVE.increment();
                Ok(entry.token)
            }
            Err(e) => {
                drop(table);
                self.accel.close_socket(hw);
                Err(e)
            }
        }
    }

    /// Attach an opaque tag to the socket, reported in its completion
    /// events.
    pub fn set_userdata(&self, token: SocketToken, value: u64) -> Result<(), Error> {
        let entry = self.entry(token)?;
        entry.userdata.store(value, Ordering::Release);
        Ok(())
    }

    /// The socket's opaque tag.
    pub fn userdata(&self, token: SocketToken) -> Result<u64, Error> {
        let entry = self.entry(token)?;
        Ok(entry.userdata.load(Ordering::Acquire))
    }

    /// Switch the socket between blocking and nonblocking mode (connect
    /// initiation and accept honor this).
    pub fn set_nonblocking(&self, token: SocketToken, nonblocking: bool) -> Result<(), Error> {
        let entry = self.entry(token)?;
        entry.state.lock().unwrap().nonblocking = nonblocking;
        Ok(())
    }

    /// Record the socket's local address. Does not commit a ring: isolation
    /// may still be requested after bind.
    pub fn bind(&self, token: SocketToken, addr: SocketAddr) -> Result<(), Error> {
        let entry = self.entry(token)?;
        let mut state = entry.state.lock().unwrap();
        if state.lifecycle != Lifecycle::Open {
            return Err(Error::InvalidState);
        }
        self.accel.bind(state.hw, addr)?;
        state.local_addr = Some(addr);
        state.lifecycle = Lifecycle::Bound;
        Ok(())
    }

    /// Start listening. This is the ring commitment point for a server
    /// socket: the ring set is fixed here and isolation can no longer
    /// change.
    pub fn listen(&self, token: SocketToken) -> Result<(), Error> {
        let entry = self.entry(token)?;
        let mut state = entry.state.lock().unwrap();
        if !matches!(state.lifecycle, Lifecycle::Open | Lifecycle::Bound) {
            return Err(Error::InvalidState);
        }
        self.assign_ring_locked(&mut state)?;
        self.accel.listen(state.hw, self.config.accept_backlog)?;
        state.lifecycle = Lifecycle::Listening;
        Ok(())
    }

    /// Initiate a connection. This is the ring commitment point for a
    /// client socket — the ring is assigned before the transport is asked
    /// to connect, so even an eventually-refused nonblocking connect leaves
    /// the socket ring-bound.
    pub fn connect(&self, token: SocketToken, addr: SocketAddr) -> Result<(), Error> {
        let entry = self.entry(token)?;
        let mut state = entry.state.lock().unwrap();
        if !matches!(state.lifecycle, Lifecycle::Open | Lifecycle::Bound) {
            return Err(Error::InvalidState);
        }
        self.assign_ring_locked(&mut state)?;
        match self.accel.connect(state.hw, addr, state.nonblocking)? {
            ConnectOutcome::Established => state.lifecycle = Lifecycle::Connected,
            ConnectOutcome::Pending => state.lifecycle = Lifecycle::Connecting,
        }
        Ok(())
    }

    /// Take one connection from a listener. Blocks unless the listener is
    /// nonblocking, in which case an empty backlog is `WouldBlock`.
    /// The descendant's ring follows [`Config::accepted_ring_policy`].
    pub fn accept(&self, token: SocketToken) -> Result<(SocketToken, SocketAddr), Error> {
        let entry = self.entry(token)?;
        // Snapshot, then release the listener so a blocking accept doesn't
        // pin its state.
        let (hw, nonblocking, listener_ring, listener_isolation, local_addr) = {
            let state = entry.state.lock().unwrap();
            if state.lifecycle != Lifecycle::Listening {
                return Err(Error::InvalidState);
            }
            (
                state.hw,
                state.nonblocking,
                state.tx_ring.clone(),
                state.isolation,
                state.local_addr,
            )
        };
        let accepted = self.accel.accept(hw, nonblocking)?;

        let new_entry = {
            let mut table = self.sockets.lock().unwrap();
            match table.allocate(accepted.socket) {
                Ok(entry) => entry,
                Err(e) => {
                    drop(table);
                    self.accel.close_socket(accepted.socket);
                    return Err(e);
                }
            }
        };
        metrics::SOCKETS_ACTIVE.increment();

        let result = (|| {
            let mut state = new_entry.state.lock().unwrap();
            state.lifecycle = Lifecycle::Connected;
            state.local_addr = local_addr;
            match self.config.accepted_ring_policy {
                AcceptedRingPolicy::InheritListener => {
                    let (ring, _) = listener_ring
                        .as_ref()
                        .expect("listening socket without a ring");
                    let tx = self.shared.rings.lock().unwrap().attach(*ring)?;
                    if let Err(e) = self.accel.attach_socket(accepted.socket, *ring) {
                        self.shared
                            .rings
                            .lock()
                            .unwrap()
                            .release(*ring, self.accel.as_ref());
                        return Err(e);
                    }
                    state.isolation = listener_isolation;
                    state.rings.push(*ring);
                    state.tx_ring = Some((*ring, tx));
                }
                AcceptedRingPolicy::SharedByAddress => {
                    state.isolation = IsolationState::Default;
                    self.assign_ring_locked(&mut state)?;
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok((new_entry.token, accepted.peer)),
            Err(e) => {
                // Unwind the half-built descendant.
                let token = new_entry.token;
                if let Ok(entry) = self.sockets.lock().unwrap().release(token) {
                    let state = entry.state.lock().unwrap();
                    self.accel.close_socket(state.hw);
                }
                metrics::SOCKETS_ACTIVE.decrement();
                Err(e)
            }
        }
    }

    /// Close a socket. Batch-held sends that were never flushed are
    /// discarded without completion events; sends already posted still
    /// complete exactly once. The socket's rings lose a member, and a
    /// ring's last member destroys it.
    pub fn close(&self, token: SocketToken) -> Result<(), Error> {
        let entry = self.sockets.lock().unwrap().release(token)?;
        metrics::SOCKETS_ACTIVE.decrement();

        let mut state = entry.state.lock().unwrap();
        state.lifecycle = Lifecycle::Closed;
        {
            let mut registrar = self.shared.registrar.lock().unwrap();
            for staged in state.stage.drain() {
                registrar.release(staged.key);
            }
        }
        self.accel.close_socket(state.hw);
        let rings = std::mem::take(&mut state.rings);
        state.tx_ring = None;
        drop(state);

        let mut dir = self.shared.rings.lock().unwrap();
        for ring in rings {
            dir.release(ring, self.accel.as_ref());
        }
        Ok(())
    }

    // ── Isolation ────────────────────────────────────────────────────

    /// Decide the socket's isolation state. Allowed exactly once, and only
    /// before the ring commitment point: after listen/connect/accept the
    /// request fails with `AlreadyBound`, and a second request in either
    /// direction fails with `IsolationRejected`.
    pub fn request_isolation(&self, token: SocketToken, mode: IsolationMode) -> Result<(), Error> {
        let entry = self.entry(token)?;
        let mut state = entry.state.lock().unwrap();
        if !state.rings.is_empty() {
            metrics::ISOLATION_REJECTED.increment();
            return Err(Error::AlreadyBound);
        }
        if state.isolation != IsolationState::Undecided {
            metrics::ISOLATION_REJECTED.increment();
            return Err(Error::IsolationRejected);
        }
        state.isolation = match mode {
            IsolationMode::Safe => IsolationState::Isolated,
            IsolationMode::Default => IsolationState::Default,
        };
        Ok(())
    }

    /// The socket's isolation state.
    pub fn isolation(&self, token: SocketToken) -> Result<IsolationState, Error> {
        let entry = self.entry(token)?;
        let state = entry.state.lock().unwrap();
        Ok(state.isolation)
    }

    /// The stable, previously assigned ring set backing the socket. Empty
    /// before the ring commitment point; never allocates.
    pub fn rings_for(&self, token: SocketToken) -> Result<Vec<RingId>, Error> {
        let entry = self.entry(token)?;
        let state = entry.state.lock().unwrap();
        Ok(state.rings.clone())
    }

    /// The accelerator-side handle backing a socket, for embedders that
    /// integrate with the transport directly.
    pub fn transport_handle(&self, token: SocketToken) -> Result<TransportSocket, Error> {
        let entry = self.entry(token)?;
        let state = entry.state.lock().unwrap();
        Ok(state.hw)
    }

    // ── Memory registration ──────────────────────────────────────────

    /// Register a caller-owned region with the protection domain. The
    /// privileged pin happens here, never on the send path. The memory
    /// must stay valid until `deregister` succeeds.
    pub fn register(&self, region: MemoryRegion) -> Result<RegionKey, Error> {
        let mut registrar = self.shared.registrar.lock().unwrap();
        registrar.validate_new(&region)?;
        let hw_key = self.accel.register_memory(&region)?;
        let key = registrar.insert(region, hw_key)?;
        metrics::REGIONS_REGISTERED.increment();
        Ok(key)
    }

    /// Release a registration. Fails with `RegionBusy` while any send
    /// referencing the key has not completed.
    pub fn deregister(&self, key: RegionKey) -> Result<(), Error> {
        let hw_key = {
            let mut registrar = self.shared.registrar.lock().unwrap();
            match registrar.remove(key) {
                Ok(hw_key) => hw_key,
                Err(Error::RegionBusy) => {
                    metrics::REGIONS_BUSY_REJECTED.increment();
                    return Err(Error::RegionBusy);
                }
                Err(e) => return Err(e),
            }
        };
        self.accel.deregister_memory(hw_key);
        metrics::REGIONS_DEREGISTERED.increment();
        Ok(())
    }

    // ── Send pipeline ────────────────────────────────────────────────

    /// Queue a zero-copy send of `region[offset..offset + len]`.
    ///
    /// With [`SendFlags::MORE`] the descriptor is held for coalescing with
    /// subsequent sends on this socket; otherwise everything held plus this
    /// descriptor drains to the ring now. `tag` comes back in the send's
    /// completion event. A send refused with `WouldBlock` has no effect and
    /// is safe to retry.
    pub fn send(
        &self,
        token: SocketToken,
        key: RegionKey,
        offset: usize,
        len: u32,
        flags: SendFlags,
        tag: u64,
    ) -> Result<(), Error> {
        let entry = self.entry(token)?;
        let mut state = entry.state.lock().unwrap();
        if state.lifecycle != Lifecycle::Connected {
            return Err(Error::SocketClosed);
        }
        if !state.stage.has_capacity() {
            metrics::SENDS_WOULD_BLOCK.increment();
            return Err(Error::WouldBlock);
        }
        let (ptr, hw_key) = self
            .shared
            .registrar
            .lock()
            .unwrap()
            .checkout(key, offset, len)?;

        let seq = state.next_seq;
        state.next_seq = state.next_seq.wrapping_add(1);
        state.stage.push(StagedSend {
            key,
            ptr,
            len,
            hw_key,
            tag,
            seq,
            held: flags.is_more(),
        });

        if flags.is_more() {
            metrics::SENDS_SUBMITTED.increment();
            return Ok(());
        }

        match self.drain_locked(&entry, &mut state) {
            Ok(()) => {
                metrics::SENDS_SUBMITTED.increment();
                Ok(())
            }
            Err(e) => {
                // A drain error stops before the failing descriptor posts,
                // and this call's descriptor is the newest — so it is still
                // staged. Unstage it so the caller's retry cannot duplicate
                // bytes; held descriptors from earlier MORE sends stay.
                let own = state.stage.pop_back().expect("own descriptor vanished");
                debug_assert_eq!(own.seq, seq);
                self.shared.registrar.lock().unwrap().release(own.key);
                state.next_seq = seq;
                Err(e)
            }
        }
    }

    /// Start transmission of everything batch-held on the socket.
    /// Idempotent; a no-op when nothing is held. `WouldBlock` leaves the
    /// un-posted remainder staged, in order.
    pub fn flush(&self, token: SocketToken) -> Result<(), Error> {
        let entry = self.entry(token)?;
        let mut state = entry.state.lock().unwrap();
        metrics::SEND_FLUSHES.increment();
        if state.stage.is_empty() {
            return Ok(());
        }
        self.drain_locked(&entry, &mut state)
    }

    /// Post staged descriptors to the ring in FIFO order. Stops at the
    /// first refusal, leaving the remainder staged.
    fn drain_locked(&self, entry: &Arc<SocketEntry>, state: &mut SocketState) -> Result<(), Error> {
        let Some((ring, tx)) = state.tx_ring.clone() else {
            debug_assert!(false, "connected socket without a ring");
            return Err(Error::SocketClosed);
        };
        while let Some(front) = state.stage.front() {
            let wire_seq = self.shared.next_txid.fetch_add(1, Ordering::Relaxed);
            let txid = TxId::encode(OpKind::Send, entry.token.index, wire_seq);
            let op = SendOp {
                socket: state.hw,
                ptr: front.ptr,
                len: front.len,
                hw_key: front.hw_key,
                txid: txid.raw(),
            };
            let held = front.held;
            // Park the descriptor before posting: with a synchronous
            // transmit path the confirmation can arrive inside post_send.
            entry.in_flight.fetch_add(1, Ordering::AcqRel);
            metrics::SENDS_IN_FLIGHT.increment();
            self.shared.pending.lock().unwrap().insert(
                txid.raw(),
                PendingSend {
                    entry: Arc::clone(entry),
                    key: front.key,
                    tag: front.tag,
                    len: front.len,
                    seq: front.seq,
                    tx: tx.clone(),
                },
            );
            let more = state.stage.len() > 1;
            match self.accel.post_send(ring, op, more) {
                Ok(()) => {
                    state.stage.pop_front();
                    if held {
                        metrics::SENDS_COALESCED.increment();
                    }
                }
                Err(e) => {
                    if self.shared.pending.lock().unwrap().remove(&txid.raw()).is_some() {
                        entry.in_flight.fetch_sub(1, Ordering::AcqRel);
                        metrics::SENDS_IN_FLIGHT.decrement();
                    }
                    if matches!(e, Error::WouldBlock) {
                        metrics::SENDS_WOULD_BLOCK.increment();
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    // ── Completion delivery ──────────────────────────────────────────

    /// Drain pending completion events for a ring. `NonBlocking` returns
    /// immediately with whatever is ready; `Blocking` waits up to the
    /// caller's timeout for at least one event. Unavailable when a
    /// completion handler was installed at build time.
    pub fn poll_completions(
        &self,
        ring: RingId,
        mode: PollMode,
    ) -> Result<Vec<CompletionEvent>, Error> {
        if self.handler.is_some() {
            return Err(Error::PollUnavailable);
        }
        let rx = self
            .shared
            .rings
            .lock()
            .unwrap()
            .receiver(ring)
            .ok_or(Error::InvalidState)?;

        let mut events = Vec::new();
        let mut disconnected = false;
        match mode {
            PollMode::NonBlocking => {
                drain_queue(&rx, &mut events, &mut disconnected);
            }
            PollMode::Blocking(timeout) => match rx.recv_timeout(timeout) {
                Ok(event) => {
                    events.push(event);
                    drain_queue(&rx, &mut events, &mut disconnected);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => disconnected = true,
            },
        }
        if disconnected {
            // The ring was retired and its last pending send has delivered.
            self.shared.rings.lock().unwrap().reap_retired(ring);
        }
        metrics::COMPLETIONS_POLLED.add(events.len() as u64);
        Ok(events)
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Ring commitment: decide an undecided socket down to `Default`, then
    /// allocate-or-attach under one ring-table critical section so racing
    /// first users converge on a single ring.
    fn assign_ring_locked(&self, state: &mut SocketState) -> Result<(), Error> {
        debug_assert!(state.rings.is_empty(), "ring already assigned");
        if state.isolation == IsolationState::Undecided {
            state.isolation = IsolationState::Default;
        }
        let class = if state.isolation == IsolationState::Isolated {
            RingClass::Isolated
        } else {
            RingClass::Shared
        };
        let key = RingKey {
            ctx: self.accel.context_id(),
            local: state.local_addr.map(|a| a.ip()),
            class,
        };
        let assignment = self.shared.rings.lock().unwrap().assign(
            key,
            self.accel.as_ref(),
            self.config.tx_queue_depth,
        )?;
        if assignment.created
            && let Some(handler) = &self.handler
        {
            spawn_dispatcher(assignment.ring, assignment.rx.clone(), Arc::clone(handler))?;
        }
        if let Err(e) = self.accel.attach_socket(state.hw, assignment.ring) {
            self.shared
                .rings
                .lock()
                .unwrap()
                .release(assignment.ring, self.accel.as_ref());
            return Err(e);
        }
        state.rings.push(assignment.ring);
        state.tx_ring = Some((assignment.ring, assignment.tx));
        Ok(())
    }

    fn entry(&self, token: SocketToken) -> Result<Arc<SocketEntry>, Error> {
        self.sockets.lock().unwrap().get(token)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Tear down whatever the caller left open so the accelerator's
        // sockets and rings are released and dispatcher threads unwind.
        let entries = self.sockets.lock().unwrap().drain_entries();
        for entry in entries {
            let mut state = entry.state.lock().unwrap();
            state.lifecycle = Lifecycle::Closed;
            {
                let mut registrar = self.shared.registrar.lock().unwrap();
                for staged in state.stage.drain() {
                    registrar.release(staged.key);
                }
            }
            self.accel.close_socket(state.hw);
            let rings = std::mem::take(&mut state.rings);
            state.tx_ring = None;
            drop(state);
            let mut dir = self.shared.rings.lock().unwrap();
            for ring in rings {
                dir.release(ring, self.accel.as_ref());
            }
            metrics::SOCKETS_ACTIVE.decrement();
        }
    }
}
