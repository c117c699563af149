//! txlane runtime metrics.
//!
//! Counters for send submission, completion delivery, ring lifecycle, and
//! memory registration, plus gauges for live resources. Exposed through
//! metriken when registered with an exposition endpoint.

use metriken::{Gauge, metric};

use crate::counter::{Counter, CounterGroup};

// Counter groups (sharded storage, one slot per event kind).
static SEND: CounterGroup = CounterGroup::new();
static COMP: CounterGroup = CounterGroup::new();
static RING: CounterGroup = CounterGroup::new();
static REGION: CounterGroup = CounterGroup::new();

/// Counter slot indices for send metrics.
pub mod send {
    pub const SUBMITTED: usize = 0;
    pub const COALESCED: usize = 1;
    pub const WOULD_BLOCK: usize = 2;
    pub const FLUSHES: usize = 3;
}

/// Counter slot indices for completion metrics.
pub mod comp {
    pub const ENQUEUED: usize = 0;
    pub const DISPATCHED: usize = 1;
    pub const POLLED: usize = 2;
}

/// Counter slot indices for ring metrics.
pub mod ring {
    pub const ALLOCATED: usize = 0;
    pub const ATTACHED: usize = 1;
    pub const RELEASED: usize = 2;
    pub const ISOLATION_REJECTED: usize = 3;
}

/// Counter slot indices for region metrics.
pub mod region {
    pub const REGISTERED: usize = 0;
    pub const DEREGISTERED: usize = 1;
    pub const BUSY_REJECTED: usize = 2;
}

// ── Sends ────────────────────────────────────────────────────────

#[metric(
    name = "txlane/sends/submitted",
    description = "Send descriptors accepted by the pipeline"
)]
pub static SENDS_SUBMITTED: Counter = Counter::new(&SEND, send::SUBMITTED);

#[metric(
    name = "txlane/sends/coalesced",
    description = "Batch-held sends flushed as part of a coalesced batch"
)]
pub static SENDS_COALESCED: Counter = Counter::new(&SEND, send::COALESCED);

#[metric(
    name = "txlane/sends/would_block",
    description = "Sends refused due to a full transmit or hold queue"
)]
pub static SENDS_WOULD_BLOCK: Counter = Counter::new(&SEND, send::WOULD_BLOCK);

#[metric(name = "txlane/sends/flushes", description = "Explicit flush calls")]
pub static SEND_FLUSHES: Counter = Counter::new(&SEND, send::FLUSHES);

#[metric(
    name = "txlane/sends/in_flight",
    description = "Sends posted to hardware awaiting completion"
)]
pub static SENDS_IN_FLIGHT: Gauge = Gauge::new();

// ── Completions ──────────────────────────────────────────────────

#[metric(
    name = "txlane/completions/enqueued",
    description = "Completion events routed to ring queues"
)]
pub static COMPLETIONS_ENQUEUED: Counter = Counter::new(&COMP, comp::ENQUEUED);

#[metric(
    name = "txlane/completions/dispatched",
    description = "Completion events delivered to the registered handler"
)]
pub static COMPLETIONS_DISPATCHED: Counter = Counter::new(&COMP, comp::DISPATCHED);

#[metric(
    name = "txlane/completions/polled",
    description = "Completion events drained by poll"
)]
pub static COMPLETIONS_POLLED: Counter = Counter::new(&COMP, comp::POLLED);

// ── Rings ────────────────────────────────────────────────────────

#[metric(
    name = "txlane/rings/allocated",
    description = "Dedicated or shared rings created"
)]
pub static RINGS_ALLOCATED: Counter = Counter::new(&RING, ring::ALLOCATED);

#[metric(
    name = "txlane/rings/attached",
    description = "Sockets attached to an existing ring"
)]
pub static RINGS_ATTACHED: Counter = Counter::new(&RING, ring::ATTACHED);

#[metric(
    name = "txlane/rings/released",
    description = "Rings destroyed after their last member closed"
)]
pub static RINGS_RELEASED: Counter = Counter::new(&RING, ring::RELEASED);

#[metric(
    name = "txlane/rings/isolation_rejected",
    description = "Isolation requests rejected"
)]
pub static ISOLATION_REJECTED: Counter = Counter::new(&RING, ring::ISOLATION_REJECTED);

#[metric(name = "txlane/rings/active", description = "Currently live rings")]
pub static RINGS_ACTIVE: Gauge = Gauge::new();

// ── Regions ──────────────────────────────────────────────────────

#[metric(
    name = "txlane/regions/registered",
    description = "Memory regions registered with the protection domain"
)]
pub static REGIONS_REGISTERED: Counter = Counter::new(&REGION, region::REGISTERED);

#[metric(
    name = "txlane/regions/deregistered",
    description = "Memory regions deregistered"
)]
pub static REGIONS_DEREGISTERED: Counter = Counter::new(&REGION, region::DEREGISTERED);

#[metric(
    name = "txlane/regions/busy_rejected",
    description = "Deregistrations refused while sends were in flight"
)]
pub static REGIONS_BUSY_REJECTED: Counter = Counter::new(&REGION, region::BUSY_REJECTED);

// ── Sockets ──────────────────────────────────────────────────────

#[metric(name = "txlane/sockets/active", description = "Currently open sockets")]
pub static SOCKETS_ACTIVE: Gauge = Gauge::new();
