//! txlane — zero-copy send-completion pipeline with ring-affinity isolation.
//!
//! txlane is the accelerator-side core behind an accelerated-socket extra
//! API: it registers caller-owned memory into a hardware protection domain,
//! issues zero-copy sends with optional batch-hold coalescing, delivers one
//! completion event per flushed send — exactly once, in per-socket order —
//! and assigns sockets to hardware rings with an opt-in isolation policy
//! that dedicates rings to socket groups.
//!
//! The transport itself is an injected collaborator: anything implementing
//! [`Accelerator`] can carry the traffic. The crate ships a deterministic
//! in-process device ([`SoftAccelerator`]) and a kernel-socket fallback
//! ([`OsAccelerator`]).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use txlane::{
//!     Config, DriverBuilder, MemoryRegion, PollMode, SendFlags, SoftAccelerator,
//! };
//!
//! fn main() -> Result<(), txlane::Error> {
//!     let driver = DriverBuilder::new(Config::default())
//!         .build(Arc::new(SoftAccelerator::new()))?;
//!
//!     let server = driver.socket()?;
//!     driver.bind(server, "127.0.0.1:8080".parse().unwrap())?;
//!     driver.listen(server)?;
//!
//!     let sock = driver.socket()?;
//!     driver.set_userdata(sock, 0xdeadc0de)?;
//!     driver.connect(sock, "127.0.0.1:8080".parse().unwrap())?;
//!
//!     let mut payload = vec![0u8; 4096];
//!     let key = driver.register(MemoryRegion {
//!         ptr: payload.as_mut_ptr(),
//!         len: payload.len(),
//!     })?;
//!
//!     driver.send(sock, key, 0, 12, SendFlags::MORE, 0)?;
//!     driver.send(sock, key, 12, 32, SendFlags::NONE, 0xdeadbeef)?;
//!     driver.flush(sock)?;
//!
//!     let ring = driver.rings_for(sock)?[0];
//!     let events =
//!         driver.poll_completions(ring, PollMode::Blocking(Duration::from_secs(1)))?;
//!     assert_eq!(events.len(), 2);
//!
//!     driver.close(sock)?;
//!     driver.deregister(key)?;
//!     Ok(())
//! }
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod completion;
pub(crate) mod counter;
pub(crate) mod metrics;
pub(crate) mod pipeline;
pub(crate) mod registrar;
pub(crate) mod ring;
pub(crate) mod socket;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod driver;
pub mod error;
pub mod transport;

// ── Re-exports: driver surface ──────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Ring policy for sockets accepted from a listener.
pub use config::AcceptedRingPolicy;
/// The assembled send-completion core.
pub use driver::Driver;
/// Builder for [`Driver`]; installing a handler selects dispatch mode.
pub use driver::DriverBuilder;
/// Core errors.
pub use error::Error;

// ── Re-exports: sockets and rings ───────────────────────────────────────

/// Opaque socket handle with stale detection.
pub use socket::SocketToken;
/// Isolation state of a socket.
pub use socket::IsolationState;
/// Identity of a hardware transmit/receive queue pair.
pub use ring::RingId;
/// Value carried by an isolation request.
pub use ring::IsolationMode;

// ── Re-exports: sends and completions ───────────────────────────────────

/// Asynchronous per-send completion notification.
pub use completion::CompletionEvent;
/// Wait mode for [`Driver::poll_completions`].
pub use completion::PollMode;
/// Callback trait for dispatch-mode completion delivery.
pub use completion::SendCompleteHandler;
/// Flags attached to a send request (batch-hold vs flush-now).
pub use pipeline::SendFlags;
/// Caller-owned memory region for protection-domain registration.
pub use registrar::MemoryRegion;
/// Opaque key of a registered memory region.
pub use registrar::RegionKey;

// ── Re-exports: transport boundary ──────────────────────────────────────

/// The consumed accelerated-transport capability.
pub use transport::Accelerator;
/// A connection handed out by accept.
pub use transport::AcceptedSocket;
/// Completion sink installed into the accelerator.
pub use transport::CompletionSink;
/// Outcome of a connect initiation.
pub use transport::ConnectOutcome;
/// Raw send confirmation from the transmit path.
pub use transport::RawCompletion;
/// A zero-copy send descriptor at the accelerator boundary.
pub use transport::SendOp;
/// Opaque per-socket accelerator handle.
pub use transport::TransportSocket;
/// Kernel-socket fallback accelerator.
pub use transport::os::OsAccelerator;
/// Deterministic in-process software accelerator.
pub use transport::soft::SoftAccelerator;
