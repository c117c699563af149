use std::io;

use thiserror::Error;

/// Errors returned by the txlane core.
///
/// Every variant is a local, recoverable condition surfaced at the failing
/// call. [`Error::WouldBlock`] is the backpressure signal and is expected to
/// be retried by the caller; nothing in the core retries silently.
#[derive(Debug, Error)]
pub enum Error {
    /// Accelerator or OS operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Region pointer/length is degenerate, or the range overlaps an
    /// existing registration.
    #[error("invalid memory region")]
    InvalidRegion,
    /// Region still referenced by staged or in-flight sends.
    #[error("region has in-flight sends")]
    RegionBusy,
    /// Unknown or stale region key, or byte range outside the region.
    #[error("invalid region key or byte range")]
    InvalidKey,
    /// Socket is not connected.
    #[error("socket not connected")]
    SocketClosed,
    /// Transmit queue (or batch-hold queue) full. Retry later.
    #[error("transmit queue full")]
    WouldBlock,
    /// A ring is already assigned; isolation can no longer change.
    #[error("ring already assigned")]
    AlreadyBound,
    /// Isolation state was already decided for this socket.
    #[error("isolation change rejected")]
    IsolationRejected,
    /// Stale or out-of-range socket token.
    #[error("invalid socket")]
    InvalidSocket,
    /// No free socket slots available.
    #[error("socket limit reached")]
    SocketLimitReached,
    /// Operation not valid in the current socket or ring state.
    #[error("invalid state for operation")]
    InvalidState,
    /// Completions are dispatched to a registered handler; polling is
    /// unavailable.
    #[error("completions are dispatched; poll unavailable")]
    PollUnavailable,
    /// Configuration or setup failure.
    #[error("setup: {0}")]
    Setup(String),
}
