/// Ring assignment policy for sockets accepted from a listener.
///
/// The inheritance rule for listener hierarchies is deliberately a policy
/// knob rather than a fixed behavior: deployments that dedicate a ring to a
/// listener usually want its descendants on the same ring, but a shared-ring
/// fan-out is also valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptedRingPolicy {
    /// Accepted sockets join the listener's ring.
    InheritListener,
    /// Accepted sockets join the shared ring for the listener's local
    /// address, regardless of the listener's isolation.
    SharedByAddress,
}

/// Configuration for the txlane driver.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of concurrently open sockets. Must be < 2^24 so a
    /// socket index fits the 24-bit field of a transmit identifier.
    pub max_sockets: u32,
    /// Depth of each hardware transmit queue. Must be a power of two.
    /// A full queue surfaces as `WouldBlock` on `send`/`flush`.
    pub tx_queue_depth: u32,
    /// Maximum batch-held (MORE-flagged) sends per socket. Overflow surfaces
    /// as `WouldBlock`; the pipeline never buffers unboundedly.
    pub max_held_sends: usize,
    /// Accept backlog hint passed to the accelerator on `listen`.
    pub accept_backlog: usize,
    /// Ring assignment policy for accepted sockets.
    pub accepted_ring_policy: AcceptedRingPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_sockets: 1024,
            tx_queue_depth: 256,
            max_held_sends: 64,
            accept_backlog: 128,
            accepted_ring_policy: AcceptedRingPolicy::InheritListener,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_sockets == 0 || self.max_sockets >= (1 << 24) {
            return Err(crate::error::Error::Setup(
                "max_sockets must be > 0 and < 2^24".into(),
            ));
        }
        if self.tx_queue_depth == 0 || !self.tx_queue_depth.is_power_of_two() {
            return Err(crate::error::Error::Setup(
                "tx_queue_depth must be > 0 and a power of two".into(),
            ));
        }
        if self.max_held_sends == 0 {
            return Err(crate::error::Error::Setup(
                "max_held_sends must be > 0".into(),
            ));
        }
        if self.accept_backlog == 0 {
            return Err(crate::error::Error::Setup(
                "accept_backlog must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use txlane::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .max_sockets(256)
///     .tx_queue_depth(64)
///     .max_held_sends(16)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of concurrently open sockets.
    pub fn max_sockets(mut self, n: u32) -> Self {
        self.config.max_sockets = n;
        self
    }

    /// Set the hardware transmit queue depth. Must be a power of two.
    pub fn tx_queue_depth(mut self, n: u32) -> Self {
        self.config.tx_queue_depth = n;
        self
    }

    /// Set the per-socket bound on batch-held sends.
    pub fn max_held_sends(mut self, n: usize) -> Self {
        self.config.max_held_sends = n;
        self
    }

    /// Set the accept backlog hint.
    pub fn accept_backlog(mut self, n: usize) -> Self {
        self.config.accept_backlog = n;
        self
    }

    /// Set the ring assignment policy for accepted sockets.
    pub fn accepted_ring_policy(mut self, policy: AcceptedRingPolicy) -> Self {
        self.config.accepted_ring_policy = policy;
        self
    }

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
