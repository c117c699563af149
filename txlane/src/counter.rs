//! Sharded counter storage for hot-path metrics.
//!
//! A [`CounterGroup`] packs up to 16 counters into a set of cache lines,
//! with each thread writing to its own shard so concurrent submitters and
//! dispatcher threads never contend on the same line. The [`Counter`] type
//! references one slot of a group and implements [`metriken::Metric`] for
//! exposition via the `#[metric]` attribute.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const CACHE_LINE: usize = 128;
const SLOTS: usize = CACHE_LINE / 8;
const NUM_SHARDS: usize = 32;

thread_local! {
    /// Shard assigned to the current thread via `bind_thread_shard()`.
    /// Threads that never bind fall back to a hash of a TLS address.
    static SHARD: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pin the current thread to a counter shard.
///
/// Dispatcher threads call this with their ring ordinal so repeated
/// increments from the same thread stay on one cache line.
pub fn bind_thread_shard(id: usize) {
    SHARD.set(Some(id % NUM_SHARDS));
}

#[repr(C, align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to 16 counters.
pub struct CounterGroup {
    shards: [Shard; NUM_SHARDS],
}

impl CounterGroup {
    /// Create a group with all slots zeroed.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const SHARD: Shard = Shard {
            slots: [ZERO; SLOTS],
        };
        Self {
            shards: [SHARD; NUM_SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        self.shards[current_shard()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, slot: usize) -> u64 {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// A counter backed by one slot of a [`CounterGroup`].
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    /// Create a counter referencing a slot in the given group.
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Self { group, slot }
    }

    /// Increment the counter by 1.
    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    /// Add a value to the counter.
    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Current value, aggregated across all shards.
    pub fn value(&self) -> u64 {
        self.group.value(self.slot)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

/// Shard index for the current thread.
#[inline]
fn current_shard() -> usize {
    SHARD.get().unwrap_or_else(|| {
        thread_local! {
            static PROBE: u8 = const { 0 };
        }
        PROBE.with(|p| p as *const u8 as usize) % NUM_SHARDS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_add() {
        static GROUP: CounterGroup = CounterGroup::new();
        let counter = Counter::new(&GROUP, 0);

        assert_eq!(counter.value(), 0);
        counter.increment();
        counter.add(7);
        assert_eq!(counter.value(), 8);
    }

    #[test]
    fn slots_are_independent() {
        static GROUP: CounterGroup = CounterGroup::new();
        let a = Counter::new(&GROUP, 1);
        let b = Counter::new(&GROUP, 2);

        a.add(3);
        b.increment();

        assert_eq!(a.value(), 3);
        assert_eq!(b.value(), 1);
    }

    #[test]
    fn aggregates_across_threads() {
        use std::sync::Arc;
        use std::thread;

        static GROUP: CounterGroup = CounterGroup::new();
        let counter = Arc::new(Counter::new(&GROUP, 3));

        let handles: Vec<_> = (0..4)
            .map(|id| {
                let c = Arc::clone(&counter);
                thread::spawn(move || {
                    bind_thread_shard(id);
                    for _ in 0..500 {
                        c.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.value(), 2000);
    }

    #[test]
    fn metriken_exposition() {
        use metriken::Metric;

        static GROUP: CounterGroup = CounterGroup::new();
        let counter = Counter::new(&GROUP, 4);
        counter.add(11);

        let value = Metric::value(&counter);
        assert!(matches!(value, Some(metriken::Value::Counter(11))));
    }
}
