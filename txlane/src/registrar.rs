use crate::error::Error;

/// A caller-owned memory region to be registered with the hardware
/// protection domain (e.g., an mmap'd arena or a static buffer).
#[derive(Clone)]
pub struct MemoryRegion {
    pub ptr: *mut u8,
    pub len: usize,
}

// Safety: regions are managed by the caller and must outlive their
// registration; the registrar never dereferences the pointer.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

/// Opaque key identifying a registered memory region.
///
/// Layout (32-bit): upper 16 bits are a generation counter, lower 16 bits a
/// slot index. A deregistered slot is reused under a bumped generation, so
/// keys held past deregistration fail validation instead of aliasing a new
/// region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionKey(u32);

impl RegionKey {
    const GEN_SHIFT: u32 = 16;
    const SLOT_MASK: u32 = 0xFFFF;

    #[inline]
    pub(crate) fn encode(slot: u16, generation: u16) -> Self {
        RegionKey(((generation as u32) << Self::GEN_SHIFT) | slot as u32)
    }

    #[inline]
    pub(crate) fn slot(self) -> u16 {
        (self.0 & Self::SLOT_MASK) as u16
    }

    #[inline]
    pub(crate) fn generation(self) -> u16 {
        (self.0 >> Self::GEN_SHIFT) as u16
    }

    /// Raw key value, as handed to the accelerator in send descriptors.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

struct ActiveRegion {
    region: MemoryRegion,
    /// Hardware key minted by the accelerator's memory registration.
    hw_key: u32,
    /// Descriptors referencing this region that have not yet completed
    /// (staged or posted). Nonzero blocks deregistration.
    in_flight: u32,
}

struct RegionSlot {
    generation: u16,
    active: Option<ActiveRegion>,
}

/// Table of registered memory regions.
///
/// Registration is the privileged, slow operation (it pins memory into the
/// protection domain); `checkout` is the per-send hot path and only does
/// range arithmetic. The caller sequences the accelerator calls — this
/// table is pure bookkeeping so it stays unit-testable.
pub(crate) struct BufferRegistrar {
    slots: Vec<RegionSlot>,
    free_list: Vec<u16>,
}

impl BufferRegistrar {
    pub fn new() -> Self {
        BufferRegistrar {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Validate a candidate region without inserting it: rejects null or
    /// empty ranges and overlap with any active registration.
    pub fn validate_new(&self, region: &MemoryRegion) -> Result<(), Error> {
        if region.ptr.is_null() || region.len == 0 {
            return Err(Error::InvalidRegion);
        }
        let start = region.ptr as usize;
        let end = start.checked_add(region.len).ok_or(Error::InvalidRegion)?;
        for slot in &self.slots {
            if let Some(active) = &slot.active {
                let a = active.region.ptr as usize;
                let b = a + active.region.len;
                if start < b && a < end {
                    return Err(Error::InvalidRegion);
                }
            }
        }
        Ok(())
    }

    /// Insert a validated region with its hardware key and return the
    /// opaque key for it.
    pub fn insert(&mut self, region: MemoryRegion, hw_key: u32) -> Result<RegionKey, Error> {
        let slot = match self.free_list.pop() {
            Some(slot) => slot,
            None => {
                if self.slots.len() > u16::MAX as usize {
                    return Err(Error::InvalidRegion);
                }
                self.slots.push(RegionSlot {
                    generation: 0,
                    active: None,
                });
                (self.slots.len() - 1) as u16
            }
        };
        let entry = &mut self.slots[slot as usize];
        debug_assert!(entry.active.is_none());
        entry.active = Some(ActiveRegion {
            region,
            hw_key,
            in_flight: 0,
        });
        Ok(RegionKey::encode(slot, entry.generation))
    }

    /// Release a registration. Fails with `RegionBusy` while any descriptor
    /// referencing the key has not completed. Returns the hardware key so
    /// the caller can deregister it from the protection domain.
    pub fn remove(&mut self, key: RegionKey) -> Result<u32, Error> {
        let slot = self.lookup(key)?;
        let entry = &mut self.slots[slot];
        let active = entry.active.as_ref().ok_or(Error::InvalidKey)?;
        if active.in_flight > 0 {
            return Err(Error::RegionBusy);
        }
        let hw_key = active.hw_key;
        entry.active = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free_list.push(slot as u16);
        Ok(hw_key)
    }

    /// Hot-path validation for `send`: resolve the key, bounds-check the
    /// byte range, and count the descriptor as in flight. Returns the
    /// segment pointer and the hardware key for the post.
    pub fn checkout(
        &mut self,
        key: RegionKey,
        offset: usize,
        len: u32,
    ) -> Result<(*const u8, u32), Error> {
        let slot = self.lookup(key)?;
        let active = self.slots[slot].active.as_mut().ok_or(Error::InvalidKey)?;
        if len == 0 {
            return Err(Error::InvalidKey);
        }
        let end = offset.checked_add(len as usize).ok_or(Error::InvalidKey)?;
        if end > active.region.len {
            return Err(Error::InvalidKey);
        }
        active.in_flight += 1;
        Ok((active.region.ptr.wrapping_add(offset) as *const u8, active.hw_key))
    }

    /// Undo a checkout: called when the hardware confirms completion, or
    /// when a send is rolled back before posting.
    pub fn release(&mut self, key: RegionKey) {
        // Deregistration is blocked while in_flight > 0, so the slot is
        // still live for every outstanding checkout.
        if let Ok(slot) = self.lookup(key)
            && let Some(active) = self.slots[slot].active.as_mut()
        {
            debug_assert!(active.in_flight > 0, "release without checkout");
            active.in_flight = active.in_flight.saturating_sub(1);
        } else {
            debug_assert!(false, "release of unknown region key");
        }
    }

    fn lookup(&self, key: RegionKey) -> Result<usize, Error> {
        let slot = key.slot() as usize;
        if slot >= self.slots.len() || self.slots[slot].generation != key.generation() {
            return Err(Error::InvalidKey);
        }
        Ok(slot)
    }
}
