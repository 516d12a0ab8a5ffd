//! Pool of fixed-size static port ranges.
//!
//! The span `[base, max)` is carved into `(max - base) / per_slot`
//! non-overlapping slots, each guarded by its own atomic flag so workers can
//! allocate concurrently without a shared lock.

use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use crate::error::{Error, Result};
use crate::types::PortRange;

pub struct StaticPortAllocator {
    base: u16,
    per_slot: u16,
    slots: Vec<AtomicBool>,
}

impl StaticPortAllocator {
    pub fn new(base: u16, max: u16, per_slot: u16) -> Self {
        let count = if per_slot == 0 || max <= base {
            0
        } else {
            usize::from((max - base) / per_slot)
        };
        Self {
            base,
            per_slot,
            slots: (0..count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_range(&self, index: usize) -> PortRange {
        let min = u32::from(self.base) + index as u32 * u32::from(self.per_slot);
        let max = min + u32::from(self.per_slot) - 1;
        // Every slot lies below `max`, which is itself a u16
        PortRange::new(min as u16, max as u16)
    }

    /// Claim the lowest free slot.
    pub fn acquire(&self) -> Result<PortRange> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(self.slot_range(i));
            }
        }
        Err(Error::NoSlotAvailable {
            slots: self.slots.len(),
        })
    }

    /// Return the slot that starts at `range.min`.
    pub fn release(&self, range: PortRange) {
        let index = range
            .min
            .checked_sub(self.base)
            .map(|offset| usize::from(offset / self.per_slot.max(1)));
        match index.and_then(|i| self.slots.get(i)) {
            Some(slot) => slot.store(false, Ordering::Release),
            None => warn!("release of foreign port range {}", range),
        }
    }

    /// Free every slot. Only used before the first scan.
    pub fn reset_all(&self) {
        for slot in &self.slots {
            slot.store(false, Ordering::Release);
        }
    }

    /// Ranges currently handed out, in slot order.
    pub fn allocated(&self) -> Vec<PortRange> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.load(Ordering::Acquire))
            .map(|(i, _)| self.slot_range(i))
            .collect()
    }
}
