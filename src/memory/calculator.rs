//! Packing calculator for arena reservations
//!
//! Computes where every reservation lands inside one block before any
//! device memory is touched. Packing is a single forward scan in insertion
//! order: each slot starts at the first multiple of its alignment at or after
//! the previous slot's end, and the block capacity is the end of the last slot.
//!
//! # Example
//! ```ignore
//! let mut calc = MemoryCalculator::new();
//! calc.add_reservation(100, 4);
//! calc.add_reservation(64, 256);
//!
//! let plan = calc.plan()?;
//! assert_eq!(plan.offsets(), &[0, 256]);
//! assert_eq!(plan.capacity(), 320);
//! ```

use crate::error::{MlpForgeError, MlpResult};

/// Round `offset` up to a multiple of `alignment` (a power of two)
pub fn align_up(offset: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    offset
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

/// Reservation requests in packing order
#[derive(Debug, Clone, Default)]
pub struct MemoryCalculator {
    requests: Vec<(usize, usize)>,
}

/// Result of packing: one offset per reservation plus total capacity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackingPlan {
    offsets: Vec<usize>,
    capacity: usize,
    requested_bytes: usize,
}

impl MemoryCalculator {
    /// Default alignment for tensor reservations
    ///
    /// 256 bytes matches the base alignment of device blocks, so every
    /// default-aligned slot is also aligned in absolute terms.
    pub const DEFAULT_ALIGNMENT: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request; returns its index in the plan
    pub fn add_reservation(&mut self, byte_size: usize, alignment: usize) -> usize {
        self.requests.push((byte_size, alignment));
        self.requests.len() - 1
    }

    pub fn reservation_count(&self) -> usize {
        self.requests.len()
    }

    /// Sum of requested sizes, without padding
    pub fn requested_bytes(&self) -> usize {
        self.requests.iter().map(|(size, _)| size).sum()
    }

    /// Pack all requests
    pub fn plan(&self) -> MlpResult<PackingPlan> {
        let mut offsets = Vec::with_capacity(self.requests.len());
        let mut end = 0usize;
        for &(size, alignment) in &self.requests {
            if !alignment.is_power_of_two() {
                return Err(MlpForgeError::InvalidAlignment(alignment));
            }
            let offset = align_up(end, alignment).ok_or_else(overflow)?;
            end = offset.checked_add(size).ok_or_else(overflow)?;
            offsets.push(offset);
        }

        Ok(PackingPlan {
            offsets,
            capacity: end,
            requested_bytes: self.requested_bytes(),
        })
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

fn overflow() -> MlpForgeError {
    MlpForgeError::InvalidSize("packed capacity overflows usize".to_string())
}

impl PackingPlan {
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn requested_bytes(&self) -> usize {
        self.requested_bytes
    }

    /// Bytes lost to alignment gaps
    pub fn padding_bytes(&self) -> usize {
        self.capacity - self.requested_bytes
    }
}
