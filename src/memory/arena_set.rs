//! One arena per tensor category
//!
//! Parameters, their gradients and per-step activations have different
//! lifetimes and access patterns, so each category is packed into its own
//! block. Shape-compatible tensors of one category end up contiguous.

use std::fmt;

use crate::backend::Device;
use crate::error::MlpResult;
use crate::memory::allocator::{strategy_for, AllocatorKind};
use crate::memory::arena::{ArenaStats, MemoryArena};

/// Tensor category, selecting the arena a tensor is reserved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorCategory {
    /// Weights and biases
    Weights,
    /// Weight and bias gradients
    WeightGrads,
    /// Inputs, outputs, pre-activations and propagated gradients
    Activations,
}

impl TensorCategory {
    pub const ALL: [TensorCategory; 3] = [
        TensorCategory::Weights,
        TensorCategory::WeightGrads,
        TensorCategory::Activations,
    ];

    pub fn arena_name(self) -> &'static str {
        match self {
            TensorCategory::Weights => "weights",
            TensorCategory::WeightGrads => "weight_grads",
            TensorCategory::Activations => "activations",
        }
    }
}

impl fmt::Display for TensorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.arena_name())
    }
}

/// The three category arenas, sealed and released together
#[derive(Debug)]
pub struct ArenaSet {
    weights: MemoryArena,
    weight_grads: MemoryArena,
    activations: MemoryArena,
}

impl ArenaSet {
    /// All three arenas use the same strategy kind
    pub fn new(device: &Device, kind: AllocatorKind) -> Self {
        Self::with_kinds(device, kind, kind, kind)
    }

    /// Pick a strategy per category
    pub fn with_kinds(
        device: &Device,
        weights: AllocatorKind,
        weight_grads: AllocatorKind,
        activations: AllocatorKind,
    ) -> Self {
        ArenaSet {
            weights: MemoryArena::new(
                TensorCategory::Weights.arena_name(),
                strategy_for(weights, device),
            ),
            weight_grads: MemoryArena::new(
                TensorCategory::WeightGrads.arena_name(),
                strategy_for(weight_grads, device),
            ),
            activations: MemoryArena::new(
                TensorCategory::Activations.arena_name(),
                strategy_for(activations, device),
            ),
        }
    }

    pub fn arena(&self, category: TensorCategory) -> &MemoryArena {
        match category {
            TensorCategory::Weights => &self.weights,
            TensorCategory::WeightGrads => &self.weight_grads,
            TensorCategory::Activations => &self.activations,
        }
    }

    pub fn arena_mut(&mut self, category: TensorCategory) -> &mut MemoryArena {
        match category {
            TensorCategory::Weights => &mut self.weights,
            TensorCategory::WeightGrads => &mut self.weight_grads,
            TensorCategory::Activations => &mut self.activations,
        }
    }

    /// Reservation count of every arena, for [`ArenaSet::rollback`]
    pub(crate) fn mark(&self) -> MlpResult<[usize; 3]> {
        let mut mark = [0; 3];
        for (slot, category) in mark.iter_mut().zip(TensorCategory::ALL) {
            *slot = self.arena(category).reservation_count()?;
        }
        Ok(mark)
    }

    /// Forget reservations made since `mark`
    pub(crate) fn rollback(&mut self, mark: [usize; 3]) -> MlpResult<()> {
        for (count, category) in mark.into_iter().zip(TensorCategory::ALL) {
            self.arena_mut(category).truncate_reservations(count)?;
        }
        Ok(())
    }

    /// Seal every arena; returns the total capacity
    ///
    /// Stops at the first failure. Arenas sealed before it stay sealed and
    /// the failing one stays open.
    pub fn seal_all(&mut self) -> MlpResult<usize> {
        let mut total = 0;
        for category in TensorCategory::ALL {
            total += self.arena_mut(category).seal()?;
        }
        tracing::debug!("ArenaSet sealed: {} bytes total", total);
        Ok(total)
    }

    pub fn release_all(&mut self) -> MlpResult<()> {
        for category in TensorCategory::ALL {
            self.arena_mut(category).release()?;
        }
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        TensorCategory::ALL
            .iter()
            .all(|&c| self.arena(c).is_sealed())
    }

    pub fn stats(&self) -> MlpResult<Vec<ArenaStats>> {
        TensorCategory::ALL
            .iter()
            .map(|&c| self.arena(c).stats())
            .collect()
    }

    /// Sum of all sealed capacities
    pub fn total_capacity(&self) -> MlpResult<usize> {
        TensorCategory::ALL
            .iter()
            .map(|&c| self.arena(c).capacity())
            .sum()
    }
}
