//! Device memory management
//!
//! Tensors are never allocated one by one. Callers describe every tensor
//! up front as a reservation in a [`MemoryArena`]; sealing the arena packs the
//! reservations into a single block obtained from a
//! [`BlockAllocatorStrategy`].
//!
//! # Pattern
//!
//! 1. Create an arena per tensor category ([`ArenaSet`])
//! 2. Reserve every tensor (views are handed out immediately)
//! 3. Seal once: offsets are computed by [`MemoryCalculator`], one block is acquired
//! 4. Use the views; release (or drop) the arena when done

pub mod allocator;
pub mod arena;
pub mod arena_set;
pub mod calculator;

pub use allocator::{
    strategy_for, AllocatorKind, BlockAllocatorStrategy, DevicePrimaryAllocator,
    ManagedAllocator, PinnedHostAllocator,
};
pub use arena::{ArenaPhase, ArenaStats, MemoryArena, ReservationSlot};
pub use arena_set::{ArenaSet, TensorCategory};
pub use calculator::{align_up, MemoryCalculator, PackingPlan};
