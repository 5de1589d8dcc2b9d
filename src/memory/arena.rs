//! Deferred-allocation memory arena
//!
//! Tensors are described first and allocated later. While the arena is
//! `Open` it only collects reservations; `seal` packs them into one block
//! obtained from the arena's [`BlockAllocatorStrategy`] and binds every
//! reservation to its offset. One device allocation per arena instead of
//! one per tensor.
//!
//! ```text
//!   Open --seal--> Sealed --release/drop--> Released
//! ```
//!
//! Views handed out by [`MemoryArena::reserve_tensor`] share the arena's
//! state, so resolving a view before seal or after release is reported as a
//! state error instead of touching memory.
//!
//! # Example
//!
//! ```rust,ignore
//! use mlpforge::backend::Device;
//! use mlpforge::memory::{strategy_for, AllocatorKind, MemoryArena};
//!
//! let device = Device::open(0)?;
//! let mut arena = MemoryArena::new("weights", strategy_for(AllocatorKind::DevicePrimary, &device));
//! let w = arena.reserve_tensor::<f32>("w0", &[16, 8])?;
//! let b = arena.reserve_tensor::<f32>("b0", &[8])?;
//! let capacity = arena.seal()?;
//! w.upload(&stream, &host_weights)?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::backend::{Placement, RawBlock};
use crate::error::{MlpForgeError, MlpResult};
use crate::memory::allocator::BlockAllocatorStrategy;
use crate::memory::calculator::MemoryCalculator;
use crate::tensor::{Scalar, TensorView};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle phase of an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaPhase {
    Open,
    Sealed,
    Released,
}

impl fmt::Display for ArenaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaPhase::Open => write!(f, "open"),
            ArenaPhase::Sealed => write!(f, "sealed"),
            ArenaPhase::Released => write!(f, "released"),
        }
    }
}

/// One reservation; carries its offset once the arena is sealed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSlot {
    index: usize,
    label: Option<String>,
    byte_size: usize,
    alignment: usize,
    offset: Option<usize>,
}

impl ReservationSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Resolved offset, `None` until the arena is sealed
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }
}

pub(crate) struct ArenaState {
    phase: ArenaPhase,
    slots: Vec<ReservationSlot>,
    block: Option<RawBlock>,
    capacity: usize,
}

impl ArenaState {
    pub(crate) fn phase(&self) -> ArenaPhase {
        self.phase
    }

    pub(crate) fn slot(&self, index: usize) -> Option<&ReservationSlot> {
        self.slots.get(index)
    }

    pub(crate) fn block(&self) -> Option<&RawBlock> {
        self.block.as_ref()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// State shared between an arena and the views it handed out
pub(crate) struct ArenaShared {
    id: u64,
    name: String,
    state: RwLock<ArenaState>,
}

impl ArenaShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn read(&self) -> MlpResult<RwLockReadGuard<'_, ArenaState>> {
        Ok(self.state.read()?)
    }
}

/// Arena statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaStats {
    pub name: String,
    pub phase: ArenaPhase,
    pub placement: Placement,
    pub reservations: usize,
    pub requested_bytes: usize,
    pub capacity: usize,
}

impl ArenaStats {
    pub fn padding_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.requested_bytes)
    }
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Arena '{}' ({}, {}): {} reservations, {} bytes requested, {} bytes capacity, {} bytes padding",
            self.name,
            self.phase,
            self.placement,
            self.reservations,
            self.requested_bytes,
            self.capacity,
            self.padding_bytes()
        )
    }
}

/// Owning, deferred-allocation region of device memory
pub struct MemoryArena {
    strategy: Arc<dyn BlockAllocatorStrategy>,
    shared: Arc<ArenaShared>,
}

impl MemoryArena {
    /// Default alignment for tensor reservations
    pub const DEFAULT_ALIGNMENT: usize = MemoryCalculator::DEFAULT_ALIGNMENT;

    /// Create an empty, open arena
    pub fn new(name: impl Into<String>, strategy: Arc<dyn BlockAllocatorStrategy>) -> Self {
        let name = name.into();
        tracing::debug!("Arena '{}' created ({})", name, strategy.name());
        MemoryArena {
            strategy,
            shared: Arc::new(ArenaShared {
                id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
                name,
                state: RwLock::new(ArenaState {
                    phase: ArenaPhase::Open,
                    slots: Vec::new(),
                    block: None,
                    capacity: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn placement(&self) -> Placement {
        self.strategy.placement()
    }

    pub fn phase(&self) -> MlpResult<ArenaPhase> {
        Ok(self.shared.read()?.phase)
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.phase(), Ok(ArenaPhase::Sealed))
    }

    pub fn reservation_count(&self) -> MlpResult<usize> {
        Ok(self.shared.read()?.slots.len())
    }

    /// Bytes of the sealed block (0 while open or when nothing was reserved)
    pub fn capacity(&self) -> MlpResult<usize> {
        Ok(self.shared.read()?.capacity)
    }

    /// Snapshot of every reservation in packing order
    pub fn slots(&self) -> MlpResult<Vec<ReservationSlot>> {
        Ok(self.shared.read()?.slots.clone())
    }

    /// Reserve `byte_size` bytes at `alignment`
    ///
    /// # Errors
    /// - `InvalidSize` if `byte_size` is zero
    /// - `InvalidAlignment` if `alignment` is not a power of two
    /// - `AlreadySealed` unless the arena is open
    pub fn reserve(&mut self, byte_size: usize, alignment: usize) -> MlpResult<ReservationSlot> {
        self.reserve_slot(None, byte_size, alignment)
    }

    /// Reserve a labelled region; the label shows up in logs and slot snapshots
    pub fn reserve_named(
        &mut self,
        label: impl Into<String>,
        byte_size: usize,
        alignment: usize,
    ) -> MlpResult<ReservationSlot> {
        self.reserve_slot(Some(label.into()), byte_size, alignment)
    }

    /// Reserve a tensor of `shape` at the default alignment and return its view
    pub fn reserve_tensor<T: Scalar>(
        &mut self,
        label: impl Into<String>,
        shape: &[usize],
    ) -> MlpResult<TensorView<T>> {
        self.reserve_tensor_aligned(label, shape, Self::DEFAULT_ALIGNMENT)
    }

    /// Reserve a tensor with an explicit alignment
    pub fn reserve_tensor_aligned<T: Scalar>(
        &mut self,
        label: impl Into<String>,
        shape: &[usize],
        alignment: usize,
    ) -> MlpResult<TensorView<T>> {
        let label = label.into();
        if shape.is_empty() || shape.contains(&0) {
            return Err(MlpForgeError::InvalidSize(format!(
                "tensor '{}' has an empty dimension in shape {:?}",
                label, shape
            )));
        }
        if alignment < std::mem::align_of::<T>() {
            return Err(MlpForgeError::InvalidAlignment(alignment));
        }
        let bytes = shape
            .iter()
            .try_fold(std::mem::size_of::<T>(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                MlpForgeError::InvalidSize(format!("tensor '{}' size overflows", label))
            })?;

        let slot = self.reserve_slot(Some(label), bytes, alignment)?;
        Ok(TensorView::for_slot(
            Arc::clone(&self.shared),
            slot.index,
            shape.to_vec(),
        ))
    }

    /// Typed view over an existing reservation
    pub fn view_of<T: Scalar>(
        &self,
        slot: &ReservationSlot,
        shape: &[usize],
    ) -> MlpResult<TensorView<T>> {
        let state = self.shared.read()?;
        let stored = state.slots.get(slot.index).ok_or_else(|| {
            MlpForgeError::InvalidState(format!(
                "slot {} does not belong to arena '{}'",
                slot.index,
                self.name()
            ))
        })?;
        let bytes = shape
            .iter()
            .try_fold(std::mem::size_of::<T>(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                MlpForgeError::ShapeMismatch(format!(
                    "shape {:?} overflows slot {}",
                    shape, slot.index
                ))
            })?;
        if shape.is_empty() || bytes == 0 || bytes > stored.byte_size {
            return Err(MlpForgeError::ShapeMismatch(format!(
                "shape {:?} needs {} bytes, slot {} holds {}",
                shape, bytes, slot.index, stored.byte_size
            )));
        }
        if stored.alignment < std::mem::align_of::<T>() {
            return Err(MlpForgeError::InvalidAlignment(stored.alignment));
        }
        Ok(TensorView::for_slot(
            Arc::clone(&self.shared),
            slot.index,
            shape.to_vec(),
        ))
    }

    /// Pack every reservation and obtain the single backing block
    ///
    /// Returns the block capacity. On allocation failure the arena stays open
    /// so the caller may release other arenas and try again.
    pub fn seal(&mut self) -> MlpResult<usize> {
        let mut state = self.shared.state.write()?;
        if state.phase != ArenaPhase::Open {
            return Err(MlpForgeError::AlreadySealed(self.shared.name.clone()));
        }

        let mut calc = MemoryCalculator::new();
        for slot in &state.slots {
            calc.add_reservation(slot.byte_size, slot.alignment);
        }
        let plan = calc.plan()?;

        let block = if plan.capacity() > 0 {
            Some(self.strategy.acquire(plan.capacity())?)
        } else {
            None
        };

        for (slot, &offset) in state.slots.iter_mut().zip(plan.offsets()) {
            slot.offset = Some(offset);
            tracing::trace!(
                "Arena '{}' slot {} ({}) -> offset {} ({} bytes)",
                self.shared.name,
                slot.index,
                slot.label.as_deref().unwrap_or("-"),
                offset,
                slot.byte_size
            );
        }
        state.block = block;
        state.capacity = plan.capacity();
        state.phase = ArenaPhase::Sealed;

        tracing::debug!(
            "Arena '{}' sealed: {} reservations packed into {} bytes ({} padding, {})",
            self.shared.name,
            state.slots.len(),
            plan.capacity(),
            plan.padding_bytes(),
            self.strategy.placement()
        );
        Ok(plan.capacity())
    }

    /// Return the block to the strategy; every view becomes invalid
    ///
    /// # Errors
    /// - `NotSealed` while the arena is still open
    /// - `DoubleFree` if the arena was already released
    pub fn release(&mut self) -> MlpResult<()> {
        let mut state = self.shared.state.write()?;
        match state.phase {
            ArenaPhase::Open => return Err(MlpForgeError::NotSealed(self.shared.name.clone())),
            ArenaPhase::Released => {
                return Err(MlpForgeError::DoubleFree(format!(
                    "arena '{}' released twice",
                    self.shared.name
                )))
            }
            ArenaPhase::Sealed => {}
        }

        if let Some(block) = state.block.clone() {
            self.strategy.release(block)?;
        }
        state.block = None;
        state.phase = ArenaPhase::Released;

        tracing::debug!(
            "Arena '{}' released {} bytes",
            self.shared.name,
            state.capacity
        );
        Ok(())
    }

    /// Flat view over the whole sealed block
    ///
    /// Covers `capacity / size_of::<T>()` elements, padding included. Used
    /// to zero or inspect a whole tensor category in one pass.
    pub fn as_view<T: Scalar>(&self) -> MlpResult<TensorView<T>> {
        let state = self.shared.read()?;
        match state.phase {
            ArenaPhase::Open => Err(MlpForgeError::NotSealed(self.shared.name.clone())),
            ArenaPhase::Released => Err(MlpForgeError::ArenaReleased(self.shared.name.clone())),
            ArenaPhase::Sealed => {
                let len = state.capacity / std::mem::size_of::<T>();
                if len == 0 {
                    return Err(MlpForgeError::InvalidSize(format!(
                        "arena '{}' holds no {}-byte elements",
                        self.shared.name,
                        std::mem::size_of::<T>()
                    )));
                }
                Ok(TensorView::whole_block(Arc::clone(&self.shared), len))
            }
        }
    }

    pub fn stats(&self) -> MlpResult<ArenaStats> {
        let state = self.shared.read()?;
        Ok(ArenaStats {
            name: self.shared.name.clone(),
            phase: state.phase,
            placement: self.strategy.placement(),
            reservations: state.slots.len(),
            requested_bytes: state.slots.iter().map(|s| s.byte_size).sum(),
            capacity: state.capacity,
        })
    }

    /// Drop every reservation made after the first `count`
    ///
    /// No-op when nothing was reserved since; otherwise the arena must be
    /// open. Views over the dropped slots must not outlive this.
    pub(crate) fn truncate_reservations(&mut self, count: usize) -> MlpResult<()> {
        let mut state = self.shared.state.write()?;
        if count >= state.slots.len() {
            return Ok(());
        }
        if state.phase != ArenaPhase::Open {
            return Err(MlpForgeError::AlreadySealed(self.shared.name.clone()));
        }
        tracing::debug!(
            "Arena '{}' dropping {} reservations",
            self.shared.name,
            state.slots.len() - count
        );
        state.slots.truncate(count);
        Ok(())
    }

    fn reserve_slot(
        &mut self,
        label: Option<String>,
        byte_size: usize,
        alignment: usize,
    ) -> MlpResult<ReservationSlot> {
        if byte_size == 0 {
            return Err(MlpForgeError::InvalidSize(format!(
                "reservation in arena '{}' has zero bytes",
                self.shared.name
            )));
        }
        if !alignment.is_power_of_two() {
            return Err(MlpForgeError::InvalidAlignment(alignment));
        }

        let mut state = self.shared.state.write()?;
        if state.phase != ArenaPhase::Open {
            return Err(MlpForgeError::AlreadySealed(self.shared.name.clone()));
        }

        let slot = ReservationSlot {
            index: state.slots.len(),
            label,
            byte_size,
            alignment,
            offset: None,
        };
        state.slots.push(slot.clone());
        Ok(slot)
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        if !self.is_sealed() {
            return;
        }
        if let Err(e) = self.release() {
            tracing::warn!("Arena '{}' failed to release on drop: {}", self.name(), e);
        }
    }
}

impl fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryArena")
            .field("name", &self.shared.name)
            .field("strategy", &self.strategy.name())
            .field("phase", &self.phase().ok())
            .finish()
    }
}
