//! Emulated compute device
//!
//! Memory lives in host allocations with a separate budget per placement,
//! queues are worker threads that execute commands in order, and events
//! complete when a queue reaches them. Everything above this module only sees
//! [`Device`], [`DeviceStream`], [`DeviceEvent`] and [`ExecutionGraph`], so a
//! real GPU runtime can replace it without touching arenas or the engine.

mod error;
mod event;
mod graph;
mod memory;
mod queue;
mod stream;

pub use error::{DeviceError, DeviceResult};
pub use event::DeviceEvent;
pub use graph::ExecutionGraph;
pub use memory::{DevicePtr, Placement, RawBlock, BLOCK_ALIGNMENT};
pub use queue::DeviceOp;
pub use stream::{DeviceStream, QueueId};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use memory::BlockMemory;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

const MIB: usize = 1024 * 1024;

/// Static properties and memory budgets of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProps {
    pub name: String,
    /// Device-local memory budget in bytes
    pub total_memory: usize,
    /// Pinned host memory budget in bytes
    pub pinned_memory: usize,
    /// Managed memory budget in bytes
    pub managed_memory: usize,
    /// Parallel execution units available to kernels
    pub compute_units: usize,
}

impl Default for DeviceProps {
    fn default() -> Self {
        DeviceProps {
            name: "mlpforge-emulated".to_string(),
            total_memory: 1024 * MIB,
            pinned_memory: 256 * MIB,
            managed_memory: 1024 * MIB,
            compute_units: rayon::current_num_threads(),
        }
    }
}

impl DeviceProps {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_total_memory(mut self, bytes: usize) -> Self {
        self.total_memory = bytes;
        self
    }

    pub fn with_pinned_memory(mut self, bytes: usize) -> Self {
        self.pinned_memory = bytes;
        self
    }

    pub fn with_managed_memory(mut self, bytes: usize) -> Self {
        self.managed_memory = bytes;
        self
    }

    pub fn with_compute_units(mut self, units: usize) -> Self {
        self.compute_units = units;
        self
    }

    /// Budget for a placement
    pub fn budget(&self, placement: Placement) -> usize {
        match placement {
            Placement::DeviceLocal => self.total_memory,
            Placement::PinnedHost => self.pinned_memory,
            Placement::Managed => self.managed_memory,
        }
    }
}

/// Usage snapshot for one placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub placement: Placement,
    pub used: usize,
    pub total: usize,
    pub live_blocks: usize,
}

impl MemoryInfo {
    pub fn free(&self) -> usize {
        self.total.saturating_sub(self.used)
    }
}

#[derive(Default)]
struct MemoryLedger {
    live: HashMap<u64, (Placement, usize)>,
    used: [usize; 3],
}

struct DeviceInner {
    id: u64,
    ordinal: usize,
    props: DeviceProps,
    next_block: AtomicU64,
    ledger: Mutex<MemoryLedger>,
}

/// Handle to a compute device; cloning shares the device
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Open a device with default properties
    pub fn open(ordinal: usize) -> DeviceResult<Self> {
        Self::with_props(ordinal, DeviceProps::default())
    }

    /// Open a device with explicit properties (memory budgets, compute units)
    pub fn with_props(ordinal: usize, props: DeviceProps) -> DeviceResult<Self> {
        if props.compute_units == 0 {
            return Err(DeviceError::InitializationFailed(
                "compute_units must be at least 1".to_string(),
            ));
        }

        tracing::debug!(
            "Device {} '{}' opened: {} MB local, {} MB pinned, {} MB managed",
            ordinal,
            props.name,
            props.total_memory / MIB,
            props.pinned_memory / MIB,
            props.managed_memory / MIB
        );

        Ok(Device {
            inner: Arc::new(DeviceInner {
                id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
                ordinal,
                props,
                next_block: AtomicU64::new(1),
                ledger: Mutex::new(MemoryLedger::default()),
            }),
        })
    }

    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    pub fn props(&self) -> &DeviceProps {
        &self.inner.props
    }

    /// Obtain `byte_size` zeroed bytes with the given placement
    pub fn acquire(&self, byte_size: usize, placement: Placement) -> DeviceResult<RawBlock> {
        if byte_size == 0 {
            return Err(DeviceError::InvalidAllocation(
                "cannot acquire a zero-sized block".to_string(),
            ));
        }

        let mut ledger = self.inner.ledger.lock()?;
        let budget = self.inner.props.budget(placement);
        let used = ledger.used[placement.index()];
        let available = budget.saturating_sub(used);
        if byte_size > available {
            return Err(DeviceError::OutOfMemory {
                requested: byte_size,
                available,
                placement,
            });
        }

        let memory = BlockMemory::allocate(byte_size, placement)?;
        let id = self.inner.next_block.fetch_add(1, Ordering::Relaxed);
        ledger.used[placement.index()] += byte_size;
        ledger.live.insert(id, (placement, byte_size));

        tracing::trace!(
            "Device {}: acquired block {} ({} bytes, {})",
            self.inner.ordinal,
            id,
            byte_size,
            placement
        );
        Ok(RawBlock::new(id, self.inner.id, placement, memory))
    }

    /// Return a block's budget to the device
    ///
    /// The bytes themselves are freed once no queued op or recorded graph
    /// still refers to them.
    pub fn release(&self, block: RawBlock) -> DeviceResult<()> {
        if block.device_id() != self.inner.id {
            return Err(DeviceError::InvalidAllocation(format!(
                "block {} belongs to another device",
                block.id()
            )));
        }

        let mut ledger = self.inner.ledger.lock()?;
        let (placement, size) = ledger
            .live
            .remove(&block.id())
            .ok_or(DeviceError::DoubleFree(block.id()))?;
        ledger.used[placement.index()] -= size;

        tracing::trace!(
            "Device {}: released block {} ({} bytes, {})",
            self.inner.ordinal,
            block.id(),
            size,
            placement
        );
        Ok(())
    }

    pub fn memory_info(&self, placement: Placement) -> DeviceResult<MemoryInfo> {
        let ledger = self.inner.ledger.lock()?;
        Ok(MemoryInfo {
            placement,
            used: ledger.used[placement.index()],
            total: self.inner.props.budget(placement),
            live_blocks: ledger
                .live
                .values()
                .filter(|(p, _)| *p == placement)
                .count(),
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("ordinal", &self.inner.ordinal)
            .field("name", &self.inner.props.name)
            .finish()
    }
}
