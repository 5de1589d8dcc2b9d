//! Raw device memory blocks and typed device pointers

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{DeviceError, DeviceResult};

/// Base alignment of every block handed out by the device
pub const BLOCK_ALIGNMENT: usize = 256;

/// Where a block lives and who can touch it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Device-local memory, fastest for kernels
    DeviceLocal,
    /// Page-locked host memory the device can read and write
    PinnedHost,
    /// Unified memory migrated between host and device on demand
    Managed,
}

impl Placement {
    pub const ALL: [Placement; 3] = [
        Placement::DeviceLocal,
        Placement::PinnedHost,
        Placement::Managed,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Placement::DeviceLocal => 0,
            Placement::PinnedHost => 1,
            Placement::Managed => 2,
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::DeviceLocal => write!(f, "device-local"),
            Placement::PinnedHost => write!(f, "pinned-host"),
            Placement::Managed => write!(f, "managed"),
        }
    }
}

/// Backing storage of one block.
///
/// Freed when the last holder goes away, so ops still queued or recorded in
/// a graph keep their memory alive even after the owning arena released it.
pub(crate) struct BlockMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: BlockMemory owns a plain heap allocation. Access to its bytes goes
// through DevicePtr, whose unsafe accessors put the aliasing burden on the
// kernel launch code (disjoint output ranges per op, queue ordering).
unsafe impl Send for BlockMemory {}
unsafe impl Sync for BlockMemory {}

impl BlockMemory {
    pub(crate) fn allocate(size: usize, placement: Placement) -> DeviceResult<Self> {
        let layout = Layout::from_size_align(size, BLOCK_ALIGNMENT).map_err(|e| {
            DeviceError::InvalidAllocation(format!("{} bytes: {}", size, e))
        })?;
        if layout.size() == 0 {
            return Err(DeviceError::InvalidAllocation(
                "block size cannot be zero".to_string(),
            ));
        }

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DeviceError::OutOfMemory {
            requested: size,
            available: 0,
            placement,
        })?;

        Ok(BlockMemory { ptr, layout })
    }

    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for BlockMemory {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Handle to one raw allocation obtained from [`super::Device::acquire`]
///
/// Cloning the handle does not duplicate the memory. Releasing a block twice
/// through the device is reported as [`DeviceError::DoubleFree`].
#[derive(Clone)]
pub struct RawBlock {
    id: u64,
    device_id: u64,
    placement: Placement,
    memory: Arc<BlockMemory>,
}

impl RawBlock {
    pub(crate) fn new(id: u64, device_id: u64, placement: Placement, memory: BlockMemory) -> Self {
        RawBlock {
            id,
            device_id,
            placement,
            memory: Arc::new(memory),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.memory.size()
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Base address, for diagnostics only
    pub fn addr(&self) -> usize {
        self.memory.base() as usize
    }

    pub(crate) fn device_id(&self) -> u64 {
        self.device_id
    }

    /// Typed pointer to `len` elements starting `offset` bytes into the block
    pub fn typed<T: Copy>(&self, offset: usize, len: usize) -> DeviceResult<DevicePtr<T>> {
        DevicePtr::new(Arc::clone(&self.memory), offset, len)
    }
}

impl fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBlock")
            .field("id", &self.id)
            .field("placement", &self.placement)
            .field("size", &self.size())
            .finish()
    }
}

/// Typed, bounds-checked pointer into a block, captured by kernel ops
pub struct DevicePtr<T> {
    memory: Arc<BlockMemory>,
    offset: usize,
    len: usize,
    _marker: PhantomData<T>,
}

// SAFETY: DevicePtr only hands out slices through unsafe accessors; T is Copy
// plain data and the block itself is Send + Sync.
unsafe impl<T: Send> Send for DevicePtr<T> {}
unsafe impl<T: Sync> Sync for DevicePtr<T> {}

impl<T> Clone for DevicePtr<T> {
    fn clone(&self) -> Self {
        DevicePtr {
            memory: Arc::clone(&self.memory),
            offset: self.offset,
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T: Copy> DevicePtr<T> {
    fn new(memory: Arc<BlockMemory>, offset: usize, len: usize) -> DeviceResult<Self> {
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|b| b.checked_add(offset))
            .ok_or_else(|| DeviceError::InvalidAllocation("view size overflows".to_string()))?;
        if bytes > memory.size() {
            return Err(DeviceError::InvalidAllocation(format!(
                "view [{}, {}) exceeds block of {} bytes",
                offset,
                bytes,
                memory.size()
            )));
        }
        let addr = memory.base() as usize + offset;
        if addr % std::mem::align_of::<T>() != 0 {
            return Err(DeviceError::InvalidAllocation(format!(
                "offset {} is misaligned for a {}-byte element",
                offset,
                std::mem::align_of::<T>()
            )));
        }
        Ok(DevicePtr {
            memory,
            offset,
            len,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// # Safety
    ///
    /// No op may write the same range while the returned slice is alive.
    pub unsafe fn as_slice(&self) -> &[T] {
        std::slice::from_raw_parts(self.memory.base().add(self.offset) as *const T, self.len)
    }

    /// # Safety
    ///
    /// The caller must be the only reader or writer of this range while the
    /// returned slice is alive. Kernel ops guarantee this through queue order
    /// and disjoint output tensors.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [T] {
        std::slice::from_raw_parts_mut(self.memory.base().add(self.offset) as *mut T, self.len)
    }
}

impl<T> fmt::Debug for DevicePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePtr")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
