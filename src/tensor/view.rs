//! Typed, shaped views into arena memory

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::backend::{DevicePtr, DeviceStream, QueueId};
use crate::error::{MlpForgeError, MlpResult};
use crate::memory::arena::{ArenaPhase, ArenaShared};
use crate::tensor::{DType, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Slot(usize),
    Block,
}

/// Non-owning handle to a tensor inside a [`crate::memory::MemoryArena`]
///
/// Cheap to clone. A view never allocates; its address is resolved from the
/// arena each time it is used, which fails while the arena is open and after
/// it has been released.
pub struct TensorView<T> {
    shape: Vec<usize>,
    origin: Origin,
    arena: Arc<ArenaShared>,
    _marker: PhantomData<T>,
}

impl<T> Clone for TensorView<T> {
    fn clone(&self) -> Self {
        TensorView {
            shape: self.shape.clone(),
            origin: self.origin,
            arena: Arc::clone(&self.arena),
            _marker: PhantomData,
        }
    }
}

impl<T: Scalar> TensorView<T> {
    pub(crate) fn for_slot(arena: Arc<ArenaShared>, index: usize, shape: Vec<usize>) -> Self {
        TensorView {
            shape,
            origin: Origin::Slot(index),
            arena,
            _marker: PhantomData,
        }
    }

    pub(crate) fn whole_block(arena: Arc<ArenaShared>, len: usize) -> Self {
        TensorView {
            shape: vec![len],
            origin: Origin::Block,
            arena,
            _marker: PhantomData,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_size(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    /// Leading dimension
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Product of the trailing dimensions
    pub fn cols(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn arena_name(&self) -> &str {
        self.arena.name()
    }

    /// True if both views cover the same reservation of the same arena
    pub fn same_storage(&self, other: &TensorView<T>) -> bool {
        self.arena.id() == other.arena.id() && self.origin == other.origin
    }

    /// Same bytes, different shape
    pub fn reshape(&self, shape: &[usize]) -> MlpResult<TensorView<T>> {
        let count = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .filter(|c| c.checked_mul(std::mem::size_of::<T>()).is_some());
        if shape.is_empty() || count != Some(self.len()) {
            return Err(MlpForgeError::ShapeMismatch(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        Ok(TensorView {
            shape: shape.to_vec(),
            origin: self.origin,
            arena: Arc::clone(&self.arena),
            _marker: PhantomData,
        })
    }

    /// Byte offset inside the arena block
    pub fn byte_offset(&self) -> MlpResult<usize> {
        let state = self.arena.read()?;
        self.check_phase(state.phase())?;
        match self.origin {
            Origin::Block => Ok(0),
            Origin::Slot(index) => state
                .slot(index)
                .and_then(|s| s.offset())
                .ok_or_else(|| self.unbound(index)),
        }
    }

    /// Resolve to a device pointer for kernel launches
    pub fn device_ptr(&self) -> MlpResult<DevicePtr<T>> {
        let state = self.arena.read()?;
        self.check_phase(state.phase())?;
        let offset = match self.origin {
            Origin::Block => 0,
            Origin::Slot(index) => state
                .slot(index)
                .and_then(|s| s.offset())
                .ok_or_else(|| self.unbound(index))?,
        };
        let block = state.block().ok_or_else(|| {
            MlpForgeError::InvalidState(format!(
                "arena '{}' has no backing block",
                self.arena.name()
            ))
        })?;
        debug_assert!(offset + self.byte_size() <= state.capacity());
        Ok(block.typed::<T>(offset, self.len())?)
    }

    /// Copy host data in; the copy runs in order on the primary queue
    pub fn upload(&self, stream: &DeviceStream, data: &[T]) -> MlpResult<()> {
        if data.len() != self.len() {
            return Err(MlpForgeError::ShapeMismatch(format!(
                "upload of {} elements into tensor {:?}",
                data.len(),
                self.shape
            )));
        }
        let dst = self.device_ptr()?;
        let data: Arc<[T]> = Arc::from(data);
        stream.launch(QueueId::Primary, "upload", move || {
            // SAFETY: this op is the only user of dst while it runs.
            unsafe { dst.as_mut_slice() }.copy_from_slice(&data);
            Ok(())
        })?;
        Ok(())
    }

    /// Copy the tensor out; waits for all queued work on the stream
    pub fn download(&self, stream: &DeviceStream) -> MlpResult<Vec<T>> {
        let src = self.device_ptr()?;
        let out: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        stream.launch(QueueId::Primary, "download", move || {
            // SAFETY: queued after every writer on the primary queue.
            let values = unsafe { src.as_slice() }.to_vec();
            *sink.lock()? = values;
            Ok(())
        })?;
        stream.synchronize()?;
        let mut guard = out.lock()?;
        Ok(std::mem::take(&mut *guard))
    }

    /// Set every element to `value`
    pub fn fill(&self, stream: &DeviceStream, value: T) -> MlpResult<()> {
        self.fill_on(stream, QueueId::Primary, value)
    }

    pub fn fill_zero(&self, stream: &DeviceStream) -> MlpResult<()> {
        self.fill(stream, T::default())
    }

    pub(crate) fn fill_on(&self, stream: &DeviceStream, queue: QueueId, value: T) -> MlpResult<()> {
        let dst = self.device_ptr()?;
        stream.launch(queue, "fill", move || {
            // SAFETY: this op is the only user of dst while it runs.
            unsafe { dst.as_mut_slice() }.fill(value);
            Ok(())
        })?;
        Ok(())
    }

    fn check_phase(&self, phase: ArenaPhase) -> MlpResult<()> {
        match phase {
            ArenaPhase::Sealed => Ok(()),
            ArenaPhase::Open => Err(MlpForgeError::NotSealed(self.arena.name().to_string())),
            ArenaPhase::Released => {
                Err(MlpForgeError::ArenaReleased(self.arena.name().to_string()))
            }
        }
    }

    fn unbound(&self, index: usize) -> MlpForgeError {
        MlpForgeError::InternalError(format!(
            "slot {} of arena '{}' has no offset",
            index,
            self.arena.name()
        ))
    }
}

impl<T: Scalar> fmt::Debug for TensorView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorView")
            .field("arena", &self.arena.name())
            .field("origin", &self.origin)
            .field("shape", &self.shape)
            .field("dtype", &T::DTYPE)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{Device, DeviceStream};
    use crate::error::MlpForgeError;
    use crate::memory::{strategy_for, AllocatorKind, MemoryArena};
    use half::f16;

    fn setup() -> (Device, DeviceStream, MemoryArena) {
        let device = Device::open(0).unwrap();
        let stream = DeviceStream::new(&device).unwrap();
        let arena = MemoryArena::new("view_test", strategy_for(AllocatorKind::Managed, &device));
        (device, stream, arena)
    }

    #[test]
    fn test_upload_download() {
        let (_device, stream, mut arena) = setup();
        let view = arena.reserve_tensor::<f32>("x", &[2, 3]).unwrap();
        arena.seal().unwrap();

        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        view.upload(&stream, &data).unwrap();
        assert_eq!(view.download(&stream).unwrap(), data);
        assert_eq!(view.rows(), 2);
        assert_eq!(view.cols(), 3);
    }

    #[test]
    fn test_upload_length_checked() {
        let (_device, stream, mut arena) = setup();
        let view = arena.reserve_tensor::<f32>("x", &[4]).unwrap();
        arena.seal().unwrap();
        assert!(matches!(
            view.upload(&stream, &[1.0, 2.0]),
            Err(MlpForgeError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_reshape_shares_storage() {
        let (_device, stream, mut arena) = setup();
        let view = arena.reserve_tensor::<f16>("h", &[2, 4]).unwrap();
        arena.seal().unwrap();

        let flat = view.reshape(&[8]).unwrap();
        assert!(flat.same_storage(&view));
        assert!(view.reshape(&[3, 3]).is_err());

        flat.fill(&stream, f16::from_f32(0.5)).unwrap();
        assert!(view
            .download(&stream)
            .unwrap()
            .iter()
            .all(|&v| v == f16::from_f32(0.5)));
    }

    #[test]
    fn test_reshape_rejects_overflowing_shape() {
        let (_device, _stream, mut arena) = setup();
        let view = arena.reserve_tensor::<f32>("x", &[8]).unwrap();
        arena.seal().unwrap();
        assert!(matches!(
            view.reshape(&[usize::MAX, 2]),
            Err(MlpForgeError::ShapeMismatch(_))
        ));
        assert!(matches!(
            view.reshape(&[(1usize << 61) + 1, 8]),
            Err(MlpForgeError::ShapeMismatch(_))
        ));
        assert_eq!(view.reshape(&[2, 4]).unwrap().len(), 8);
    }

    #[test]
    fn test_views_do_not_overlap() {
        let (_device, stream, mut arena) = setup();
        let a = arena.reserve_tensor::<f32>("a", &[3]).unwrap();
        let b = arena.reserve_tensor::<f32>("b", &[3]).unwrap();
        arena.seal().unwrap();
        assert!(!a.same_storage(&b));

        a.upload(&stream, &[1.0, 1.0, 1.0]).unwrap();
        b.upload(&stream, &[2.0, 2.0, 2.0]).unwrap();
        assert_eq!(a.download(&stream).unwrap(), vec![1.0; 3]);
        assert_eq!(b.byte_offset().unwrap(), 256);
    }
}
