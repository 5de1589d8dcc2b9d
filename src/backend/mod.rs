//! Device backends
//!
//! The crate currently ships the emulated device in [`device`].

pub mod device;

pub use device::{
    Device, DeviceError, DeviceEvent, DeviceOp, DeviceProps, DevicePtr, DeviceResult,
    DeviceStream, ExecutionGraph, MemoryInfo, Placement, QueueId, RawBlock,
};
