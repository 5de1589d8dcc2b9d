//! Block allocation strategies
//!
//! A strategy decides where an arena's single block comes from. Arenas call
//! it exactly twice in their life: once at seal and once at release.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{Device, Placement, RawBlock};
use crate::error::{MlpForgeError, MlpResult};

/// Policy for obtaining and returning raw device bytes
pub trait BlockAllocatorStrategy: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Placement of every block this strategy hands out
    fn placement(&self) -> Placement;

    /// Obtain one contiguous, zeroed block of `byte_size` bytes
    fn acquire(&self, byte_size: usize) -> MlpResult<RawBlock>;

    /// Return a block obtained from `acquire`
    fn release(&self, block: RawBlock) -> MlpResult<()>;
}

/// Device-local memory; the default for parameters and activations
#[derive(Debug, Clone)]
pub struct DevicePrimaryAllocator {
    device: Device,
}

/// Page-locked host memory the device can access, used for staging
#[derive(Debug, Clone)]
pub struct PinnedHostAllocator {
    device: Device,
}

/// Unified memory visible to host and device
#[derive(Debug, Clone)]
pub struct ManagedAllocator {
    device: Device,
}

macro_rules! device_backed_strategy {
    ($ty:ident, $name:literal, $placement:expr) => {
        impl $ty {
            pub fn new(device: &Device) -> Self {
                $ty {
                    device: device.clone(),
                }
            }
        }

        impl BlockAllocatorStrategy for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn placement(&self) -> Placement {
                $placement
            }

            fn acquire(&self, byte_size: usize) -> MlpResult<RawBlock> {
                let block = self.device.acquire(byte_size, $placement)?;
                tracing::trace!("{}: acquired {} bytes", $name, byte_size);
                Ok(block)
            }

            fn release(&self, block: RawBlock) -> MlpResult<()> {
                if block.placement() != $placement {
                    return Err(MlpForgeError::InvalidState(format!(
                        "{} cannot release a {} block",
                        $name,
                        block.placement()
                    )));
                }
                self.device.release(block)?;
                Ok(())
            }
        }
    };
}

device_backed_strategy!(DevicePrimaryAllocator, "device_primary", Placement::DeviceLocal);
device_backed_strategy!(PinnedHostAllocator, "pinned_host", Placement::PinnedHost);
device_backed_strategy!(ManagedAllocator, "managed", Placement::Managed);

/// Named selector for the built-in strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    #[default]
    DevicePrimary,
    PinnedHost,
    Managed,
}

impl AllocatorKind {
    pub fn placement(self) -> Placement {
        match self {
            AllocatorKind::DevicePrimary => Placement::DeviceLocal,
            AllocatorKind::PinnedHost => Placement::PinnedHost,
            AllocatorKind::Managed => Placement::Managed,
        }
    }
}

impl FromStr for AllocatorKind {
    type Err = MlpForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "device" | "device_primary" | "primary" => Ok(AllocatorKind::DevicePrimary),
            "pinned" | "pinned_host" | "host" => Ok(AllocatorKind::PinnedHost),
            "managed" | "unified" => Ok(AllocatorKind::Managed),
            other => Err(MlpForgeError::InvalidConfiguration(format!(
                "unknown allocator '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorKind::DevicePrimary => write!(f, "device_primary"),
            AllocatorKind::PinnedHost => write!(f, "pinned_host"),
            AllocatorKind::Managed => write!(f, "managed"),
        }
    }
}

/// Build the strategy for `kind` on `device`
pub fn strategy_for(kind: AllocatorKind, device: &Device) -> Arc<dyn BlockAllocatorStrategy> {
    match kind {
        AllocatorKind::DevicePrimary => Arc::new(DevicePrimaryAllocator::new(device)),
        AllocatorKind::PinnedHost => Arc::new(PinnedHostAllocator::new(device)),
        AllocatorKind::Managed => Arc::new(ManagedAllocator::new(device)),
    }
}
