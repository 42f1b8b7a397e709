//! Device capability layer
//!
//! This module defines the minimal device interface the allocators are
//! written against, the handle types shared by every backend, and the
//! software reference device.

mod api;
mod command;
mod error;
mod resource;
mod software;

pub use api::{
    CommandListType, DeviceApi, HeapFlags, HeapProperties, HeapTileRange, HeapType, ResourceDesc,
    ResourceDimension, ResourceFlags, ResourceState, TileRegion, TILE_SIZE_IN_BYTES,
};
pub use command::{Command, CommandAllocator, CommandList};
pub use error::{DeviceError, DeviceResult};
pub use resource::{BackendPayload, Heap, Resource};
pub use software::{SoftwareDevice, SoftwareDeviceStats};
