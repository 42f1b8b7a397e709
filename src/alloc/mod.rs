//! GPU memory allocators
//!
//! The two allocators at the core of the crate: the bucketized buffer
//! allocator for device-local tensor storage and the pooled upload heap for
//! CPU-to-GPU staging copies. Both are parametrized by the device capability
//! interface and an execution context.

mod bucket;
mod pointer;
mod region;
mod upload;

pub use bucket::{
    AllocationInfo, AllocatorRoundingMode, BucketAllocatorConfig, BucketizedBufferAllocator,
    DEFAULT_MAX_HEAP_SIZE_IN_TILES,
};
pub use pointer::DevicePtr;
pub use region::BufferRegion;
pub use upload::{
    PooledUploadHeap, UploadHeapConfig, DEFAULT_ALLOCATION_ALIGNMENT,
    DEFAULT_MAX_REUSABLE_COMMAND_LISTS, DEFAULT_MIN_CHUNK_SIZE,
};
