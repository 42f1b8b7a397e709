//! DmlForge - GPU memory subsystem for ML runtimes
//!
//! Two allocators sit between a high-level ML runtime and a GPU command
//! queue: the [`BucketizedBufferAllocator`] hands out opaque device pointers
//! for tensor storage backed by power-of-two resource buckets, and the
//! [`PooledUploadHeap`] streams CPU-to-GPU copies through ring-buffered
//! staging chunks with an LRU cache of pre-recorded copy command lists.
//!
//! Both are written against the [`DeviceApi`] capability trait and the
//! [`ExecutionContext`] submission trait, so they run unmodified over a real
//! driver binding or over the bundled [`SoftwareDevice`]/[`SoftwareQueue`]
//! pair, which backs everything with host memory for GPU-free runs and CI.
//!
//! ```
//! use dmlforge::{
//!     BucketAllocatorConfig, BucketizedBufferAllocator, SoftwareDevice, SoftwareQueue,
//! };
//!
//! let device = SoftwareDevice::new();
//! let queue = SoftwareQueue::new(device.clone());
//! let allocator = BucketizedBufferAllocator::new(
//!     device,
//!     queue,
//!     BucketAllocatorConfig::default(),
//! );
//!
//! let ptr = allocator.alloc(100).unwrap();
//! let region = allocator.create_buffer_region(ptr, 100).unwrap();
//! assert_eq!(region.size_in_bytes(), 100);
//! allocator.free(ptr).unwrap();
//! ```

pub mod alloc;
pub mod device;
pub mod error;
pub mod exec;
pub mod logging;

pub use alloc::{
    AllocationInfo, AllocatorRoundingMode, BucketAllocatorConfig, BucketizedBufferAllocator,
    BufferRegion, DevicePtr, PooledUploadHeap, UploadHeapConfig,
};
pub use device::{
    CommandAllocator, CommandList, CommandListType, DeviceApi, DeviceError, DeviceResult, Heap,
    HeapFlags, HeapProperties, HeapType, Resource, ResourceDesc, ResourceDimension, ResourceFlags,
    ResourceState, SoftwareDevice, TILE_SIZE_IN_BYTES,
};
pub use error::{DmlForgeError, ForgeResult};
pub use exec::{ExecutionContext, Fence, GpuEvent, SoftwareQueue};

#[cfg(test)]
mod library_tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn full_stack_constructs_over_the_software_backend() {
        let device = SoftwareDevice::new();
        let queue = SoftwareQueue::new(device.clone());
        let allocator = BucketizedBufferAllocator::new(
            device.clone(),
            queue.clone(),
            BucketAllocatorConfig::default(),
        );
        let upload_heap = PooledUploadHeap::new(device, queue);

        assert_eq!(allocator.outstanding_allocation_count(), 0);
        assert_eq!(upload_heap.total_capacity(), 0);
        let _: Arc<dyn DeviceApi> = SoftwareDevice::new();
    }
}
