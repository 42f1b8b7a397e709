//! Bucketized buffer allocator
//!
//! An allocator that makes logically contiguous allocations backed by device
//! heaps. Requests are rounded up to power-of-two buckets with a 64 KiB
//! floor, and each bucket keeps a free list of idle resources of exactly that
//! size, so steady-state allocation never touches the device.
//!
//! Heaps must fit entirely in local or non-local memory, and large heaps are
//! the ones that get demoted under memory pressure. On devices with tiled
//! resource support, large allocations are therefore backed by however many
//! small heaps are necessary to cover the requested size, exposed as a single
//! reserved resource with static tile mappings. Without tiled support each
//! allocation falls back to a single dedicated heap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::alloc::pointer::DevicePtr;
use crate::alloc::region::BufferRegion;
use crate::device::{
    DeviceApi, DeviceResult, Heap, HeapFlags, HeapProperties, HeapTileRange, Resource,
    ResourceDesc, ResourceFlags, ResourceState, TileRegion, TILE_SIZE_IN_BYTES,
};
use crate::error::{DmlForgeError, ForgeResult};
use crate::exec::ExecutionContext;

/// Bucket sizes start at 2^16 = 64 KiB.
const MIN_RESOURCE_SIZE_EXPONENT: u32 = 16;

/// Minimum allocation granularity in exact-size mode.
const EXACT_SIZE_ALIGNMENT: u64 = 4;

/// Maximum size of a heap (in tiles) when allocations are tiled. A default
/// of 512 tiles (32 MiB) handles local-memory fragmentation without
/// requiring lots of heaps.
pub const DEFAULT_MAX_HEAP_SIZE_IN_TILES: u32 = 512;

/// Whether requests are rounded up to the bucket size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocatorRoundingMode {
    /// Round up to the bucket size and reuse resources through free lists.
    #[default]
    Enabled,
    /// Hand out an exact-sized dedicated resource, bypassing the buckets.
    /// Forgoes reuse; intended for large or rare allocations.
    Disabled,
}

/// Bucket allocator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BucketAllocatorConfig {
    pub heap_properties: HeapProperties,
    pub heap_flags: HeapFlags,
    pub resource_flags: ResourceFlags,
    pub initial_state: ResourceState,
    /// Allows disabling tiling even when the device supports it.
    pub tiling_enabled: bool,
    pub max_heap_size_in_tiles: u32,
}

impl Default for BucketAllocatorConfig {
    fn default() -> Self {
        Self {
            heap_properties: HeapProperties::device_local(),
            heap_flags: HeapFlags::ALLOW_ONLY_BUFFERS,
            resource_flags: ResourceFlags::ALLOW_UNORDERED_ACCESS,
            initial_state: ResourceState::UNORDERED_ACCESS,
            tiling_enabled: true,
            max_heap_size_in_tiles: DEFAULT_MAX_HEAP_SIZE_IN_TILES,
        }
    }
}

impl BucketAllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heap_properties(mut self, heap_properties: HeapProperties) -> Self {
        self.heap_properties = heap_properties;
        self
    }

    pub fn with_tiling_enabled(mut self, tiling_enabled: bool) -> Self {
        self.tiling_enabled = tiling_enabled;
        self
    }

    pub fn with_max_heap_size_in_tiles(mut self, max_heap_size_in_tiles: u32) -> Self {
        self.max_heap_size_in_tiles = max_heap_size_in_tiles;
        self
    }
}

/// A backing: the resource plus the heaps that keep it resident. Untiled
/// placed backings own one heap, committed backings none, tiled backings as
/// many heaps as cover the resource.
#[derive(Clone, Debug)]
struct HeapAllocation {
    heaps: Vec<Heap>,
    resource: Resource,
    resource_id: u64,
}

/// Per-live-allocation record. Cheap to clone; handles are `Arc`-shared.
#[derive(Clone, Debug)]
pub struct AllocationInfo {
    allocation_id: u32,
    device_ptr: DevicePtr,
    bucket_index: Option<usize>,
    backing: HeapAllocation,
    requested_size_in_bytes: u64,
    rounding_mode: AllocatorRoundingMode,
}

impl AllocationInfo {
    pub fn allocation_id(&self) -> u32 {
        self.allocation_id
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.device_ptr
    }

    /// Bucket this allocation reuses through, `None` in exact-size mode.
    pub fn bucket_index(&self) -> Option<usize> {
        self.bucket_index
    }

    pub fn resource(&self) -> &Resource {
        &self.backing.resource
    }

    /// Monotonic id of the backing resource. Never reused across the
    /// allocator's lifetime, which makes free-list reuse observable.
    pub fn resource_id(&self) -> u64 {
        self.backing.resource_id
    }

    pub fn requested_size_in_bytes(&self) -> u64 {
        self.requested_size_in_bytes
    }

    pub fn rounding_mode(&self) -> AllocatorRoundingMode {
        self.rounding_mode
    }
}

#[derive(Default)]
struct Bucket {
    resources: Vec<HeapAllocation>,
}

struct AllocatorState {
    pool: Vec<Bucket>,
    allocations_by_id: HashMap<u32, AllocationInfo>,
    // Largest allocation id issued so far. Ids start at 1 so a valid
    // allocation can never have pointer value 0.
    current_allocation_id: u32,
    // Freed ids for reuse; the bump counter only advances when this is empty.
    free_allocation_ids: Vec<u32>,
    current_resource_id: u64,
    default_rounding_mode: AllocatorRoundingMode,
}

impl AllocatorState {
    /// Reserve an allocation id: freed ids first, then the bump counter.
    /// Returns the id and whether it was freshly minted.
    fn try_reserve_allocation_id(&mut self) -> Option<(u32, bool)> {
        if let Some(id) = self.free_allocation_ids.pop() {
            return Some((id, false));
        }
        if self.current_allocation_id >= DevicePtr::MAX_ALLOCATION_ID {
            return None;
        }
        self.current_allocation_id += 1;
        Some((self.current_allocation_id, true))
    }

    fn release_allocation_id(&mut self, id: u32) {
        self.free_allocation_ids.push(id);
    }

    /// Undo a reservation when the allocation it was for never materialized,
    /// restoring the exact pre-reservation state.
    fn rollback_allocation_id(&mut self, id: u32, minted: bool) {
        if minted {
            debug_assert_eq!(id, self.current_allocation_id);
            self.current_allocation_id -= 1;
        } else {
            self.free_allocation_ids.push(id);
        }
    }

    fn next_resource_id(&mut self) -> u64 {
        self.current_resource_id += 1;
        self.current_resource_id
    }
}

/// The bucketized buffer allocator. All public operations are serialized by
/// an internal mutex; the allocator is safe to share across threads.
pub struct BucketizedBufferAllocator {
    device: Arc<dyn DeviceApi>,
    context: Arc<dyn ExecutionContext>,
    heap_properties: HeapProperties,
    heap_flags: HeapFlags,
    resource_flags: ResourceFlags,
    initial_state: ResourceState,
    tiling_enabled: bool,
    max_heap_size_in_tiles: u32,
    state: Mutex<AllocatorState>,
}

impl BucketizedBufferAllocator {
    pub fn new(
        device: Arc<dyn DeviceApi>,
        context: Arc<dyn ExecutionContext>,
        config: BucketAllocatorConfig,
    ) -> Self {
        // Queried once and cached; never re-queried per allocation.
        let tiling_enabled = config.tiling_enabled && device.tiled_resources_supported();
        tracing::debug!(
            tiling_enabled,
            max_heap_size_in_tiles = config.max_heap_size_in_tiles,
            "BucketizedBufferAllocator: created"
        );
        Self {
            device,
            context,
            heap_properties: config.heap_properties,
            heap_flags: config.heap_flags,
            resource_flags: config.resource_flags,
            initial_state: config.initial_state,
            tiling_enabled,
            max_heap_size_in_tiles: config.max_heap_size_in_tiles.max(1),
            state: Mutex::new(AllocatorState {
                pool: Vec::new(),
                allocations_by_id: HashMap::new(),
                current_allocation_id: 0,
                free_allocation_ids: Vec::new(),
                current_resource_id: 0,
                default_rounding_mode: AllocatorRoundingMode::Enabled,
            }),
        }
    }

    pub fn tiling_enabled(&self) -> bool {
        self.tiling_enabled
    }

    /// Bucket size a request rounds up to: 64 KiB for anything at or below
    /// the floor, the next power of two otherwise.
    pub fn compute_required_size(size_in_bytes: u64) -> u64 {
        let floor = 1u64 << MIN_RESOURCE_SIZE_EXPONENT;
        if size_in_bytes <= floor {
            floor
        } else {
            size_in_bytes.next_power_of_two()
        }
    }

    fn bucket_index_from_size(size_in_bytes: u64) -> usize {
        let required = Self::compute_required_size(size_in_bytes);
        (required.trailing_zeros() - MIN_RESOURCE_SIZE_EXPONENT) as usize
    }

    fn bucket_size_from_index(index: usize) -> u64 {
        1u64 << (MIN_RESOURCE_SIZE_EXPONENT as usize + index)
    }

    /// Switch the rounding behavior for subsequent allocations. Live
    /// allocations keep the mode they were made with.
    pub fn set_default_rounding_mode(&self, mode: AllocatorRoundingMode) {
        if let Ok(mut state) = self.state.lock() {
            state.default_rounding_mode = mode;
        }
    }

    /// Allocate `size_in_bytes` and return an opaque device pointer.
    pub fn alloc(&self, size_in_bytes: u64) -> ForgeResult<DevicePtr> {
        if size_in_bytes == 0 {
            return Err(DmlForgeError::InvalidArgument(
                "allocation size cannot be zero".to_string(),
            ));
        }

        let mut state = self.state.lock()?;
        let rounding_mode = state.default_rounding_mode;

        let (allocation_id, minted) = state
            .try_reserve_allocation_id()
            .ok_or(DmlForgeError::AllocationIdsExhausted)?;

        let outcome = self.acquire_backing(&mut state, size_in_bytes, rounding_mode);
        let (bucket_index, backing) = match outcome {
            Ok(pair) => pair,
            Err(err) => {
                state.rollback_allocation_id(allocation_id, minted);
                return Err(err.into());
            }
        };

        let device_ptr = DevicePtr::pack(allocation_id, 0);
        let info = AllocationInfo {
            allocation_id,
            device_ptr,
            bucket_index,
            backing,
            requested_size_in_bytes: size_in_bytes,
            rounding_mode,
        };
        tracing::trace!(
            allocation_id,
            size_in_bytes,
            ?bucket_index,
            resource_id = info.backing.resource_id,
            "BucketizedBufferAllocator: allocated"
        );
        state.allocations_by_id.insert(allocation_id, info);

        Ok(device_ptr)
    }

    fn acquire_backing(
        &self,
        state: &mut AllocatorState,
        size_in_bytes: u64,
        rounding_mode: AllocatorRoundingMode,
    ) -> DeviceResult<(Option<usize>, HeapAllocation)> {
        match rounding_mode {
            AllocatorRoundingMode::Enabled => {
                let bucket_index = Self::bucket_index_from_size(size_in_bytes);
                if state.pool.len() <= bucket_index {
                    state.pool.resize_with(bucket_index + 1, Bucket::default);
                }
                if let Some(backing) = state.pool[bucket_index].resources.pop() {
                    tracing::trace!(
                        bucket_index,
                        resource_id = backing.resource_id,
                        "BucketizedBufferAllocator: reusing pooled resource"
                    );
                    return Ok((Some(bucket_index), backing));
                }
                let bucket_size = Self::bucket_size_from_index(bucket_index);
                let backing = self.create_backing(state, bucket_size)?;
                Ok((Some(bucket_index), backing))
            }
            AllocatorRoundingMode::Disabled => {
                let exact = align_up(size_in_bytes, EXACT_SIZE_ALIGNMENT);
                let backing = self.create_backing(state, exact)?;
                Ok((None, backing))
            }
        }
    }

    fn create_backing(
        &self,
        state: &mut AllocatorState,
        size_in_bytes: u64,
    ) -> DeviceResult<HeapAllocation> {
        let (heaps, resource) = if self.tiling_enabled {
            self.try_create_tiled_allocation(size_in_bytes)?
        } else {
            self.try_create_untiled_allocation(size_in_bytes)?
        };
        Ok(HeapAllocation {
            heaps,
            resource,
            resource_id: state.next_resource_id(),
        })
    }

    /// Back `size_in_bytes` with however many small heaps are necessary,
    /// exposed as one reserved resource. The identity tile mapping is
    /// established here, once; it is never updated on reuse.
    fn try_create_tiled_allocation(
        &self,
        size_in_bytes: u64,
    ) -> DeviceResult<(Vec<Heap>, Resource)> {
        let tile_count = size_in_bytes.div_ceil(TILE_SIZE_IN_BYTES);
        let resource_size = tile_count * TILE_SIZE_IN_BYTES;

        // On failure the heaps collected so far drop here and nothing of the
        // attempt is visible to the allocator.
        let mut heaps = Vec::new();
        let mut tiles_remaining = tile_count;
        while tiles_remaining > 0 {
            let tiles_in_heap = tiles_remaining.min(u64::from(self.max_heap_size_in_tiles));
            let heap = self.device.create_heap(
                &self.heap_properties,
                self.heap_flags,
                tiles_in_heap * TILE_SIZE_IN_BYTES,
            )?;
            heaps.push(heap);
            tiles_remaining -= tiles_in_heap;
        }

        let desc = ResourceDesc::buffer_with_flags(resource_size, self.resource_flags);
        let resource = self
            .device
            .create_reserved_resource(&desc, self.initial_state)?;

        let mut start_tile = 0u32;
        for heap in &heaps {
            let tiles_in_heap = (heap.size_in_bytes() / TILE_SIZE_IN_BYTES) as u32;
            self.device.update_tile_mappings(
                &resource,
                &[TileRegion {
                    start_tile,
                    tile_count: tiles_in_heap,
                }],
                &[HeapTileRange {
                    heap: heap.clone(),
                    start_tile: 0,
                    tile_count: tiles_in_heap,
                }],
            )?;
            start_tile += tiles_in_heap;
        }

        tracing::debug!(
            size_in_bytes,
            tile_count,
            heap_count = heaps.len(),
            "BucketizedBufferAllocator: tiled backing created"
        );
        Ok((heaps, resource))
    }

    /// One heap per allocation: a placed resource spanning a dedicated heap,
    /// or a committed resource when the heap properties are CPU-visible.
    fn try_create_untiled_allocation(
        &self,
        size_in_bytes: u64,
    ) -> DeviceResult<(Vec<Heap>, Resource)> {
        let desc = ResourceDesc::buffer_with_flags(size_in_bytes, self.resource_flags);
        if self.heap_properties.is_cpu_visible() {
            let resource = self.device.create_committed_resource(
                &self.heap_properties,
                self.heap_flags,
                &desc,
                self.initial_state,
            )?;
            tracing::debug!(size_in_bytes, "BucketizedBufferAllocator: committed backing created");
            Ok((Vec::new(), resource))
        } else {
            let heap =
                self.device
                    .create_heap(&self.heap_properties, self.heap_flags, size_in_bytes)?;
            let resource =
                self.device
                    .create_placed_resource(&heap, 0, &desc, self.initial_state)?;
            tracing::debug!(size_in_bytes, "BucketizedBufferAllocator: placed backing created");
            Ok((vec![heap], resource))
        }
    }

    /// Release an allocation. Pooled backings return to their bucket's free
    /// list with no device calls; exact-size backings are queued on the
    /// execution context for release once in-flight GPU work retires.
    pub fn free(&self, ptr: DevicePtr) -> ForgeResult<()> {
        if ptr.is_null() {
            return Err(DmlForgeError::InvalidArgument(
                "cannot free a null device pointer".to_string(),
            ));
        }
        if ptr.offset_in_bytes() != 0 {
            return Err(DmlForgeError::InvalidArgument(format!(
                "cannot free an interior pointer (offset {})",
                ptr.offset_in_bytes()
            )));
        }

        let mut state = self.state.lock()?;
        let info = state
            .allocations_by_id
            .remove(&ptr.allocation_id())
            .ok_or_else(|| {
                DmlForgeError::InvalidArgument(format!(
                    "free of unknown allocation id {}",
                    ptr.allocation_id()
                ))
            })?;

        match info.bucket_index {
            Some(bucket_index) => {
                debug_assert_eq!(
                    info.backing.resource.size_in_bytes(),
                    Self::bucket_size_from_index(bucket_index)
                );
                state.pool[bucket_index].resources.push(info.backing);
            }
            None => {
                // The resource may still be referenced by in-flight work.
                self.context.queue_reference(Arc::new(info.backing));
            }
        }
        state.release_allocation_id(info.allocation_id);
        tracing::trace!(
            allocation_id = info.allocation_id,
            "BucketizedBufferAllocator: freed"
        );
        Ok(())
    }

    /// Logical view over (part of) an allocation's backing. The physical
    /// resource may be larger than `size_in_bytes`; callers must use the
    /// returned offset and size or risk out-of-bounds access.
    pub fn create_buffer_region(
        &self,
        ptr: DevicePtr,
        size_in_bytes: u64,
    ) -> ForgeResult<BufferRegion> {
        if ptr.is_null() {
            return Err(DmlForgeError::InvalidArgument(
                "cannot create a region from a null device pointer".to_string(),
            ));
        }
        if size_in_bytes == 0 {
            return Err(DmlForgeError::InvalidArgument(
                "buffer region size cannot be zero".to_string(),
            ));
        }

        let state = self.state.lock()?;
        let info = state
            .allocations_by_id
            .get(&ptr.allocation_id())
            .ok_or_else(|| {
                DmlForgeError::InvalidArgument(format!(
                    "unknown allocation id {}",
                    ptr.allocation_id()
                ))
            })?;

        let offset = ptr.offset_in_bytes();
        let backing_size = info.backing.resource.size_in_bytes();
        if offset.checked_add(size_in_bytes).map_or(true, |end| end > backing_size) {
            return Err(DmlForgeError::InvalidArgument(format!(
                "region [{}, {}+{}) exceeds backing of {} bytes",
                offset, offset, size_in_bytes, backing_size
            )));
        }

        Ok(BufferRegion::new(
            info.backing.resource.clone(),
            offset,
            size_in_bytes,
        ))
    }

    /// Look up the allocation record behind a pointer.
    pub fn get_allocation_info(&self, ptr: DevicePtr) -> ForgeResult<AllocationInfo> {
        if ptr.is_null() {
            return Err(DmlForgeError::InvalidArgument(
                "null device pointer".to_string(),
            ));
        }
        let state = self.state.lock()?;
        state
            .allocations_by_id
            .get(&ptr.allocation_id())
            .cloned()
            .ok_or_else(|| {
                DmlForgeError::InvalidArgument(format!(
                    "unknown allocation id {}",
                    ptr.allocation_id()
                ))
            })
    }

    /// Number of live allocations.
    pub fn outstanding_allocation_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.allocations_by_id.len())
            .unwrap_or(0)
    }
}

impl Drop for BucketizedBufferAllocator {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            if let Ok(state) = self.state.lock() {
                if !state.allocations_by_id.is_empty() {
                    tracing::warn!(
                        outstanding = state.allocations_by_id.len(),
                        "BucketizedBufferAllocator: dropped with live allocations"
                    );
                    for info in state.allocations_by_id.values() {
                        tracing::warn!(
                            allocation_id = info.allocation_id,
                            requested_size_in_bytes = info.requested_size_in_bytes,
                            "  outstanding allocation"
                        );
                    }
                }
            }
        }
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_size_has_a_64k_floor() {
        assert_eq!(BucketizedBufferAllocator::compute_required_size(1), 1 << 16);
        assert_eq!(BucketizedBufferAllocator::compute_required_size(100), 1 << 16);
        assert_eq!(
            BucketizedBufferAllocator::compute_required_size(1 << 16),
            1 << 16
        );
    }

    #[test]
    fn required_size_rounds_to_next_power_of_two() {
        assert_eq!(
            BucketizedBufferAllocator::compute_required_size((1 << 16) + 1),
            1 << 17
        );
        assert_eq!(
            BucketizedBufferAllocator::compute_required_size((1 << 20) - 3),
            1 << 20
        );
        assert_eq!(
            BucketizedBufferAllocator::compute_required_size(1 << 20),
            1 << 20
        );
    }

    #[test]
    fn bucket_index_math_round_trips() {
        assert_eq!(BucketizedBufferAllocator::bucket_index_from_size(100), 0);
        assert_eq!(
            BucketizedBufferAllocator::bucket_index_from_size((1 << 16) + 1),
            1
        );
        assert_eq!(BucketizedBufferAllocator::bucket_index_from_size(1 << 20), 4);

        for index in 0..8 {
            let size = BucketizedBufferAllocator::bucket_size_from_index(index);
            assert_eq!(BucketizedBufferAllocator::bucket_index_from_size(size), index);
        }
    }

    #[test]
    fn id_reservation_prefers_freed_ids() {
        let mut state = AllocatorState {
            pool: Vec::new(),
            allocations_by_id: HashMap::new(),
            current_allocation_id: 0,
            free_allocation_ids: Vec::new(),
            current_resource_id: 0,
            default_rounding_mode: AllocatorRoundingMode::Enabled,
        };

        assert_eq!(state.try_reserve_allocation_id(), Some((1, true)));
        assert_eq!(state.try_reserve_allocation_id(), Some((2, true)));
        state.release_allocation_id(1);
        assert_eq!(state.try_reserve_allocation_id(), Some((1, false)));
        assert_eq!(state.try_reserve_allocation_id(), Some((3, true)));
    }

    #[test]
    fn id_rollback_restores_the_counter() {
        let mut state = AllocatorState {
            pool: Vec::new(),
            allocations_by_id: HashMap::new(),
            current_allocation_id: 0,
            free_allocation_ids: Vec::new(),
            current_resource_id: 0,
            default_rounding_mode: AllocatorRoundingMode::Enabled,
        };

        let (id, minted) = state.try_reserve_allocation_id().unwrap();
        state.rollback_allocation_id(id, minted);
        assert_eq!(state.current_allocation_id, 0);
        assert!(state.free_allocation_ids.is_empty());
        assert_eq!(state.try_reserve_allocation_id(), Some((1, true)));
    }

    #[test]
    fn id_space_exhaustion_is_detected() {
        let mut state = AllocatorState {
            pool: Vec::new(),
            allocations_by_id: HashMap::new(),
            current_allocation_id: DevicePtr::MAX_ALLOCATION_ID,
            free_allocation_ids: Vec::new(),
            current_resource_id: 0,
            default_rounding_mode: AllocatorRoundingMode::Enabled,
        };

        assert_eq!(state.try_reserve_allocation_id(), None);
        state.release_allocation_id(77);
        assert_eq!(state.try_reserve_allocation_id(), Some((77, false)));
    }

    #[test]
    fn align_up_is_exact_on_boundaries() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(100, 4), 100);
        assert_eq!(align_up(101, 4), 104);
    }
}
