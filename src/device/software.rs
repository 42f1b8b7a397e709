//! Software reference device
//!
//! A complete [`DeviceApi`] implementation over host memory. Every resource
//! is backed by a dedicated host allocation; heap placement and tile mappings
//! are validated bookkeeping. An optional byte budget makes out-of-memory
//! paths testable, and creation counters let tests assert which backing
//! strategy an allocator chose.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::api::{
    CommandListType, DeviceApi, HeapFlags, HeapProperties, HeapTileRange, ResourceDesc,
    ResourceState, TileRegion, TILE_SIZE_IN_BYTES,
};
use crate::device::command::{CommandAllocator, CommandList};
use crate::device::error::{DeviceError, DeviceResult};
use crate::device::resource::{BackendPayload, Heap, Resource};

/// Host-memory backing attached to every software resource.
///
/// The boxed slice never reallocates, so the data pointer handed out by
/// `map` stays valid for the lifetime of the store.
pub(crate) struct SoftwareStore {
    bytes: Mutex<Box<[u8]>>,
}

impl SoftwareStore {
    fn new(size_in_bytes: u64) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; size_in_bytes as usize].into_boxed_slice()),
        }
    }

    pub(crate) fn read(&self, offset: u64, len: usize) -> DeviceResult<Vec<u8>> {
        let bytes = self.bytes.lock()?;
        let start = offset as usize;
        let end = start.checked_add(len).ok_or_else(|| {
            DeviceError::InvalidArgument(format!("read range overflow: offset={} len={}", offset, len))
        })?;
        if end > bytes.len() {
            return Err(DeviceError::InvalidArgument(format!(
                "read out of bounds: offset={} len={} size={}",
                offset,
                len,
                bytes.len()
            )));
        }
        Ok(bytes[start..end].to_vec())
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut bytes = self.bytes.lock()?;
        let start = offset as usize;
        let end = start.checked_add(data.len()).ok_or_else(|| {
            DeviceError::InvalidArgument(format!(
                "write range overflow: offset={} len={}",
                offset,
                data.len()
            ))
        })?;
        if end > bytes.len() {
            return Err(DeviceError::InvalidArgument(format!(
                "write out of bounds: offset={} len={} size={}",
                offset,
                data.len(),
                bytes.len()
            )));
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn data_ptr(&self) -> DeviceResult<*mut u8> {
        let bytes = self.bytes.lock()?;
        Ok(bytes.as_ptr() as *mut u8)
    }
}

/// Creation counters, readable by tests.
#[derive(Clone, Debug, Default)]
pub struct SoftwareDeviceStats {
    pub heaps_created: u64,
    pub placed_resources_created: u64,
    pub committed_resources_created: u64,
    pub reserved_resources_created: u64,
    pub tile_mapping_calls: u64,
    pub maps: u64,
    pub unmaps: u64,
}

struct SoftwareDeviceState {
    next_object_id: u64,
    bytes_allocated: u64,
    stats: SoftwareDeviceStats,
    // resource id -> tiles bound so far, for mapping validation
    tiles_mapped: HashMap<u64, u32>,
}

/// The software device.
pub struct SoftwareDevice {
    state: Mutex<SoftwareDeviceState>,
    budget_in_bytes: Option<u64>,
    tiled_support: bool,
}

impl SoftwareDevice {
    pub fn new() -> Arc<Self> {
        Self::build(None, true)
    }

    /// Device that refuses heap/committed-resource creation beyond `budget`.
    pub fn with_budget(budget_in_bytes: u64) -> Arc<Self> {
        Self::build(Some(budget_in_bytes), true)
    }

    /// Device reporting no tiled-resource support, to exercise the untiled
    /// backing path.
    pub fn without_tiled_resources() -> Arc<Self> {
        Self::build(None, false)
    }

    fn build(budget_in_bytes: Option<u64>, tiled_support: bool) -> Arc<Self> {
        tracing::debug!(
            ?budget_in_bytes,
            tiled_support,
            "SoftwareDevice: creating device"
        );
        Arc::new(Self {
            state: Mutex::new(SoftwareDeviceState {
                next_object_id: 0,
                bytes_allocated: 0,
                stats: SoftwareDeviceStats::default(),
                tiles_mapped: HashMap::new(),
            }),
            budget_in_bytes,
            tiled_support,
        })
    }

    pub fn stats(&self) -> SoftwareDeviceStats {
        self.state
            .lock()
            .map(|state| state.stats.clone())
            .unwrap_or_default()
    }

    /// Bytes currently charged against the budget.
    pub fn bytes_allocated(&self) -> u64 {
        self.state
            .lock()
            .map(|state| state.bytes_allocated)
            .unwrap_or(0)
    }

    /// Read bytes out of a software-backed resource. Test helper.
    pub fn read_resource_bytes(
        &self,
        resource: &Resource,
        offset: u64,
        len: usize,
    ) -> DeviceResult<Vec<u8>> {
        Self::store_of(resource)?.read(offset, len)
    }

    pub(crate) fn store_of(resource: &Resource) -> DeviceResult<Arc<SoftwareStore>> {
        let payload: &BackendPayload = resource.payload().ok_or_else(|| {
            DeviceError::InvalidArgument(format!(
                "resource {} has no software backing",
                resource.id()
            ))
        })?;
        payload
            .clone()
            .downcast::<SoftwareStore>()
            .map_err(|_| {
                DeviceError::InvalidArgument(format!(
                    "resource {} is not software-backed",
                    resource.id()
                ))
            })
    }

    fn charge(&self, state: &mut SoftwareDeviceState, size_in_bytes: u64) -> DeviceResult<()> {
        if let Some(budget) = self.budget_in_bytes {
            let requested = state.bytes_allocated.saturating_add(size_in_bytes);
            if requested > budget {
                return Err(DeviceError::OutOfMemory(format!(
                    "allocation of {} bytes exceeds budget ({} of {} in use)",
                    size_in_bytes, state.bytes_allocated, budget
                )));
            }
        }
        state.bytes_allocated += size_in_bytes;
        Ok(())
    }

    fn next_id(state: &mut SoftwareDeviceState) -> u64 {
        state.next_object_id += 1;
        state.next_object_id
    }

    fn validate_buffer_desc(desc: &ResourceDesc) -> DeviceResult<()> {
        if desc.size_in_bytes == 0 {
            return Err(DeviceError::InvalidArgument(
                "resource size cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl DeviceApi for SoftwareDevice {
    fn create_heap(
        &self,
        properties: &HeapProperties,
        flags: HeapFlags,
        size_in_bytes: u64,
    ) -> DeviceResult<Heap> {
        if size_in_bytes == 0 {
            return Err(DeviceError::InvalidArgument(
                "heap size cannot be zero".to_string(),
            ));
        }
        let mut state = self.state.lock()?;
        self.charge(&mut state, size_in_bytes)?;
        state.stats.heaps_created += 1;
        let id = Self::next_id(&mut state);
        tracing::trace!(id, size_in_bytes, "SoftwareDevice: heap created");
        Ok(Heap::new(id, size_in_bytes, *properties, flags, None))
    }

    fn create_placed_resource(
        &self,
        heap: &Heap,
        heap_offset_in_bytes: u64,
        desc: &ResourceDesc,
        _initial_state: ResourceState,
    ) -> DeviceResult<Resource> {
        Self::validate_buffer_desc(desc)?;
        let end = heap_offset_in_bytes
            .checked_add(desc.size_in_bytes)
            .ok_or_else(|| {
                DeviceError::ResourceCreationFailed("placed range overflow".to_string())
            })?;
        if end > heap.size_in_bytes() {
            return Err(DeviceError::ResourceCreationFailed(format!(
                "placed resource does not fit heap: offset={} size={} heap={}",
                heap_offset_in_bytes,
                desc.size_in_bytes,
                heap.size_in_bytes()
            )));
        }
        let mut state = self.state.lock()?;
        state.stats.placed_resources_created += 1;
        let id = Self::next_id(&mut state);
        tracing::trace!(
            id,
            heap_id = heap.id(),
            size_in_bytes = desc.size_in_bytes,
            "SoftwareDevice: placed resource created"
        );
        let store: BackendPayload = Arc::new(SoftwareStore::new(desc.size_in_bytes));
        Ok(Resource::new(id, *desc, Some(store)))
    }

    fn create_committed_resource(
        &self,
        _properties: &HeapProperties,
        _flags: HeapFlags,
        desc: &ResourceDesc,
        _initial_state: ResourceState,
    ) -> DeviceResult<Resource> {
        Self::validate_buffer_desc(desc)?;
        let mut state = self.state.lock()?;
        self.charge(&mut state, desc.size_in_bytes)?;
        state.stats.committed_resources_created += 1;
        let id = Self::next_id(&mut state);
        tracing::trace!(
            id,
            size_in_bytes = desc.size_in_bytes,
            "SoftwareDevice: committed resource created"
        );
        let store: BackendPayload = Arc::new(SoftwareStore::new(desc.size_in_bytes));
        Ok(Resource::new(id, *desc, Some(store)))
    }

    fn create_reserved_resource(
        &self,
        desc: &ResourceDesc,
        _initial_state: ResourceState,
    ) -> DeviceResult<Resource> {
        if !self.tiled_support {
            return Err(DeviceError::ResourceCreationFailed(
                "device does not support reserved resources".to_string(),
            ));
        }
        Self::validate_buffer_desc(desc)?;
        if desc.size_in_bytes % TILE_SIZE_IN_BYTES != 0 {
            return Err(DeviceError::ResourceCreationFailed(format!(
                "reserved resource size {} is not tile-aligned",
                desc.size_in_bytes
            )));
        }
        let mut state = self.state.lock()?;
        state.stats.reserved_resources_created += 1;
        let id = Self::next_id(&mut state);
        state.tiles_mapped.insert(id, 0);
        tracing::trace!(
            id,
            size_in_bytes = desc.size_in_bytes,
            "SoftwareDevice: reserved resource created"
        );
        // Virtual extent is backed eagerly so copies work; budget models
        // device memory, which the backing heaps are charged for.
        let store: BackendPayload = Arc::new(SoftwareStore::new(desc.size_in_bytes));
        Ok(Resource::new(id, *desc, Some(store)))
    }

    fn update_tile_mappings(
        &self,
        resource: &Resource,
        tile_regions: &[TileRegion],
        heap_ranges: &[HeapTileRange],
    ) -> DeviceResult<()> {
        if tile_regions.len() != heap_ranges.len() {
            return Err(DeviceError::TileMappingFailed(format!(
                "mismatched ranges: {} tile regions vs {} heap ranges",
                tile_regions.len(),
                heap_ranges.len()
            )));
        }
        let resource_tiles = resource.size_in_bytes() / TILE_SIZE_IN_BYTES;
        let mut bound = 0u32;
        for (region, range) in tile_regions.iter().zip(heap_ranges) {
            if region.tile_count != range.tile_count {
                return Err(DeviceError::TileMappingFailed(format!(
                    "tile count mismatch: region={} heap range={}",
                    region.tile_count, range.tile_count
                )));
            }
            let region_end = u64::from(region.start_tile) + u64::from(region.tile_count);
            if region_end > resource_tiles {
                return Err(DeviceError::TileMappingFailed(format!(
                    "tile region [{}, {}) exceeds resource extent of {} tiles",
                    region.start_tile, region_end, resource_tiles
                )));
            }
            let heap_tiles = range.heap.size_in_bytes() / TILE_SIZE_IN_BYTES;
            let heap_end = u64::from(range.start_tile) + u64::from(range.tile_count);
            if heap_end > heap_tiles {
                return Err(DeviceError::TileMappingFailed(format!(
                    "heap range [{}, {}) exceeds heap extent of {} tiles",
                    range.start_tile, heap_end, heap_tiles
                )));
            }
            bound += region.tile_count;
        }

        let mut state = self.state.lock()?;
        state.stats.tile_mapping_calls += 1;
        let entry = state.tiles_mapped.entry(resource.id()).or_insert(0);
        *entry += bound;
        tracing::trace!(
            resource_id = resource.id(),
            tiles_bound = *entry,
            "SoftwareDevice: tile mappings updated"
        );
        Ok(())
    }

    fn create_command_allocator(
        &self,
        list_type: CommandListType,
    ) -> DeviceResult<CommandAllocator> {
        let mut state = self.state.lock()?;
        let id = Self::next_id(&mut state);
        Ok(CommandAllocator::new(id, list_type))
    }

    fn create_command_list(
        &self,
        list_type: CommandListType,
        allocator: &CommandAllocator,
    ) -> DeviceResult<CommandList> {
        if allocator.list_type() != list_type {
            return Err(DeviceError::CommandListError(format!(
                "allocator type {:?} does not match list type {:?}",
                allocator.list_type(),
                list_type
            )));
        }
        let mut state = self.state.lock()?;
        let id = Self::next_id(&mut state);
        Ok(CommandList::new(id, list_type))
    }

    fn map(&self, resource: &Resource) -> DeviceResult<*mut u8> {
        let store = Self::store_of(resource)
            .map_err(|err| DeviceError::MapFailed(err.to_string()))?;
        let ptr = store.data_ptr().map_err(|err| DeviceError::MapFailed(err.to_string()))?;
        let mut state = self.state.lock()?;
        state.stats.maps += 1;
        Ok(ptr)
    }

    fn unmap(&self, resource: &Resource) {
        if let Ok(mut state) = self.state.lock() {
            state.stats.unmaps += 1;
        }
        tracing::trace!(resource_id = resource.id(), "SoftwareDevice: unmap");
    }

    fn tiled_resources_supported(&self) -> bool {
        self.tiled_support
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced_for_heaps_and_committed_resources() {
        let device = SoftwareDevice::with_budget(128 * 1024);
        let props = HeapProperties::device_local();

        device
            .create_heap(&props, HeapFlags::ALLOW_ONLY_BUFFERS, 64 * 1024)
            .expect("first heap fits the budget");
        device
            .create_committed_resource(
                &HeapProperties::upload(),
                HeapFlags::empty(),
                &ResourceDesc::buffer(64 * 1024),
                ResourceState::GENERIC_READ,
            )
            .expect("committed resource fits the budget");

        let refused = device.create_heap(&props, HeapFlags::ALLOW_ONLY_BUFFERS, 1);
        assert!(matches!(refused, Err(DeviceError::OutOfMemory(_))));
    }

    #[test]
    fn placed_resource_must_fit_its_heap() {
        let device = SoftwareDevice::new();
        let heap = device
            .create_heap(&HeapProperties::device_local(), HeapFlags::empty(), 4096)
            .unwrap();
        let refused = device.create_placed_resource(
            &heap,
            1024,
            &ResourceDesc::buffer(4096),
            ResourceState::UNORDERED_ACCESS,
        );
        assert!(matches!(refused, Err(DeviceError::ResourceCreationFailed(_))));
    }

    #[test]
    fn map_write_read_round_trip() {
        let device = SoftwareDevice::new();
        let resource = device
            .create_committed_resource(
                &HeapProperties::upload(),
                HeapFlags::empty(),
                &ResourceDesc::buffer(64),
                ResourceState::GENERIC_READ,
            )
            .unwrap();

        let ptr = device.map(&resource).unwrap();
        // SAFETY: the resource is 64 bytes and the store outlives the map.
        unsafe {
            std::ptr::copy_nonoverlapping([7u8; 16].as_ptr(), ptr.add(8), 16);
        }
        device.unmap(&resource);

        assert_eq!(device.read_resource_bytes(&resource, 8, 16).unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn tile_mapping_validation() {
        let device = SoftwareDevice::new();
        let heap = device
            .create_heap(
                &HeapProperties::device_local(),
                HeapFlags::ALLOW_ONLY_BUFFERS,
                4 * TILE_SIZE_IN_BYTES,
            )
            .unwrap();
        let resource = device
            .create_reserved_resource(
                &ResourceDesc::buffer(4 * TILE_SIZE_IN_BYTES),
                ResourceState::UNORDERED_ACCESS,
            )
            .unwrap();

        device
            .update_tile_mappings(
                &resource,
                &[TileRegion { start_tile: 0, tile_count: 4 }],
                &[HeapTileRange { heap: heap.clone(), start_tile: 0, tile_count: 4 }],
            )
            .expect("identity mapping is valid");

        let refused = device.update_tile_mappings(
            &resource,
            &[TileRegion { start_tile: 2, tile_count: 4 }],
            &[HeapTileRange { heap, start_tile: 0, tile_count: 4 }],
        );
        assert!(matches!(refused, Err(DeviceError::TileMappingFailed(_))));
    }

    #[test]
    fn reserved_resources_refused_without_tiled_support() {
        let device = SoftwareDevice::without_tiled_resources();
        assert!(!device.tiled_resources_supported());
        let refused = device.create_reserved_resource(
            &ResourceDesc::buffer(TILE_SIZE_IN_BYTES),
            ResourceState::UNORDERED_ACCESS,
        );
        assert!(refused.is_err());
    }
}
