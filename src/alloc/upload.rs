//! Pooled upload heap
//!
//! Implements a pool of CPU-writable staging chunks for streaming CPU-to-GPU
//! copies. Each chunk is used as a ring buffer: allocations are placed after
//! the most recent one and reclaimed once their GPU completion event fires,
//! so the live span walks around the chunk. Repeated uploads of the same
//! shape can go through a cache of pre-recorded copy command lists, bounded
//! by an LRU.
//!
//! The heap expects a single submission thread; the `&mut self` methods
//! encode that. Concurrent producers must serialize externally.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::{
    CommandAllocator, CommandList, DeviceApi, HeapFlags, HeapProperties, Resource, ResourceDesc,
    ResourceState,
};
use crate::error::{DmlForgeError, ForgeResult};
use crate::exec::{ExecutionContext, GpuEvent};

/// Minimum size a new chunk is created with.
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// Required placement alignment for staging sub-allocations.
pub const DEFAULT_ALLOCATION_ALIGNMENT: u64 = 512;

/// Bound on the cached copy command lists.
pub const DEFAULT_MAX_REUSABLE_COMMAND_LISTS: usize = 10;

/// Upload heap configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadHeapConfig {
    pub min_chunk_size: u64,
    /// Power of two, at least 4 bytes.
    pub allocation_alignment: u64,
    pub max_reusable_command_lists: usize,
}

impl Default for UploadHeapConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            allocation_alignment: DEFAULT_ALLOCATION_ALIGNMENT,
            max_reusable_command_lists: DEFAULT_MAX_REUSABLE_COMMAND_LISTS,
        }
    }
}

impl UploadHeapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_chunk_size(mut self, min_chunk_size: u64) -> Self {
        self.min_chunk_size = min_chunk_size;
        self
    }

    pub fn with_allocation_alignment(mut self, allocation_alignment: u64) -> Self {
        self.allocation_alignment = allocation_alignment;
        self
    }

    pub fn with_max_reusable_command_lists(mut self, max: usize) -> Self {
        self.max_reusable_command_lists = max;
        self
    }

    fn validate(&self) -> ForgeResult<()> {
        if !self.allocation_alignment.is_power_of_two() || self.allocation_alignment < 4 {
            return Err(DmlForgeError::InvalidArgument(format!(
                "allocation alignment must be a power of two >= 4, got {}",
                self.allocation_alignment
            )));
        }
        if self.min_chunk_size == 0 {
            return Err(DmlForgeError::InvalidArgument(
                "minimum chunk size cannot be zero".to_string(),
            ));
        }
        if self.max_reusable_command_lists == 0 {
            return Err(DmlForgeError::InvalidArgument(
                "reusable command list bound cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A staging sub-allocation. `done_event` gates when the bytes may be
/// overwritten; `locked` inhibits reclamation while a cached command list
/// still references the byte range.
#[derive(Clone, Debug)]
struct UploadAllocation {
    size_in_bytes: u64,
    offset_in_chunk: u64,
    done_event: GpuEvent,
    locked: bool,
}

/// Insertion-ordered allocation store with stable keys. The back of the
/// order is always the most recently started allocation, which is the
/// temporal ordering the ring-buffer placement relies on. Keys stay valid
/// across unrelated insertions and removals, so cached command lists can
/// hold on to one.
#[derive(Default)]
struct AllocationList {
    entries: HashMap<u64, UploadAllocation>,
    order: VecDeque<u64>,
    next_key: u64,
}

impl AllocationList {
    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn front(&self) -> Option<&UploadAllocation> {
        self.order.front().and_then(|key| self.entries.get(key))
    }

    fn back(&self) -> Option<&UploadAllocation> {
        self.order.back().and_then(|key| self.entries.get(key))
    }

    fn push_back(&mut self, allocation: UploadAllocation) -> u64 {
        self.next_key += 1;
        let key = self.next_key;
        self.entries.insert(key, allocation);
        self.order.push_back(key);
        key
    }

    fn get(&self, key: u64) -> Option<&UploadAllocation> {
        self.entries.get(&key)
    }

    fn get_mut(&mut self, key: u64) -> Option<&mut UploadAllocation> {
        self.entries.get_mut(&key)
    }

    /// Drop allocations failing the predicate, preserving insertion order.
    fn retain(&mut self, mut keep: impl FnMut(&UploadAllocation) -> bool) {
        let mut kept = VecDeque::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            let keep_entry = self.entries.get(&key).map(&mut keep).unwrap_or(false);
            if keep_entry {
                kept.push_back(key);
            } else {
                self.entries.remove(&key);
            }
        }
        self.order = kept;
    }

    fn iter(&self) -> impl Iterator<Item = &UploadAllocation> {
        self.order.iter().filter_map(|key| self.entries.get(key))
    }

    fn locked_count(&self) -> usize {
        self.iter().filter(|a| a.locked).count()
    }
}

/// A single CPU-writable staging buffer used as a ring.
struct Chunk {
    capacity_in_bytes: u64,
    resource: Resource,
    allocations: AllocationList,
}

/// Cache key for pre-recorded copy command lists.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ReusableCopyKey {
    dst_resource_id: u64,
    dst_offset_in_bytes: u64,
    src_size_in_bytes: u64,
}

/// A cached copy command list and the staging slot it references.
struct ReusableCommandListState {
    command_allocator: CommandAllocator,
    command_list: CommandList,
    chunk_resource: Resource,
    allocation_key: u64,
}

/// The pooled upload heap.
pub struct PooledUploadHeap {
    device: Arc<dyn DeviceApi>,
    context: Arc<dyn ExecutionContext>,
    chunks: Vec<Chunk>,
    total_capacity: u64,
    min_chunk_size: u64,
    allocation_alignment: u64,
    max_reusable_command_lists: usize,
    // LRU front = next eviction candidate.
    lru_order: VecDeque<ReusableCopyKey>,
    reusable_command_lists: HashMap<ReusableCopyKey, ReusableCommandListState>,
}

impl PooledUploadHeap {
    pub fn new(device: Arc<dyn DeviceApi>, context: Arc<dyn ExecutionContext>) -> Self {
        Self::from_validated(device, context, UploadHeapConfig::default())
    }

    pub fn with_config(
        device: Arc<dyn DeviceApi>,
        context: Arc<dyn ExecutionContext>,
        config: UploadHeapConfig,
    ) -> ForgeResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(device, context, config))
    }

    fn from_validated(
        device: Arc<dyn DeviceApi>,
        context: Arc<dyn ExecutionContext>,
        config: UploadHeapConfig,
    ) -> Self {
        tracing::debug!(
            min_chunk_size = config.min_chunk_size,
            allocation_alignment = config.allocation_alignment,
            max_reusable_command_lists = config.max_reusable_command_lists,
            "PooledUploadHeap: created"
        );
        Self {
            device,
            context,
            chunks: Vec::new(),
            total_capacity: 0,
            min_chunk_size: config.min_chunk_size,
            allocation_alignment: config.allocation_alignment,
            max_reusable_command_lists: config.max_reusable_command_lists,
            lru_order: VecDeque::new(),
            reusable_command_lists: HashMap::new(),
        }
    }

    /// Copy `src` into `dst` at `dst_offset`. Returns the completion event
    /// that fires once the GPU-side copy has retired. May grow the pool by
    /// one chunk.
    pub fn begin_upload_to_gpu(
        &mut self,
        dst: &Resource,
        dst_offset_in_bytes: u64,
        dst_state: ResourceState,
        src: &[u8],
    ) -> ForgeResult<GpuEvent> {
        Self::validate_upload_args(dst, src)?;
        self.assert_invariants();

        self.reclaim_allocations();

        let size_in_bytes = src.len() as u64;
        let (chunk_index, offset_in_chunk) = self.reserve(size_in_bytes)?;
        self.write_to_chunk(chunk_index, offset_in_chunk, src)?;

        let chunk_resource = self.chunks[chunk_index].resource.clone();
        self.context.copy_buffer_region(
            dst,
            dst_offset_in_bytes,
            dst_state,
            &chunk_resource,
            offset_in_chunk,
            ResourceState::GENERIC_READ,
            size_in_bytes,
        )?;

        let done_event = self.context.current_completion_event();
        self.chunks[chunk_index].allocations.push_back(UploadAllocation {
            size_in_bytes,
            offset_in_chunk,
            done_event: done_event.clone(),
            locked: false,
        });

        tracing::trace!(
            dst_id = dst.id(),
            dst_offset_in_bytes,
            size_in_bytes,
            chunk_index,
            offset_in_chunk,
            "PooledUploadHeap: upload submitted"
        );
        self.assert_invariants();
        Ok(done_event)
    }

    /// Same semantics as [`begin_upload_to_gpu`](Self::begin_upload_to_gpu),
    /// but the barrier/copy/barrier sequence is recorded once per
    /// `(destination, offset, size)` shape and re-executed on later calls.
    pub fn begin_reusable_upload_to_gpu(
        &mut self,
        dst: &Resource,
        dst_offset_in_bytes: u64,
        dst_state: ResourceState,
        src: &[u8],
    ) -> ForgeResult<GpuEvent> {
        Self::validate_upload_args(dst, src)?;
        self.assert_invariants();

        let key = ReusableCopyKey {
            dst_resource_id: dst.id(),
            dst_offset_in_bytes,
            src_size_in_bytes: src.len() as u64,
        };
        let cached = self.reusable_command_lists.contains_key(&key);

        // Evict before reclaiming so the evictee's staging slot can be
        // unlocked and freed within this same call.
        if !cached && self.reusable_command_lists.len() == self.max_reusable_command_lists {
            self.evict_least_recently_used();
        }

        self.reclaim_allocations();

        let done_event = if cached {
            self.execute_cached_copy(&key, src)?
        } else {
            self.record_and_execute_copy(key, dst, dst_offset_in_bytes, dst_state, src)?
        };

        self.assert_invariants();
        Ok(done_event)
    }

    /// Reclaim finished allocations, drop chunks left empty, and recompute
    /// the total capacity. Chunks referenced by cached command lists hold a
    /// locked allocation and are never dropped here.
    pub fn trim(&mut self) {
        self.assert_invariants();
        self.reclaim_allocations();

        let before = self.chunks.len();
        self.chunks.retain(|chunk| !chunk.allocations.is_empty());
        if self.chunks.len() != before {
            tracing::debug!(
                dropped = before - self.chunks.len(),
                remaining = self.chunks.len(),
                "PooledUploadHeap: trimmed chunks"
            );
        }

        self.total_capacity = self.chunks.iter().map(|c| c.capacity_in_bytes).sum();
        self.assert_invariants();
    }

    pub fn total_capacity(&self) -> u64 {
        self.total_capacity
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_capacity(&self, chunk_index: usize) -> Option<u64> {
        self.chunks.get(chunk_index).map(|c| c.capacity_in_bytes)
    }

    /// Staging offsets live in a chunk, in submission order. For debugging.
    pub fn chunk_allocation_offsets(&self, chunk_index: usize) -> Option<Vec<u64>> {
        self.chunks
            .get(chunk_index)
            .map(|c| c.allocations.iter().map(|a| a.offset_in_chunk).collect())
    }

    /// Staging allocations pinned by cached command lists.
    pub fn locked_allocation_count(&self) -> usize {
        self.chunks.iter().map(|c| c.allocations.locked_count()).sum()
    }

    pub fn reusable_command_list_count(&self) -> usize {
        self.reusable_command_lists.len()
    }

    pub fn allocation_alignment(&self) -> u64 {
        self.allocation_alignment
    }

    fn validate_upload_args(dst: &Resource, src: &[u8]) -> ForgeResult<()> {
        if src.is_empty() {
            return Err(DmlForgeError::InvalidArgument(
                "upload source cannot be empty".to_string(),
            ));
        }
        if !dst.is_buffer() {
            return Err(DmlForgeError::InvalidArgument(format!(
                "upload destination must be a buffer, got {:?}",
                dst.desc().dimension
            )));
        }
        Ok(())
    }

    /// Ring-buffer placement within one chunk. The live span runs from the
    /// oldest allocation to the newest and may wrap; a new allocation goes
    /// after the most recent one, falling back to offset 0 when only the
    /// front of the chunk has room.
    fn find_offset_for_allocation(
        capacity_in_bytes: u64,
        allocations: &AllocationList,
        size_in_bytes: u64,
        alignment: u64,
    ) -> Option<u64> {
        debug_assert!(size_in_bytes != 0);

        if capacity_in_bytes < size_in_bytes {
            // This chunk isn't even big enough to accommodate the allocation
            return None;
        }

        let (first, last) = match (allocations.front(), allocations.back()) {
            (Some(first), Some(last)) => (first, last),
            // The entire chunk is empty - allocate from the beginning
            _ => return Some(0),
        };

        let last_end = last.offset_in_chunk + last.size_in_bytes;
        if last_end > u64::MAX - (alignment - 1) {
            // Aligning would overflow
            return None;
        }
        let candidate = align_up(last_end, alignment);
        let candidate_end = candidate.checked_add(size_in_bytes)?;

        if first.offset_in_chunk <= last.offset_in_chunk {
            // Free space is potentially at the beginning and end of the
            // chunk, but not the middle:
            //   |------XXXXYYYZZ------|
            //          ^^^^   ^^
            //          first  last
            if candidate_end <= capacity_in_bytes {
                return Some(candidate);
            }
            // Not enough space at the end - try the beginning instead
            if size_in_bytes <= first.offset_in_chunk {
                return Some(0);
            }
            None
        } else {
            // Free space is potentially in the middle, but not at the edges:
            //   |YYYZZ---------XXXX-|
            //       ^^         ^^^^
            //       last       first
            if candidate_end <= first.offset_in_chunk {
                Some(candidate)
            } else {
                None
            }
        }
    }

    /// Find space in an existing chunk or grow the pool by one chunk of
    /// `max(total capacity, min chunk size, requested size)`, which at least
    /// doubles the pool.
    fn reserve(&mut self, size_in_bytes: u64) -> ForgeResult<(usize, u64)> {
        for (chunk_index, chunk) in self.chunks.iter().enumerate() {
            if let Some(offset) = Self::find_offset_for_allocation(
                chunk.capacity_in_bytes,
                &chunk.allocations,
                size_in_bytes,
                self.allocation_alignment,
            ) {
                return Ok((chunk_index, offset));
            }
        }

        let new_chunk_size = self
            .total_capacity
            .max(self.min_chunk_size)
            .max(size_in_bytes);
        let chunk = self.create_chunk(new_chunk_size)?;
        self.chunks.push(chunk);
        self.total_capacity += new_chunk_size;
        tracing::debug!(
            new_chunk_size,
            total_capacity = self.total_capacity,
            chunk_count = self.chunks.len(),
            "PooledUploadHeap: pool grown"
        );
        Ok((self.chunks.len() - 1, 0))
    }

    fn create_chunk(&self, size_in_bytes: u64) -> ForgeResult<Chunk> {
        let resource = self.device.create_committed_resource(
            &HeapProperties::upload(),
            HeapFlags::empty(),
            &ResourceDesc::buffer(size_in_bytes),
            ResourceState::GENERIC_READ,
        )?;
        Ok(Chunk {
            capacity_in_bytes: size_in_bytes,
            resource,
            allocations: AllocationList::default(),
        })
    }

    /// Map the chunk, copy the source bytes at the reserved offset, unmap.
    fn write_to_chunk(&self, chunk_index: usize, offset_in_chunk: u64, src: &[u8]) -> ForgeResult<()> {
        let chunk = &self.chunks[chunk_index];
        debug_assert!(offset_in_chunk + src.len() as u64 <= chunk.capacity_in_bytes);

        let mapped = self.device.map(&chunk.resource)?;
        // SAFETY: placement guarantees [offset, offset + len) lies within
        // the mapped resource, and the mapping stays valid until unmap.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), mapped.add(offset_in_chunk as usize), src.len());
        }
        self.device.unmap(&chunk.resource);
        Ok(())
    }

    /// Remove allocations whose completion event has fired, except locked
    /// ones. Allocation lists are insertion-ordered and events monotonic, so
    /// this preserves the ring's single-span property.
    fn reclaim_allocations(&mut self) {
        for chunk in &mut self.chunks {
            chunk
                .allocations
                .retain(|allocation| allocation.locked || !allocation.done_event.is_signaled());
        }
    }

    fn chunk_index_by_resource(&self, resource_id: u64) -> Option<usize> {
        self.chunks.iter().position(|c| c.resource.id() == resource_id)
    }

    fn evict_least_recently_used(&mut self) {
        let Some(lru_key) = self.lru_order.pop_front() else {
            return;
        };
        let Some(evicted) = self.reusable_command_lists.remove(&lru_key) else {
            debug_assert!(false, "LRU order out of sync with cache");
            return;
        };

        // The GPU may still be executing the evicted list; hand both objects
        // to the context for release after the current event fires.
        self.context.queue_reference(Arc::new(evicted.command_list));
        self.context.queue_reference(Arc::new(evicted.command_allocator));

        if let Some(chunk_index) = self.chunk_index_by_resource(evicted.chunk_resource.id()) {
            if let Some(allocation) = self.chunks[chunk_index]
                .allocations
                .get_mut(evicted.allocation_key)
            {
                allocation.locked = false;
            }
        }
        tracing::trace!(?lru_key, "PooledUploadHeap: evicted cached command list");
    }

    fn record_and_execute_copy(
        &mut self,
        key: ReusableCopyKey,
        dst: &Resource,
        dst_offset_in_bytes: u64,
        dst_state: ResourceState,
        src: &[u8],
    ) -> ForgeResult<GpuEvent> {
        let size_in_bytes = src.len() as u64;
        let (chunk_index, offset_in_chunk) = self.reserve(size_in_bytes)?;

        let list_type = self.context.command_list_type();
        let command_allocator = self.device.create_command_allocator(list_type)?;
        let command_list = self.device.create_command_list(list_type, &command_allocator)?;

        self.write_to_chunk(chunk_index, offset_in_chunk, src)?;
        let chunk_resource = self.chunks[chunk_index].resource.clone();

        let needs_transition = !dst_state.contains(ResourceState::COPY_DEST);
        if needs_transition {
            command_list.resource_barrier(dst, dst_state, ResourceState::COPY_DEST)?;
        }
        command_list.copy_buffer_region(
            dst,
            dst_offset_in_bytes,
            &chunk_resource,
            offset_in_chunk,
            size_in_bytes,
        )?;
        if needs_transition {
            command_list.resource_barrier(dst, ResourceState::COPY_DEST, dst_state)?;
        }
        command_list.close()?;

        let done_event = self.context.execute_command_list(&command_list)?;

        // The recorded list references this exact staging offset, so the
        // allocation stays locked until the list is evicted.
        let allocation_key = self.chunks[chunk_index].allocations.push_back(UploadAllocation {
            size_in_bytes,
            offset_in_chunk,
            done_event: done_event.clone(),
            locked: true,
        });

        tracing::trace!(
            ?key,
            chunk_index,
            offset_in_chunk,
            "PooledUploadHeap: recorded reusable copy"
        );
        self.reusable_command_lists.insert(
            key.clone(),
            ReusableCommandListState {
                command_allocator,
                command_list,
                chunk_resource,
                allocation_key,
            },
        );
        self.lru_order.push_back(key);

        Ok(done_event)
    }

    fn execute_cached_copy(&mut self, key: &ReusableCopyKey, src: &[u8]) -> ForgeResult<GpuEvent> {
        let (command_list, chunk_resource_id, allocation_key) = {
            let state = self.reusable_command_lists.get(key).ok_or_else(|| {
                DmlForgeError::ExecutionFailure("cached command list disappeared".to_string())
            })?;
            (
                state.command_list.clone(),
                state.chunk_resource.id(),
                state.allocation_key,
            )
        };

        let chunk_index = self.chunk_index_by_resource(chunk_resource_id).ok_or_else(|| {
            DmlForgeError::ExecutionFailure(
                "staging chunk of cached command list disappeared".to_string(),
            )
        })?;
        let offset_in_chunk = self.chunks[chunk_index]
            .allocations
            .get(allocation_key)
            .map(|a| a.offset_in_chunk)
            .ok_or_else(|| {
                DmlForgeError::ExecutionFailure(
                    "staging allocation of cached command list disappeared".to_string(),
                )
            })?;

        self.write_to_chunk(chunk_index, offset_in_chunk, src)?;
        let done_event = self.context.execute_command_list(&command_list)?;

        // Refresh the reclamation gate so the slot outlives this new copy.
        if let Some(allocation) = self.chunks[chunk_index].allocations.get_mut(allocation_key) {
            allocation.done_event = done_event.clone();
        }

        // Touch: this key is now the most recently used.
        if let Some(position) = self.lru_order.iter().position(|k| k == key) {
            self.lru_order.remove(position);
        }
        self.lru_order.push_back(key.clone());

        tracing::trace!(?key, chunk_index, offset_in_chunk, "PooledUploadHeap: cache hit");
        Ok(done_event)
    }

    #[cfg(debug_assertions)]
    fn assert_invariants(&self) {
        // Chunks stay sorted by ascending capacity
        for pair in self.chunks.windows(2) {
            assert!(pair[0].capacity_in_bytes <= pair[1].capacity_in_bytes);
        }

        let mut computed_capacity = 0u64;
        for chunk in &self.chunks {
            assert_eq!(chunk.capacity_in_bytes, chunk.resource.size_in_bytes());
            computed_capacity += chunk.capacity_in_bytes;

            let mut spans: Vec<(u64, u64)> = chunk
                .allocations
                .iter()
                .map(|a| (a.offset_in_chunk, a.size_in_bytes))
                .collect();
            assert_eq!(spans.len(), chunk.allocations.len());
            for &(offset, size) in &spans {
                assert!(offset + size <= chunk.capacity_in_bytes);
                assert_eq!(offset % self.allocation_alignment, 0);
            }
            spans.sort_by_key(|span| span.0);
            for pair in spans.windows(2) {
                assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlapping staging allocations");
            }
        }
        assert_eq!(computed_capacity, self.total_capacity);
    }

    #[cfg(not(debug_assertions))]
    fn assert_invariants(&self) {}
}

fn align_up(offset: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(offset: u64, size: u64) -> UploadAllocation {
        UploadAllocation {
            size_in_bytes: size,
            offset_in_chunk: offset,
            done_event: GpuEvent::signaled(),
            locked: false,
        }
    }

    fn list_of(allocations: &[(u64, u64)]) -> AllocationList {
        let mut list = AllocationList::default();
        for &(offset, size) in allocations {
            list.push_back(allocation(offset, size));
        }
        list
    }

    #[test]
    fn align_up_matches_hardware_alignment() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(300, 16), 304);
        assert_eq!(align_up(304, 16), 304);
        assert_eq!(align_up(504, 16), 512);
        assert_eq!(align_up(1, 512), 512);
    }

    #[test]
    fn empty_chunk_allocates_from_the_beginning() {
        let list = AllocationList::default();
        assert_eq!(
            PooledUploadHeap::find_offset_for_allocation(1024, &list, 300, 16),
            Some(0)
        );
    }

    #[test]
    fn undersized_chunk_is_skipped() {
        let list = AllocationList::default();
        assert_eq!(
            PooledUploadHeap::find_offset_for_allocation(256, &list, 300, 16),
            None
        );
    }

    #[test]
    fn sequential_placement_goes_after_the_last_allocation() {
        let list = list_of(&[(0, 300)]);
        assert_eq!(
            PooledUploadHeap::find_offset_for_allocation(1024, &list, 200, 16),
            Some(304)
        );
    }

    #[test]
    fn placement_wraps_to_the_front_when_the_tail_is_full() {
        // Live span [304, 1024); 500 bytes fit neither after 1024 nor
        // before offset 304... but 300 do fit at the front.
        let list = list_of(&[(304, 200), (512, 512)]);
        assert_eq!(
            PooledUploadHeap::find_offset_for_allocation(1024, &list, 500, 16),
            None
        );
        assert_eq!(
            PooledUploadHeap::find_offset_for_allocation(1024, &list, 300, 16),
            Some(0)
        );
    }

    #[test]
    fn wrapped_span_places_into_the_middle_gap() {
        // First allocation at 600, last wrapped to 0: the free gap is
        // [aligned end of last, first.offset).
        let list = list_of(&[(600, 200), (0, 100)]);
        assert_eq!(
            PooledUploadHeap::find_offset_for_allocation(1024, &list, 400, 16),
            Some(112)
        );
        assert_eq!(
            PooledUploadHeap::find_offset_for_allocation(1024, &list, 600, 16),
            None
        );
    }

    #[test]
    fn placement_guards_against_offset_overflow() {
        let list = list_of(&[(0, u64::MAX - 8)]);
        assert_eq!(
            PooledUploadHeap::find_offset_for_allocation(u64::MAX, &list, 64, 16),
            None
        );
    }

    #[test]
    fn allocation_list_retains_in_order_with_stable_keys() {
        let mut list = AllocationList::default();
        let a = list.push_back(allocation(0, 10));
        let b = list.push_back(allocation(16, 10));
        let c = list.push_back(allocation(32, 10));

        list.retain(|entry| entry.offset_in_chunk != 16);
        assert_eq!(list.len(), 2);
        assert!(list.get(a).is_some());
        assert!(list.get(b).is_none());
        assert!(list.get(c).is_some());
        assert_eq!(list.front().unwrap().offset_in_chunk, 0);
        assert_eq!(list.back().unwrap().offset_in_chunk, 32);
    }

    #[test]
    fn locked_allocations_survive_retain_by_event() {
        let mut list = AllocationList::default();
        list.push_back(UploadAllocation {
            size_in_bytes: 10,
            offset_in_chunk: 0,
            done_event: GpuEvent::signaled(),
            locked: true,
        });
        list.push_back(allocation(16, 10));

        list.retain(|a| a.locked || !a.done_event.is_signaled());
        assert_eq!(list.len(), 1);
        assert_eq!(list.locked_count(), 1);
    }

    #[test]
    fn config_validation_rejects_bad_alignment() {
        assert!(UploadHeapConfig::new().with_allocation_alignment(3).validate().is_err());
        assert!(UploadHeapConfig::new().with_allocation_alignment(2).validate().is_err());
        assert!(UploadHeapConfig::new().with_allocation_alignment(16).validate().is_ok());
    }
}
