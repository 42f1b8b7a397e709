//! End-to-end tests for the bucketized buffer allocator over the software
//! device: bucket sizing, id recycling, free-list reuse, tiled and untiled
//! backing strategies, and failure semantics.

use std::sync::Arc;

use dmlforge::{
    AllocatorRoundingMode, BucketAllocatorConfig, BucketizedBufferAllocator, DevicePtr,
    DmlForgeError, HeapProperties, SoftwareDevice, SoftwareQueue, TILE_SIZE_IN_BYTES,
};

fn make_stack(
    device: Arc<SoftwareDevice>,
    config: BucketAllocatorConfig,
) -> (Arc<SoftwareQueue>, BucketizedBufferAllocator) {
    let queue = SoftwareQueue::new(device.clone());
    let allocator = BucketizedBufferAllocator::new(device, queue.clone(), config);
    (queue, allocator)
}

fn default_stack() -> (Arc<SoftwareDevice>, Arc<SoftwareQueue>, BucketizedBufferAllocator) {
    let device = SoftwareDevice::new();
    let (queue, allocator) = make_stack(device.clone(), BucketAllocatorConfig::default());
    (device, queue, allocator)
}

#[test]
fn requests_round_up_to_power_of_two_buckets() {
    let (_device, _queue, allocator) = default_stack();

    let small = allocator.alloc(100).expect("alloc(100)");
    let info = allocator.get_allocation_info(small).unwrap();
    assert_eq!(info.bucket_index(), Some(0));
    assert_eq!(info.resource().size_in_bytes(), 65_536);
    assert_eq!(info.requested_size_in_bytes(), 100);

    let just_over = allocator.alloc(65_537).expect("alloc(65537)");
    let info = allocator.get_allocation_info(just_over).unwrap();
    assert_eq!(info.bucket_index(), Some(1));
    assert_eq!(info.resource().size_in_bytes(), 131_072);

    let megabyte = allocator.alloc(1 << 20).expect("alloc(1 MiB)");
    let info = allocator.get_allocation_info(megabyte).unwrap();
    assert_eq!(info.bucket_index(), Some(4));
    assert_eq!(info.resource().size_in_bytes(), 1_048_576);
}

#[test]
fn allocation_ids_start_at_one_and_recycle_freed_ids_first() {
    let (_device, _queue, allocator) = default_stack();

    let first = allocator.alloc(64).unwrap();
    let second = allocator.alloc(64).unwrap();
    assert_eq!(first.allocation_id(), 1);
    assert_eq!(second.allocation_id(), 2);

    allocator.free(first).unwrap();

    let third = allocator.alloc(64).unwrap();
    let fourth = allocator.alloc(64).unwrap();
    assert_eq!(third.allocation_id(), 1, "freed id is reused before the counter bumps");
    assert_eq!(fourth.allocation_id(), 3);
}

#[test]
fn bucket_free_lists_reuse_resources_lifo() {
    let (_device, _queue, allocator) = default_stack();

    let a = allocator.alloc(1000).unwrap();
    let b = allocator.alloc(1000).unwrap();
    let a_resource = allocator.get_allocation_info(a).unwrap().resource_id();
    let b_resource = allocator.get_allocation_info(b).unwrap().resource_id();
    assert_ne!(a_resource, b_resource);

    allocator.free(a).unwrap();
    allocator.free(b).unwrap();

    // b was returned last, so it comes back first.
    let c = allocator.alloc(1000).unwrap();
    assert_eq!(allocator.get_allocation_info(c).unwrap().resource_id(), b_resource);
    let d = allocator.alloc(1000).unwrap();
    assert_eq!(allocator.get_allocation_info(d).unwrap().resource_id(), a_resource);
}

#[test]
fn same_rounded_size_reuses_the_same_backing() {
    let (device, _queue, allocator) = default_stack();

    let ptr = allocator.alloc(100).unwrap();
    let resource_id = allocator.get_allocation_info(ptr).unwrap().resource_id();
    allocator.free(ptr).unwrap();

    let created_before = device.stats().reserved_resources_created;
    // 40_000 rounds to the same 64 KiB bucket as 100.
    let again = allocator.alloc(40_000).unwrap();
    assert_eq!(
        allocator.get_allocation_info(again).unwrap().resource_id(),
        resource_id
    );
    assert_eq!(
        device.stats().reserved_resources_created,
        created_before,
        "reuse must not touch the device"
    );
}

#[test]
fn buffer_regions_carry_offset_and_logical_size() {
    let (_device, _queue, allocator) = default_stack();

    let ptr = allocator.alloc(100).unwrap();
    let region = allocator.create_buffer_region(ptr, 100).unwrap();
    assert_eq!(region.offset_in_bytes(), 0);
    assert_eq!(region.size_in_bytes(), 100);
    // Physical backing is the rounded bucket size.
    assert_eq!(region.resource().size_in_bytes(), 65_536);

    let interior = allocator.create_buffer_region(ptr.byte_offset(64), 32).unwrap();
    assert_eq!(interior.offset_in_bytes(), 64);
    assert_eq!(interior.size_in_bytes(), 32);

    let too_large = allocator.create_buffer_region(ptr, 70_000);
    assert!(matches!(too_large, Err(DmlForgeError::InvalidArgument(_))));
}

#[test]
fn tiled_backings_span_multiple_small_heaps() {
    let device = SoftwareDevice::new();
    let config = BucketAllocatorConfig::default().with_max_heap_size_in_tiles(4);
    let (_queue, allocator) = make_stack(device.clone(), config);
    assert!(allocator.tiling_enabled());

    // 1 MiB = 16 tiles, split across heaps of at most 4 tiles each.
    let ptr = allocator.alloc(1 << 20).unwrap();
    let stats = device.stats();
    assert_eq!(stats.heaps_created, 4);
    assert_eq!(stats.reserved_resources_created, 1);
    assert_eq!(stats.tile_mapping_calls, 4, "one identity mapping per heap");

    let info = allocator.get_allocation_info(ptr).unwrap();
    assert_eq!(info.resource().size_in_bytes(), 16 * TILE_SIZE_IN_BYTES);
}

#[test]
fn untiled_fallback_uses_one_dedicated_heap_per_allocation() {
    let device = SoftwareDevice::without_tiled_resources();
    let (_queue, allocator) = make_stack(device.clone(), BucketAllocatorConfig::default());
    assert!(!allocator.tiling_enabled());

    allocator.alloc(1 << 20).unwrap();
    let stats = device.stats();
    assert_eq!(stats.heaps_created, 1);
    assert_eq!(stats.placed_resources_created, 1);
    assert_eq!(stats.reserved_resources_created, 0);
}

#[test]
fn cpu_visible_heaps_use_committed_resources() {
    let device = SoftwareDevice::without_tiled_resources();
    let config = BucketAllocatorConfig::default().with_heap_properties(HeapProperties::upload());
    let (_queue, allocator) = make_stack(device.clone(), config);

    allocator.alloc(4096).unwrap();
    let stats = device.stats();
    assert_eq!(stats.committed_resources_created, 1);
    assert_eq!(stats.heaps_created, 0);
}

#[test]
fn disabled_rounding_bypasses_buckets_and_defers_release() {
    let device = SoftwareDevice::without_tiled_resources();
    let config = BucketAllocatorConfig::default().with_heap_properties(HeapProperties::upload());
    let (queue, allocator) = make_stack(device, config);

    allocator.set_default_rounding_mode(AllocatorRoundingMode::Disabled);
    let ptr = allocator.alloc(100).unwrap();
    let info = allocator.get_allocation_info(ptr).unwrap();
    assert_eq!(info.bucket_index(), None);
    assert_eq!(info.resource().size_in_bytes(), 100);
    assert_eq!(info.rounding_mode(), AllocatorRoundingMode::Disabled);

    // Unpooled backings are not returned to a bucket; they ride the
    // completion queue until in-flight GPU work retires.
    allocator.free(ptr).unwrap();
    assert_eq!(queue.pending_reference_count(), 1);
    queue.retire_all();
    assert_eq!(queue.pending_reference_count(), 0);
}

#[test]
fn device_refusal_surfaces_out_of_memory_and_rolls_back() {
    let device = SoftwareDevice::with_budget(100 * 1024);
    let (_queue, allocator) = make_stack(device, BucketAllocatorConfig::default());

    let first = allocator.alloc(60_000).expect("fits the budget");
    assert_eq!(first.allocation_id(), 1);

    let refused = allocator.alloc(60_000);
    assert!(matches!(refused, Err(DmlForgeError::OutOfDeviceMemory(_))));
    assert_eq!(allocator.outstanding_allocation_count(), 1);

    // The failed attempt leaked neither its id nor allocator state: freeing
    // the first allocation and allocating again reuses the pooled resource
    // (no new device memory) and id 1.
    allocator.free(first).unwrap();
    let again = allocator.alloc(60_000).expect("reuses the pooled resource");
    assert_eq!(again.allocation_id(), 1);
}

#[test]
fn free_rejects_null_interior_and_unknown_pointers() {
    let (_device, _queue, allocator) = default_stack();

    assert!(matches!(
        allocator.free(DevicePtr::NULL),
        Err(DmlForgeError::InvalidArgument(_))
    ));

    let ptr = allocator.alloc(64).unwrap();
    assert!(matches!(
        allocator.free(ptr.byte_offset(8)),
        Err(DmlForgeError::InvalidArgument(_))
    ));

    allocator.free(ptr).unwrap();
    let double_free = allocator.free(ptr);
    assert!(matches!(double_free, Err(DmlForgeError::InvalidArgument(_))));
}

#[test]
fn zero_sized_allocations_are_rejected() {
    let (_device, _queue, allocator) = default_stack();
    assert!(matches!(
        allocator.alloc(0),
        Err(DmlForgeError::InvalidArgument(_))
    ));
}

#[test]
fn concurrent_producers_never_collide_on_ids() {
    let (_device, _queue, allocator) = default_stack();
    let allocator = Arc::new(allocator);

    let mut workers = Vec::new();
    for _ in 0..4 {
        let allocator = allocator.clone();
        workers.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let ptr = allocator.alloc(1000).expect("alloc under contention");
                let info = allocator.get_allocation_info(ptr).expect("live allocation");
                assert_eq!(info.device_ptr(), ptr);
                allocator.free(ptr).expect("free under contention");
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(allocator.outstanding_allocation_count(), 0);
    let ptr = allocator.alloc(64).unwrap();
    assert!(ptr.allocation_id() >= 1 && ptr.allocation_id() <= 4);
}
