//! Buffer regions
//!
//! A logical view over part of a backing resource. The physical resource may
//! be larger than the requested size because of bucket rounding; callers must
//! honor the offset and size rather than the resource extent.

use crate::device::Resource;

#[derive(Clone, Debug)]
pub struct BufferRegion {
    resource: Resource,
    offset_in_bytes: u64,
    size_in_bytes: u64,
}

impl BufferRegion {
    pub fn new(resource: Resource, offset_in_bytes: u64, size_in_bytes: u64) -> Self {
        debug_assert!(offset_in_bytes + size_in_bytes <= resource.size_in_bytes());
        Self {
            resource,
            offset_in_bytes,
            size_in_bytes,
        }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn offset_in_bytes(&self) -> u64 {
        self.offset_in_bytes
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }
}
