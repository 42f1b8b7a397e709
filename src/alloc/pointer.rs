//! Tagged device pointers
//!
//! The bucket allocator hands out opaque pointer *values*, not references:
//! the allocation id and a byte offset packed into 64 bits. The allocator
//! owns every allocation record and translates a pointer back to its backing
//! through the id. Id 0 is never issued, so a null pointer can never alias a
//! live allocation.

use std::fmt;

const OFFSET_BITS: u32 = 40;
const ALLOCATION_ID_BITS: u32 = 24;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// An opaque device pointer issued by the bucket allocator.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// Largest id that fits the tag bits.
    pub const MAX_ALLOCATION_ID: u32 = (1 << ALLOCATION_ID_BITS) - 1;

    /// Largest byte offset that fits the tag bits (1 TiB - 1).
    pub const MAX_OFFSET: u64 = OFFSET_MASK;

    /// The null pointer.
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Pack an allocation id and byte offset. Debug-asserts the bit budgets;
    /// both are enforced by the allocator before packing.
    pub fn pack(allocation_id: u32, offset_in_bytes: u64) -> Self {
        debug_assert!(allocation_id <= Self::MAX_ALLOCATION_ID);
        debug_assert!(offset_in_bytes <= Self::MAX_OFFSET);
        DevicePtr((u64::from(allocation_id) << OFFSET_BITS) | (offset_in_bytes & OFFSET_MASK))
    }

    pub fn allocation_id(self) -> u32 {
        (self.0 >> OFFSET_BITS) as u32
    }

    pub fn offset_in_bytes(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `delta` bytes into the same allocation. The caller is
    /// responsible for staying within the allocation, exactly as with raw
    /// pointer arithmetic; `create_buffer_region` re-validates the range.
    pub fn byte_offset(self, delta: u64) -> DevicePtr {
        DevicePtr::pack(self.allocation_id(), self.offset_in_bytes() + delta)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        DevicePtr(raw)
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "DevicePtr(null)")
        } else {
            write!(
                f,
                "DevicePtr(id={}, offset={})",
                self.allocation_id(),
                self.offset_in_bytes()
            )
        }
    }
}
