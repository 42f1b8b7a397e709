//! Device capability interface
//!
//! The allocators in this crate are written against [`DeviceApi`], a minimal
//! slice of a D3D12-style device: heap creation, placed/committed/reserved
//! buffer resources, tile mappings, command list creation, and map/unmap of
//! CPU-visible resources. A driver binding implements this trait once; the
//! bundled [`SoftwareDevice`](super::SoftwareDevice) implements it over host
//! memory so the whole stack runs without a GPU.

use serde::{Deserialize, Serialize};

use crate::device::command::{CommandAllocator, CommandList};
use crate::device::error::DeviceResult;
use crate::device::resource::{Heap, Resource};

/// Size of one resource tile. Reserved buffers are backed in units of this.
pub const TILE_SIZE_IN_BYTES: u64 = 64 * 1024;

bitflags::bitflags! {
    /// Heap creation flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct HeapFlags: u32 {
        const ALLOW_ONLY_BUFFERS = 1 << 0;
        const SHARED             = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Resource creation flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u32 {
        const ALLOW_UNORDERED_ACCESS = 1 << 0;
        const DENY_SHADER_RESOURCE   = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Resource usage states. The empty set is the common state.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const COPY_DEST        = 1 << 0;
        const COPY_SOURCE      = 1 << 1;
        const GENERIC_READ     = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
    }
}

// Flag words serialize as their raw bits; unknown bits survive a round trip.
macro_rules! impl_flag_serde {
    ($flags:ty) => {
        impl Serialize for $flags {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u32(self.bits())
            }
        }

        impl<'de> Deserialize<'de> for $flags {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                u32::deserialize(deserializer).map(<$flags>::from_bits_retain)
            }
        }

        impl Default for $flags {
            fn default() -> Self {
                Self::empty()
            }
        }
    };
}

impl_flag_serde!(HeapFlags);
impl_flag_serde!(ResourceFlags);
impl_flag_serde!(ResourceState);

/// Memory pool a heap lives in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapType {
    /// Device-local memory, not CPU-visible.
    #[default]
    Default,
    /// CPU-writable memory for CPU-to-GPU streaming.
    Upload,
    /// CPU-readable memory for GPU-to-CPU readback.
    Readback,
    /// Explicitly described memory properties.
    Custom,
}

/// Properties of a heap (or the implicit heap of a committed resource).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeapProperties {
    pub heap_type: HeapType,
}

impl HeapProperties {
    /// Device-local memory.
    pub fn device_local() -> Self {
        Self { heap_type: HeapType::Default }
    }

    /// CPU-writable upload memory.
    pub fn upload() -> Self {
        Self { heap_type: HeapType::Upload }
    }

    /// CPU-readable readback memory.
    pub fn readback() -> Self {
        Self { heap_type: HeapType::Readback }
    }

    /// Whether resources in this heap can be mapped by the CPU.
    pub fn is_cpu_visible(&self) -> bool {
        !matches!(self.heap_type, HeapType::Default)
    }
}

/// Dimensionality of a resource. The allocators only ever create buffers;
/// the dimension exists so destination-resource validation can reject
/// textures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceDimension {
    #[default]
    Buffer,
    Texture2D,
}

/// Description of a resource to create.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub size_in_bytes: u64,
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    /// Describe a plain buffer of `size_in_bytes`.
    pub fn buffer(size_in_bytes: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            size_in_bytes,
            flags: ResourceFlags::empty(),
        }
    }

    /// Same buffer with explicit flags.
    pub fn buffer_with_flags(size_in_bytes: u64, flags: ResourceFlags) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            size_in_bytes,
            flags,
        }
    }
}

/// Queue/command-list family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandListType {
    #[default]
    Direct,
    Compute,
    Copy,
}

/// A run of tiles within a reserved resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRegion {
    pub start_tile: u32,
    pub tile_count: u32,
}

/// A run of tiles within a heap, used as the backing side of a tile mapping.
#[derive(Clone, Debug)]
pub struct HeapTileRange {
    pub heap: Heap,
    pub start_tile: u32,
    pub tile_count: u32,
}

/// The device capabilities both allocators are parametrized by.
///
/// All methods are fallible except the tiling capability query, which is
/// expected to be answered once at startup and cached by callers.
pub trait DeviceApi: Send + Sync {
    /// Create a heap of `size_in_bytes`.
    fn create_heap(
        &self,
        properties: &HeapProperties,
        flags: HeapFlags,
        size_in_bytes: u64,
    ) -> DeviceResult<Heap>;

    /// Create a resource placed at `heap_offset_in_bytes` within `heap`.
    fn create_placed_resource(
        &self,
        heap: &Heap,
        heap_offset_in_bytes: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> DeviceResult<Resource>;

    /// Create a resource together with its own implicit heap.
    fn create_committed_resource(
        &self,
        properties: &HeapProperties,
        flags: HeapFlags,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> DeviceResult<Resource>;

    /// Create a virtual resource without backing; tiles are bound later via
    /// [`update_tile_mappings`](DeviceApi::update_tile_mappings).
    fn create_reserved_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> DeviceResult<Resource>;

    /// Bind tile regions of a reserved resource to heap tile ranges.
    /// `tile_regions` and `heap_ranges` are matched pairwise and must cover
    /// the same number of tiles.
    fn update_tile_mappings(
        &self,
        resource: &Resource,
        tile_regions: &[TileRegion],
        heap_ranges: &[HeapTileRange],
    ) -> DeviceResult<()>;

    /// Create a command allocator for the given queue family.
    fn create_command_allocator(
        &self,
        list_type: CommandListType,
    ) -> DeviceResult<CommandAllocator>;

    /// Create an open command list recording against `allocator`.
    fn create_command_list(
        &self,
        list_type: CommandListType,
        allocator: &CommandAllocator,
    ) -> DeviceResult<CommandList>;

    /// Map a CPU-visible resource and return its CPU address. The pointer is
    /// valid until [`unmap`](DeviceApi::unmap); callers perform their own
    /// bounds checking against the resource size.
    fn map(&self, resource: &Resource) -> DeviceResult<*mut u8>;

    /// Unmap a previously mapped resource.
    fn unmap(&self, resource: &Resource);

    /// Whether the device supports tiled (reserved) resources. Queried once
    /// at allocator construction and cached there.
    fn tiled_resources_supported(&self) -> bool;
}
