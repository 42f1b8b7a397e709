//! Heap and resource handles
//!
//! Handles are cheap to clone; the inner record is shared behind an `Arc` so
//! a handle can be stored in free lists, allocation tables, and recorded
//! command lists without lifetime plumbing. Identity is the device-minted id.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::device::api::{HeapFlags, HeapProperties, ResourceDesc, ResourceDimension};

/// Opaque backend-side payload attached to a handle. The software device
/// attaches its host-memory store here; a driver binding would attach its
/// native object.
pub type BackendPayload = Arc<dyn Any + Send + Sync>;

struct HeapInner {
    id: u64,
    size_in_bytes: u64,
    properties: HeapProperties,
    flags: HeapFlags,
    payload: Option<BackendPayload>,
}

/// A heap handle.
#[derive(Clone)]
pub struct Heap {
    inner: Arc<HeapInner>,
}

impl Heap {
    /// Construct a handle. Intended for [`DeviceApi`](super::DeviceApi)
    /// implementations; `id` must be unique per device.
    pub fn new(
        id: u64,
        size_in_bytes: u64,
        properties: HeapProperties,
        flags: HeapFlags,
        payload: Option<BackendPayload>,
    ) -> Self {
        Self {
            inner: Arc::new(HeapInner {
                id,
                size_in_bytes,
                properties,
                flags,
                payload,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.inner.size_in_bytes
    }

    pub fn properties(&self) -> &HeapProperties {
        &self.inner.properties
    }

    pub fn flags(&self) -> HeapFlags {
        self.inner.flags
    }

    pub fn payload(&self) -> Option<&BackendPayload> {
        self.inner.payload.as_ref()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.inner.id)
            .field("size_in_bytes", &self.inner.size_in_bytes)
            .field("heap_type", &self.inner.properties.heap_type)
            .finish()
    }
}

struct ResourceInner {
    id: u64,
    desc: ResourceDesc,
    payload: Option<BackendPayload>,
}

/// A resource handle.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    /// Construct a handle. Intended for [`DeviceApi`](super::DeviceApi)
    /// implementations; `id` must be unique per device.
    pub fn new(id: u64, desc: ResourceDesc, payload: Option<BackendPayload>) -> Self {
        Self {
            inner: Arc::new(ResourceInner { id, desc, payload }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.inner.desc
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.inner.desc.size_in_bytes
    }

    pub fn is_buffer(&self) -> bool {
        self.inner.desc.dimension == ResourceDimension::Buffer
    }

    pub fn payload(&self) -> Option<&BackendPayload> {
        self.inner.payload.as_ref()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Resource {}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.inner.id)
            .field("size_in_bytes", &self.inner.desc.size_in_bytes)
            .field("dimension", &self.inner.desc.dimension)
            .finish()
    }
}
