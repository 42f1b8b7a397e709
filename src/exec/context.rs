//! Execution context interface
//!
//! The upload heap and the bucket allocator never talk to a command queue
//! directly; they go through [`ExecutionContext`], which submits copies,
//! executes recorded command lists, and mints completion events. Events from
//! one context are monotonic: an event minted later never fires earlier.

use std::any::Any;
use std::sync::Arc;

use crate::device::{CommandList, CommandListType, Resource, ResourceState};
use crate::error::ForgeResult;
use crate::exec::event::GpuEvent;

pub trait ExecutionContext: Send + Sync {
    /// Issue a buffer-region copy, including any transition of `dst` from
    /// `dst_state` to copy-dest and back. Implementations skip the
    /// transitions when `dst_state` already includes copy-dest.
    #[allow(clippy::too_many_arguments)]
    fn copy_buffer_region(
        &self,
        dst: &Resource,
        dst_offset_in_bytes: u64,
        dst_state: ResourceState,
        src: &Resource,
        src_offset_in_bytes: u64,
        src_state: ResourceState,
        size_in_bytes: u64,
    ) -> ForgeResult<()>;

    /// Submit a closed command list. The returned event fires once the
    /// submitted work has retired.
    fn execute_command_list(&self, list: &CommandList) -> ForgeResult<GpuEvent>;

    /// Event that fires once everything enqueued so far has retired.
    fn current_completion_event(&self) -> GpuEvent;

    /// Command-list family of the underlying queue.
    fn command_list_type(&self) -> CommandListType;

    /// Keep `object` alive until the current completion event fires.
    fn queue_reference(&self, object: Arc<dyn Any + Send + Sync>);
}
