//! Software execution queue
//!
//! [`SoftwareQueue`] implements [`ExecutionContext`] over a
//! [`SoftwareDevice`]. Copies are applied eagerly at submission; completion
//! is decoupled and advances only when the caller retires work, so tests can
//! hold completion events unsignaled while exercising reclamation and
//! deferred-release paths exactly as they behave against a real queue.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::device::{
    Command, CommandList, CommandListType, Resource, ResourceState, SoftwareDevice,
};
use crate::error::{DmlForgeError, ForgeResult};
use crate::exec::context::ExecutionContext;
use crate::exec::event::{Fence, GpuEvent};

struct QueueState {
    submitted: u64,
    pending_references: Vec<(u64, Arc<dyn Any + Send + Sync>)>,
}

/// A single-queue software execution context.
pub struct SoftwareQueue {
    device: Arc<SoftwareDevice>,
    fence: Arc<Fence>,
    list_type: CommandListType,
    state: Mutex<QueueState>,
}

impl SoftwareQueue {
    pub fn new(device: Arc<SoftwareDevice>) -> Arc<Self> {
        Self::with_list_type(device, CommandListType::Direct)
    }

    pub fn with_list_type(device: Arc<SoftwareDevice>, list_type: CommandListType) -> Arc<Self> {
        Arc::new(Self {
            device,
            fence: Fence::new(),
            list_type,
            state: Mutex::new(QueueState {
                submitted: 0,
                pending_references: Vec::new(),
            }),
        })
    }

    pub fn device(&self) -> &Arc<SoftwareDevice> {
        &self.device
    }

    /// Fence value of the most recent submission.
    pub fn submitted_value(&self) -> u64 {
        self.state.lock().map(|state| state.submitted).unwrap_or(0)
    }

    /// Retire all submissions up to and including `value`: the fence
    /// advances and queued references whose event has fired are dropped.
    pub fn retire_up_to(&self, value: u64) {
        self.fence.signal(value);
        if let Ok(mut state) = self.state.lock() {
            let before = state.pending_references.len();
            state.pending_references.retain(|(v, _)| *v > value);
            let dropped = before - state.pending_references.len();
            if dropped > 0 {
                tracing::trace!(value, dropped, "SoftwareQueue: released queued references");
            }
        }
    }

    /// Retire everything submitted so far.
    pub fn retire_all(&self) {
        let value = self.submitted_value();
        self.retire_up_to(value);
    }

    /// Number of objects still held for deferred release.
    pub fn pending_reference_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.pending_references.len())
            .unwrap_or(0)
    }

    fn apply_copy(
        &self,
        dst: &Resource,
        dst_offset_in_bytes: u64,
        src: &Resource,
        src_offset_in_bytes: u64,
        size_in_bytes: u64,
    ) -> ForgeResult<()> {
        if !dst.is_buffer() || !src.is_buffer() {
            return Err(DmlForgeError::InvalidArgument(
                "buffer-region copies require buffer resources".to_string(),
            ));
        }
        let src_end = src_offset_in_bytes.checked_add(size_in_bytes);
        if src_end.is_none() || src_end.unwrap_or(u64::MAX) > src.size_in_bytes() {
            return Err(DmlForgeError::InvalidArgument(format!(
                "source range out of bounds: offset={} size={} resource={}",
                src_offset_in_bytes,
                size_in_bytes,
                src.size_in_bytes()
            )));
        }
        let dst_end = dst_offset_in_bytes.checked_add(size_in_bytes);
        if dst_end.is_none() || dst_end.unwrap_or(u64::MAX) > dst.size_in_bytes() {
            return Err(DmlForgeError::InvalidArgument(format!(
                "destination range out of bounds: offset={} size={} resource={}",
                dst_offset_in_bytes,
                size_in_bytes,
                dst.size_in_bytes()
            )));
        }

        let src_store = SoftwareDevice::store_of(src)
            .map_err(|err| DmlForgeError::ExecutionFailure(err.to_string()))?;
        let dst_store = SoftwareDevice::store_of(dst)
            .map_err(|err| DmlForgeError::ExecutionFailure(err.to_string()))?;
        let bytes = src_store
            .read(src_offset_in_bytes, size_in_bytes as usize)
            .map_err(|err| DmlForgeError::ExecutionFailure(err.to_string()))?;
        dst_store
            .write(dst_offset_in_bytes, &bytes)
            .map_err(|err| DmlForgeError::ExecutionFailure(err.to_string()))?;
        Ok(())
    }

    fn record_submission(&self) -> ForgeResult<GpuEvent> {
        let mut state = self.state.lock()?;
        state.submitted += 1;
        Ok(GpuEvent::new(self.fence.clone(), state.submitted))
    }
}

impl ExecutionContext for SoftwareQueue {
    fn copy_buffer_region(
        &self,
        dst: &Resource,
        dst_offset_in_bytes: u64,
        dst_state: ResourceState,
        src: &Resource,
        src_offset_in_bytes: u64,
        _src_state: ResourceState,
        size_in_bytes: u64,
    ) -> ForgeResult<()> {
        if !dst_state.contains(ResourceState::COPY_DEST) {
            // Transitions are a no-op on the software timeline.
            tracing::trace!(
                dst_id = dst.id(),
                ?dst_state,
                "SoftwareQueue: transitioning destination around copy"
            );
        }
        self.apply_copy(dst, dst_offset_in_bytes, src, src_offset_in_bytes, size_in_bytes)?;
        let event = self.record_submission()?;
        tracing::trace!(
            dst_id = dst.id(),
            dst_offset_in_bytes,
            size_in_bytes,
            value = event.value(),
            "SoftwareQueue: copy submitted"
        );
        Ok(())
    }

    fn execute_command_list(&self, list: &CommandList) -> ForgeResult<GpuEvent> {
        if !list.is_closed() {
            return Err(DmlForgeError::ExecutionFailure(format!(
                "command list {} submitted before close",
                list.id()
            )));
        }
        let commands = list
            .commands()
            .map_err(|err| DmlForgeError::ExecutionFailure(err.to_string()))?;
        for command in &commands {
            match command {
                Command::TransitionBarrier { resource, before, after } => {
                    tracing::trace!(
                        resource_id = resource.id(),
                        ?before,
                        ?after,
                        "SoftwareQueue: barrier"
                    );
                }
                Command::CopyBufferRegion {
                    dst,
                    dst_offset_in_bytes,
                    src,
                    src_offset_in_bytes,
                    size_in_bytes,
                } => {
                    self.apply_copy(dst, *dst_offset_in_bytes, src, *src_offset_in_bytes, *size_in_bytes)?;
                }
            }
        }
        let event = self.record_submission()?;
        tracing::trace!(
            list_id = list.id(),
            commands = commands.len(),
            value = event.value(),
            "SoftwareQueue: command list executed"
        );
        Ok(event)
    }

    fn current_completion_event(&self) -> GpuEvent {
        let submitted = self.submitted_value();
        GpuEvent::new(self.fence.clone(), submitted)
    }

    fn command_list_type(&self) -> CommandListType {
        self.list_type
    }

    fn queue_reference(&self, object: Arc<dyn Any + Send + Sync>) {
        if let Ok(mut state) = self.state.lock() {
            let value = state.submitted;
            state.pending_references.push((value, object));
        }
    }
}
