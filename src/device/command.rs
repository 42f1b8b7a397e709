//! Recorded command lists
//!
//! A command list is a replayable tape of barrier and copy commands. The
//! upload heap records a list once per copy shape and re-executes it on cache
//! hits; the execution context interprets the tape at submission time.

use std::sync::{Arc, Mutex};

use crate::device::api::{CommandListType, ResourceState};
use crate::device::error::{DeviceError, DeviceResult};
use crate::device::resource::Resource;

/// One recorded command.
#[derive(Clone, Debug)]
pub enum Command {
    TransitionBarrier {
        resource: Resource,
        before: ResourceState,
        after: ResourceState,
    },
    CopyBufferRegion {
        dst: Resource,
        dst_offset_in_bytes: u64,
        src: Resource,
        src_offset_in_bytes: u64,
        size_in_bytes: u64,
    },
}

struct CommandAllocatorInner {
    id: u64,
    list_type: CommandListType,
}

/// Backing storage handle for command list recording.
#[derive(Clone)]
pub struct CommandAllocator {
    inner: Arc<CommandAllocatorInner>,
}

impl CommandAllocator {
    pub fn new(id: u64, list_type: CommandListType) -> Self {
        Self {
            inner: Arc::new(CommandAllocatorInner { id, list_type }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn list_type(&self) -> CommandListType {
        self.inner.list_type
    }
}

impl std::fmt::Debug for CommandAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAllocator")
            .field("id", &self.inner.id)
            .field("list_type", &self.inner.list_type)
            .finish()
    }
}

struct Tape {
    commands: Vec<Command>,
    closed: bool,
}

struct CommandListInner {
    id: u64,
    list_type: CommandListType,
    tape: Mutex<Tape>,
}

/// A command list handle. Created open; record commands, then `close` before
/// handing it to the execution context.
#[derive(Clone)]
pub struct CommandList {
    inner: Arc<CommandListInner>,
}

impl CommandList {
    pub fn new(id: u64, list_type: CommandListType) -> Self {
        Self {
            inner: Arc::new(CommandListInner {
                id,
                list_type,
                tape: Mutex::new(Tape {
                    commands: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn list_type(&self) -> CommandListType {
        self.inner.list_type
    }

    /// Record a state transition barrier.
    pub fn resource_barrier(
        &self,
        resource: &Resource,
        before: ResourceState,
        after: ResourceState,
    ) -> DeviceResult<()> {
        self.record(Command::TransitionBarrier {
            resource: resource.clone(),
            before,
            after,
        })
    }

    /// Record a buffer-region copy.
    pub fn copy_buffer_region(
        &self,
        dst: &Resource,
        dst_offset_in_bytes: u64,
        src: &Resource,
        src_offset_in_bytes: u64,
        size_in_bytes: u64,
    ) -> DeviceResult<()> {
        self.record(Command::CopyBufferRegion {
            dst: dst.clone(),
            dst_offset_in_bytes,
            src: src.clone(),
            src_offset_in_bytes,
            size_in_bytes,
        })
    }

    fn record(&self, command: Command) -> DeviceResult<()> {
        let mut tape = self.inner.tape.lock()?;
        if tape.closed {
            return Err(DeviceError::CommandListError(format!(
                "cannot record into closed command list {}",
                self.inner.id
            )));
        }
        tape.commands.push(command);
        Ok(())
    }

    /// Close the list. Closing twice is an error.
    pub fn close(&self) -> DeviceResult<()> {
        let mut tape = self.inner.tape.lock()?;
        if tape.closed {
            return Err(DeviceError::CommandListError(format!(
                "command list {} already closed",
                self.inner.id
            )));
        }
        tape.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .tape
            .lock()
            .map(|tape| tape.closed)
            .unwrap_or(false)
    }

    /// Snapshot of the recorded tape, for executors.
    pub fn commands(&self) -> DeviceResult<Vec<Command>> {
        let tape = self.inner.tape.lock()?;
        Ok(tape.commands.clone())
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.inner.id)
            .field("list_type", &self.inner.list_type)
            .field("closed", &self.is_closed())
            .finish()
    }
}
