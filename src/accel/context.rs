//! Execution context and its in-order command queue.

use tracing::info;

use crate::accel::{release, Device, PipelineError};
use crate::runtime::{ComputeRuntime, ContextId, DeviceId, Handle, QueueId};

/// A session bound to one device. Released on drop, after every object
/// borrowed from it.
pub struct Context<'rt> {
    runtime: &'rt dyn ComputeRuntime,
    id: ContextId,
    device: DeviceId,
}

impl<'rt> Context<'rt> {
    pub fn create(device: &Device<'rt>) -> Result<Self, PipelineError> {
        let runtime = device.runtime();
        let id = runtime
            .create_context(device.id())
            .map_err(PipelineError::ContextCreationFailed)?;
        info!(context = %id, device = %device.info().name, "compute context created");
        Ok(Self { runtime, id, device: device.id() })
    }

    /// Create the single in-order queue used for every transfer and launch.
    pub fn create_queue(&self) -> Result<CommandQueue<'_>, PipelineError> {
        let id = self
            .runtime
            .create_queue(self.id, self.device)
            .map_err(PipelineError::QueueCreationFailed)?;
        info!(queue = %id, "command queue created");
        Ok(CommandQueue { context: self, id })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn runtime(&self) -> &'rt dyn ComputeRuntime {
        self.runtime
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        release(self.runtime, Handle::Context(self.id));
    }
}

/// An in-order command queue. Operations retire in submission order.
pub struct CommandQueue<'c> {
    context: &'c Context<'c>,
    id: QueueId,
}

impl<'c> CommandQueue<'c> {
    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn context(&self) -> &'c Context<'c> {
        self.context
    }
}

impl Drop for CommandQueue<'_> {
    fn drop(&mut self) {
        release(self.context.runtime(), Handle::Queue(self.id));
    }
}
