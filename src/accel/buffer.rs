//! Buffer manager: device allocations and blocking `f32` transfers.

use tracing::{debug, info};

use crate::accel::{release, CommandQueue, Context, Direction, PipelineError};
use crate::runtime::{AccessMode, BufferId, Handle};

const F32_SIZE: usize = std::mem::size_of::<f32>();

/// A device-resident memory region with a fixed kernel access mode.
///
/// Access modes are not enforced here: writing a `WriteOnly` buffer from the
/// host is a caller error.
pub struct DeviceBuffer<'c> {
    context: &'c Context<'c>,
    id: BufferId,
    size: usize,
    access: AccessMode,
    populated: bool,
}

impl<'c> DeviceBuffer<'c> {
    pub fn allocate(context: &'c Context<'c>, size_bytes: usize, access: AccessMode) -> Result<Self, PipelineError> {
        let id = context
            .runtime()
            .create_buffer(context.id(), size_bytes, access)
            .map_err(|source| PipelineError::AllocationFailed { size: size_bytes, source })?;
        info!(buffer = %id, size = size_bytes, ?access, "device buffer allocated");
        Ok(Self { context, id, size: size_bytes, access, populated: false })
    }

    /// Allocate room for `len` `f32` values.
    pub fn for_f32(context: &'c Context<'c>, len: usize, access: AccessMode) -> Result<Self, PipelineError> {
        Self::allocate(context, len.saturating_mul(F32_SIZE), access)
    }

    /// Blocking host-to-device copy of exactly `len()` values.
    pub fn write(&mut self, queue: &CommandQueue<'_>, data: &[f32]) -> Result<(), PipelineError> {
        self.check_len(data.len(), Direction::HostToDevice)?;
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_ne_bytes()).collect();
        self.context
            .runtime()
            .write_buffer(queue.id(), self.id, &bytes)
            .map_err(|e| PipelineError::TransferFailed {
                direction: Direction::HostToDevice,
                reason: e.to_string(),
            })?;
        self.populated = true;
        debug!(buffer = %self.id, values = data.len(), "wrote host data to device");
        Ok(())
    }

    /// Blocking device-to-host copy of exactly `len()` values.
    pub fn read(&self, queue: &CommandQueue<'_>, out: &mut [f32]) -> Result<(), PipelineError> {
        self.check_len(out.len(), Direction::DeviceToHost)?;
        let mut bytes = vec![0u8; self.size];
        self.context
            .runtime()
            .read_buffer(queue.id(), self.id, &mut bytes)
            .map_err(|e| PipelineError::TransferFailed {
                direction: Direction::DeviceToHost,
                reason: e.to_string(),
            })?;
        for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(F32_SIZE)) {
            *value = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        debug!(buffer = %self.id, values = out.len(), "read device data to host");
        Ok(())
    }

    fn check_len(&self, values: usize, direction: Direction) -> Result<(), PipelineError> {
        if values.saturating_mul(F32_SIZE) != self.size {
            return Err(PipelineError::TransferFailed {
                direction,
                reason: format!(
                    "host slice of {} bytes does not match device region of {} bytes",
                    values.saturating_mul(F32_SIZE),
                    self.size
                ),
            });
        }
        Ok(())
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size_bytes(&self) -> usize {
        self.size
    }

    /// Number of `f32` values the buffer holds.
    pub fn len(&self) -> usize {
        self.size / F32_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }
}

impl Drop for DeviceBuffer<'_> {
    fn drop(&mut self) {
        release(self.context.runtime(), Handle::Buffer(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::Device;
    use crate::runtime::{DeviceClass, DeviceSpec, HostRuntime, RuntimeError};

    #[test]
    fn test_write_then_read_back() {
        let rt = HostRuntime::default();
        let device = Device::select(&rt, DeviceClass::Accelerator).unwrap();
        let context = Context::create(&device).unwrap();
        let queue = context.create_queue().unwrap();
        let mut buffer = DeviceBuffer::for_f32(&context, 3, AccessMode::ReadOnly).unwrap();
        assert_eq!(buffer.len(), 3);
        assert!(!buffer.is_populated());

        buffer.write(&queue, &[1.5, -2.0, 3.25]).unwrap();
        assert!(buffer.is_populated());
        let mut out = [0.0f32; 3];
        buffer.read(&queue, &mut out).unwrap();
        assert_eq!(out, [1.5, -2.0, 3.25]);
    }

    #[test]
    fn test_size_mismatch_is_a_transfer_failure() {
        let rt = HostRuntime::default();
        let device = Device::select(&rt, DeviceClass::Accelerator).unwrap();
        let context = Context::create(&device).unwrap();
        let queue = context.create_queue().unwrap();
        let mut buffer = DeviceBuffer::for_f32(&context, 4, AccessMode::ReadOnly).unwrap();
        let err = buffer.write(&queue, &[1.0, 2.0]).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::TransferFailed { direction: Direction::HostToDevice, .. }
        ));
        let mut out = [0.0f32; 5];
        let err = buffer.read(&queue, &mut out).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::TransferFailed { direction: Direction::DeviceToHost, .. }
        ));
    }

    #[test]
    fn test_allocation_failure() {
        let rt = HostRuntime::new(vec![DeviceSpec { global_mem_bytes: 64, ..DeviceSpec::accelerator() }]);
        let device = Device::select(&rt, DeviceClass::Accelerator).unwrap();
        let context = Context::create(&device).unwrap();
        let err = DeviceBuffer::for_f32(&context, 32, AccessMode::ReadOnly).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::AllocationFailed { size: 128, source: RuntimeError::OutOfResources { .. } }
        ));
        let err = DeviceBuffer::for_f32(&context, 0, AccessMode::ReadOnly).err().unwrap();
        assert!(matches!(err, PipelineError::AllocationFailed { size: 0, .. }));
    }
}
