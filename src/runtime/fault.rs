//! Fault-injecting runtime wrapper.
//!
//! [`FaultInjector`] forwards every call to an inner runtime, journals the
//! operation, and fails the configured [`RuntimeOp`] instead of forwarding
//! it. It can also overwrite selected `f32` elements on read-back to model a
//! device that computes wrong values.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use super::{
    AccessMode, BufferId, ComputeRuntime, ContextId, DeviceClass, DeviceId, DeviceInfo, Handle,
    KernelArg, KernelId, ProgramId, QueueId, Result, RuntimeError, RuntimeOp,
};

#[derive(Default)]
struct Plan {
    fail_on: Option<RuntimeOp>,
    corruptions: Vec<(usize, f32)>,
    journal: Vec<RuntimeOp>,
}

/// Wraps a runtime and injects failures.
pub struct FaultInjector<R> {
    inner: R,
    plan: Mutex<Plan>,
}

impl<R: ComputeRuntime> FaultInjector<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, plan: Mutex::new(Plan::default()) }
    }

    /// Fail every call of `op` with [`RuntimeError::Injected`].
    pub fn fail_on(self, op: RuntimeOp) -> Self {
        self.lock().fail_on = Some(op);
        self
    }

    /// Replace element `index` of every `f32` read-back with `value`.
    pub fn corrupt_read(self, index: usize, value: f32) -> Self {
        self.lock().corruptions.push((index, value));
        self
    }

    /// Operations attempted so far, in call order.
    pub fn journal(&self) -> Vec<RuntimeOp> {
        self.lock().journal.clone()
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn lock(&self) -> MutexGuard<'_, Plan> {
        self.plan.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, op: RuntimeOp) -> Result<()> {
        let mut plan = self.lock();
        plan.journal.push(op);
        if plan.fail_on == Some(op) {
            warn!(%op, "injecting runtime fault");
            return Err(RuntimeError::Injected(op));
        }
        Ok(())
    }
}

impl<R: ComputeRuntime> ComputeRuntime for FaultInjector<R> {
    fn devices(&self, class: DeviceClass) -> Result<Vec<DeviceId>> {
        self.check(RuntimeOp::QueryDevices)?;
        self.inner.devices(class)
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        self.check(RuntimeOp::DeviceInfo)?;
        self.inner.device_info(device)
    }

    fn create_context(&self, device: DeviceId) -> Result<ContextId> {
        self.check(RuntimeOp::CreateContext)?;
        self.inner.create_context(device)
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        self.check(RuntimeOp::CreateQueue)?;
        self.inner.create_queue(context, device)
    }

    fn create_program(&self, context: ContextId, source: &str) -> Result<ProgramId> {
        self.check(RuntimeOp::CreateProgram)?;
        self.inner.create_program(context, source)
    }

    fn build_program(&self, program: ProgramId, device: DeviceId) -> Result<()> {
        self.check(RuntimeOp::BuildProgram)?;
        self.inner.build_program(program, device)
    }

    fn build_log(&self, program: ProgramId, device: DeviceId) -> Result<String> {
        self.check(RuntimeOp::BuildLog)?;
        self.inner.build_log(program, device)
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        self.check(RuntimeOp::CreateKernel)?;
        self.inner.create_kernel(program, name)
    }

    fn kernel_arg_count(&self, kernel: KernelId) -> Result<usize> {
        self.check(RuntimeOp::KernelArgCount)?;
        self.inner.kernel_arg_count(kernel)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: usize, arg: &KernelArg) -> Result<()> {
        self.check(RuntimeOp::SetKernelArg)?;
        self.inner.set_kernel_arg(kernel, index, arg)
    }

    fn create_buffer(&self, context: ContextId, size: usize, access: AccessMode) -> Result<BufferId> {
        self.check(RuntimeOp::CreateBuffer)?;
        self.inner.create_buffer(context, size, access)
    }

    fn write_buffer(&self, queue: QueueId, buffer: BufferId, data: &[u8]) -> Result<()> {
        self.check(RuntimeOp::WriteBuffer)?;
        self.inner.write_buffer(queue, buffer, data)
    }

    fn read_buffer(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        self.check(RuntimeOp::ReadBuffer)?;
        self.inner.read_buffer(queue, buffer, out)?;
        for &(index, value) in &self.lock().corruptions {
            if let Some(chunk) = out.chunks_exact_mut(4).nth(index) {
                chunk.copy_from_slice(&value.to_ne_bytes());
            }
        }
        Ok(())
    }

    fn kernel_work_group_size(&self, kernel: KernelId, device: DeviceId) -> Result<usize> {
        self.check(RuntimeOp::QueryWorkGroupSize)?;
        self.inner.kernel_work_group_size(kernel, device)
    }

    fn enqueue_kernel(&self, queue: QueueId, kernel: KernelId, global: usize, group: usize) -> Result<()> {
        self.check(RuntimeOp::EnqueueKernel)?;
        self.inner.enqueue_kernel(queue, kernel, global, group)
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        self.check(RuntimeOp::Finish)?;
        self.inner.finish(queue)
    }

    fn release(&self, handle: Handle) -> Result<()> {
        self.check(RuntimeOp::Release)?;
        self.inner.release(handle)
    }
}
