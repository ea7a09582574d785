//! Driver-backed compute runtime over the system OpenCL ICD loader.
//!
//! Compiled only with the `opencl` feature. Every trait call maps onto the
//! matching OpenCL entry point; driver objects live in handle tables and are
//! released when their handle is.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{
    get_all_devices, Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
use opencl3::error_codes::ClError;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_ONLY, CL_MEM_WRITE_ONLY};
use opencl3::program::Program;
use opencl3::types::{cl_uint, CL_BLOCKING};
use tracing::{debug, trace};

use super::{
    AccessMode, BufferId, ComputeRuntime, ContextId, DeviceClass, DeviceId, DeviceInfo, Handle,
    KernelArg, KernelId, ProgramId, QueueId, Result, RuntimeError,
};

fn driver(err: ClError) -> RuntimeError {
    RuntimeError::Driver(err.to_string())
}

fn invalid(kind: &'static str, id: u64) -> RuntimeError {
    RuntimeError::InvalidHandle { kind, id }
}

struct ProgramObj {
    program: Program,
    device: usize,
}

struct KernelObj {
    kernel: Kernel,
    device: usize,
}

#[derive(Default)]
struct State {
    /// Enumerated devices; `DeviceId(n)` is entry `n - 1`.
    devices: Vec<(Device, DeviceClass)>,
    next_id: u64,
    contexts: HashMap<u64, (Context, usize)>,
    queues: HashMap<u64, CommandQueue>,
    programs: HashMap<u64, ProgramObj>,
    kernels: HashMap<u64, KernelObj>,
    buffers: HashMap<u64, Buffer<u8>>,
}

impl State {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn device_index(&self, id: DeviceId) -> Result<usize> {
        (id.0 as usize)
            .checked_sub(1)
            .filter(|idx| *idx < self.devices.len())
            .ok_or(invalid("device", id.0))
    }

    /// Stable id for a driver device, registering it on first sight.
    fn register(&mut self, device: Device, class: DeviceClass) -> DeviceId {
        let idx = match self.devices.iter().position(|(d, _)| d.id() == device.id()) {
            Some(idx) => idx,
            None => {
                self.devices.push((device, class));
                self.devices.len() - 1
            }
        };
        DeviceId(idx as u64 + 1)
    }
}

/// A [`ComputeRuntime`] that drives the installed OpenCL platforms.
pub struct OpenClRuntime {
    state: Mutex<State>,
}

impl Default for OpenClRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenClRuntime {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ComputeRuntime for OpenClRuntime {
    fn devices(&self, class: DeviceClass) -> Result<Vec<DeviceId>> {
        let mask = match class {
            DeviceClass::Accelerator => CL_DEVICE_TYPE_GPU | CL_DEVICE_TYPE_ACCELERATOR,
            DeviceClass::GeneralPurpose => CL_DEVICE_TYPE_CPU,
        };
        // No platform, or none with a matching device, reads as "not found".
        let found = get_all_devices(mask).unwrap_or_default();
        if found.is_empty() {
            return Err(RuntimeError::DeviceNotFound(class));
        }
        let mut state = self.lock();
        Ok(found
            .into_iter()
            .map(|raw| state.register(Device::new(raw), class))
            .collect())
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        let state = self.lock();
        let (dev, class) = &state.devices[state.device_index(device)?];
        Ok(DeviceInfo {
            name: dev.name().map_err(driver)?,
            class: *class,
            max_work_group_size: dev.max_work_group_size().map_err(driver)?,
            global_mem_bytes: dev.global_mem_size().map_err(driver)?,
            compute_units: dev.max_compute_units().map_err(driver)?,
            available: dev.available().map_err(driver)?,
        })
    }

    fn create_context(&self, device: DeviceId) -> Result<ContextId> {
        let mut state = self.lock();
        let idx = state.device_index(device)?;
        let (dev, _) = &state.devices[idx];
        if !dev.available().map_err(driver)? {
            return Err(RuntimeError::DeviceNotAvailable(device));
        }
        let context = Context::from_device(dev).map_err(driver)?;
        let id = state.alloc_id();
        state.contexts.insert(id, (context, idx));
        debug!(context = id, %device, "context created");
        Ok(ContextId(id))
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        let mut state = self.lock();
        let idx = state.device_index(device)?;
        let (ctx, ctx_device) = state.contexts.get(&context.0).ok_or(invalid("context", context.0))?;
        if *ctx_device != idx {
            return Err(RuntimeError::InvalidHandle { kind: "device for context", id: device.0 });
        }
        // In-order and without profiling, matching the host runtime.
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(ctx, 0).map_err(driver)?;
        let id = state.alloc_id();
        state.queues.insert(id, queue);
        Ok(QueueId(id))
    }

    fn create_program(&self, context: ContextId, source: &str) -> Result<ProgramId> {
        let mut state = self.lock();
        let (ctx, device) = state.contexts.get(&context.0).ok_or(invalid("context", context.0))?;
        let device = *device;
        let program = Program::create_from_source(ctx, source).map_err(driver)?;
        let id = state.alloc_id();
        state.programs.insert(id, ProgramObj { program, device });
        Ok(ProgramId(id))
    }

    fn build_program(&self, program: ProgramId, device: DeviceId) -> Result<()> {
        let mut state = self.lock();
        let idx = state.device_index(device)?;
        let raw = state.devices[idx].0.id();
        let prog = state.programs.get_mut(&program.0).ok_or(invalid("program", program.0))?;
        if prog.device != idx {
            return Err(RuntimeError::InvalidHandle { kind: "device for program", id: device.0 });
        }
        prog.program.build(&[raw], "").map_err(|e| {
            debug!(error = %e, "program build failed");
            RuntimeError::BuildProgramFailure
        })
    }

    fn build_log(&self, program: ProgramId, device: DeviceId) -> Result<String> {
        let state = self.lock();
        let raw = state.devices[state.device_index(device)?].0.id();
        let prog = state.programs.get(&program.0).ok_or(invalid("program", program.0))?;
        prog.program.get_build_log(raw).map_err(driver)
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut state = self.lock();
        let prog = state.programs.get(&program.0).ok_or(invalid("program", program.0))?;
        let device = prog.device;
        let kernel = Kernel::create(&prog.program, name)
            .map_err(|_| RuntimeError::InvalidKernelName(name.to_string()))?;
        let id = state.alloc_id();
        state.kernels.insert(id, KernelObj { kernel, device });
        Ok(KernelId(id))
    }

    fn kernel_arg_count(&self, kernel: KernelId) -> Result<usize> {
        let state = self.lock();
        let k = state.kernels.get(&kernel.0).ok_or(invalid("kernel", kernel.0))?;
        Ok(k.kernel.num_args().map_err(driver)? as usize)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: usize, arg: &KernelArg) -> Result<()> {
        let state = self.lock();
        let k = state.kernels.get(&kernel.0).ok_or(invalid("kernel", kernel.0))?;
        let count = k.kernel.num_args().map_err(driver)? as usize;
        let slot = cl_uint::try_from(index)
            .ok()
            .filter(|_| index < count)
            .ok_or(RuntimeError::InvalidArgIndex { index, count })?;
        let bad_value = |e: ClError| RuntimeError::InvalidArgValue { index, reason: e.to_string() };
        match arg {
            KernelArg::Buffer(buf) => {
                let mem = state.buffers.get(&buf.0).ok_or(invalid("buffer", buf.0))?.get();
                // SAFETY: `mem` is a live cl_mem owned by the buffer table.
                unsafe { k.kernel.set_arg(slot, &mem) }.map_err(bad_value)
            }
            KernelArg::Scalar(bytes) => {
                // SAFETY: the driver copies `bytes.len()` bytes before returning.
                unsafe { k.kernel.set_arg_raw(slot, bytes.len(), bytes.as_ptr() as *const c_void) }
                    .map_err(bad_value)
            }
        }
    }

    fn create_buffer(&self, context: ContextId, size: usize, access: AccessMode) -> Result<BufferId> {
        let mut state = self.lock();
        if size == 0 {
            return Err(RuntimeError::InvalidBufferSize(size));
        }
        let (ctx, _) = state.contexts.get(&context.0).ok_or(invalid("context", context.0))?;
        let flags = match access {
            AccessMode::ReadOnly => CL_MEM_READ_ONLY,
            AccessMode::WriteOnly => CL_MEM_WRITE_ONLY,
        };
        // SAFETY: no host pointer is passed, so the driver owns the storage.
        let buffer = unsafe { Buffer::<u8>::create(ctx, flags, size, ptr::null_mut()) }.map_err(driver)?;
        let id = state.alloc_id();
        state.buffers.insert(id, buffer);
        debug!(buffer = id, size, ?access, "buffer allocated");
        Ok(BufferId(id))
    }

    fn write_buffer(&self, queue: QueueId, buffer: BufferId, data: &[u8]) -> Result<()> {
        let mut guard = self.lock();
        let State { queues, buffers, .. } = &mut *guard;
        let q = queues.get(&queue.0).ok_or(invalid("queue", queue.0))?;
        let buf = buffers.get_mut(&buffer.0).ok_or(invalid("buffer", buffer.0))?;
        let size = buf.size().map_err(driver)?;
        if data.len() > size {
            return Err(RuntimeError::TransferOutOfBounds { len: data.len(), size });
        }
        // SAFETY: blocking write; `data` outlives the call.
        unsafe { q.enqueue_write_buffer(buf, CL_BLOCKING, 0, data, &[]) }.map_err(driver)?;
        Ok(())
    }

    fn read_buffer(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        let state = self.lock();
        let q = state.queues.get(&queue.0).ok_or(invalid("queue", queue.0))?;
        let buf = state.buffers.get(&buffer.0).ok_or(invalid("buffer", buffer.0))?;
        let size = buf.size().map_err(driver)?;
        if out.len() > size {
            return Err(RuntimeError::TransferOutOfBounds { len: out.len(), size });
        }
        // SAFETY: blocking read into `out`, which outlives the call.
        unsafe { q.enqueue_read_buffer(buf, CL_BLOCKING, 0, out, &[]) }.map_err(driver)?;
        Ok(())
    }

    fn kernel_work_group_size(&self, kernel: KernelId, device: DeviceId) -> Result<usize> {
        let state = self.lock();
        let idx = state.device_index(device)?;
        let k = state.kernels.get(&kernel.0).ok_or(invalid("kernel", kernel.0))?;
        if k.device != idx {
            return Err(RuntimeError::InvalidHandle { kind: "device for kernel", id: device.0 });
        }
        k.kernel.get_work_group_size(state.devices[idx].0.id()).map_err(driver)
    }

    fn enqueue_kernel(&self, queue: QueueId, kernel: KernelId, global: usize, group: usize) -> Result<()> {
        if global == 0 {
            return Err(RuntimeError::InvalidGlobalWorkSize);
        }
        let state = self.lock();
        let q = state.queues.get(&queue.0).ok_or(invalid("queue", queue.0))?;
        let k = state.kernels.get(&kernel.0).ok_or(invalid("kernel", kernel.0))?;
        let (global_size, group_size) = ([global], [group]);
        // SAFETY: the size arrays outlive the call and every argument was
        // bound through `set_kernel_arg`, which the driver verifies.
        unsafe {
            q.enqueue_nd_range_kernel(
                k.kernel.get(),
                1,
                ptr::null(),
                global_size.as_ptr(),
                group_size.as_ptr(),
                &[],
            )
        }
        .map_err(|e| RuntimeError::InvalidWorkGroupSize { global, group, reason: e.to_string() })?;
        trace!(kernel = %kernel, global, group, "launch enqueued");
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        let state = self.lock();
        let q = state.queues.get(&queue.0).ok_or(invalid("queue", queue.0))?;
        q.finish().map_err(|e| RuntimeError::ExecutionFailed(e.to_string()))
    }

    fn release(&self, handle: Handle) -> Result<()> {
        let mut state = self.lock();
        let released = match handle {
            Handle::Context(id) => state.contexts.remove(&id.0).is_some(),
            Handle::Queue(id) => state.queues.remove(&id.0).is_some(),
            Handle::Program(id) => state.programs.remove(&id.0).is_some(),
            Handle::Kernel(id) => state.kernels.remove(&id.0).is_some(),
            Handle::Buffer(id) => state.buffers.remove(&id.0).is_some(),
        };
        if !released {
            let (kind, id) = match handle {
                Handle::Context(id) => ("context", id.0),
                Handle::Queue(id) => ("queue", id.0),
                Handle::Program(id) => ("program", id.0),
                Handle::Kernel(id) => ("kernel", id.0),
                Handle::Buffer(id) => ("buffer", id.0),
            };
            return Err(invalid(kind, id));
        }
        trace!(%handle, "released");
        Ok(())
    }
}
