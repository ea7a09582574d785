//! Host-emulated compute runtime.
//!
//! Emulates a set of devices on the calling thread: programs are compiled
//! by the built-in OpenCL C subset compiler, buffers live in host memory and
//! kernel launches execute work-item by work-item. Launches are deferred on
//! the in-order queue until `finish` or the next blocking transfer, which is
//! what makes an explicit wait meaningful.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::lang::{EntryPoint, Module, ParamType, Resolved};
use super::{
    AccessMode, BufferId, ComputeRuntime, ContextId, DeviceClass, DeviceId, DeviceInfo, Handle,
    KernelArg, KernelId, ProgramId, QueueId, Result, RuntimeError,
};

// ---------------------------------------------------------------------------
// Device configuration
// ---------------------------------------------------------------------------

/// Description of one emulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSpec {
    pub name: String,
    pub class: DeviceClass,
    pub max_work_group_size: usize,
    pub global_mem_bytes: u64,
    pub compute_units: u32,
    /// Unavailable devices are enumerated but refuse context creation.
    pub available: bool,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self::accelerator()
    }
}

impl DeviceSpec {
    /// The default emulated accelerator.
    pub fn accelerator() -> Self {
        Self {
            name: "Host-emulated accelerator".to_string(),
            class: DeviceClass::Accelerator,
            max_work_group_size: 256,
            global_mem_bytes: 256 * 1024 * 1024,
            compute_units: 16,
            available: true,
        }
    }

    /// The default emulated general-purpose processor.
    pub fn general_purpose() -> Self {
        Self {
            name: "Host-emulated CPU".to_string(),
            class: DeviceClass::GeneralPurpose,
            max_work_group_size: 1024,
            global_mem_bytes: 1024 * 1024 * 1024,
            compute_units: 4,
            available: true,
        }
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            class: self.class,
            max_work_group_size: self.max_work_group_size,
            global_mem_bytes: self.global_mem_bytes,
            compute_units: self.compute_units,
            available: self.available,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime objects
// ---------------------------------------------------------------------------

struct DeviceState {
    spec: DeviceSpec,
    allocated: u64,
}

struct ContextObj {
    device: usize,
}

struct Launch {
    entry: Arc<EntryPoint>,
    args: Vec<KernelArg>,
    global: usize,
    group: usize,
}

struct QueueObj {
    pending: VecDeque<Launch>,
}

enum BuildState {
    Unbuilt,
    Built(Arc<Module>),
    Failed,
}

struct ProgramObj {
    context: u64,
    source: String,
    state: BuildState,
    log: String,
}

struct KernelObj {
    device: usize,
    entry: Arc<EntryPoint>,
    args: Vec<Option<KernelArg>>,
}

struct BufferObj {
    device: usize,
    /// Allocated size; `data` is empty while a launch borrows the bytes.
    size: usize,
    data: Vec<u8>,
}

#[derive(Default)]
struct State {
    devices: Vec<DeviceState>,
    next_id: u64,
    contexts: HashMap<u64, ContextObj>,
    queues: HashMap<u64, QueueObj>,
    programs: HashMap<u64, ProgramObj>,
    kernels: HashMap<u64, KernelObj>,
    buffers: HashMap<u64, BufferObj>,
}

fn invalid(kind: &'static str, id: u64) -> RuntimeError {
    RuntimeError::InvalidHandle { kind, id }
}

impl State {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn device(&self, id: DeviceId) -> Result<&DeviceState> {
        (id.0 as usize)
            .checked_sub(1)
            .and_then(|idx| self.devices.get(idx))
            .ok_or(invalid("device", id.0))
    }

    fn context_device(&self, context: ContextId) -> Result<usize> {
        self.contexts
            .get(&context.0)
            .map(|c| c.device)
            .ok_or(invalid("context", context.0))
    }

    /// Run every pending launch on `queue`, in submission order.
    fn drain(&mut self, queue: QueueId) -> Result<()> {
        let pending = {
            let q = self.queues.get_mut(&queue.0).ok_or(invalid("queue", queue.0))?;
            std::mem::take(&mut q.pending)
        };
        for launch in pending {
            self.execute(launch)?;
        }
        Ok(())
    }

    fn execute(&mut self, launch: Launch) -> Result<()> {
        // Each distinct buffer lends its bytes to the launch once, so several
        // pointer arguments can alias the same memory. The table entries stay
        // in place throughout.
        let mut ids: Vec<u64> = Vec::new();
        let mut resolved = Vec::with_capacity(launch.args.len());
        for arg in &launch.args {
            match arg {
                KernelArg::Buffer(id) => {
                    let slot = match ids.iter().position(|b| *b == id.0) {
                        Some(slot) => slot,
                        None => {
                            ids.push(id.0);
                            ids.len() - 1
                        }
                    };
                    resolved.push(Resolved::Memory(slot));
                }
                KernelArg::Scalar(bytes) => resolved.push(Resolved::Scalar(bytes.clone())),
            }
        }
        if let Some(id) = ids.iter().find(|id| !self.buffers.contains_key(id)) {
            return Err(RuntimeError::ExecutionFailed(format!(
                "buffer #{id} was released before the launch ran"
            )));
        }
        let mut memory: Vec<Vec<u8>> = ids
            .iter()
            .map(|id| {
                self.buffers
                    .get_mut(id)
                    .map(|buf| std::mem::take(&mut buf.data))
                    .unwrap_or_default()
            })
            .collect();

        trace!(kernel = %launch.entry.name, global = launch.global, group = launch.group, "executing launch");
        let outcome = launch
            .entry
            .execute(&resolved, &mut memory, launch.global, launch.group);

        for (id, data) in ids.iter().zip(memory) {
            if let Some(buf) = self.buffers.get_mut(id) {
                buf.data = data;
            }
        }
        outcome.map_err(|e| RuntimeError::ExecutionFailed(format!("{}: {e}", launch.entry.name)))
    }
}

// ---------------------------------------------------------------------------
// HostRuntime
// ---------------------------------------------------------------------------

/// A [`ComputeRuntime`] that emulates its devices on the host thread.
pub struct HostRuntime {
    state: Mutex<State>,
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new(vec![DeviceSpec::accelerator(), DeviceSpec::general_purpose()])
    }
}

impl HostRuntime {
    /// Create a runtime exposing `devices` in the given order.
    pub fn new(devices: Vec<DeviceSpec>) -> Self {
        let state = State {
            devices: devices
                .into_iter()
                .map(|spec| DeviceState { spec, allocated: 0 })
                .collect(),
            ..State::default()
        };
        Self { state: Mutex::new(state) }
    }

    /// Number of runtime objects that have not been released yet.
    pub fn live_objects(&self) -> usize {
        let state = self.lock();
        state.contexts.len()
            + state.queues.len()
            + state.programs.len()
            + state.kernels.len()
            + state.buffers.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock means a caller panicked mid-operation. Launches never
        // remove table entries, so every object is still tracked and can be
        // released with its memory accounted for.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ComputeRuntime for HostRuntime {
    fn devices(&self, class: DeviceClass) -> Result<Vec<DeviceId>> {
        let ids: Vec<DeviceId> = self
            .lock()
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.spec.class == class)
            .map(|(idx, _)| DeviceId(idx as u64 + 1))
            .collect();
        if ids.is_empty() {
            return Err(RuntimeError::DeviceNotFound(class));
        }
        Ok(ids)
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        Ok(self.lock().device(device)?.spec.info())
    }

    fn create_context(&self, device: DeviceId) -> Result<ContextId> {
        let mut state = self.lock();
        if !state.device(device)?.spec.available {
            return Err(RuntimeError::DeviceNotAvailable(device));
        }
        let id = state.alloc_id();
        state.contexts.insert(id, ContextObj { device: device.0 as usize - 1 });
        debug!(context = id, %device, "context created");
        Ok(ContextId(id))
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        let mut state = self.lock();
        let ctx_device = state.context_device(context)?;
        state.device(device)?;
        if ctx_device != device.0 as usize - 1 {
            return Err(RuntimeError::InvalidHandle { kind: "device for context", id: device.0 });
        }
        let id = state.alloc_id();
        state.queues.insert(id, QueueObj { pending: VecDeque::new() });
        Ok(QueueId(id))
    }

    fn create_program(&self, context: ContextId, source: &str) -> Result<ProgramId> {
        let mut state = self.lock();
        state.context_device(context)?;
        let id = state.alloc_id();
        state.programs.insert(
            id,
            ProgramObj {
                context: context.0,
                source: source.to_string(),
                state: BuildState::Unbuilt,
                log: String::new(),
            },
        );
        Ok(ProgramId(id))
    }

    fn build_program(&self, program: ProgramId, device: DeviceId) -> Result<()> {
        let mut state = self.lock();
        let ctx = state
            .programs
            .get(&program.0)
            .map(|p| p.context)
            .ok_or(invalid("program", program.0))?;
        let ctx_device = state.context_device(ContextId(ctx))?;
        if ctx_device != device.0 as usize - 1 {
            return Err(RuntimeError::InvalidHandle { kind: "device for program", id: device.0 });
        }
        let Some(prog) = state.programs.get_mut(&program.0) else {
            return Err(invalid("program", program.0));
        };
        match Module::compile(&prog.source) {
            Ok(module) => {
                let names: Vec<&str> = module.entry_names().collect();
                prog.log = format!("build succeeded; kernels: {}", names.join(", "));
                prog.state = BuildState::Built(Arc::new(module));
                Ok(())
            }
            Err(diagnostic) => {
                prog.log = format!("{diagnostic}\n1 error generated.");
                prog.state = BuildState::Failed;
                Err(RuntimeError::BuildProgramFailure)
            }
        }
    }

    fn build_log(&self, program: ProgramId, _device: DeviceId) -> Result<String> {
        self.lock()
            .programs
            .get(&program.0)
            .map(|p| p.log.clone())
            .ok_or(invalid("program", program.0))
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut state = self.lock();
        let prog = state.programs.get(&program.0).ok_or(invalid("program", program.0))?;
        let BuildState::Built(module) = &prog.state else {
            return Err(RuntimeError::InvalidProgramExecutable);
        };
        let entry = module
            .entry(name)
            .ok_or_else(|| RuntimeError::InvalidKernelName(name.to_string()))?;
        let device = state.context_device(ContextId(prog.context))?;
        let id = state.alloc_id();
        let args = vec![None; entry.params.len()];
        state.kernels.insert(id, KernelObj { device, entry, args });
        Ok(KernelId(id))
    }

    fn kernel_arg_count(&self, kernel: KernelId) -> Result<usize> {
        self.lock()
            .kernels
            .get(&kernel.0)
            .map(|k| k.entry.params.len())
            .ok_or(invalid("kernel", kernel.0))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: usize, arg: &KernelArg) -> Result<()> {
        let mut state = self.lock();
        if let KernelArg::Buffer(buf) = arg {
            if !state.buffers.contains_key(&buf.0) {
                return Err(invalid("buffer", buf.0));
            }
        }
        let k = state.kernels.get_mut(&kernel.0).ok_or(invalid("kernel", kernel.0))?;
        let count = k.entry.params.len();
        let param = k
            .entry
            .params
            .get(index)
            .ok_or(RuntimeError::InvalidArgIndex { index, count })?;
        let reason = match (param.ty, arg) {
            (ParamType::GlobalFloatPtr, KernelArg::Buffer(_)) => None,
            (ParamType::GlobalFloatPtr, KernelArg::Scalar(_)) => {
                Some(format!("expected a buffer handle for `{}` ({})", param.name, param.ty))
            }
            (ParamType::Scalar(_), KernelArg::Buffer(_)) => Some(format!(
                "buffer handle bound to by-value parameter `{}` ({})",
                param.name, param.ty
            )),
            (ty, KernelArg::Scalar(bytes)) if bytes.len() != ty.arg_size() => Some(format!(
                "`{}` ({}) takes {} bytes, got {}",
                param.name,
                param.ty,
                ty.arg_size(),
                bytes.len()
            )),
            (ParamType::Scalar(_), KernelArg::Scalar(_)) => None,
        };
        if let Some(reason) = reason {
            return Err(RuntimeError::InvalidArgValue { index, reason });
        }
        k.args[index] = Some(arg.clone());
        Ok(())
    }

    fn create_buffer(&self, context: ContextId, size: usize, access: AccessMode) -> Result<BufferId> {
        let mut state = self.lock();
        let device = state.context_device(context)?;
        if size == 0 {
            return Err(RuntimeError::InvalidBufferSize(size));
        }
        let dev = &mut state.devices[device];
        let available = dev.spec.global_mem_bytes.saturating_sub(dev.allocated);
        if size as u64 > available {
            return Err(RuntimeError::OutOfResources { requested: size as u64, available });
        }
        dev.allocated += size as u64;
        let id = state.alloc_id();
        state.buffers.insert(id, BufferObj { device, size, data: vec![0; size] });
        debug!(buffer = id, size, ?access, "buffer allocated");
        Ok(BufferId(id))
    }

    fn write_buffer(&self, queue: QueueId, buffer: BufferId, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        state.drain(queue)?;
        let buf = state.buffers.get_mut(&buffer.0).ok_or(invalid("buffer", buffer.0))?;
        if data.len() > buf.data.len() {
            return Err(RuntimeError::TransferOutOfBounds { len: data.len(), size: buf.data.len() });
        }
        buf.data[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        let mut state = self.lock();
        state.drain(queue)?;
        let buf = state.buffers.get(&buffer.0).ok_or(invalid("buffer", buffer.0))?;
        if out.len() > buf.data.len() {
            return Err(RuntimeError::TransferOutOfBounds { len: out.len(), size: buf.data.len() });
        }
        out.copy_from_slice(&buf.data[..out.len()]);
        Ok(())
    }

    fn kernel_work_group_size(&self, kernel: KernelId, device: DeviceId) -> Result<usize> {
        let state = self.lock();
        let k = state.kernels.get(&kernel.0).ok_or(invalid("kernel", kernel.0))?;
        let dev = state.device(device)?;
        if k.device != device.0 as usize - 1 {
            return Err(RuntimeError::InvalidHandle { kind: "device for kernel", id: device.0 });
        }
        Ok(dev.spec.max_work_group_size)
    }

    fn enqueue_kernel(&self, queue: QueueId, kernel: KernelId, global: usize, group: usize) -> Result<()> {
        let mut state = self.lock();
        let k = state.kernels.get(&kernel.0).ok_or(invalid("kernel", kernel.0))?;
        let max = state.devices[k.device].spec.max_work_group_size;
        if global == 0 {
            return Err(RuntimeError::InvalidGlobalWorkSize);
        }
        let bad_group = |reason: String| RuntimeError::InvalidWorkGroupSize { global, group, reason };
        if group == 0 {
            return Err(bad_group("group size must be non-zero".into()));
        }
        if group > max {
            return Err(bad_group(format!("exceeds device maximum of {max}")));
        }
        if global % group != 0 {
            return Err(bad_group("global size is not a multiple of the group size".into()));
        }
        let mut args = Vec::with_capacity(k.args.len());
        for (index, arg) in k.args.iter().enumerate() {
            args.push(arg.clone().ok_or(RuntimeError::KernelArgsNotSet(index))?);
        }
        let launch = Launch { entry: Arc::clone(&k.entry), args, global, group };
        state
            .queues
            .get_mut(&queue.0)
            .ok_or(invalid("queue", queue.0))?
            .pending
            .push_back(launch);
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        self.lock().drain(queue)
    }

    fn release(&self, handle: Handle) -> Result<()> {
        let mut state = self.lock();
        let released = match handle {
            Handle::Context(id) => state.contexts.remove(&id.0).is_some(),
            Handle::Queue(id) => state.queues.remove(&id.0).is_some(),
            Handle::Program(id) => state.programs.remove(&id.0).is_some(),
            Handle::Kernel(id) => state.kernels.remove(&id.0).is_some(),
            Handle::Buffer(id) => match state.buffers.remove(&id.0) {
                Some(buf) => {
                    let dev = &mut state.devices[buf.device];
                    dev.allocated = dev.allocated.saturating_sub(buf.size as u64);
                    true
                }
                None => false,
            },
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

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &str = "__kernel void square(__global float* input, __global float* output, \
                          const unsigned long count) { unsigned i = get_global_id(0); \
                          if (i < count) output[i] = input[i] * input[i]; }";

    fn bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    struct Setup {
        rt: HostRuntime,
        device: DeviceId,
        ctx: ContextId,
        queue: QueueId,
        kernel: KernelId,
    }

    fn setup() -> Setup {
        let rt = HostRuntime::default();
        let device = rt.devices(DeviceClass::Accelerator).unwrap()[0];
        let ctx = rt.create_context(device).unwrap();
        let queue = rt.create_queue(ctx, device).unwrap();
        let program = rt.create_program(ctx, SQUARE).unwrap();
        rt.build_program(program, device).unwrap();
        let kernel = rt.create_kernel(program, "square").unwrap();
        rt.release(Handle::Program(program)).unwrap();
        Setup { rt, device, ctx, queue, kernel }
    }

    #[test]
    fn test_device_enumeration_by_class() {
        let rt = HostRuntime::new(vec![DeviceSpec::general_purpose()]);
        assert_eq!(rt.devices(DeviceClass::GeneralPurpose).unwrap().len(), 1);
        assert_eq!(
            rt.devices(DeviceClass::Accelerator),
            Err(RuntimeError::DeviceNotFound(DeviceClass::Accelerator))
        );
    }

    #[test]
    fn test_unavailable_device_refuses_context() {
        let rt = HostRuntime::new(vec![DeviceSpec { available: false, ..DeviceSpec::accelerator() }]);
        let device = rt.devices(DeviceClass::Accelerator).unwrap()[0];
        assert_eq!(rt.create_context(device), Err(RuntimeError::DeviceNotAvailable(device)));
    }

    #[test]
    fn test_launch_is_deferred_until_finish() {
        let s = setup();
        let input = s.rt.create_buffer(s.ctx, 8, AccessMode::ReadOnly).unwrap();
        let output = s.rt.create_buffer(s.ctx, 8, AccessMode::WriteOnly).unwrap();
        s.rt.write_buffer(s.queue, input, &bytes(&[3.0, 4.0])).unwrap();
        s.rt.set_kernel_arg(s.kernel, 0, &KernelArg::Buffer(input)).unwrap();
        s.rt.set_kernel_arg(s.kernel, 1, &KernelArg::Buffer(output)).unwrap();
        s.rt.set_kernel_arg(s.kernel, 2, &KernelArg::Scalar(2u64.to_ne_bytes().to_vec())).unwrap();
        s.rt.enqueue_kernel(s.queue, s.kernel, 2, 2).unwrap();

        // Still pending: the output buffer has not been touched.
        assert_eq!(s.rt.lock().buffers[&output.0].data, vec![0u8; 8]);
        s.rt.finish(s.queue).unwrap();

        let mut out = vec![0u8; 8];
        s.rt.read_buffer(s.queue, output, &mut out).unwrap();
        assert_eq!(out, bytes(&[9.0, 16.0]));
    }

    #[test]
    fn test_arg_validation() {
        let s = setup();
        let buf = s.rt.create_buffer(s.ctx, 4, AccessMode::ReadOnly).unwrap();
        assert_eq!(
            s.rt.set_kernel_arg(s.kernel, 3, &KernelArg::Buffer(buf)),
            Err(RuntimeError::InvalidArgIndex { index: 3, count: 3 })
        );
        assert!(matches!(
            s.rt.set_kernel_arg(s.kernel, 2, &KernelArg::Scalar(vec![0; 4])),
            Err(RuntimeError::InvalidArgValue { index: 2, .. })
        ));
        assert!(matches!(
            s.rt.set_kernel_arg(s.kernel, 2, &KernelArg::Buffer(buf)),
            Err(RuntimeError::InvalidArgValue { index: 2, .. })
        ));
        assert!(matches!(
            s.rt.set_kernel_arg(s.kernel, 0, &KernelArg::Scalar(vec![0; 8])),
            Err(RuntimeError::InvalidArgValue { index: 0, .. })
        ));
    }

    #[test]
    fn test_enqueue_rejects_bad_partition_and_unset_args() {
        let s = setup();
        assert_eq!(
            s.rt.enqueue_kernel(s.queue, s.kernel, 8, 4),
            Err(RuntimeError::KernelArgsNotSet(0))
        );
        assert!(matches!(
            s.rt.enqueue_kernel(s.queue, s.kernel, 10, 4),
            Err(RuntimeError::InvalidWorkGroupSize { .. })
        ));
        assert!(matches!(
            s.rt.enqueue_kernel(s.queue, s.kernel, 1024, 512),
            Err(RuntimeError::InvalidWorkGroupSize { .. })
        ));
        assert_eq!(s.rt.kernel_work_group_size(s.kernel, s.device), Ok(256));
    }

    #[test]
    fn test_allocation_limits_and_release_accounting() {
        let rt = HostRuntime::new(vec![DeviceSpec { global_mem_bytes: 16, ..DeviceSpec::accelerator() }]);
        let device = rt.devices(DeviceClass::Accelerator).unwrap()[0];
        let ctx = rt.create_context(device).unwrap();
        assert_eq!(rt.create_buffer(ctx, 0, AccessMode::ReadOnly), Err(RuntimeError::InvalidBufferSize(0)));
        let a = rt.create_buffer(ctx, 12, AccessMode::ReadOnly).unwrap();
        assert!(matches!(
            rt.create_buffer(ctx, 8, AccessMode::WriteOnly),
            Err(RuntimeError::OutOfResources { requested: 8, available: 4 })
        ));
        rt.release(Handle::Buffer(a)).unwrap();
        let b = rt.create_buffer(ctx, 16, AccessMode::WriteOnly).unwrap();
        rt.release(Handle::Buffer(b)).unwrap();
        rt.release(Handle::Context(ctx)).unwrap();
        assert_eq!(rt.live_objects(), 0);
        assert!(rt.release(Handle::Context(ctx)).is_err());
    }

    #[test]
    fn test_build_failure_keeps_log_and_blocks_kernel() {
        let rt = HostRuntime::default();
        let device = rt.devices(DeviceClass::Accelerator).unwrap()[0];
        let ctx = rt.create_context(device).unwrap();
        let program = rt.create_program(ctx, "__kernel void square(__global float* a) { a[0] = }").unwrap();
        assert_eq!(rt.build_program(program, device), Err(RuntimeError::BuildProgramFailure));
        let log = rt.build_log(program, device).unwrap();
        assert!(log.contains("error: expected expression"));
        assert_eq!(rt.create_kernel(program, "square"), Err(RuntimeError::InvalidProgramExecutable));
    }
}
