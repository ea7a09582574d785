//! Compute runtime boundary.
//!
//! The dispatch pipeline drives a device runtime exclusively through the
//! [`ComputeRuntime`] trait: device enumeration, context/queue creation,
//! program compilation, kernel argument binding, buffer transfers, 1-D
//! launches and queue draining. Handles are opaque runtime-assigned ids.
//!
//! [`host::HostRuntime`] is the built-in implementation that emulates a
//! device on the calling thread; [`fault::FaultInjector`] wraps any runtime
//! to fail a chosen operation. With the `opencl` feature,
//! [`opencl::OpenClRuntime`] drives the installed OpenCL driver instead.

pub mod fault;
pub mod host;
mod lang;
#[cfg(feature = "opencl")]
pub mod opencl;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fault::FaultInjector;
pub use host::{DeviceSpec, HostRuntime};
#[cfg(feature = "opencl")]
pub use opencl::OpenClRuntime;

/// Convenience alias for runtime results.
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported by a compute runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("no device of class {0} found")]
    DeviceNotFound(DeviceClass),

    #[error("device {0} is not available")]
    DeviceNotAvailable(DeviceId),

    #[error("invalid {kind} handle #{id}")]
    InvalidHandle { kind: &'static str, id: u64 },

    #[error("program build failure")]
    BuildProgramFailure,

    #[error("program is not built for its device")]
    InvalidProgramExecutable,

    #[error("no kernel named `{0}` in program")]
    InvalidKernelName(String),

    #[error("argument index {index} out of range (kernel takes {count})")]
    InvalidArgIndex { index: usize, count: usize },

    #[error("argument {index}: {reason}")]
    InvalidArgValue { index: usize, reason: String },

    #[error("invalid buffer size {0}")]
    InvalidBufferSize(usize),

    #[error("out of device memory: requested {requested} B, {available} B free")]
    OutOfResources { requested: u64, available: u64 },

    #[error("transfer of {len} B exceeds buffer of {size} B")]
    TransferOutOfBounds { len: usize, size: usize },

    #[error("invalid work-group size {group} for global size {global}: {reason}")]
    InvalidWorkGroupSize {
        global: usize,
        group: usize,
        reason: String,
    },

    #[error("global work size must be non-zero")]
    InvalidGlobalWorkSize,

    #[error("kernel argument {0} is not set")]
    KernelArgsNotSet(usize),

    #[error("driver call failed: {0}")]
    Driver(String),

    #[error("kernel execution failed: {0}")]
    ExecutionFailed(String),

    #[error("injected fault in {0}")]
    Injected(RuntimeOp),
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Raw runtime-assigned id.
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "#{}", self.0)
            }
        }
    };
}

handle!(
    /// A compute device.
    DeviceId
);
handle!(
    /// A session bound to one device.
    ContextId
);
handle!(
    /// An in-order command queue.
    QueueId
);
handle!(
    /// A program object (source plus build state).
    ProgramId
);
handle!(
    /// A kernel entry point extracted from a built program.
    KernelId
);
handle!(
    /// A device-resident memory region.
    BufferId
);

/// Any releasable runtime object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Handle {
    Context(ContextId),
    Queue(QueueId),
    Program(ProgramId),
    Kernel(KernelId),
    Buffer(BufferId),
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Context(id) => write!(f, "context {id}"),
            Handle::Queue(id) => write!(f, "queue {id}"),
            Handle::Program(id) => write!(f, "program {id}"),
            Handle::Kernel(id) => write!(f, "kernel {id}"),
            Handle::Buffer(id) => write!(f, "buffer {id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Device description
// ---------------------------------------------------------------------------

/// Requested device capability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    /// Dedicated parallel accelerator (GPU-like).
    Accelerator,
    /// General-purpose processor.
    GeneralPurpose,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Accelerator => write!(f, "accelerator"),
            DeviceClass::GeneralPurpose => write!(f, "general-purpose"),
        }
    }
}

/// Properties reported for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub class: DeviceClass,
    pub max_work_group_size: usize,
    pub global_mem_bytes: u64,
    pub compute_units: u32,
    /// Unavailable devices are listed but refuse context creation.
    pub available: bool,
}

/// Kernel-side access mode of a buffer, fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessMode {
    /// Written by the host, read by the kernel.
    ReadOnly,
    /// Written by the kernel, read by the host.
    WriteOnly,
}

/// A value bound to a kernel parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    /// A device buffer handle, for `__global` pointer parameters.
    Buffer(BufferId),
    /// Raw bytes of a by-value parameter, in native byte order.
    Scalar(Vec<u8>),
}

/// Runtime operations, used to journal and inject faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeOp {
    QueryDevices,
    DeviceInfo,
    CreateContext,
    CreateQueue,
    CreateProgram,
    BuildProgram,
    BuildLog,
    CreateKernel,
    KernelArgCount,
    SetKernelArg,
    CreateBuffer,
    WriteBuffer,
    ReadBuffer,
    QueryWorkGroupSize,
    EnqueueKernel,
    Finish,
    Release,
}

impl fmt::Display for RuntimeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeOp::QueryDevices => "query-devices",
            RuntimeOp::DeviceInfo => "device-info",
            RuntimeOp::CreateContext => "create-context",
            RuntimeOp::CreateQueue => "create-queue",
            RuntimeOp::CreateProgram => "create-program",
            RuntimeOp::BuildProgram => "build-program",
            RuntimeOp::BuildLog => "build-log",
            RuntimeOp::CreateKernel => "create-kernel",
            RuntimeOp::KernelArgCount => "kernel-arg-count",
            RuntimeOp::SetKernelArg => "set-kernel-arg",
            RuntimeOp::CreateBuffer => "create-buffer",
            RuntimeOp::WriteBuffer => "write-buffer",
            RuntimeOp::ReadBuffer => "read-buffer",
            RuntimeOp::QueryWorkGroupSize => "query-work-group-size",
            RuntimeOp::EnqueueKernel => "enqueue-kernel",
            RuntimeOp::Finish => "finish",
            RuntimeOp::Release => "release",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Runtime contract
// ---------------------------------------------------------------------------

/// The device-management and execution service the pipeline drives.
///
/// Every call is synchronous. Transfers block until complete; kernel
/// launches may be deferred until [`ComputeRuntime::finish`] or the next
/// blocking transfer on the same queue.
pub trait ComputeRuntime: Send + Sync {
    /// Enumerate devices of the given class, in runtime order.
    fn devices(&self, class: DeviceClass) -> Result<Vec<DeviceId>>;

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo>;

    fn create_context(&self, device: DeviceId) -> Result<ContextId>;

    /// Create an in-order queue on `context` targeting `device`.
    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId>;

    fn create_program(&self, context: ContextId, source: &str) -> Result<ProgramId>;

    /// Compile `program` for `device`. Diagnostics are available from
    /// [`ComputeRuntime::build_log`] whether or not the build succeeds.
    fn build_program(&self, program: ProgramId, device: DeviceId) -> Result<()>;

    fn build_log(&self, program: ProgramId, device: DeviceId) -> Result<String>;

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId>;

    /// Number of formal parameters declared by the kernel.
    fn kernel_arg_count(&self, kernel: KernelId) -> Result<usize>;

    fn set_kernel_arg(&self, kernel: KernelId, index: usize, arg: &KernelArg) -> Result<()>;

    fn create_buffer(&self, context: ContextId, size: usize, access: AccessMode) -> Result<BufferId>;

    /// Blocking host-to-device copy into the start of `buffer`.
    fn write_buffer(&self, queue: QueueId, buffer: BufferId, data: &[u8]) -> Result<()>;

    /// Blocking device-to-host copy from the start of `buffer`.
    fn read_buffer(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<()>;

    /// Largest work-group size usable for `kernel` on `device`.
    fn kernel_work_group_size(&self, kernel: KernelId, device: DeviceId) -> Result<usize>;

    /// Submit a 1-D launch of `global` work-items in groups of `group`.
    fn enqueue_kernel(&self, queue: QueueId, kernel: KernelId, global: usize, group: usize)
        -> Result<()>;

    /// Block until every operation submitted to `queue` has retired.
    fn finish(&self, queue: QueueId) -> Result<()>;

    fn release(&self, handle: Handle) -> Result<()>;
}

impl<R: ComputeRuntime + ?Sized> ComputeRuntime for Box<R> {
    fn devices(&self, class: DeviceClass) -> Result<Vec<DeviceId>> {
        (**self).devices(class)
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        (**self).device_info(device)
    }

    fn create_context(&self, device: DeviceId) -> Result<ContextId> {
        (**self).create_context(device)
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        (**self).create_queue(context, device)
    }

    fn create_program(&self, context: ContextId, source: &str) -> Result<ProgramId> {
        (**self).create_program(context, source)
    }

    fn build_program(&self, program: ProgramId, device: DeviceId) -> Result<()> {
        (**self).build_program(program, device)
    }

    fn build_log(&self, program: ProgramId, device: DeviceId) -> Result<String> {
        (**self).build_log(program, device)
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        (**self).create_kernel(program, name)
    }

    fn kernel_arg_count(&self, kernel: KernelId) -> Result<usize> {
        (**self).kernel_arg_count(kernel)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: usize, arg: &KernelArg) -> Result<()> {
        (**self).set_kernel_arg(kernel, index, arg)
    }

    fn create_buffer(&self, context: ContextId, size: usize, access: AccessMode) -> Result<BufferId> {
        (**self).create_buffer(context, size, access)
    }

    fn write_buffer(&self, queue: QueueId, buffer: BufferId, data: &[u8]) -> Result<()> {
        (**self).write_buffer(queue, buffer, data)
    }

    fn read_buffer(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        (**self).read_buffer(queue, buffer, out)
    }

    fn kernel_work_group_size(&self, kernel: KernelId, device: DeviceId) -> Result<usize> {
        (**self).kernel_work_group_size(kernel, device)
    }

    fn enqueue_kernel(&self, queue: QueueId, kernel: KernelId, global: usize, group: usize)
        -> Result<()> {
        (**self).enqueue_kernel(queue, kernel, global, group)
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        (**self).finish(queue)
    }

    fn release(&self, handle: Handle) -> Result<()> {
        (**self).release(handle)
    }
}

/// Every device `runtime` exposes, accelerators first. A class with no
/// devices, or a device whose info cannot be read, is skipped.
pub fn enumerate(runtime: &dyn ComputeRuntime) -> Vec<(DeviceId, DeviceInfo)> {
    [DeviceClass::Accelerator, DeviceClass::GeneralPurpose]
        .into_iter()
        .flat_map(|class| runtime.devices(class).unwrap_or_default())
        .filter_map(|id| runtime.device_info(id).ok().map(|info| (id, info)))
        .collect()
}
