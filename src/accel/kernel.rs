//! Kernel binder: extract an entry point and bind its arguments by index.

use tracing::{debug, info};

use crate::accel::{release, Context, DeviceBuffer, PipelineError, Program};
use crate::runtime::{AccessMode, Handle, KernelArg, KernelId};

/// A by-value kernel argument.
pub trait ScalarArg: Copy {
    fn to_arg_bytes(self) -> Vec<u8>;
}

macro_rules! scalar_arg {
    ($($ty:ty),*) => {
        $(impl ScalarArg for $ty {
            fn to_arg_bytes(self) -> Vec<u8> {
                self.to_ne_bytes().to_vec()
            }
        })*
    };
}

scalar_arg!(u32, u64, i32, i64, f32);

/// An invocable entry point plus its bound-argument table.
pub struct Kernel<'c> {
    context: &'c Context<'c>,
    id: KernelId,
    name: String,
    bound: Vec<Option<KernelArg>>,
}

impl<'c> Kernel<'c> {
    /// Extract the entry point called `name` from a built program.
    pub fn extract(program: &Program<'c>, name: &str) -> Result<Self, PipelineError> {
        let context = program.context();
        let runtime = context.runtime();
        let not_found = |source| PipelineError::KernelNotFound { name: name.to_string(), source };

        let id = runtime.create_kernel(program.id(), name).map_err(not_found)?;
        let mut kernel = Self { context, id, name: name.to_string(), bound: Vec::new() };
        let params = runtime.kernel_arg_count(id).map_err(not_found)?;
        kernel.bound = vec![None; params];

        info!(kernel = %name, params, "kernel extracted");
        Ok(kernel)
    }

    /// Bind `arg` to parameter `index`, replacing any earlier binding.
    pub fn bind(&mut self, index: usize, arg: KernelArg) -> Result<(), PipelineError> {
        if index >= self.bound.len() {
            return Err(PipelineError::InvalidArgument {
                index,
                reason: format!("kernel `{}` takes {} arguments", self.name, self.bound.len()),
            });
        }
        self.context
            .runtime()
            .set_kernel_arg(self.id, index, &arg)
            .map_err(|e| PipelineError::InvalidArgument { index, reason: e.to_string() })?;
        debug!(kernel = %self.name, index, ?arg, "argument bound");
        self.bound[index] = Some(arg);
        Ok(())
    }

    /// Bind a device buffer. Read-only inputs must already hold data.
    pub fn bind_buffer(&mut self, index: usize, buffer: &DeviceBuffer<'_>) -> Result<(), PipelineError> {
        if buffer.access() == AccessMode::ReadOnly && !buffer.is_populated() {
            return Err(PipelineError::InvalidArgument {
                index,
                reason: format!("input buffer {} bound before it was written", buffer.id()),
            });
        }
        self.bind(index, KernelArg::Buffer(buffer.id()))
    }

    pub fn bind_scalar<T: ScalarArg>(&mut self, index: usize, value: T) -> Result<(), PipelineError> {
        self.bind(index, KernelArg::Scalar(value.to_arg_bytes()))
    }

    /// First parameter index without a binding, if any.
    pub fn unbound_index(&self) -> Option<usize> {
        self.bound.iter().position(Option::is_none)
    }

    pub fn binding(&self, index: usize) -> Option<&KernelArg> {
        self.bound.get(index).and_then(Option::as_ref)
    }

    pub fn arg_count(&self) -> usize {
        self.bound.len()
    }

    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &'c Context<'c> {
        self.context
    }
}

impl Drop for Kernel<'_> {
    fn drop(&mut self) {
        release(self.context.runtime(), Handle::Kernel(self.id));
    }
}
