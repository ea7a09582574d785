use crate::accel::{DeviceBuffer, Kernel, PipelineError};

/// Entry point name of the built-in square kernel.
pub const SQUARE_KERNEL_NAME: &str = "square";

/// OpenCL C source of the built-in square kernel. The `count` guard lets
/// the dispatcher pad the global size to a multiple of the group size.
pub const SQUARE_KERNEL_SOURCE: &str = r#"__kernel void square(__global float* input,
                     __global float* output,
                     const unsigned long count) {
    unsigned i = get_global_id(0);
    if (i < count)
        output[i] = input[i] * input[i];
}
"#;

/// Binding layout of the square kernel. Parameter order is fixed by the
/// kernel source; changing one means changing the other.
pub struct SquareOp;

impl SquareOp {
    pub const INPUT: usize = 0;
    pub const OUTPUT: usize = 1;
    pub const COUNT: usize = 2;

    /// Bind every argument, stopping at the first one that fails.
    pub fn bind(
        kernel: &mut Kernel<'_>,
        input: &DeviceBuffer<'_>,
        output: &DeviceBuffer<'_>,
        count: usize,
    ) -> Result<(), PipelineError> {
        kernel.bind_buffer(Self::INPUT, input)?;
        kernel.bind_buffer(Self::OUTPUT, output)?;
        kernel.bind_scalar(Self::COUNT, count as u64)?;
        Ok(())
    }
}
