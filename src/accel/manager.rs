use std::time::Instant;

use tracing::{info, warn};

use crate::accel::{
    cpu, dispatch, ops, Context, Device, DeviceBuffer, Kernel, PipelineError, Program, RunReport,
    SquareOp, WorkPartition,
};
use crate::runtime::{AccessMode, ComputeRuntime, DeviceClass};

/// What to run and where.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub device_class: DeviceClass,
    pub kernel_name: String,
    pub kernel_source: String,
    /// Work-group size override; queried from the runtime when `None`.
    pub group_size: Option<usize>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            device_class: DeviceClass::Accelerator,
            kernel_name: ops::SQUARE_KERNEL_NAME.to_string(),
            kernel_source: ops::SQUARE_KERNEL_SOURCE.to_string(),
            group_size: None,
        }
    }
}

/// Result of a successful run: device output plus summary.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub output: Vec<f32>,
    pub report: RunReport,
}

/// Drives one synchronous single-kernel, single-device dispatch.
pub struct AccelerationPipeline<'rt> {
    runtime: &'rt dyn ComputeRuntime,
    settings: PipelineSettings,
}

impl<'rt> AccelerationPipeline<'rt> {
    pub fn new(runtime: &'rt dyn ComputeRuntime, settings: PipelineSettings) -> Self {
        info!(
            class = %settings.device_class,
            kernel = %settings.kernel_name,
            group_size = ?settings.group_size,
            "AccelerationPipeline initialized"
        );
        Self { runtime, settings }
    }

    /// Square `input` on the device and verify it against the scalar
    /// reference.
    ///
    /// Any stage failure returns immediately; every runtime object acquired
    /// so far is released in reverse acquisition order as its guard drops.
    pub fn run(&self, input: &[f32]) -> Result<RunOutcome, PipelineError> {
        let started_at = chrono::Utc::now();
        let clock = Instant::now();
        let count = input.len();

        let device = Device::select(self.runtime, self.settings.device_class)?;
        let context = Context::create(&device)?;
        let queue = context.create_queue()?;

        let mut kernel = {
            let program = Program::build(&context, &self.settings.kernel_source)?;
            Kernel::extract(&program, &self.settings.kernel_name)?
        };

        let mut input_buf = DeviceBuffer::for_f32(&context, count, AccessMode::ReadOnly)?;
        let output_buf = DeviceBuffer::for_f32(&context, count, AccessMode::WriteOnly)?;
        input_buf.write(&queue, input)?;
        SquareOp::bind(&mut kernel, &input_buf, &output_buf, count)?;

        let group = match self.settings.group_size {
            Some(group) => group,
            None => dispatch::preferred_group_size(&kernel)?,
        };
        let partition = WorkPartition::padded(count, group).ok_or_else(|| PipelineError::LaunchFailed {
            reason: format!("cannot partition {count} work-items into groups of {group}"),
        })?;
        dispatch::dispatch(&queue, &kernel, partition)?;
        dispatch::wait(&queue)?;

        let mut output = vec![0.0f32; count];
        output_buf.read(&queue, &mut output)?;

        let expected = cpu::square_reference(input);
        let correct = cpu::count_exact_matches(&expected, &output);
        if correct != count {
            warn!(
                correct,
                count,
                "Acceleration mismatch! Device produced values that differ from the scalar reference."
            );
        } else {
            info!(count, "verification passed");
        }

        let report = RunReport {
            run_id: uuid::Uuid::new_v4(),
            started_at,
            device: device.info().name.clone(),
            device_class: device.info().class,
            count,
            correct,
            global_size: partition.global(),
            group_size: partition.group(),
            duration_us: u64::try_from(clock.elapsed().as_micros()).unwrap_or(u64::MAX),
        };
        Ok(RunOutcome { output, report })
    }
}
