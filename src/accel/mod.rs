//! Acceleration pipeline -- device selection, program build, buffer staging,
//! kernel dispatch and result verification.
//!
//! Every runtime object is wrapped in a scoped guard that releases it on
//! drop, and child objects borrow their [`Context`], so a failed stage
//! unwinds everything acquired before it in reverse order.

pub mod buffer;
pub mod context;
pub mod cpu;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod manager;
pub mod ops;
pub mod program;

use tracing::{debug, warn};

use crate::runtime::{ComputeRuntime, DeviceClass, Handle};

pub use buffer::DeviceBuffer;
pub use context::{CommandQueue, Context};
pub use device::Device;
pub use dispatch::WorkPartition;
pub use error::{Direction, PipelineError, Stage};
pub use kernel::Kernel;
pub use manager::{AccelerationPipeline, PipelineSettings, RunOutcome};
pub use ops::SquareOp;
pub use program::Program;

/// Summary of one completed pipeline run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub run_id: uuid::Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub device: String,
    pub device_class: DeviceClass,
    pub count: usize,
    pub correct: usize,
    pub global_size: usize,
    pub group_size: usize,
    pub duration_us: u64,
}

impl RunReport {
    pub fn all_correct(&self) -> bool {
        self.correct == self.count
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Computed {}/{} correct values!", self.correct, self.count)
    }
}

/// Release a runtime object, logging instead of failing: releases happen
/// from `Drop` and have nowhere to report to.
pub(crate) fn release(runtime: &dyn ComputeRuntime, handle: Handle) {
    match runtime.release(handle) {
        Ok(()) => debug!(%handle, "released"),
        Err(e) => warn!(%handle, error = %e, "failed to release runtime object"),
    }
}
