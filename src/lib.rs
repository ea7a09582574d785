//! kernelpipe -- a single-kernel compute dispatch pipeline.
//!
//! Squares a vector of floats on a compute device through an OpenCL-style
//! runtime boundary and verifies the result against a scalar reference.

pub mod accel;
pub mod config;
pub mod input;
pub mod runtime;

pub use accel::{AccelerationPipeline, PipelineError, PipelineSettings, RunOutcome, RunReport};
pub use config::PipelineConfig;
pub use runtime::{ComputeRuntime, FaultInjector, HostRuntime};
