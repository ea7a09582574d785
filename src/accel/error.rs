use std::fmt;

use thiserror::Error;

use crate::runtime::{DeviceClass, RuntimeError};

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Stage {
    DeviceSelection,
    ContextCreation,
    QueueCreation,
    ProgramBuild,
    KernelExtraction,
    ArgumentBinding,
    BufferAllocation,
    Transfer,
    WorkGroupQuery,
    Launch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::DeviceSelection => "device selection",
            Stage::ContextCreation => "context creation",
            Stage::QueueCreation => "queue creation",
            Stage::ProgramBuild => "program build",
            Stage::KernelExtraction => "kernel extraction",
            Stage::ArgumentBinding => "argument binding",
            Stage::BufferAllocation => "buffer allocation",
            Stage::Transfer => "transfer",
            Stage::WorkGroupQuery => "work-group query",
            Stage::Launch => "launch",
        };
        f.write_str(name)
    }
}

/// Direction of a buffer transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::HostToDevice => f.write_str("host to device"),
            Direction::DeviceToHost => f.write_str("device to host"),
        }
    }
}

/// Fatal dispatch pipeline errors, one per stage. None are retried.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no {class} device available")]
    NoDeviceAvailable { class: DeviceClass },

    #[error("failed to create a compute context")]
    ContextCreationFailed(#[source] RuntimeError),

    #[error("failed to create a command queue")]
    QueueCreationFailed(#[source] RuntimeError),

    /// `log` holds the compiler diagnostics, bounded to
    /// [`super::program::BUILD_LOG_LIMIT`] bytes.
    #[error("failed to build program executable")]
    BuildFailed { log: String },

    #[error("failed to create kernel `{name}`")]
    KernelNotFound {
        name: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to set kernel argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: String },

    #[error("failed to allocate {size} bytes of device memory")]
    AllocationFailed {
        size: usize,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to transfer {direction}: {reason}")]
    TransferFailed { direction: Direction, reason: String },

    #[error("failed to retrieve kernel work-group info")]
    QueryFailed(#[source] RuntimeError),

    #[error("failed to execute kernel: {reason}")]
    LaunchFailed { reason: String },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::NoDeviceAvailable { .. } => Stage::DeviceSelection,
            PipelineError::ContextCreationFailed(_) => Stage::ContextCreation,
            PipelineError::QueueCreationFailed(_) => Stage::QueueCreation,
            PipelineError::BuildFailed { .. } => Stage::ProgramBuild,
            PipelineError::KernelNotFound { .. } => Stage::KernelExtraction,
            PipelineError::InvalidArgument { .. } => Stage::ArgumentBinding,
            PipelineError::AllocationFailed { .. } => Stage::BufferAllocation,
            PipelineError::TransferFailed { .. } => Stage::Transfer,
            PipelineError::QueryFailed(_) => Stage::WorkGroupQuery,
            PipelineError::LaunchFailed { .. } => Stage::Launch,
        }
    }
}
