//! Dispatcher: 1-D work partitioning, kernel submission and queue drain.

use tracing::{debug, info};

use crate::accel::{CommandQueue, Kernel, PipelineError};

/// A 1-D launch shape: `global` work-items in groups of `group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WorkPartition {
    global: usize,
    group: usize,
}

impl WorkPartition {
    /// Partition `count` elements into groups of `group`, padding the global
    /// size up to the next multiple. The padded work-items rely on the kernel
    /// guarding its writes with the element count. `None` if `group` is zero
    /// or the padded size overflows.
    pub fn padded(count: usize, group: usize) -> Option<Self> {
        if group == 0 {
            return None;
        }
        let global = count.checked_next_multiple_of(group)?;
        Some(Self { global, group })
    }

    /// An explicit launch shape. Nothing is checked until [`dispatch`].
    pub fn new(global: usize, group: usize) -> Self {
        Self { global, group }
    }

    pub fn global(&self) -> usize {
        self.global
    }

    pub fn group(&self) -> usize {
        self.group
    }

    /// Number of work-groups, for valid partitions.
    pub fn groups(&self) -> Option<usize> {
        self.is_valid().then(|| self.global / self.group)
    }

    /// Whether `group` is non-zero and evenly divides `global`.
    pub fn is_valid(&self) -> bool {
        self.group != 0 && self.global % self.group == 0
    }
}

/// Largest work-group size the runtime allows for `kernel` on its device.
pub fn preferred_group_size(kernel: &Kernel<'_>) -> Result<usize, PipelineError> {
    let context = kernel.context();
    let size = context
        .runtime()
        .kernel_work_group_size(kernel.id(), context.device())
        .map_err(PipelineError::QueryFailed)?;
    debug!(kernel = %kernel.name(), size, "preferred work-group size");
    Ok(size)
}

/// Submit `kernel` over `partition`. Unbound arguments and non-dividing
/// partitions are rejected before anything reaches the runtime.
pub fn dispatch(queue: &CommandQueue<'_>, kernel: &Kernel<'_>, partition: WorkPartition) -> Result<(), PipelineError> {
    if let Some(index) = kernel.unbound_index() {
        return Err(PipelineError::LaunchFailed {
            reason: format!("argument {index} of `{}` is not bound", kernel.name()),
        });
    }
    if !partition.is_valid() {
        return Err(PipelineError::LaunchFailed {
            reason: format!(
                "global size {} is not a multiple of group size {}",
                partition.global, partition.group
            ),
        });
    }
    kernel
        .context()
        .runtime()
        .enqueue_kernel(queue.id(), kernel.id(), partition.global, partition.group)
        .map_err(|e| PipelineError::LaunchFailed { reason: e.to_string() })?;
    info!(
        kernel = %kernel.name(),
        global = partition.global,
        group = partition.group,
        "kernel dispatched"
    );
    Ok(())
}

/// Block until everything submitted to `queue` has retired. Execution
/// faults of earlier launches surface here.
pub fn wait(queue: &CommandQueue<'_>) -> Result<(), PipelineError> {
    queue
        .context()
        .runtime()
        .finish(queue.id())
        .map_err(|e| PipelineError::LaunchFailed { reason: e.to_string() })?;
    debug!(queue = %queue.id(), "queue drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_partition() {
        let p = WorkPartition::padded(1000, 256).unwrap();
        assert_eq!((p.global(), p.group(), p.groups()), (1024, 256, Some(4)));
        let p = WorkPartition::padded(1024, 256).unwrap();
        assert_eq!(p.global(), 1024);
        assert_eq!(WorkPartition::padded(4, 0), None);
        assert_eq!(WorkPartition::padded(usize::MAX, 2), None);
    }

    #[test]
    fn test_manual_partition_validity() {
        assert!(WorkPartition::new(12, 4).is_valid());
        assert!(!WorkPartition::new(10, 4).is_valid());
        assert!(!WorkPartition::new(10, 0).is_valid());
        assert_eq!(WorkPartition::new(10, 4).groups(), None);
    }
}
