use tracing::{info, warn};

use crate::accel::PipelineError;
use crate::runtime::{ComputeRuntime, DeviceClass, DeviceId, DeviceInfo, RuntimeError};

/// A selected compute device. Devices are never released.
pub struct Device<'rt> {
    runtime: &'rt dyn ComputeRuntime,
    id: DeviceId,
    info: DeviceInfo,
}

impl<'rt> Device<'rt> {
    /// Pick the first device of `class` the runtime enumerates.
    pub fn select(runtime: &'rt dyn ComputeRuntime, class: DeviceClass) -> Result<Self, PipelineError> {
        let unavailable = |e: RuntimeError| {
            warn!(%class, error = %e, "device query failed");
            PipelineError::NoDeviceAvailable { class }
        };
        let ids = runtime.devices(class).map_err(unavailable)?;
        let id = ids
            .first()
            .copied()
            .ok_or(PipelineError::NoDeviceAvailable { class })?;
        let info = runtime.device_info(id).map_err(unavailable)?;

        info!(
            device = %info.name,
            %class,
            max_work_group_size = info.max_work_group_size,
            "selected compute device"
        );
        Ok(Self { runtime, id, info })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn runtime(&self) -> &'rt dyn ComputeRuntime {
        self.runtime
    }
}
