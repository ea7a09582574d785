//! TOML configuration for kernelpipe.
//!
//! Lookup order: an explicit path, then `KERNELPIPE_CONFIG`, then
//! `/etc/kernelpipe/kernelpipe.toml`, then compiled-in defaults. Every
//! section is optional and missing keys take their defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accel::{ops, PipelineSettings};
use crate::runtime::{ComputeRuntime, DeviceClass, DeviceSpec, HostRuntime};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "KERNELPIPE_CONFIG";

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/kernelpipe/kernelpipe.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    /// Resolve configuration. An explicit `path` must load; the environment
    /// and system locations fall through to defaults with a warning.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Try `KERNELPIPE_CONFIG`, then the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "KERNELPIPE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Pipeline settings described by this config. Reads the kernel source
    /// file when one is configured.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        let kernel_source = match &self.kernel.source_path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read kernel source: {}", path.display()))?,
            None => ops::SQUARE_KERNEL_SOURCE.to_string(),
        };
        Ok(PipelineSettings {
            device_class: self.device.class,
            kernel_name: self.kernel.name.clone(),
            kernel_source,
            group_size: self.dispatch.group_size,
        })
    }

    /// A host runtime exposing the configured devices.
    pub fn host_runtime(&self) -> HostRuntime {
        HostRuntime::new(self.runtime.devices.clone())
    }

    /// The runtime selected by `[runtime] backend`.
    pub fn compute_runtime(&self) -> Result<Box<dyn ComputeRuntime>> {
        match self.runtime.backend {
            Backend::Host => Ok(Box::new(self.host_runtime())),
            #[cfg(feature = "opencl")]
            Backend::OpenCl => Ok(Box::new(crate::runtime::OpenClRuntime::new())),
            #[cfg(not(feature = "opencl"))]
            Backend::OpenCl => {
                anyhow::bail!("the opencl backend is not compiled in; rebuild with `--features opencl`")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device class the pipeline runs on.
    pub class: DeviceClass,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { class: DeviceClass::Accelerator }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Entry point to extract from the program.
    pub name: String,
    /// OpenCL C file replacing the built-in square kernel.
    pub source_path: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: ops::SQUARE_KERNEL_NAME.to_string(),
            source_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Number of elements to square.
    pub count: usize,
    /// Seed for the input generator; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { count: 1024, seed: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Work-group size override.
    pub group_size: Option<usize>,
}

/// Which [`ComputeRuntime`] executes the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Built-in host emulation.
    #[default]
    Host,
    /// The system OpenCL driver (requires the `opencl` feature).
    #[serde(rename = "opencl")]
    OpenCl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: Backend,
    /// Devices exposed by the host runtime. Ignored by the opencl backend.
    pub devices: Vec<DeviceSpec>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Host,
            devices: vec![DeviceSpec::accelerator(), DeviceSpec::general_purpose()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit log lines as JSON.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.device.class, DeviceClass::Accelerator);
        assert_eq!(cfg.kernel.name, "square");
        assert!(cfg.kernel.source_path.is_none());
        assert_eq!(cfg.data.count, 1024);
        assert!(cfg.data.seed.is_none());
        assert!(cfg.dispatch.group_size.is_none());
        assert_eq!(cfg.runtime.backend, Backend::Host);
        assert_eq!(cfg.runtime.devices.len(), 2);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[device]
class = "general-purpose"

[kernel]
name = "square"

[data]
count = 4096
seed = 7

[dispatch]
group_size = 64

[[runtime.devices]]
name = "Test CPU"
class = "general-purpose"
max_work_group_size = 128

[logging]
level = "debug"
json = true
"#;
        let cfg: PipelineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.device.class, DeviceClass::GeneralPurpose);
        assert_eq!(cfg.data.count, 4096);
        assert_eq!(cfg.data.seed, Some(7));
        assert_eq!(cfg.dispatch.group_size, Some(64));
        assert_eq!(cfg.runtime.devices.len(), 1);
        let device = &cfg.runtime.devices[0];
        assert_eq!(device.name, "Test CPU");
        assert_eq!(device.max_work_group_size, 128);
        // Unlisted keys come from the device defaults.
        assert!(device.available);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: PipelineConfig = toml::from_str("[data]\ncount = 16\n").unwrap();
        assert_eq!(cfg.data.count, 16);
        assert_eq!(cfg.device.class, DeviceClass::Accelerator);
        assert_eq!(cfg.runtime.devices.len(), 2);
    }

    #[test]
    fn test_load_from_file_and_kernel_source() {
        let dir = tempfile::tempdir().unwrap();
        let kernel_path = dir.path().join("double.cl");
        std::fs::write(
            &kernel_path,
            "__kernel void twice(__global float* a, __global float* b, const unsigned long n) {\n\
             size_t i = get_global_id(0);\n if (i < n) b[i] = a[i] + a[i];\n}\n",
        )
        .unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[kernel]\nname = \"twice\"\nsource_path = {:?}", kernel_path.display().to_string()).unwrap();

        let cfg = PipelineConfig::resolve(Some(file.path())).unwrap();
        let settings = cfg.pipeline_settings().unwrap();
        assert_eq!(settings.kernel_name, "twice");
        assert!(settings.kernel_source.contains("a[i] + a[i]"));
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let err = PipelineConfig::resolve(Some(Path::new("/nonexistent/kernelpipe.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_missing_kernel_file() {
        let mut cfg = PipelineConfig::default();
        cfg.kernel.source_path = Some(PathBuf::from("/nonexistent/square.cl"));
        assert!(cfg.pipeline_settings().is_err());
    }

    #[test]
    fn test_backend_selection() {
        let cfg: PipelineConfig = toml::from_str("[runtime]\nbackend = \"opencl\"\n").unwrap();
        assert_eq!(cfg.runtime.backend, Backend::OpenCl);
        // The host device list keeps its defaults.
        assert_eq!(cfg.runtime.devices.len(), 2);
        assert!(toml::from_str::<PipelineConfig>("[runtime]\nbackend = \"cuda\"\n").is_err());

        let host = PipelineConfig::default().compute_runtime().unwrap();
        assert_eq!(host.devices(DeviceClass::Accelerator).unwrap().len(), 1);
    }

    #[cfg(not(feature = "opencl"))]
    #[test]
    fn test_opencl_backend_needs_feature() {
        let mut cfg = PipelineConfig::default();
        cfg.runtime.backend = Backend::OpenCl;
        let err = cfg.compute_runtime().err().unwrap();
        assert!(err.to_string().contains("--features opencl"));
    }
}
