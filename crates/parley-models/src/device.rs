//! GPU availability and device fallback.

use std::path::Path;

use tracing::warn;

use parley_core::types::{Device, ModelKind, ModelSettings};

/// Reports whether a GPU adapter is usable right now.
pub trait DeviceDetector: Send + Sync {
    fn gpu_available(&self) -> bool;
}

/// Detector with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticDetector {
    gpu: bool,
}

impl StaticDetector {
    pub fn new(gpu: bool) -> Self {
        Self { gpu }
    }

    pub fn cpu_only() -> Self {
        Self::new(false)
    }
}

impl DeviceDetector for StaticDetector {
    fn gpu_available(&self) -> bool {
        self.gpu
    }
}

/// Inspect the host: `PARLEY_FORCE_CPU` disables the GPU, macOS always has
/// Metal, elsewhere a DRM render node or NVIDIA device file must exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDetector;

impl DeviceDetector for SystemDetector {
    fn gpu_available(&self) -> bool {
        if std::env::var_os("PARLEY_FORCE_CPU").is_some() {
            return false;
        }
        if cfg!(target_os = "macos") {
            return true;
        }
        ["/dev/dri/renderD128", "/dev/nvidia0"]
            .iter()
            .any(|p| Path::new(p).exists())
    }
}

/// Settings to construct with: GPU downgrades to CPU when no adapter is available.
///
/// The configured settings are left untouched so the check runs again on the
/// next load.
pub fn effective_settings(
    kind: ModelKind,
    settings: ModelSettings,
    detector: &dyn DeviceDetector,
) -> ModelSettings {
    if settings.device == Device::Gpu && !detector.gpu_available() {
        warn!(kind = %kind, "No GPU adapter available, falling back to CPU");
        return settings.with_device(Device::Cpu);
    }
    settings
}
