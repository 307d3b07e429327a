use farm_core::{Error, Result};
use sysinfo::System;

/// Source of CPU busy percentages (0..=100).
pub trait CpuSampler: Send {
    fn sample(&mut self) -> Result<f32>;
}

/// Whole-machine CPU usage via `sysinfo`.
pub struct SysinfoSampler {
    sys: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        // The first reading has no baseline to diff against.
        sys.refresh_cpu_usage();
        Self { sys }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<f32> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(Error::Other("CPU sampling unsupported on this system".into()));
        }
        self.sys.refresh_cpu_usage();
        let usage = self.sys.global_cpu_usage();
        if !usage.is_finite() {
            return Err(Error::Other(format!("invalid CPU reading: {}", usage)));
        }
        Ok(usage.clamp(0.0, 100.0))
    }
}

/// Reports the same load on every sample. Used for embedded agents that
/// should never gate on local load.
pub struct FixedSampler(pub f32);

impl CpuSampler for FixedSampler {
    fn sample(&mut self) -> Result<f32> {
        Ok(self.0)
    }
}
