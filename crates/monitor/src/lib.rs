pub mod hysteresis;
pub mod monitor;
pub mod sampler;

pub use hysteresis::{LoadGate, LoadVerdict};
pub use monitor::{LoadSnapshot, PerformanceMonitor};
pub use sampler::{CpuSampler, FixedSampler, SysinfoSampler};
