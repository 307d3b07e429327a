use farm_core::config::PerformanceConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::hysteresis::{LoadGate, LoadVerdict};
use crate::sampler::CpuSampler;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSnapshot {
    pub verdict: LoadVerdict,
    pub average: f32,
    pub last_sample: Option<f32>,
    pub samples: u64,
}

/// Samples CPU on its own interval and keeps the latest hysteresis verdict.
pub struct PerformanceMonitor {
    sampler: Mutex<Box<dyn CpuSampler>>,
    gate: Mutex<LoadGate>,
    samples: AtomicU64,
    interval: Duration,
}

impl PerformanceMonitor {
    pub fn new(config: &PerformanceConfig, sampler: Box<dyn CpuSampler>) -> Self {
        Self {
            sampler: Mutex::new(sampler),
            gate: Mutex::new(LoadGate::new(config.window_size, config.busy_threshold)),
            samples: AtomicU64::new(0),
            interval: Duration::from_millis(config.sample_interval_ms.max(1)),
        }
    }

    /// Takes one reading and feeds it to the gate.
    pub async fn sample_once(&self) -> LoadVerdict {
        let reading = self.sampler.lock().await.sample();
        let mut gate = self.gate.lock().await;
        let before = gate.verdict();
        let after = match reading {
            Ok(value) => gate.record(value),
            Err(e) => {
                warn!(error = %e, "CPU sample failed, treating as fully busy");
                gate.record_failure()
            }
        };
        self.samples.fetch_add(1, Ordering::Relaxed);
        if before != after {
            info!(from = ?before, to = ?after, average = gate.average(), "Load verdict changed");
        }
        after
    }

    pub async fn verdict(&self) -> LoadVerdict {
        self.gate.lock().await.verdict()
    }

    pub async fn snapshot(&self) -> LoadSnapshot {
        let gate = self.gate.lock().await;
        LoadSnapshot {
            verdict: gate.verdict(),
            average: gate.average(),
            last_sample: gate.last(),
            samples: self.samples.load(Ordering::Relaxed),
        }
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_ms = self.interval.as_millis() as u64, "PerformanceMonitor started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let verdict = self.sample_once().await;
                    debug!(?verdict, "CPU sampled");
                }
                _ = shutdown.recv() => {
                    info!("PerformanceMonitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_core::{Error, Result};
    use std::collections::VecDeque;

    struct Scripted(VecDeque<Result<f32>>);

    impl CpuSampler for Scripted {
        fn sample(&mut self) -> Result<f32> {
            self.0.pop_front().unwrap_or(Ok(0.0))
        }
    }

    fn monitor(script: Vec<Result<f32>>) -> PerformanceMonitor {
        let config = PerformanceConfig {
            sample_interval_ms: 10,
            window_size: 3,
            busy_threshold: 80.0,
        };
        PerformanceMonitor::new(&config, Box::new(Scripted(script.into())))
    }

    #[tokio::test]
    async fn test_sampling_error_goes_busy_and_loop_continues() {
        let mon = monitor(vec![
            Ok(10.0),
            Err(Error::Other("sensor gone".into())),
            Ok(10.0),
        ]);
        assert_eq!(mon.sample_once().await, LoadVerdict::Available);
        assert_eq!(mon.sample_once().await, LoadVerdict::Busy);
        // [10, 100, 10] averages exactly T/2.
        assert_eq!(mon.sample_once().await, LoadVerdict::Available);
        assert_eq!(mon.snapshot().await.samples, 3);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let mon = Arc::new(monitor((0..1000).map(|_| Ok(95.0)).collect()));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(mon.clone().run_loop(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        let snap = mon.snapshot().await;
        assert!(snap.samples >= 1);
        assert_eq!(snap.verdict, LoadVerdict::Busy);
    }
}
