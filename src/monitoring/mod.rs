pub mod producers;

use anyhow::{bail, Result};
use std::future::Future;
use sysinfo::{MemoryRefreshKind, System};
use tokio::sync::Mutex;

pub use producers::{spawn_log_producer, spawn_stats_producer, ProducerHandles};

/// Instantaneous host resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of host samples for the telemetry producers.
pub trait HostSampler: Send + Sync + 'static {
    fn sample(&self) -> impl Future<Output = Result<HostSample>> + Send;
}

/// Collects host metrics using sysinfo.
#[derive(Debug)]
pub struct MetricsCollector {
    system: Mutex<System>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU counters; usage is computed against the previous refresh.
        system.refresh_cpu();
        system.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());
        Self {
            system: Mutex::new(system),
        }
    }

    /// Capture a fresh sample of CPU and memory usage.
    pub async fn snapshot(&self) -> Result<HostSample> {
        let mut system = self.system.lock().await;
        system.refresh_cpu();
        system.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());

        let total = system.total_memory();
        if total == 0 {
            bail!("host memory totals unavailable");
        }
        let cpu = system.global_cpu_info().cpu_usage();
        if !cpu.is_finite() {
            bail!("host cpu usage unavailable");
        }

        Ok(HostSample {
            cpu_percent: round_tenth(cpu as f64),
            memory_percent: round_tenth(system.used_memory() as f64 / total as f64 * 100.0),
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler for MetricsCollector {
    fn sample(&self) -> impl Future<Output = Result<HostSample>> + Send {
        self.snapshot()
    }
}

fn round_tenth(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
