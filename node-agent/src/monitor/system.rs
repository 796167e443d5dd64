//! Host metrics collected through sysinfo
//!
//! - CPU usage and load averages
//! - Memory and swap usage
//! - Disk usage per mounted filesystem
//! - Network interface counters
//! - Static system identity

use super::MetricSource;
use crate::identity::HostIdentity;
use crate::records::MetricCategory;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sysinfo::{Disks, Networks, System, MINIMUM_CPU_UPDATE_INTERVAL};

#[derive(Debug, Serialize)]
pub struct CpuMetrics {
    pub percent: f32,
    pub load_avg: [f64; 3],
    pub core_count: usize,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct MemoryMetrics {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub percent_used: f32,
    pub swap_total_mb: u64,
    pub swap_used_mb: u64,
}

#[derive(Debug, Serialize)]
pub struct DiskMetrics {
    pub mount_point: String,
    pub file_system: String,
    pub total_gb: f64,
    pub free_gb: f64,
    pub percent_used: f32,
}

#[derive(Debug, Serialize)]
pub struct InterfaceCounters {
    pub name: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
}

const MB: u64 = 1024 * 1024;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;

fn percent(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 100.0) as f32
    }
}

/// Production metric source. Keeps sysinfo state between ticks so CPU usage
/// and network counters are measured against the previous refresh.
pub struct SysinfoSource {
    system: Mutex<Option<System>>,
    networks: Mutex<Networks>,
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(None),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }

    fn cpu(&self) -> CpuMetrics {
        let mut guard = self.system.lock();
        let sys = guard.get_or_insert_with(|| {
            let mut sys = System::new();
            sys.refresh_cpu();
            // Usage needs two refreshes spaced apart
            std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
            sys
        });
        sys.refresh_cpu();

        let load = System::load_average();
        CpuMetrics {
            percent: sys.global_cpu_info().cpu_usage(),
            load_avg: [load.one, load.five, load.fifteen],
            core_count: sys.cpus().len(),
            uptime_seconds: System::uptime(),
        }
    }

    fn memory(&self) -> Result<MemoryMetrics> {
        let mut guard = self.system.lock();
        let sys = guard.get_or_insert_with(System::new);
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            bail!("memory statistics unavailable");
        }
        let available = sys.available_memory();
        let used = total.saturating_sub(available);
        Ok(MemoryMetrics {
            total_mb: total / MB,
            used_mb: used / MB,
            available_mb: available / MB,
            percent_used: percent(used, total),
            swap_total_mb: sys.total_swap() / MB,
            swap_used_mb: sys.used_swap() / MB,
        })
    }

    fn disks(&self) -> Result<Vec<DiskMetrics>> {
        let disks = Disks::new_with_refreshed_list();
        let metrics: Vec<DiskMetrics> = disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let total = d.total_space();
                let free = d.available_space();
                DiskMetrics {
                    mount_point: d.mount_point().to_string_lossy().to_string(),
                    file_system: d.file_system().to_string_lossy().to_string(),
                    total_gb: total as f64 / GB,
                    free_gb: free as f64 / GB,
                    percent_used: percent(total.saturating_sub(free), total),
                }
            })
            .collect();

        if metrics.is_empty() {
            bail!("no mounted filesystems reported");
        }
        Ok(metrics)
    }

    fn network(&self) -> Vec<InterfaceCounters> {
        let mut networks = self.networks.lock();
        networks.refresh_list();

        let mut counters: Vec<InterfaceCounters> = networks
            .list()
            .iter()
            .map(|(name, data)| InterfaceCounters {
                name: name.clone(),
                bytes_sent: data.total_transmitted(),
                bytes_recv: data.total_received(),
                packets_sent: data.total_packets_transmitted(),
                packets_recv: data.total_packets_received(),
                errors_in: data.total_errors_on_received(),
                errors_out: data.total_errors_on_transmitted(),
            })
            .collect();
        counters.sort_by(|a, b| a.name.cmp(&b.name));
        counters
    }
}

impl MetricSource for SysinfoSource {
    fn sample(&self, category: MetricCategory) -> Result<Value> {
        let value = match category {
            MetricCategory::Cpu => serde_json::to_value(self.cpu())?,
            MetricCategory::Memory => serde_json::to_value(self.memory()?)?,
            MetricCategory::Disk => serde_json::to_value(self.disks()?)?,
            MetricCategory::Network => serde_json::to_value(self.network())?,
            MetricCategory::SystemInfo => serde_json::to_value(HostIdentity::discover()?)?,
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_and_memory_sampling() {
        let source = SysinfoSource::new();
        let cpu = source.sample(MetricCategory::Cpu).unwrap();
        assert!(cpu["core_count"].as_u64().unwrap() > 0);

        let memory = source.sample(MetricCategory::Memory).unwrap();
        assert!(memory["total_mb"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
