use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Where accelerator-resident pipelines are placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl DeviceMap {
    pub fn new(cpu: bool, ordinal: usize) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::Ordinal(ordinal)
        }
    }

    /// Picks the least loaded NVIDIA GPU, or ordinal 0 when `nvidia-smi`
    /// cannot be queried.
    pub fn auto() -> Self {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,memory.used,memory.total,utilization.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output();
        let stats = match output {
            Ok(output) if output.status.success() => {
                parse_gpu_stats(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!(status = %output.status, "nvidia-smi failed, using GPU 0");
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "nvidia-smi unavailable, using GPU 0");
                Vec::new()
            }
        };
        let ordinal = least_loaded(&stats).unwrap_or(0);
        if !stats.is_empty() {
            info!(ordinal, gpus = stats.len(), "selected least loaded GPU");
        }
        Self::Ordinal(ordinal)
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// One row of `nvidia-smi --query-gpu` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuStats {
    pub index: usize,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
    pub utilization_pct: u32,
}

/// Parses `index, memory.used, memory.total, utilization.gpu` CSV rows.
/// Rows that do not parse are skipped.
pub fn parse_gpu_stats(csv: &str) -> Vec<GpuStats> {
    csv.lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let stats = GpuStats {
                index: fields.next()?.parse().ok()?,
                memory_used_mib: fields.next()?.parse().ok()?,
                memory_total_mib: fields.next()?.parse().ok()?,
                utilization_pct: fields.next()?.parse().ok()?,
            };
            Some(stats)
        })
        .collect()
}

/// Lowest memory use wins; utilization breaks ties.
pub fn least_loaded(stats: &[GpuStats]) -> Option<usize> {
    stats
        .iter()
        .min_by_key(|gpu| (gpu.memory_used_mib, gpu.utilization_pct))
        .map(|gpu| gpu.index)
}
