//! Accelerator, strategy, device and worker resolution.

use crate::auto::Auto;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Cap for automatically chosen dataloader workers per device.
pub const MAX_AUTO_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    #[serde(alias = "cuda")]
    Gpu,
    Mps,
    Tpu,
    Hpu,
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Mps => "mps",
            Self::Tpu => "tpu",
            Self::Hpu => "hpu",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    SingleDevice,
    Ddp,
    DdpSpawn,
    #[serde(rename = "ddp_find_unused_parameters_true")]
    DdpFindUnusedParameters,
    Fsdp,
    Deepspeed,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        f.write_str(value.as_str().unwrap_or_default())
    }
}

/// Requested devices per node: a count or explicit device indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Devices {
    Count(usize),
    Indices(Vec<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Precision {
    #[serde(rename = "64-true")]
    Double,
    #[default]
    #[serde(rename = "32-true")]
    Full,
    #[serde(rename = "16-true")]
    Half,
    #[serde(rename = "bf16-true")]
    BFloat16,
    #[serde(rename = "16-mixed")]
    HalfMixed,
    #[serde(rename = "bf16-mixed")]
    BFloat16Mixed,
}

/// What the machine offers. Detected once per run and passed by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub cpu_count: Option<usize>,
    pub cuda_devices: usize,
    pub mps_available: bool,
}

impl HardwareInfo {
    #[must_use]
    pub fn detect() -> Self {
        let cpu_count = std::thread::available_parallelism().map(std::num::NonZero::get).ok();
        Self { cpu_count, cuda_devices: detect_cuda_devices(), mps_available: cfg!(all(target_os = "macos", target_arch = "aarch64")) }
    }

    #[must_use]
    pub fn cpu_only(cpu_count: usize) -> Self {
        Self { cpu_count: Some(cpu_count), cuda_devices: 0, mps_available: false }
    }

    /// Number of devices usable on one node for `accelerator`.
    #[must_use]
    pub fn devices_for(&self, accelerator: Accelerator) -> usize {
        match accelerator {
            Accelerator::Cpu => 1,
            Accelerator::Gpu => self.cuda_devices,
            Accelerator::Mps => usize::from(self.mps_available),
            Accelerator::Tpu | Accelerator::Hpu => 0,
        }
    }
}

fn detect_cuda_devices() -> usize {
    let visible = std::env::var("CUDA_VISIBLE_DEVICES").ok();
    if let Some(visible) = visible.as_deref() {
        let visible = visible.trim();
        if visible.is_empty() || visible == "-1" {
            return 0;
        }
    }

    let present = std::fs::read_dir(Path::new("/dev"))
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| {
                    let name = e.file_name();
                    let name = name.to_string_lossy();
                    name.strip_prefix("nvidia").is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
                })
                .count()
        })
        .unwrap_or(0);

    match visible {
        Some(visible) => visible.split(',').filter(|s| !s.trim().is_empty()).count().min(present),
        None => present,
    }
}

pub fn resolve_accelerator(accelerator: &Auto<Accelerator>, hardware: &HardwareInfo) -> TrainingResult<Accelerator> {
    match accelerator {
        Auto::Auto => Ok(if hardware.cuda_devices > 0 {
            Accelerator::Gpu
        } else if hardware.mps_available {
            Accelerator::Mps
        } else {
            Accelerator::Cpu
        }),
        Auto::Explicit(accelerator) => {
            if hardware.devices_for(*accelerator) == 0 {
                return Err(TrainingError::resolution(format!(
                    "accelerator `{accelerator}` was requested but no such device is available"
                )));
            }
            Ok(*accelerator)
        }
    }
}

/// Number of devices per node the run will use.
pub fn resolve_devices_per_node(
    devices: &Auto<Devices>,
    accelerator: Accelerator,
    hardware: &HardwareInfo,
) -> TrainingResult<usize> {
    let available = hardware.devices_for(accelerator);
    match devices {
        Auto::Auto => Ok(available.max(1)),
        Auto::Explicit(Devices::Count(0)) => Err(TrainingError::config("devices", "must be >= 1")),
        Auto::Explicit(Devices::Count(count)) => {
            // CPU runs may spawn several processes on the same host.
            if accelerator != Accelerator::Cpu && *count > available {
                return Err(TrainingError::resolution(format!(
                    "devices={count} requested but only {available} `{accelerator}` device(s) are available"
                )));
            }
            Ok(*count)
        }
        Auto::Explicit(Devices::Indices(indices)) => {
            if indices.is_empty() {
                return Err(TrainingError::config("devices", "device index list must not be empty"));
            }
            if let Some(bad) = indices.iter().find(|i| accelerator != Accelerator::Cpu && **i >= available) {
                return Err(TrainingError::resolution(format!(
                    "device index {bad} is out of range, {available} `{accelerator}` device(s) available"
                )));
            }
            let mut unique = indices.clone();
            unique.sort_unstable();
            unique.dedup();
            if unique.len() != indices.len() {
                return Err(TrainingError::config("devices", "device indices must be unique"));
            }
            Ok(indices.len())
        }
    }
}

/// Pick a distributed strategy.
///
/// An explicit choice is kept. `auto` becomes DDP for multi-device or
/// multi-node runs and otherwise stays `auto` for the trainer to decide.
#[must_use]
pub fn resolve_strategy(strategy: &Auto<Strategy>, devices_per_node: usize, num_nodes: usize) -> Auto<Strategy> {
    match strategy {
        Auto::Explicit(strategy) => Auto::Explicit(*strategy),
        Auto::Auto if devices_per_node * num_nodes > 1 => Auto::Explicit(Strategy::Ddp),
        Auto::Auto => Auto::Auto,
    }
}

pub fn total_num_devices(num_nodes: usize, devices_per_node: usize) -> TrainingResult<usize> {
    if num_nodes == 0 {
        return Err(TrainingError::config("num_nodes", "must be >= 1"));
    }
    if devices_per_node == 0 {
        return Err(TrainingError::config("devices", "must be >= 1"));
    }
    Ok(num_nodes * devices_per_node)
}

/// Dataloader workers per device.
///
/// `auto` gives every device an equal share of the CPUs, keeping one core
/// per device for the training process itself.
#[must_use]
pub fn resolve_num_workers(num_workers: &Auto<usize>, cpu_count: Option<usize>, devices_per_node: usize) -> usize {
    match num_workers {
        Auto::Explicit(n) => *n,
        Auto::Auto => match cpu_count {
            Some(cpus) => {
                let per_device = cpus / devices_per_node.max(1);
                per_device.saturating_sub(1).min(MAX_AUTO_WORKERS)
            }
            None => MAX_AUTO_WORKERS,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInformation {
    pub os: &'static str,
    pub arch: &'static str,
    pub crate_version: &'static str,
    pub hardware: HardwareInfo,
}

#[must_use]
pub fn get_system_information(hardware: &HardwareInfo) -> SystemInformation {
    SystemInformation {
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        crate_version: env!("CARGO_PKG_VERSION"),
        hardware: hardware.clone(),
    }
}

pub fn log_system_information(info: &SystemInformation) {
    info!(
        os = info.os,
        arch = info.arch,
        version = info.crate_version,
        cpus = ?info.hardware.cpu_count,
        cuda_devices = info.hardware.cuda_devices,
        mps = info.hardware.mps_available,
        "system information"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gpus(n: usize) -> HardwareInfo {
        HardwareInfo { cpu_count: Some(16), cuda_devices: n, mps_available: false }
    }

    #[test]
    fn test_auto_accelerator_prefers_gpu() {
        assert_eq!(resolve_accelerator(&Auto::Auto, &gpus(2)).unwrap(), Accelerator::Gpu);
        assert_eq!(resolve_accelerator(&Auto::Auto, &gpus(0)).unwrap(), Accelerator::Cpu);
    }

    #[test]
    fn test_explicit_gpu_without_devices_fails() {
        let err = resolve_accelerator(&Auto::Explicit(Accelerator::Gpu), &gpus(0)).unwrap_err();
        assert!(err.is_resolution());
    }

    #[test]
    fn test_devices_resolution() {
        let hw = gpus(4);
        assert_eq!(resolve_devices_per_node(&Auto::Auto, Accelerator::Gpu, &hw).unwrap(), 4);
        assert_eq!(resolve_devices_per_node(&Auto::Explicit(Devices::Count(2)), Accelerator::Gpu, &hw).unwrap(), 2);
        assert_eq!(
            resolve_devices_per_node(&Auto::Explicit(Devices::Indices(vec![0, 3])), Accelerator::Gpu, &hw).unwrap(),
            2
        );
        assert!(resolve_devices_per_node(&Auto::Explicit(Devices::Count(8)), Accelerator::Gpu, &hw).is_err());
        assert!(resolve_devices_per_node(&Auto::Explicit(Devices::Indices(vec![4])), Accelerator::Gpu, &hw).is_err());
        assert!(resolve_devices_per_node(&Auto::Explicit(Devices::Indices(vec![1, 1])), Accelerator::Gpu, &hw).is_err());
    }

    #[test]
    fn test_strategy_resolution() {
        assert_eq!(resolve_strategy(&Auto::Auto, 1, 1), Auto::Auto);
        assert_eq!(resolve_strategy(&Auto::Auto, 2, 1), Auto::Explicit(Strategy::Ddp));
        assert_eq!(resolve_strategy(&Auto::Auto, 1, 2), Auto::Explicit(Strategy::Ddp));
        assert_eq!(resolve_strategy(&Auto::Explicit(Strategy::Fsdp), 4, 1), Auto::Explicit(Strategy::Fsdp));
    }

    #[test]
    fn test_num_workers_auto() {
        assert_eq!(resolve_num_workers(&Auto::Auto, Some(16), 2), 7);
        assert_eq!(resolve_num_workers(&Auto::Auto, Some(64), 1), MAX_AUTO_WORKERS);
        assert_eq!(resolve_num_workers(&Auto::Auto, Some(1), 4), 0);
        assert_eq!(resolve_num_workers(&Auto::Auto, None, 4), MAX_AUTO_WORKERS);
        assert_eq!(resolve_num_workers(&Auto::Explicit(3), Some(64), 1), 3);
    }

    #[test]
    fn test_serde_names() {
        let precision: Precision = serde_json::from_value(json!("bf16-mixed")).unwrap();
        assert_eq!(precision, Precision::BFloat16Mixed);
        let accelerator: Accelerator = serde_json::from_value(json!("cuda")).unwrap();
        assert_eq!(accelerator, Accelerator::Gpu);
        let strategy: Strategy = serde_json::from_value(json!("ddp_find_unused_parameters_true")).unwrap();
        assert_eq!(strategy.to_string(), "ddp_find_unused_parameters_true");
        let devices: Devices = serde_json::from_value(json!([0, 1])).unwrap();
        assert_eq!(devices, Devices::Indices(vec![0, 1]));
    }
}
