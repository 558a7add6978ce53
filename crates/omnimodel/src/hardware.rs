//! Best-effort hardware snapshot.
//!
//! Detection runs once per process and the snapshot is reused for every
//! adapter selection. Consumers only read the booleans; how they were
//! computed is deliberately outside the core's contract. Environment
//! overrides (`OMNIMODEL_HAS_GPU`, `OMNIMODEL_HAS_NPU`) take precedence
//! over probing, which also keeps tests hermetic.

use std::sync::{Mutex, OnceLock};

use serde::Serialize;
use sysinfo::System;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct HardwareInfo {
    pub platform: String,
    pub has_gpu: bool,
    pub has_npu: bool,
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub architecture: String,
}

fn snapshot_cell() -> &'static Mutex<Option<HardwareInfo>> {
    static CELL: OnceLock<Mutex<Option<HardwareInfo>>> = OnceLock::new();
    CELL.get_or_init(|| Mutex::new(None))
}

/// The cached snapshot, detecting on first use.
pub fn hardware_info() -> HardwareInfo {
    let mut cached = snapshot_cell().lock().unwrap();
    if let Some(info) = cached.as_ref() {
        return info.clone();
    }
    let info = detect();
    info!(
        "Hardware snapshot: platform={} gpu={} npu={} mem={}MB cores={} arch={}",
        info.platform, info.has_gpu, info.has_npu, info.memory_mb, info.cpu_cores,
        info.architecture
    );
    *cached = Some(info.clone());
    info
}

/// Drop the cached snapshot so the next call re-detects. Test hook; also
/// useful after an eGPU attach/detach.
pub fn reset_hardware_cache() {
    *snapshot_cell().lock().unwrap() = None;
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")
    })
}

fn detect() -> HardwareInfo {
    let mut system = System::new_all();
    system.refresh_memory();

    let has_gpu = env_flag("OMNIMODEL_HAS_GPU").unwrap_or_else(probe_gpu);
    let has_npu = env_flag("OMNIMODEL_HAS_NPU").unwrap_or(false);

    HardwareInfo {
        platform: std::env::consts::OS.to_string(),
        has_gpu,
        has_npu,
        memory_mb: system.total_memory() / 1024 / 1024,
        cpu_cores: num_cpus::get() as u32,
        architecture: std::env::consts::ARCH.to_string(),
    }
}

/// GPU probing is best effort and never fails: Apple Silicon has a Metal
/// GPU by construction; elsewhere the presence of nvidia-smi is the
/// cheapest reliable signal without linking a vendor library.
fn probe_gpu() -> bool {
    if cfg!(target_os = "macos") && std::env::consts::ARCH == "aarch64" {
        return true;
    }
    std::process::Command::new("nvidia-smi")
        .arg("--list-gpus")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
