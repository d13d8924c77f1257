use crate::kfd::interface::{CuInfo, FirmwareType};
use crate::queues::hqd::DEFAULT_POLL_QUANTUM;
use log::warn;
use std::env;
use std::time::Duration;

pub const ENV_VM_SIZE: &str = "RADEON_KGD_VM_SIZE";
pub const ENV_HQD_POLL_MS: &str = "RADEON_KGD_HQD_POLL_MS";
pub const ENV_COMPUTE_VMID_BITMAP: &str = "RADEON_KGD_COMPUTE_VMID_BITMAP";

pub const DEFAULT_VM_SIZE: u64 = 1 << 36;
/// VMIDs 8-15 belong to compute.
pub const DEFAULT_COMPUTE_VMID_BITMAP: u32 = 0xFF00;

/// Microcode versions reported to the KFD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareVersions {
    pub pfp: u16,
    pub me: u16,
    pub ce: u16,
    pub mec: u16,
    pub rlc: u16,
    pub sdma: u16,
}

impl FirmwareVersions {
    #[must_use]
    pub const fn get(&self, fw: FirmwareType) -> u16 {
        match fw {
            FirmwareType::Pfp => self.pfp,
            FirmwareType::Me => self.me,
            FirmwareType::Ce => self.ce,
            // Both MECs run the same image
            FirmwareType::Mec1 | FirmwareType::Mec2 => self.mec,
            FirmwareType::Rlc => self.rlc,
            FirmwareType::Sdma1 | FirmwareType::Sdma2 => self.sdma,
        }
    }
}

/// Device configuration for [`RadeonKgd`](crate::kfd::device::RadeonKgd).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KgdConfig {
    pub vm_size: u64,
    pub compute_vmid_bitmap: u32,
    pub first_compute_pipe: u32,
    pub compute_pipe_count: u32,
    pub hqd_poll_quantum: Duration,
    pub pasid_update_timeout: Duration,
    pub doorbell_physical_address: u64,
    pub doorbell_aperture_size: u64,
    pub doorbell_start_offset: u64,
    pub vram_size: u64,
    pub max_engine_clock_mhz: u32,
    pub cu_info: CuInfo,
    pub firmware: FirmwareVersions,
}

impl Default for KgdConfig {
    fn default() -> Self {
        Self {
            vm_size: DEFAULT_VM_SIZE,
            compute_vmid_bitmap: DEFAULT_COMPUTE_VMID_BITMAP,
            first_compute_pipe: 1,
            compute_pipe_count: 3,
            hqd_poll_quantum: DEFAULT_POLL_QUANTUM,
            pasid_update_timeout: Duration::from_millis(100),
            doorbell_physical_address: 0,
            doorbell_aperture_size: 0,
            doorbell_start_offset: 0,
            vram_size: 0,
            max_engine_clock_mhz: 0,
            cu_info: CuInfo::default(),
            firmware: FirmwareVersions::default(),
        }
    }
}

impl KgdConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `RADEON_KGD_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    /// Applies overrides looked up by variable name. Unparsable values are
    /// ignored with a warning.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(size) = parse_override(&lookup, ENV_VM_SIZE) {
            self.vm_size = size;
        }
        if let Some(ms) = parse_override(&lookup, ENV_HQD_POLL_MS) {
            self.hqd_poll_quantum = Duration::from_millis(ms);
        }
        if let Some(bitmap) = parse_override(&lookup, ENV_COMPUTE_VMID_BITMAP) {
            match u32::try_from(bitmap) {
                Ok(bitmap) => self.compute_vmid_bitmap = bitmap,
                Err(_) => warn!("KgdConfig: {ENV_COMPUTE_VMID_BITMAP}={bitmap:#x} out of range"),
            }
        }
        self
    }

    #[must_use]
    pub const fn with_vm_size(mut self, size: u64) -> Self {
        self.vm_size = size;
        self
    }

    #[must_use]
    pub const fn with_compute_vmid_bitmap(mut self, bitmap: u32) -> Self {
        self.compute_vmid_bitmap = bitmap;
        self
    }

    #[must_use]
    pub const fn with_compute_pipes(mut self, first: u32, count: u32) -> Self {
        self.first_compute_pipe = first;
        self.compute_pipe_count = count;
        self
    }

    #[must_use]
    pub const fn with_hqd_poll_quantum(mut self, quantum: Duration) -> Self {
        self.hqd_poll_quantum = quantum;
        self
    }

    #[must_use]
    pub const fn with_pasid_update_timeout(mut self, timeout: Duration) -> Self {
        self.pasid_update_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_doorbells(mut self, physical_address: u64, size: u64, start: u64) -> Self {
        self.doorbell_physical_address = physical_address;
        self.doorbell_aperture_size = size;
        self.doorbell_start_offset = start;
        self
    }

    #[must_use]
    pub const fn with_vram_size(mut self, size: u64) -> Self {
        self.vram_size = size;
        self
    }

    #[must_use]
    pub const fn with_max_engine_clock_mhz(mut self, mhz: u32) -> Self {
        self.max_engine_clock_mhz = mhz;
        self
    }

    #[must_use]
    pub const fn with_cu_info(mut self, info: CuInfo) -> Self {
        self.cu_info = info;
        self
    }

    #[must_use]
    pub const fn with_firmware(mut self, firmware: FirmwareVersions) -> Self {
        self.firmware = firmware;
        self
    }
}

fn parse_override(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    let value = raw.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed
        .inspect_err(|e| warn!("KgdConfig: ignoring {name}={raw:?}: {e}"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| {
            vars.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn test_overrides_applied() {
        let cfg = KgdConfig::new().with_overrides(lookup(&[
            (ENV_VM_SIZE, "0x100000000"),
            (ENV_HQD_POLL_MS, "5"),
            (ENV_COMPUTE_VMID_BITMAP, "0xF000"),
        ]));
        assert_eq!(cfg.vm_size, 1 << 32);
        assert_eq!(cfg.hqd_poll_quantum, Duration::from_millis(5));
        assert_eq!(cfg.compute_vmid_bitmap, 0xF000);
    }

    #[test]
    fn test_bad_overrides_ignored() {
        let cfg = KgdConfig::new().with_overrides(lookup(&[
            (ENV_VM_SIZE, "lots"),
            (ENV_COMPUTE_VMID_BITMAP, "0x100000000"),
        ]));
        assert_eq!(cfg, KgdConfig::default());
    }

    #[test]
    fn test_firmware_lookup() {
        let fw = FirmwareVersions {
            mec: 220,
            sdma: 31,
            ..Default::default()
        };
        assert_eq!(fw.get(FirmwareType::Mec2), 220);
        assert_eq!(fw.get(FirmwareType::Sdma1), 31);
        assert_eq!(fw.get(FirmwareType::Pfp), 0);
    }

    #[test]
    fn test_builder_setters() {
        let cfg = KgdConfig::new()
            .with_vm_size(1 << 34)
            .with_compute_pipes(1, 7)
            .with_doorbells(0xF000_0000, 0x20_0000, 0x100);
        assert_eq!(cfg.vm_size, 1 << 34);
        assert_eq!(cfg.compute_pipe_count, 7);
        assert_eq!(cfg.doorbell_start_offset, 0x100);
    }
}
