//! Interfaces between the graphics driver (KGD) and the compute driver (KFD).
//!
//! The KFD registers a [`Kgd2Kfd`] implementation when a device is attached;
//! the device object implements [`Kfd2Kgd`] for calls going the other way.

use crate::error::KgdResult;
use crate::kfd::mqd::CikMqd;
use crate::memory::{AllocFlags, GpuMemoryObject, ImportedBuffer};
use crate::queues::hqd::{ResetType, UserWord};
use crate::vm::GpuVm;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InterfaceVersion {
    pub major: u16,
    pub minor: u16,
}

impl InterfaceVersion {
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Same major version and at least the required minor.
    #[must_use]
    pub const fn satisfies(self, required: Self) -> bool {
        self.major == required.major && self.minor >= required.minor
    }
}

impl fmt::Display for InterfaceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Interface version this crate speaks.
pub const KGD2KFD_INTERFACE_VERSION: InterfaceVersion = InterfaceVersion::new(1, 2);

/// Device resources handed to the KFD at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedResources {
    /// Bit `n` set: VMID `n` is reserved for compute processes.
    pub compute_vmid_bitmap: u32,
    pub first_compute_pipe: u32,
    pub compute_pipe_count: u32,
    pub doorbell_physical_address: u64,
    pub doorbell_aperture_size: u64,
    /// Doorbells below this index belong to the graphics driver.
    pub doorbell_start_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareType {
    Pfp,
    Me,
    Ce,
    Mec1,
    Mec2,
    Rlc,
    Sdma1,
    Sdma2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CuInfo {
    pub cu_active_number: u32,
    pub cu_ao_mask: u32,
    pub simd_per_cu: u32,
    pub max_waves_per_simd: u32,
    pub wave_front_size: u32,
    pub lds_size: u32,
    /// Active CU bitmap per shader engine.
    pub cu_bitmap: [u32; 4],
}

/// Calls from the graphics driver into the KFD.
pub trait Kgd2Kfd: Send + Sync {
    fn interface_version(&self) -> InterfaceVersion;
    fn device_init(&self, resources: &SharedResources) -> KgdResult<()>;
    fn device_exit(&self);
    fn interrupt(&self, ih_ring_entry: &[u32]);
    fn suspend(&self);
    fn resume(&self) -> KgdResult<()>;
}

/// Calls from the KFD into the graphics driver.
pub trait Kfd2Kgd: Send + Sync {
    fn create_vm(&self) -> KgdResult<Arc<GpuVm>>;
    fn allocate_memory(
        &self,
        vm: &Arc<GpuVm>,
        va: u64,
        size: u64,
        flags: AllocFlags,
    ) -> KgdResult<GpuMemoryObject>;
    fn import_memory(
        &self,
        vm: &Arc<GpuVm>,
        va: u64,
        buffer: ImportedBuffer,
        flags: AllocFlags,
    ) -> KgdResult<GpuMemoryObject>;
    fn free_memory(&self, object: GpuMemoryObject) -> KgdResult<()>;
    fn map_memory_to_gpu(&self, object: &GpuMemoryObject) -> KgdResult<()>;
    fn unmap_memory_from_gpu(&self, object: &GpuMemoryObject) -> KgdResult<()>;

    fn program_sh_mem_settings(
        &self,
        vmid: u32,
        sh_mem_config: u32,
        sh_mem_ape1_base: u32,
        sh_mem_ape1_limit: u32,
        sh_mem_bases: u32,
    );
    fn set_pasid_vmid_mapping(&self, pasid: u32, vmid: u32) -> KgdResult<()>;
    fn init_pipeline(&self, pipe_id: u32, hpd_size: u32, hpd_gpu_addr: u64) -> KgdResult<()>;

    fn hqd_load(
        &self,
        mqd: &CikMqd,
        pipe_id: u32,
        queue_id: u32,
        wptr: Option<&dyn UserWord>,
        page_table_base: u64,
    ) -> KgdResult<()>;
    fn hqd_is_occupied(&self, queue_address: u64, pipe_id: u32, queue_id: u32) -> bool;
    fn hqd_destroy(
        &self,
        reset_type: ResetType,
        timeout: Duration,
        pipe_id: u32,
        queue_id: u32,
    ) -> KgdResult<()>;

    fn gpu_clock_counter(&self) -> u64;
    fn max_engine_clock_mhz(&self) -> u32;
    fn vram_size(&self) -> u64;
    fn firmware_version(&self, fw: FirmwareType) -> u16;
    fn cu_info(&self) -> CuInfo;
}
