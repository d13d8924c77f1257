use crate::bo::BoStore;
use crate::config::KgdConfig;
use crate::error::{KgdError, KgdResult};
use crate::kfd::interface::{
    CuInfo, FirmwareType, KGD2KFD_INTERFACE_VERSION, Kfd2Kgd, Kgd2Kfd, SharedResources,
};
use crate::kfd::mqd::CikMqd;
use crate::kfd::regs::{
    ATC_VMID_PASID_MAPPING_UPDATE_STATUS, ATC_VMID0_PASID_MAPPING, ATC_VMID_PASID_MAPPING_VALID,
    CP_HPD_EOP_BASE_ADDR, CP_HPD_EOP_BASE_ADDR_HI, CP_HPD_EOP_CONTROL, CP_HPD_EOP_VMID,
    IH_VMID_0_LUT, RLC_CAPTURE_GPU_CLOCK_COUNT, RLC_GPU_CLOCK_COUNT_LSB, RLC_GPU_CLOCK_COUNT_MSB,
    RegisterAccess, SH_MEM_APE1_BASE, SH_MEM_APE1_LIMIT, SH_MEM_BASES, SH_MEM_CONFIG, SrbmLock,
    compute_pipe,
};
use crate::memory::{AllocFlags, GpuMemoryObject, ImportedBuffer, MemoryManager};
use crate::queues::hqd::{HqdManager, ResetType, UserWord};
use crate::utils::{is_aligned, lower_32_bits, upper_32_bits};
use crate::vm::{GpuVm, PageTableWriter};
use log::{debug, info, warn};
use std::hint;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const MAX_VMID: u32 = 15;

/// A radeon GPU as seen by the compute driver.
///
/// Owns the memory manager and the HQD slots and forwards device events to the
/// attached KFD.
pub struct RadeonKgd {
    config: KgdConfig,
    store: Arc<dyn BoStore>,
    writer: Arc<dyn PageTableWriter>,
    regs: Arc<dyn RegisterAccess>,
    srbm: Arc<SrbmLock>,
    memory: MemoryManager,
    hqd: HqdManager,
    clock: Mutex<()>,
    kfd: Mutex<Option<Arc<dyn Kgd2Kfd>>>,
}

impl RadeonKgd {
    #[must_use]
    pub fn new(
        config: KgdConfig,
        store: Arc<dyn BoStore>,
        writer: Arc<dyn PageTableWriter>,
        regs: Arc<dyn RegisterAccess>,
    ) -> Self {
        let srbm = Arc::new(SrbmLock::new());
        let hqd = HqdManager::new(regs.clone(), srbm.clone(), config.hqd_poll_quantum);
        Self {
            memory: MemoryManager::new(store.clone()),
            hqd,
            config,
            store,
            writer,
            regs,
            srbm,
            clock: Mutex::new(()),
            kfd: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &KgdConfig {
        &self.config
    }

    #[must_use]
    pub const fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    #[must_use]
    pub const fn hqd(&self) -> &HqdManager {
        &self.hqd
    }

    #[must_use]
    pub const fn shared_resources(&self) -> SharedResources {
        SharedResources {
            compute_vmid_bitmap: self.config.compute_vmid_bitmap,
            first_compute_pipe: self.config.first_compute_pipe,
            compute_pipe_count: self.config.compute_pipe_count,
            doorbell_physical_address: self.config.doorbell_physical_address,
            doorbell_aperture_size: self.config.doorbell_aperture_size,
            doorbell_start_offset: self.config.doorbell_start_offset,
        }
    }

    fn lock_kfd(&self) -> MutexGuard<'_, Option<Arc<dyn Kgd2Kfd>>> {
        self.kfd.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kfd(&self) -> Option<Arc<dyn Kgd2Kfd>> {
        self.lock_kfd().clone()
    }

    /// Hands the device to `kfd`.
    ///
    /// `device_init` runs without the attachment slot locked, so the KFD may
    /// call back into the device from it; until it returns the device still
    /// reports itself detached.
    ///
    /// # Errors
    /// `IncompatibleInterface` if the KFD speaks an older or different major
    /// interface version, or whatever its `device_init` reports.
    pub fn attach(&self, kfd: Arc<dyn Kgd2Kfd>) -> KgdResult<()> {
        let found = kfd.interface_version();
        if !found.satisfies(KGD2KFD_INTERFACE_VERSION) {
            warn!("RadeonKgd: KFD interface {found} does not satisfy {KGD2KFD_INTERFACE_VERSION}");
            return Err(KgdError::IncompatibleInterface {
                expected: KGD2KFD_INTERFACE_VERSION,
                found,
            });
        }

        if self.is_attached() {
            return Err(KgdError::InvalidArgument("a KFD is already attached".into()));
        }
        kfd.device_init(&self.shared_resources())?;

        let mut slot = self.lock_kfd();
        if slot.is_some() {
            drop(slot);
            warn!("RadeonKgd: another KFD attached during device_init");
            kfd.device_exit();
            return Err(KgdError::InvalidArgument("a KFD is already attached".into()));
        }
        *slot = Some(kfd);
        drop(slot);

        info!("RadeonKgd: KFD attached (interface {found})");
        Ok(())
    }

    pub fn detach(&self) {
        let kfd = self.lock_kfd().take();
        if let Some(kfd) = kfd {
            kfd.device_exit();
            info!("RadeonKgd: KFD detached");
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.lock_kfd().is_some()
    }

    /// Forwards an interrupt handler ring entry to the KFD.
    pub fn interrupt(&self, ih_ring_entry: &[u32]) {
        if let Some(kfd) = self.kfd() {
            kfd.interrupt(ih_ring_entry);
        }
    }

    pub fn suspend(&self) {
        if let Some(kfd) = self.kfd() {
            kfd.suspend();
        }
    }

    pub fn resume(&self) -> KgdResult<()> {
        self.kfd().map_or(Ok(()), |kfd| kfd.resume())
    }

    fn check_vmid(vmid: u32) -> KgdResult<()> {
        if vmid > MAX_VMID {
            return Err(KgdError::InvalidArgument(format!("VMID {vmid} out of range")));
        }
        Ok(())
    }
}

impl Drop for RadeonKgd {
    fn drop(&mut self) {
        self.detach();
    }
}

impl Kfd2Kgd for RadeonKgd {
    fn create_vm(&self) -> KgdResult<Arc<GpuVm>> {
        let vm = GpuVm::new(self.store.clone(), self.writer.clone(), self.config.vm_size)?;
        Ok(Arc::new(vm))
    }

    fn allocate_memory(
        &self,
        vm: &Arc<GpuVm>,
        va: u64,
        size: u64,
        flags: AllocFlags,
    ) -> KgdResult<GpuMemoryObject> {
        self.memory.allocate_memory(vm, va, size, flags)
    }

    fn import_memory(
        &self,
        vm: &Arc<GpuVm>,
        va: u64,
        buffer: ImportedBuffer,
        flags: AllocFlags,
    ) -> KgdResult<GpuMemoryObject> {
        self.memory.import_memory(vm, va, buffer, flags)
    }

    fn free_memory(&self, object: GpuMemoryObject) -> KgdResult<()> {
        self.memory.free_memory(object)
    }

    fn map_memory_to_gpu(&self, object: &GpuMemoryObject) -> KgdResult<()> {
        self.memory.map_to_gpu(object)
    }

    fn unmap_memory_from_gpu(&self, object: &GpuMemoryObject) -> KgdResult<()> {
        self.memory.unmap_from_gpu(object)
    }

    fn program_sh_mem_settings(
        &self,
        vmid: u32,
        sh_mem_config: u32,
        sh_mem_ape1_base: u32,
        sh_mem_ape1_limit: u32,
        sh_mem_bases: u32,
    ) {
        let bank = self.srbm.select_vmid(&*self.regs, vmid);
        bank.write32(SH_MEM_CONFIG, sh_mem_config);
        bank.write32(SH_MEM_APE1_BASE, sh_mem_ape1_base);
        bank.write32(SH_MEM_APE1_LIMIT, sh_mem_ape1_limit);
        bank.write32(SH_MEM_BASES, sh_mem_bases);
    }

    fn set_pasid_vmid_mapping(&self, pasid: u32, vmid: u32) -> KgdResult<()> {
        Self::check_vmid(vmid)?;

        // PASID 0 unmaps the VMID
        let mapping = if pasid == 0 {
            0
        } else {
            pasid | ATC_VMID_PASID_MAPPING_VALID
        };
        self.regs.write32(ATC_VMID0_PASID_MAPPING + vmid * 4, mapping);

        let deadline = Instant::now() + self.config.pasid_update_timeout;
        while self.regs.read32(ATC_VMID_PASID_MAPPING_UPDATE_STATUS) & (1 << vmid) == 0 {
            if Instant::now() >= deadline {
                warn!("RadeonKgd: ATC did not acknowledge PASID {pasid} -> VMID {vmid}");
                return Err(KgdError::Timeout);
            }
            hint::spin_loop();
        }
        self.regs.write32(ATC_VMID_PASID_MAPPING_UPDATE_STATUS, 1 << vmid);

        // The IH block keeps its own copy
        self.regs.write32(IH_VMID_0_LUT + vmid * 4, mapping);

        debug!("RadeonKgd: PASID {pasid} -> VMID {vmid}");
        Ok(())
    }

    fn init_pipeline(&self, pipe_id: u32, hpd_size: u32, hpd_gpu_addr: u64) -> KgdResult<()> {
        if !is_aligned(hpd_gpu_addr, 256) {
            return Err(KgdError::InvalidArgument(format!(
                "HPD address {hpd_gpu_addr:#x} is not 256-byte aligned"
            )));
        }

        let (mec, pipe) = compute_pipe(pipe_id);
        let bank = self.srbm.select(&*self.regs, mec, pipe, 0, 0);
        bank.write32(CP_HPD_EOP_BASE_ADDR, lower_32_bits(hpd_gpu_addr >> 8));
        bank.write32(CP_HPD_EOP_BASE_ADDR_HI, upper_32_bits(hpd_gpu_addr >> 8));
        bank.write32(CP_HPD_EOP_VMID, 0);
        bank.write32(CP_HPD_EOP_CONTROL, hpd_size);
        Ok(())
    }

    fn hqd_load(
        &self,
        mqd: &CikMqd,
        pipe_id: u32,
        queue_id: u32,
        wptr: Option<&dyn UserWord>,
        page_table_base: u64,
    ) -> KgdResult<()> {
        self.hqd.load(mqd, pipe_id, queue_id, wptr, page_table_base)
    }

    fn hqd_is_occupied(&self, queue_address: u64, pipe_id: u32, queue_id: u32) -> bool {
        self.hqd.is_occupied(queue_address, pipe_id, queue_id)
    }

    fn hqd_destroy(
        &self,
        reset_type: ResetType,
        timeout: Duration,
        pipe_id: u32,
        queue_id: u32,
    ) -> KgdResult<()> {
        self.hqd.destroy(reset_type, timeout, pipe_id, queue_id)
    }

    fn gpu_clock_counter(&self) -> u64 {
        let _clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        self.regs.write32(RLC_CAPTURE_GPU_CLOCK_COUNT, 1);
        u64::from(self.regs.read32(RLC_GPU_CLOCK_COUNT_LSB))
            | (u64::from(self.regs.read32(RLC_GPU_CLOCK_COUNT_MSB)) << 32)
    }

    fn max_engine_clock_mhz(&self) -> u32 {
        self.config.max_engine_clock_mhz
    }

    fn vram_size(&self) -> u64 {
        self.config.vram_size
    }

    fn firmware_version(&self, fw: FirmwareType) -> u16 {
        self.config.firmware.get(fw)
    }

    fn cu_info(&self) -> CuInfo {
        self.config.cu_info
    }
}
