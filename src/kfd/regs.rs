#![allow(clippy::cast_possible_truncation)]

use crate::error::{KgdError, KgdResult};
use log::warn;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

// ===============================================================================================
// Register offsets (CIK, byte offsets into the MMIO BAR)
// ===============================================================================================

pub const SRBM_GFX_CNTL: u32 = 0x0E44;

pub const fn srbm_pipeid(x: u32) -> u32 {
    x & 0x3
}
pub const fn srbm_meid(x: u32) -> u32 {
    (x & 0x3) << 2
}
pub const fn srbm_vmid(x: u32) -> u32 {
    (x & 0xF) << 4
}
pub const fn srbm_queueid(x: u32) -> u32 {
    (x & 0x7) << 8
}

pub const VM_CONTEXT0_PAGE_TABLE_BASE_ADDR: u32 = 0x153C;
pub const VM_CONTEXT8_PAGE_TABLE_BASE_ADDR: u32 = 0x1438;

pub const ATC_VMID_PASID_MAPPING_UPDATE_STATUS: u32 = 0x3398;
pub const ATC_VMID0_PASID_MAPPING: u32 = 0x339C;
pub const ATC_VMID_PASID_MAPPING_VALID: u32 = 1 << 31;

pub const IH_VMID_0_LUT: u32 = 0x3D40;

pub const SH_MEM_BASES: u32 = 0x8C28;
pub const SH_MEM_APE1_BASE: u32 = 0x8C2C;
pub const SH_MEM_APE1_LIMIT: u32 = 0x8C30;
pub const SH_MEM_CONFIG: u32 = 0x8C34;

pub const COMPUTE_STATIC_THREAD_MGMT_SE0: u32 = 0xB858;
pub const COMPUTE_STATIC_THREAD_MGMT_SE1: u32 = 0xB85C;
pub const COMPUTE_STATIC_THREAD_MGMT_SE2: u32 = 0xB864;
pub const COMPUTE_STATIC_THREAD_MGMT_SE3: u32 = 0xB868;

pub const RLC_GPU_CLOCK_COUNT_LSB: u32 = 0xC390;
pub const RLC_GPU_CLOCK_COUNT_MSB: u32 = 0xC394;
pub const RLC_CAPTURE_GPU_CLOCK_COUNT: u32 = 0xC398;

pub const CP_HPD_EOP_BASE_ADDR: u32 = 0xC904;
pub const CP_HPD_EOP_BASE_ADDR_HI: u32 = 0xC908;
pub const CP_HPD_EOP_VMID: u32 = 0xC90C;
pub const CP_HPD_EOP_CONTROL: u32 = 0xC910;

pub const CP_MQD_BASE_ADDR: u32 = 0xC914;
pub const CP_MQD_BASE_ADDR_HI: u32 = 0xC918;
pub const CP_HQD_ACTIVE: u32 = 0xC91C;
pub const CP_HQD_VMID: u32 = 0xC920;
pub const CP_HQD_PERSISTENT_STATE: u32 = 0xC924;
pub const CP_HQD_PIPE_PRIORITY: u32 = 0xC928;
pub const CP_HQD_QUEUE_PRIORITY: u32 = 0xC92C;
pub const CP_HQD_QUANTUM: u32 = 0xC930;
pub const CP_HQD_PQ_BASE: u32 = 0xC934;
pub const CP_HQD_PQ_BASE_HI: u32 = 0xC938;
pub const CP_HQD_PQ_RPTR: u32 = 0xC93C;
pub const CP_HQD_PQ_RPTR_REPORT_ADDR: u32 = 0xC940;
pub const CP_HQD_PQ_RPTR_REPORT_ADDR_HI: u32 = 0xC944;
pub const CP_HQD_PQ_WPTR_POLL_ADDR: u32 = 0xC948;
pub const CP_HQD_PQ_WPTR_POLL_ADDR_HI: u32 = 0xC94C;
pub const CP_HQD_PQ_DOORBELL_CONTROL: u32 = 0xC950;
pub const CP_HQD_PQ_WPTR: u32 = 0xC954;
pub const CP_HQD_PQ_CONTROL: u32 = 0xC958;
pub const CP_HQD_IB_BASE_ADDR: u32 = 0xC95C;
pub const CP_HQD_IB_BASE_ADDR_HI: u32 = 0xC960;
pub const CP_HQD_IB_RPTR: u32 = 0xC964;
pub const CP_HQD_IB_CONTROL: u32 = 0xC968;
pub const CP_HQD_IQ_TIMER: u32 = 0xC96C;
pub const CP_HQD_IQ_RPTR: u32 = 0xC970;
pub const CP_HQD_DEQUEUE_REQUEST: u32 = 0xC974;
pub const CP_HQD_DMA_OFFLOAD: u32 = 0xC978;
pub const CP_HQD_SEMA_CMD: u32 = 0xC97C;
pub const CP_HQD_MSG_TYPE: u32 = 0xC980;
pub const CP_HQD_ATOMIC0_PREOP_LO: u32 = 0xC984;
pub const CP_HQD_ATOMIC0_PREOP_HI: u32 = 0xC988;
pub const CP_HQD_ATOMIC1_PREOP_LO: u32 = 0xC98C;
pub const CP_HQD_ATOMIC1_PREOP_HI: u32 = 0xC990;
pub const CP_HQD_HQ_SCHEDULER0: u32 = 0xC994;
pub const CP_HQD_HQ_SCHEDULER1: u32 = 0xC998;
pub const CP_MQD_CONTROL: u32 = 0xC99C;

pub const CP_HQD_ACTIVE_ACTIVE: u32 = 1 << 0;

/// Compute pipes per MEC on CIK.
pub const CIK_PIPE_PER_MEC: u32 = 4;

/// Page-table base register of `vmid`. Contexts 0-7 and 8-15 live in two banks.
#[must_use]
pub const fn vm_context_page_table_base(vmid: u32) -> u32 {
    if vmid < 8 {
        VM_CONTEXT0_PAGE_TABLE_BASE_ADDR + vmid * 4
    } else {
        VM_CONTEXT8_PAGE_TABLE_BASE_ADDR + (vmid - 8) * 4
    }
}

// ===============================================================================================
// Access
// ===============================================================================================

/// 32-bit register file access.
pub trait RegisterAccess: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// A memory-mapped register BAR, e.g. `/sys/bus/pci/devices/<bdf>/resource5`.
#[derive(Debug)]
pub struct MmioRegisters {
    base: *mut u8,
    size: usize,
}

// Accesses are single volatile 32-bit loads and stores.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Maps the first `size` bytes of `path` read/write.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be opened or mapped.
    pub fn open(path: impl AsRef<Path>, size: usize) -> KgdResult<Self> {
        if size == 0 {
            return Err(KgdError::InvalidArgument("empty register window".into()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self {
            base: base.cast::<u8>(),
            size,
        })
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    fn check(&self, offset: u32) -> bool {
        let ok = offset % 4 == 0 && (offset as usize) + 4 <= self.size;
        if !ok {
            warn!("MmioRegisters: bad register offset {offset:#x}");
        }
        ok
    }
}

impl RegisterAccess for MmioRegisters {
    fn read32(&self, offset: u32) -> u32 {
        if !self.check(offset) {
            return u32::MAX;
        }
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            ptr::read_volatile(self.base.add(offset as usize).cast::<u32>())
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        if !self.check(offset) {
            return;
        }
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            ptr::write_volatile(self.base.add(offset as usize).cast::<u32>(), value);
        }
    }
}

impl Drop for MmioRegisters {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}

// ===============================================================================================
// SRBM bank selection
// ===============================================================================================

/// Serializes use of `SRBM_GFX_CNTL`, which selects which queue or VMID bank
/// the banked registers address.
#[derive(Debug, Default)]
pub struct SrbmLock {
    lock: Mutex<()>,
}

impl SrbmLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the bank for (`mec`, `pipe`, `queue`, `vmid`) and holds it until
    /// the guard drops.
    pub fn select<'a>(
        &'a self,
        regs: &'a dyn RegisterAccess,
        mec: u32,
        pipe: u32,
        queue: u32,
        vmid: u32,
    ) -> SrbmGuard<'a> {
        let lock = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        regs.write32(
            SRBM_GFX_CNTL,
            srbm_pipeid(pipe) | srbm_meid(mec) | srbm_vmid(vmid) | srbm_queueid(queue),
        );
        SrbmGuard { regs, _lock: lock }
    }

    /// Selects the bank of compute queue `queue` on `pipe_id`, counted from the
    /// first pipe usable for compute (MEC1 pipe 1).
    pub fn select_queue<'a>(
        &'a self,
        regs: &'a dyn RegisterAccess,
        pipe_id: u32,
        queue: u32,
    ) -> SrbmGuard<'a> {
        let (mec, pipe) = compute_pipe(pipe_id);
        self.select(regs, mec, pipe, queue, 0)
    }

    pub fn select_vmid<'a>(&'a self, regs: &'a dyn RegisterAccess, vmid: u32) -> SrbmGuard<'a> {
        self.select(regs, 0, 0, 0, vmid)
    }
}

/// (MEC, pipe) of compute pipe `pipe_id`. Pipe 0 of MEC1 belongs to the kernel
/// driver and is skipped.
#[must_use]
pub const fn compute_pipe(pipe_id: u32) -> (u32, u32) {
    let pipe_id = pipe_id + 1;
    (pipe_id / CIK_PIPE_PER_MEC + 1, pipe_id % CIK_PIPE_PER_MEC)
}

/// A selected SRBM bank. Dropping it resets the selection, then releases the lock.
pub struct SrbmGuard<'a> {
    regs: &'a dyn RegisterAccess,
    _lock: MutexGuard<'a, ()>,
}

impl SrbmGuard<'_> {
    pub fn read32(&self, offset: u32) -> u32 {
        self.regs.read32(offset)
    }

    pub fn write32(&self, offset: u32, value: u32) {
        self.regs.write32(offset, value);
    }
}

impl Drop for SrbmGuard<'_> {
    fn drop(&mut self) {
        self.regs.write32(SRBM_GFX_CNTL, 0);
    }
}
