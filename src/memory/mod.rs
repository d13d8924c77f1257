pub mod manager;

use crate::bo::{
    BO_FLAG_CPU_ACCESS, BO_FLAG_GTT_USWC, BO_FLAG_NO_CPU_ACCESS, BO_FLAG_READ_ONLY, BoHandle,
    MemoryDomain,
};
use crate::vm::{GpuVm, PTE_READABLE, PTE_WRITEABLE, VmBinding};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Flags controlling memory allocation behavior.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    pub vram: bool,
    pub gtt: bool,
    pub host_access: bool,
    pub read_only: bool,
    pub uncached: bool,
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn vram(mut self) -> Self {
        self.vram = true;
        self
    }

    #[must_use]
    pub const fn gtt(mut self) -> Self {
        self.gtt = true;
        self.host_access = true;
        self
    }

    #[must_use]
    pub const fn host_access(mut self) -> Self {
        self.host_access = true;
        self
    }

    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub const fn uncached(mut self) -> Self {
        self.uncached = true;
        self
    }

    /// VRAM wins when both domains are requested.
    #[must_use]
    pub const fn domain(self) -> MemoryDomain {
        if self.vram {
            MemoryDomain::Vram
        } else {
            MemoryDomain::Gtt
        }
    }

    /// Access bits of the PTEs that map this memory.
    #[must_use]
    pub const fn to_pte_flags(self) -> u64 {
        if self.read_only {
            PTE_READABLE
        } else {
            PTE_READABLE | PTE_WRITEABLE
        }
    }

    /// Flags for `BoStore::create`. VRAM is never CPU accessible.
    #[must_use]
    pub const fn to_bo_flags(self) -> u32 {
        let mut flags = 0;

        if self.vram {
            flags |= BO_FLAG_NO_CPU_ACCESS;
        } else if self.host_access {
            flags |= BO_FLAG_CPU_ACCESS;
        }
        if self.uncached && !self.vram {
            flags |= BO_FLAG_GTT_USWC;
        }
        if self.read_only {
            flags |= BO_FLAG_READ_ONLY;
        }

        flags
    }
}

/// A buffer object owned by another driver and shared into this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedBuffer {
    pub bo: BoHandle,
    pub size: u64,
}

impl ImportedBuffer {
    #[must_use]
    pub const fn new(bo: BoHandle, size: u64) -> Self {
        Self { bo, size }
    }
}

/// Where a memory object's backing comes from.
///
/// Native buffers are created and destroyed by the memory manager. Imported
/// buffers are only bound and mapped; their owner releases them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Native(BoHandle),
    Imported(ImportedBuffer),
}

impl Backing {
    #[must_use]
    pub const fn bo(&self) -> BoHandle {
        match self {
            Self::Native(bo) => *bo,
            Self::Imported(buffer) => buffer.bo,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemState {
    pub(crate) mapped_to_gpu: bool,
    pub(crate) gpu_address: Option<u64>,
}

/// A GPU memory allocation bound into one VM at a fixed address.
///
/// `is_mapped()` is true exactly when the buffer, the page directory and every
/// page-table block spanning the range are pinned on this object's account.
#[derive(Debug)]
pub struct GpuMemoryObject {
    backing: Backing,
    domain: MemoryDomain,
    size: u64,
    flags: AllocFlags,
    binding: VmBinding,
    state: Mutex<MemState>,
}

impl GpuMemoryObject {
    pub(crate) fn new(
        backing: Backing,
        domain: MemoryDomain,
        size: u64,
        flags: AllocFlags,
        binding: VmBinding,
    ) -> Self {
        Self {
            backing,
            domain,
            size,
            flags,
            binding,
            state: Mutex::new(MemState::default()),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    #[must_use]
    pub const fn bo(&self) -> BoHandle {
        self.backing.bo()
    }

    #[must_use]
    pub const fn is_imported(&self) -> bool {
        matches!(self.backing, Backing::Imported(_))
    }

    #[must_use]
    pub const fn domain(&self) -> MemoryDomain {
        self.domain
    }

    #[must_use]
    pub const fn va(&self) -> u64 {
        self.binding.va()
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn flags(&self) -> AllocFlags {
        self.flags
    }

    #[must_use]
    pub const fn binding(&self) -> &VmBinding {
        &self.binding
    }

    #[must_use]
    pub const fn vm(&self) -> &Arc<GpuVm> {
        self.binding.vm()
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.lock_state().mapped_to_gpu
    }

    /// Address the buffer is pinned at while mapped.
    #[must_use]
    pub fn gpu_address(&self) -> Option<u64> {
        self.lock_state().gpu_address
    }
}

pub use manager::MemoryManager;
