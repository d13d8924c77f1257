//! Per-process GPU virtual address space.
//!
//! A [`GpuVm`] owns a page directory and a sparse set of page-table blocks, each
//! block translating [`PTES_PER_BLOCK`] GPU pages. Structural changes and all
//! page-table edits happen under the VM mutex through a [`VmGuard`]. Pinning of
//! the page directory and blocks is reference counted per VM and happens
//! outside that mutex.

pub mod aperture;
pub mod host;

use crate::bo::{
    BO_FLAG_NO_CPU_ACCESS, BoHandle, BoStore, MemoryDomain, Reservation, ReservationSet,
};
use crate::error::{KgdError, KgdResult};
use crate::utils::{align_up, checked_align_up, is_aligned};
use aperture::Aperture;
use log::{debug, error, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const GPU_PAGE_SHIFT: u32 = 12;
pub const GPU_PAGE_SIZE: u64 = 1 << GPU_PAGE_SHIFT;

/// log2 of the number of PTEs in one page-table block.
pub const VM_BLOCK_SHIFT: u32 = 9;
pub const PTES_PER_BLOCK: u64 = 1 << VM_BLOCK_SHIFT;
pub const PT_BLOCK_BYTES: u64 = PTES_PER_BLOCK * 8;
/// Bytes of address space translated by one page-table block (2 MiB).
pub const BLOCK_SPAN: u64 = PTES_PER_BLOCK << GPU_PAGE_SHIFT;

pub const PDE_VALID: u64 = 1 << 0;

pub const PTE_VALID: u64 = 1 << 0;
pub const PTE_SYSTEM: u64 = 1 << 1;
pub const PTE_SNOOPED: u64 = 1 << 2;
pub const PTE_READABLE: u64 = 1 << 5;
pub const PTE_WRITEABLE: u64 = 1 << 6;

/// The page-table walker's update service.
///
/// Implementations write entries into page-directory and page-table buffers.
/// An entry value of zero means "not present".
pub trait PageTableWriter: Send + Sync {
    fn write_pde(&self, pd: BoHandle, index: u64, entry: u64) -> KgdResult<()>;

    /// Writes `count` PTEs starting at `first`. Entry `i` is `(addr + i * incr) | flags`,
    /// or zero when `flags` is zero.
    fn write_ptes(
        &self,
        pt: BoHandle,
        first: u64,
        count: u64,
        addr: u64,
        incr: u64,
        flags: u64,
    ) -> KgdResult<()>;
}

/// Where a binding's PTEs point: a pinned buffer address and its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteTarget {
    pub address: u64,
    pub domain: MemoryDomain,
}

impl PteTarget {
    const fn flags(self, permissions: u64) -> u64 {
        match self.domain {
            MemoryDomain::Gtt => permissions | PTE_VALID | PTE_SYSTEM | PTE_SNOOPED,
            MemoryDomain::Vram => permissions | PTE_VALID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

/// Inclusive range of GPU page frame numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfnRange {
    pub start: u64,
    pub last: u64,
}

impl PfnRange {
    #[must_use]
    pub const fn first_block(&self) -> u64 {
        self.start >> VM_BLOCK_SHIFT
    }

    #[must_use]
    pub const fn last_block(&self) -> u64 {
        self.last >> VM_BLOCK_SHIFT
    }

    /// Splits the range at block boundaries:
    /// `(block, first pte in block, pte count, page offset from start)`.
    fn pieces(self) -> impl Iterator<Item = (u64, u64, u64, u64)> {
        let mut pfn = self.start;
        std::iter::from_fn(move || {
            if pfn > self.last {
                return None;
            }
            let block = pfn >> VM_BLOCK_SHIFT;
            let block_last = ((block + 1) << VM_BLOCK_SHIFT) - 1;
            let end = block_last.min(self.last);
            let piece = (
                block,
                pfn & (PTES_PER_BLOCK - 1),
                end - pfn + 1,
                pfn - self.start,
            );
            pfn = end + 1;
            Some(piece)
        })
    }
}

#[derive(Debug)]
struct PageTableBlock {
    bo: BoHandle,
    // Bindings whose interval spans this block
    refs: u32,
    // PDE as last written
    pde: u64,
}

#[derive(Debug)]
struct BindingState {
    bo: BoHandle,
    range: Option<PfnRange>,
    permissions: u64,
    // Blocks this binding holds a reference on
    blocks: Vec<u64>,
    target: Option<PteTarget>,
    ptes_live: bool,
}

#[derive(Debug)]
struct VmInner {
    aperture: Aperture,
    blocks: BTreeMap<u64, PageTableBlock>,
    bindings: HashMap<BindingId, BindingState>,
    freed: Vec<PfnRange>,
    invalidated: Vec<BindingId>,
    next_binding: u64,
}

#[derive(Debug, Default)]
struct PinCounts {
    blocks: HashMap<u64, (BoHandle, u32)>,
    page_directory: u32,
}

/// A GPU virtual address space.
pub struct GpuVm {
    store: Arc<dyn BoStore>,
    writer: Arc<dyn PageTableWriter>,
    page_directory: BoHandle,
    max_address: u64,
    vmid: AtomicU32,
    inner: Mutex<VmInner>,
    pins: Mutex<PinCounts>,
}

impl fmt::Debug for GpuVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuVm")
            .field("page_directory", &self.page_directory)
            .field("max_address", &self.max_address)
            .field("vmid", &self.vmid())
            .finish_non_exhaustive()
    }
}

impl GpuVm {
    /// Creates an empty address space of `vm_size` bytes and allocates its page directory.
    pub fn new(
        store: Arc<dyn BoStore>,
        writer: Arc<dyn PageTableWriter>,
        vm_size: u64,
    ) -> KgdResult<Self> {
        if vm_size < BLOCK_SPAN || !is_aligned(vm_size, BLOCK_SPAN) {
            return Err(KgdError::InvalidArgument(format!(
                "VM size {vm_size:#x} is not a multiple of {BLOCK_SPAN:#x}"
            )));
        }

        let pd_entries = vm_size / BLOCK_SPAN;
        let page_directory = store
            .create(
                align_up(pd_entries * 8, GPU_PAGE_SIZE),
                GPU_PAGE_SIZE,
                MemoryDomain::Vram,
                BO_FLAG_NO_CPU_ACCESS,
            )
            .map_err(|e| {
                warn!("GpuVm: page directory allocation failed: {e}");
                KgdError::OutOfMemory
            })?;

        debug!("GpuVm: created {vm_size:#x} byte VM, page directory {page_directory}");

        Ok(Self {
            store,
            writer,
            page_directory,
            max_address: vm_size,
            vmid: AtomicU32::new(0),
            inner: Mutex::new(VmInner {
                // Page 0 stays unmapped so a zero address is never valid
                aperture: Aperture::new(GPU_PAGE_SIZE, vm_size),
                blocks: BTreeMap::new(),
                bindings: HashMap::new(),
                freed: Vec::new(),
                invalidated: Vec::new(),
                next_binding: 1,
            }),
            pins: Mutex::new(PinCounts::default()),
        })
    }

    /// Takes the VM mutex.
    pub fn lock(&self) -> VmGuard<'_> {
        VmGuard {
            vm: self,
            inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            touched: Vec::new(),
        }
    }

    fn lock_pins(&self) -> MutexGuard<'_, PinCounts> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn BoStore> {
        &self.store
    }

    #[must_use]
    pub const fn page_directory(&self) -> BoHandle {
        self.page_directory
    }

    /// GPU address of the page directory, valid while it is pinned.
    #[must_use]
    pub fn page_directory_address(&self) -> Option<u64> {
        self.store.gpu_address(self.page_directory)
    }

    #[must_use]
    pub const fn max_address(&self) -> u64 {
        self.max_address
    }

    /// Hardware VMID this VM is bound to, 0 when unbound.
    #[must_use]
    pub fn vmid(&self) -> u32 {
        self.vmid.load(Ordering::Acquire)
    }

    pub fn set_vmid(&self, vmid: u32) {
        self.vmid.store(vmid, Ordering::Release);
    }

    pub fn create_binding(&self, bo: BoHandle) -> KgdResult<BindingId> {
        self.lock().create_binding(bo)
    }

    pub fn remove_binding(&self, id: BindingId) {
        self.lock().remove_binding(id);
    }

    pub fn assign_address(
        &self,
        id: BindingId,
        va: u64,
        size: u64,
        permissions: u64,
    ) -> KgdResult<PfnRange> {
        self.lock().assign_address(id, va, size, permissions)
    }

    /// Every buffer object the VM references: the page directory, its
    /// page-table blocks and every bound buffer.
    #[must_use]
    pub fn referenced_bos(&self) -> Vec<BoHandle> {
        let guard = self.lock();
        let inner = &guard.inner;
        let mut bos = Vec::with_capacity(1 + inner.blocks.len() + inner.bindings.len());
        bos.push(self.page_directory);
        bos.extend(inner.blocks.values().map(|b| b.bo));
        bos.extend(inner.bindings.values().map(|b| b.bo));
        bos
    }

    /// Queues every binding of `bo` for a PTE rewrite, e.g. after the store moved it.
    pub fn invalidate_bo(&self, bo: BoHandle) {
        let mut guard = self.lock();
        let inner = &mut *guard.inner;
        for (id, binding) in &inner.bindings {
            if binding.bo == bo && binding.range.is_some() && !inner.invalidated.contains(id) {
                inner.invalidated.push(*id);
            }
        }
    }

    fn binding_blocks(&self, id: BindingId) -> KgdResult<Vec<(u64, BoHandle)>> {
        let guard = self.lock();
        let binding = guard
            .inner
            .bindings
            .get(&id)
            .ok_or_else(|| KgdError::InvalidArgument(format!("unknown binding {id:?}")))?;
        Ok(binding
            .blocks
            .iter()
            .filter_map(|idx| guard.inner.blocks.get(idx).map(|b| (*idx, b.bo)))
            .collect())
    }

    /// Runs `f` with `bo` reserved. The reservation is taken here unless
    /// `held` already covers it; it is always taken before the pin counts.
    fn reserved<T>(
        &self,
        held: Option<&ReservationSet<'_>>,
        bo: BoHandle,
        f: impl FnOnce() -> KgdResult<T>,
    ) -> KgdResult<T> {
        if held.is_some_and(|set| set.contains(bo)) {
            return f();
        }
        let _reservation = Reservation::acquire(&*self.store, bo)?;
        f()
    }

    fn pin_block(
        &self,
        held: Option<&ReservationSet<'_>>,
        idx: u64,
        bo: BoHandle,
    ) -> KgdResult<()> {
        self.reserved(held, bo, || {
            let mut pins = self.lock_pins();
            let users = pins.blocks.get(&idx).map_or(0, |&(_, n)| n);
            if users == 0 {
                self.store.pin(bo, MemoryDomain::Vram)?;
            }
            pins.blocks.insert(idx, (bo, users + 1));
            Ok(())
        })
    }

    fn unpin_block(
        &self,
        held: Option<&ReservationSet<'_>>,
        idx: u64,
        bo: BoHandle,
    ) -> KgdResult<()> {
        self.reserved(held, bo, || {
            let mut pins = self.lock_pins();
            debug_assert!(pins.blocks.contains_key(&idx), "block {idx} is not pinned");
            match pins.blocks.get(&idx).copied() {
                None => Err(KgdError::NotPinned(bo)),
                Some((_, 1)) => {
                    pins.blocks.remove(&idx);
                    self.store.unpin(bo)
                }
                Some((bo, n)) => {
                    pins.blocks.insert(idx, (bo, n - 1));
                    Ok(())
                }
            }
        })
    }

    /// Pins every page-table block the binding spans, in ascending block order.
    ///
    /// Blocks not covered by `held` are reserved one at a time around their
    /// pin. A block already pinned for another mapped binding only gains a
    /// user. On failure the blocks pinned by this call are released in
    /// descending order.
    pub fn pin_page_tables(
        &self,
        id: BindingId,
        held: Option<&ReservationSet<'_>>,
    ) -> KgdResult<()> {
        let blocks = self.binding_blocks(id)?;
        let mut pinned = Vec::with_capacity(blocks.len());

        for (idx, bo) in blocks {
            if let Err(e) = self.pin_block(held, idx, bo) {
                for (idx, bo) in pinned.into_iter().rev() {
                    if let Err(ue) = self.unpin_block(held, idx, bo) {
                        warn!("GpuVm: unwinding pin of block {idx} failed: {ue}");
                    }
                }
                return Err(e);
            }
            pinned.push((idx, bo));
        }
        Ok(())
    }

    /// Drops this binding's user on each of its blocks. Continues past errors
    /// and reports the first.
    pub fn unpin_page_tables(
        &self,
        id: BindingId,
        held: Option<&ReservationSet<'_>>,
    ) -> KgdResult<()> {
        let mut first_err = None;
        for (idx, bo) in self.binding_blocks(id)? {
            if let Err(e) = self.unpin_block(held, idx, bo) {
                warn!("GpuVm: unpin of block {idx} failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn pin_page_directory(&self, held: Option<&ReservationSet<'_>>) -> KgdResult<()> {
        self.reserved(held, self.page_directory, || {
            let mut pins = self.lock_pins();
            if pins.page_directory == 0 {
                self.store.pin(self.page_directory, MemoryDomain::Vram)?;
            }
            pins.page_directory += 1;
            Ok(())
        })
    }

    pub fn unpin_page_directory(&self, held: Option<&ReservationSet<'_>>) -> KgdResult<()> {
        self.reserved(held, self.page_directory, || {
            let mut pins = self.lock_pins();
            debug_assert!(pins.page_directory > 0, "page directory is not pinned");
            match pins.page_directory {
                0 => Err(KgdError::NotPinned(self.page_directory)),
                1 => {
                    pins.page_directory = 0;
                    self.store.unpin(self.page_directory)
                }
                _ => {
                    pins.page_directory -= 1;
                    Ok(())
                }
            }
        })
    }

    #[must_use]
    pub fn page_table_count(&self) -> usize {
        self.lock().inner.blocks.len()
    }

    #[must_use]
    pub fn block_bo(&self, idx: u64) -> Option<BoHandle> {
        self.lock().inner.blocks.get(&idx).map(|b| b.bo)
    }

    /// Number of mapped bindings currently holding a pin on block `idx`.
    #[must_use]
    pub fn block_pin_users(&self, idx: u64) -> u32 {
        self.lock_pins().blocks.get(&idx).map_or(0, |&(_, n)| n)
    }

    #[must_use]
    pub fn page_directory_pin_users(&self) -> u32 {
        self.lock_pins().page_directory
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.lock().inner.bindings.len()
    }

    #[must_use]
    pub fn pending_freed(&self) -> usize {
        self.lock().inner.freed.len()
    }

    #[must_use]
    pub fn pending_invalid(&self) -> usize {
        self.lock().inner.invalidated.len()
    }
}

impl Drop for GpuVm {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !inner.bindings.is_empty() {
            error!(
                "GpuVm: dropped with {} live bindings, their page tables are released anyway",
                inner.bindings.len()
            );
        }
        for (_, block) in std::mem::take(&mut inner.blocks) {
            self.store.destroy(block.bo);
        }
        self.store.destroy(self.page_directory);
    }
}

/// The VM mutex, held. Page-table edits made through the guard record the
/// buffers they touched; [`VmGuard::finish`] hands that list back.
pub struct VmGuard<'a> {
    vm: &'a GpuVm,
    inner: MutexGuard<'a, VmInner>,
    touched: Vec<BoHandle>,
}

impl VmGuard<'_> {
    /// Creates the binding record for `bo`. One binding per buffer per VM.
    pub fn create_binding(&mut self, bo: BoHandle) -> KgdResult<BindingId> {
        if self.inner.bindings.values().any(|b| b.bo == bo) {
            return Err(KgdError::BindingExists(bo));
        }

        let id = BindingId(self.inner.next_binding);
        self.inner.next_binding += 1;
        self.inner.bindings.insert(
            id,
            BindingState {
                bo,
                range: None,
                permissions: 0,
                blocks: Vec::new(),
                target: None,
                ptes_live: false,
            },
        );
        Ok(id)
    }

    /// Places the binding at `[va, va + size)` and allocates any page-table
    /// blocks the range needs that do not exist yet.
    ///
    /// A failed block allocation leaves the blocks allocated so far referenced
    /// by the binding; removing the binding and draining the freed list
    /// releases them.
    pub fn assign_address(
        &mut self,
        id: BindingId,
        va: u64,
        size: u64,
        permissions: u64,
    ) -> KgdResult<PfnRange> {
        if va == 0 || size == 0 || !is_aligned(va, GPU_PAGE_SIZE) {
            return Err(KgdError::InvalidVirtualAddress(va));
        }
        let size =
            checked_align_up(size, GPU_PAGE_SIZE).ok_or(KgdError::InvalidVirtualAddress(va))?;

        let inner = &mut *self.inner;
        let binding = inner
            .bindings
            .get_mut(&id)
            .ok_or_else(|| KgdError::InvalidArgument(format!("unknown binding {id:?}")))?;
        if binding.range.is_some() {
            return Err(KgdError::InvalidArgument(format!(
                "binding {id:?} already has an address"
            )));
        }
        if !inner.aperture.reserve_fixed(va, size) {
            return Err(KgdError::InvalidVirtualAddress(va));
        }

        let range = PfnRange {
            start: va >> GPU_PAGE_SHIFT,
            last: ((va + size) >> GPU_PAGE_SHIFT) - 1,
        };
        binding.range = Some(range);
        binding.permissions = permissions;

        for idx in range.first_block()..=range.last_block() {
            if let Some(block) = inner.blocks.get_mut(&idx) {
                block.refs += 1;
            } else {
                let bo = self
                    .vm
                    .store
                    .create(
                        PT_BLOCK_BYTES,
                        GPU_PAGE_SIZE,
                        MemoryDomain::Vram,
                        BO_FLAG_NO_CPU_ACCESS,
                    )
                    .map_err(|e| {
                        warn!("GpuVm: page table block {idx} allocation failed: {e}");
                        KgdError::OutOfMemory
                    })?;
                inner.blocks.insert(idx, PageTableBlock { bo, refs: 1, pde: 0 });
            }
            binding.blocks.push(idx);
        }

        Ok(range)
    }

    /// Deletes the binding. If its PTEs may still be live, the range is queued
    /// on the freed list for the next [`clear_freed`](Self::clear_freed).
    pub fn remove_binding(&mut self, id: BindingId) {
        let inner = &mut *self.inner;
        let Some(binding) = inner.bindings.remove(&id) else {
            warn!("GpuVm: remove of unknown binding {id:?}");
            return;
        };

        if let Some(range) = binding.range {
            inner.aperture.release(range.start << GPU_PAGE_SHIFT);
            if binding.ptes_live {
                inner.freed.push(range);
            }
        }
        for idx in &binding.blocks {
            if let Some(block) = inner.blocks.get_mut(idx) {
                block.refs -= 1;
            }
        }
        inner.invalidated.retain(|x| *x != id);
    }

    /// Brings every PDE in line with the current placement of its block.
    pub fn update_page_directory(&mut self) -> KgdResult<()> {
        let vm = self.vm;
        for (idx, block) in &mut self.inner.blocks {
            let entry = vm
                .store
                .gpu_address(block.bo)
                .map_or(0, |addr| addr | PDE_VALID);
            if entry != block.pde {
                vm.writer.write_pde(vm.page_directory, *idx, entry)?;
                block.pde = entry;
                self.touched.push(vm.page_directory);
            }
        }
        Ok(())
    }

    fn write_range(&mut self, range: PfnRange, base: u64, flags: u64) -> KgdResult<()> {
        let vm = self.vm;
        let incr = if flags == 0 { 0 } else { GPU_PAGE_SIZE };
        for (idx, first, count, offset) in range.pieces() {
            let Some(block) = self.inner.blocks.get(&idx) else {
                warn!("GpuVm: no page table block {idx} for pfn range {range:?}");
                continue;
            };
            let addr = if flags == 0 {
                0
            } else {
                base + (offset << GPU_PAGE_SHIFT)
            };
            vm.writer
                .write_ptes(block.bo, first, count, addr, incr, flags)?;
            self.touched.push(block.bo);
        }
        Ok(())
    }

    /// Points the binding's PTEs at `target`, or clears them for `None`.
    ///
    /// If the write fails part way, the binding is left on the invalidated
    /// list so a later [`clear_invalids`](Self::clear_invalids) retries it.
    pub fn update_ptes(&mut self, id: BindingId, target: Option<PteTarget>) -> KgdResult<()> {
        let binding = self
            .inner
            .bindings
            .get(&id)
            .ok_or_else(|| KgdError::InvalidArgument(format!("unknown binding {id:?}")))?;
        let range = binding
            .range
            .ok_or_else(|| KgdError::InvalidArgument(format!("binding {id:?} has no address")))?;
        let (base, flags) = target.map_or((0, 0), |t| (t.address, t.flags(binding.permissions)));

        let result = self.write_range(range, base, flags);

        let inner = &mut *self.inner;
        if let Some(binding) = inner.bindings.get_mut(&id) {
            binding.target = target;
            match result {
                Ok(()) => binding.ptes_live = target.is_some(),
                Err(_) => binding.ptes_live = true,
            }
        }
        if result.is_ok() {
            inner.invalidated.retain(|x| *x != id);
        } else if !inner.invalidated.contains(&id) {
            inner.invalidated.push(id);
        }
        result
    }

    /// Clears the PTEs of removed bindings, then releases page-table blocks no
    /// binding spans any more.
    pub fn clear_freed(&mut self) -> KgdResult<()> {
        while let Some(range) = self.inner.freed.last().copied() {
            self.write_range(range, 0, 0)?;
            self.inner.freed.pop();
        }

        let vm = self.vm;
        let orphans: Vec<u64> = self
            .inner
            .blocks
            .iter()
            .filter(|(_, b)| b.refs == 0)
            .map(|(idx, _)| *idx)
            .collect();

        for idx in orphans {
            let Some(block) = self.inner.blocks.get_mut(&idx) else {
                continue;
            };
            if block.pde != 0 {
                vm.writer.write_pde(vm.page_directory, idx, 0)?;
                block.pde = 0;
                self.touched.push(vm.page_directory);
            }
            if let Some(block) = self.inner.blocks.remove(&idx) {
                debug!("GpuVm: releasing page table block {idx} ({})", block.bo);
                self.touched.retain(|bo| *bo != block.bo);
                vm.store.destroy(block.bo);
            }
        }
        Ok(())
    }

    /// Rewrites the PTEs of every invalidated binding from the current
    /// placement of its buffer.
    pub fn clear_invalids(&mut self) -> KgdResult<()> {
        let vm = self.vm;
        while let Some(id) = self.inner.invalidated.last().copied() {
            let Some(binding) = self.inner.bindings.get(&id) else {
                self.inner.invalidated.pop();
                continue;
            };
            let target = binding.target.and_then(|t| {
                vm.store.gpu_address(binding.bo).map(|address| PteTarget {
                    address,
                    domain: t.domain,
                })
            });
            self.update_ptes(id, target)?;
        }
        Ok(())
    }

    /// Releases the mutex and returns the page-table buffers edited under it.
    #[must_use]
    pub fn finish(mut self) -> Vec<BoHandle> {
        let mut touched = std::mem::take(&mut self.touched);
        drop(self);
        touched.sort_unstable();
        touched.dedup();
        touched
    }
}

/// The association of one buffer object with one VM at a fixed address.
#[derive(Debug)]
pub struct VmBinding {
    id: BindingId,
    vm: Arc<GpuVm>,
    bo: BoHandle,
    range: PfnRange,
}

impl VmBinding {
    pub(crate) fn new(id: BindingId, vm: Arc<GpuVm>, bo: BoHandle, range: PfnRange) -> Self {
        Self { id, vm, bo, range }
    }

    #[must_use]
    pub const fn id(&self) -> BindingId {
        self.id
    }

    #[must_use]
    pub const fn vm(&self) -> &Arc<GpuVm> {
        &self.vm
    }

    #[must_use]
    pub const fn bo(&self) -> BoHandle {
        self.bo
    }

    #[must_use]
    pub const fn range(&self) -> PfnRange {
        self.range
    }

    #[must_use]
    pub const fn va(&self) -> u64 {
        self.range.start << GPU_PAGE_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::host::HostPageTables;
    use super::*;
    use crate::bo::host::{BoOp, HostBoStore};

    const VM_SIZE: u64 = 1 << 32;

    fn make_vm() -> (Arc<HostBoStore>, Arc<HostPageTables>, GpuVm) {
        let store = Arc::new(HostBoStore::default());
        let tables = Arc::new(HostPageTables::default());
        let vm = GpuVm::new(store.clone(), tables.clone(), VM_SIZE).unwrap();
        (store, tables, vm)
    }

    fn gtt_bo(store: &HostBoStore, size: u64) -> BoHandle {
        store.create(size, GPU_PAGE_SIZE, MemoryDomain::Gtt, 0).unwrap()
    }

    #[test]
    fn test_pieces_split_at_block_boundary() {
        let range = PfnRange {
            start: PTES_PER_BLOCK - 2,
            last: PTES_PER_BLOCK + 1,
        };
        let pieces: Vec<_> = range.pieces().collect();
        assert_eq!(
            pieces,
            vec![(0, PTES_PER_BLOCK - 2, 2, 0), (1, 0, 2, 2)]
        );
    }

    #[test]
    fn test_rejects_unaligned_vm_size() {
        let store = Arc::new(HostBoStore::default());
        let tables = Arc::new(HostPageTables::default());
        assert!(GpuVm::new(store, tables, BLOCK_SPAN + 1).is_err());
    }

    #[test]
    fn test_one_binding_per_bo() {
        let (store, _, vm) = make_vm();
        let bo = gtt_bo(&store, 4096);
        vm.create_binding(bo).unwrap();
        assert!(matches!(
            vm.create_binding(bo),
            Err(KgdError::BindingExists(b)) if b == bo
        ));
    }

    #[test]
    fn test_assign_allocates_shared_blocks_once() {
        let (store, _, vm) = make_vm();
        let a = gtt_bo(&store, 4096);
        let b = gtt_bo(&store, 4096);
        let ida = vm.create_binding(a).unwrap();
        let idb = vm.create_binding(b).unwrap();

        vm.assign_address(ida, 0x1000, 0x1000, 0).unwrap();
        vm.assign_address(idb, 0x2000, 0x1000, 0).unwrap();
        assert_eq!(vm.page_table_count(), 1);

        let range = vm.assign_address(
            vm.create_binding(gtt_bo(&store, BLOCK_SPAN)).unwrap(),
            BLOCK_SPAN - 0x1000,
            0x2000,
            0,
        );
        assert_eq!(range.unwrap().last_block(), 1);
        assert_eq!(vm.page_table_count(), 2);
    }

    #[test]
    fn test_assign_rejects_overlap_and_zero() {
        let (store, _, vm) = make_vm();
        let id = vm.create_binding(gtt_bo(&store, 4096)).unwrap();
        assert!(matches!(
            vm.assign_address(id, 0, 0x1000, 0),
            Err(KgdError::InvalidVirtualAddress(0))
        ));
        assert!(matches!(
            vm.assign_address(id, 0x1800, 0x1000, 0),
            Err(KgdError::InvalidVirtualAddress(0x1800))
        ));
        vm.assign_address(id, 0x4000, 0x2000, 0).unwrap();

        let other = vm.create_binding(gtt_bo(&store, 4096)).unwrap();
        assert!(matches!(
            vm.assign_address(other, 0x5000, 0x1000, 0),
            Err(KgdError::InvalidVirtualAddress(0x5000))
        ));
    }

    #[test]
    fn test_assign_rejects_overflowing_size() {
        let (store, _, vm) = make_vm();
        let id = vm.create_binding(gtt_bo(&store, 4096)).unwrap();
        assert!(matches!(
            vm.assign_address(id, 0x40_0000, u64::MAX - 10, 0),
            Err(KgdError::InvalidVirtualAddress(0x40_0000))
        ));
        assert_eq!(vm.page_table_count(), 0);
    }

    #[test]
    fn test_remove_and_clear_freed_releases_blocks() {
        let (store, _, vm) = make_vm();
        let objects_before = store.live_objects();
        let bo = gtt_bo(&store, 4096);
        let id = vm.create_binding(bo).unwrap();
        vm.assign_address(id, 0x10_0000, 0x1000, 0).unwrap();
        assert_eq!(vm.page_table_count(), 1);

        let mut guard = vm.lock();
        guard.remove_binding(id);
        guard.clear_freed().unwrap();
        drop(guard);

        assert_eq!(vm.page_table_count(), 0);
        assert_eq!(vm.binding_count(), 0);
        assert_eq!(store.live_objects(), objects_before + 1);
    }

    #[test]
    fn test_failed_block_allocation_is_recoverable() {
        let (store, _, vm) = make_vm();
        let id = vm.create_binding(gtt_bo(&store, 2 * BLOCK_SPAN)).unwrap();
        store.fail_nth(BoOp::Create, 2);
        assert!(matches!(
            vm.assign_address(id, BLOCK_SPAN, 2 * BLOCK_SPAN, 0),
            Err(KgdError::OutOfMemory)
        ));
        assert_eq!(vm.page_table_count(), 1);

        let mut guard = vm.lock();
        guard.remove_binding(id);
        guard.clear_freed().unwrap();
        drop(guard);
        assert_eq!(vm.page_table_count(), 0);
    }

    #[test]
    fn test_update_ptes_and_freed_list() {
        let (store, tables, vm) = make_vm();
        let bo = gtt_bo(&store, 0x2000);
        let id = vm.create_binding(bo).unwrap();
        vm.assign_address(id, 0x10_0000, 0x2000, PTE_READABLE).unwrap();
        let addr = store.pin(bo, MemoryDomain::Gtt).unwrap();

        let mut guard = vm.lock();
        guard
            .update_ptes(
                id,
                Some(PteTarget {
                    address: addr,
                    domain: MemoryDomain::Gtt,
                }),
            )
            .unwrap();
        let touched = guard.finish();

        let pt = vm.block_bo(0).unwrap();
        assert_eq!(touched, vec![pt]);
        let first = 0x10_0000 >> GPU_PAGE_SHIFT;
        assert_eq!(
            tables.pte(pt, first),
            addr | PTE_VALID | PTE_SYSTEM | PTE_SNOOPED | PTE_READABLE
        );
        assert_eq!(
            tables.pte(pt, first + 1),
            (addr + GPU_PAGE_SIZE) | PTE_VALID | PTE_SYSTEM | PTE_SNOOPED | PTE_READABLE
        );

        vm.remove_binding(id);
        assert_eq!(vm.pending_freed(), 1);
        assert_eq!(tables.live_ptes(), 2);
        vm.lock().clear_freed().unwrap();
        assert_eq!(vm.pending_freed(), 0);
        assert_eq!(tables.live_ptes(), 0);
        store.unpin(bo).unwrap();
    }

    #[test]
    fn test_page_directory_follows_block_placement() {
        let (_, tables, vm) = make_vm();
        let store = vm.store().clone();
        let bo = store.create(4096, 4096, MemoryDomain::Gtt, 0).unwrap();
        let id = vm.create_binding(bo).unwrap();
        vm.assign_address(id, BLOCK_SPAN, 0x1000, 0).unwrap();

        vm.pin_page_tables(id, None).unwrap();
        let mut guard = vm.lock();
        guard.update_page_directory().unwrap();
        assert_eq!(guard.finish(), vec![vm.page_directory()]);

        let pt_addr = store.gpu_address(vm.block_bo(1).unwrap()).unwrap();
        assert_eq!(tables.pde(vm.page_directory(), 1), pt_addr | PDE_VALID);

        // Unchanged placement: nothing to write
        let mut guard = vm.lock();
        guard.update_page_directory().unwrap();
        assert!(guard.finish().is_empty());

        vm.unpin_page_tables(id, None).unwrap();
        vm.lock().update_page_directory().unwrap();
        assert_eq!(tables.pde(vm.page_directory(), 1), 0);
    }

    #[test]
    fn test_block_pins_are_shared() {
        let (store, _, vm) = make_vm();
        let a = vm.create_binding(gtt_bo(&store, 4096)).unwrap();
        let b = vm.create_binding(gtt_bo(&store, 4096)).unwrap();
        vm.assign_address(a, 0x1000, 0x1000, 0).unwrap();
        vm.assign_address(b, 0x2000, 0x1000, 0).unwrap();
        let pt = vm.block_bo(0).unwrap();

        vm.pin_page_tables(a, None).unwrap();
        vm.pin_page_tables(b, None).unwrap();
        assert_eq!(vm.block_pin_users(0), 2);
        assert_eq!(store.pin_count(pt), 1);

        vm.unpin_page_tables(a, None).unwrap();
        assert_eq!(store.pin_count(pt), 1);
        vm.unpin_page_tables(b, None).unwrap();
        assert_eq!(store.pin_count(pt), 0);
        assert_eq!(vm.block_pin_users(0), 0);
    }

    #[test]
    fn test_pin_page_tables_unwinds_on_failure() {
        let (store, _, vm) = make_vm();
        let id = vm.create_binding(gtt_bo(&store, 3 * BLOCK_SPAN)).unwrap();
        vm.assign_address(id, BLOCK_SPAN, 3 * BLOCK_SPAN, 0).unwrap();
        store.fail_pin_of(vm.block_bo(3).unwrap());

        assert!(vm.pin_page_tables(id, None).is_err());
        for idx in 1..=3 {
            assert_eq!(vm.block_pin_users(idx), 0);
            assert_eq!(store.pin_count(vm.block_bo(idx).unwrap()), 0);
        }
    }

    #[test]
    fn test_invalidate_rewrites_ptes() {
        let (store, tables, vm) = make_vm();
        let bo = gtt_bo(&store, 4096);
        let id = vm.create_binding(bo).unwrap();
        vm.assign_address(id, 0x3000, 0x1000, 0).unwrap();
        let addr = store.pin(bo, MemoryDomain::Gtt).unwrap();
        vm.lock()
            .update_ptes(
                id,
                Some(PteTarget {
                    address: addr,
                    domain: MemoryDomain::Gtt,
                }),
            )
            .unwrap();

        vm.invalidate_bo(bo);
        assert_eq!(vm.pending_invalid(), 1);
        vm.lock().clear_invalids().unwrap();
        assert_eq!(vm.pending_invalid(), 0);
        let pt = vm.block_bo(0).unwrap();
        assert_eq!(tables.pte(pt, 3) & !0xfff, addr);
        store.unpin(bo).unwrap();
    }

    #[test]
    fn test_referenced_bos_covers_everything() {
        let (store, _, vm) = make_vm();
        let bo = gtt_bo(&store, 4096);
        let id = vm.create_binding(bo).unwrap();
        vm.assign_address(id, 0x1000, 0x1000, 0).unwrap();

        let bos = vm.referenced_bos();
        assert!(bos.contains(&vm.page_directory()));
        assert!(bos.contains(&vm.block_bo(0).unwrap()));
        assert!(bos.contains(&bo));
    }

    #[test]
    fn test_drop_releases_page_tables() {
        let (store, _, vm) = make_vm();
        let id = vm.create_binding(gtt_bo(&store, 4096)).unwrap();
        vm.assign_address(id, 0x1000, 0x1000, 0).unwrap();
        let pd = vm.page_directory();
        let pt = vm.block_bo(0).unwrap();
        drop(vm);
        assert!(!store.exists(pd));
        assert!(!store.exists(pt));
    }
}
