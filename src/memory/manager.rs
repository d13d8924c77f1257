use super::{AllocFlags, Backing, GpuMemoryObject, ImportedBuffer};
use crate::bo::{BoHandle, BoStore, MemoryDomain, Reservation, ReservationSet};
use crate::error::{KgdError, KgdResult, Step};
use crate::vm::{BindingId, GPU_PAGE_SIZE, GpuVm, PteTarget, VmBinding};
use log::{debug, error, trace, warn};
use std::sync::Arc;

/// Allocates GPU memory objects and moves them between the unmapped and
/// mapped states.
///
/// Operations on one object are serialized by that object's lock. Objects in
/// the same VM can be mapped and unmapped concurrently.
pub struct MemoryManager {
    store: Arc<dyn BoStore>,
}

impl MemoryManager {
    #[must_use]
    pub fn new(store: Arc<dyn BoStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn BoStore> {
        &self.store
    }

    /// Creates a buffer in the domain `flags` select and binds it at `va`.
    ///
    /// The returned object is not mapped. If the binding cannot be created the
    /// buffer is released and the cause is returned inside `MappingFailed`.
    pub fn allocate_memory(
        &self,
        vm: &Arc<GpuVm>,
        va: u64,
        size: u64,
        flags: AllocFlags,
    ) -> KgdResult<GpuMemoryObject> {
        if size == 0 {
            return Err(KgdError::InvalidArgument("zero-sized allocation".into()));
        }
        debug_assert!(
            std::ptr::addr_eq(Arc::as_ptr(&self.store), Arc::as_ptr(vm.store())),
            "VM uses a different buffer store"
        );

        let domain = flags.domain();
        let bo = self
            .store
            .create(size, GPU_PAGE_SIZE, domain, flags.to_bo_flags())
            .map_err(|e| {
                warn!("MemoryManager: {domain:?} allocation of {size:#x} bytes failed: {e}");
                KgdError::OutOfMemory
            })?;

        match self.add_bo_to_vm(vm, bo, va, size, flags.to_pte_flags()) {
            Ok(binding) => {
                debug!("MemoryManager: allocated {bo} ({size:#x} bytes) at {va:#x}");
                Ok(GpuMemoryObject::new(
                    Backing::Native(bo),
                    domain,
                    size,
                    flags,
                    binding,
                ))
            }
            Err(e) => {
                self.store.destroy(bo);
                Err(KgdError::MappingFailed(Box::new(e)))
            }
        }
    }

    /// Binds a buffer owned elsewhere at `va`. Freeing the object unbinds it
    /// but leaves the buffer alive.
    pub fn import_memory(
        &self,
        vm: &Arc<GpuVm>,
        va: u64,
        buffer: ImportedBuffer,
        flags: AllocFlags,
    ) -> KgdResult<GpuMemoryObject> {
        let domain = self
            .store
            .domain(buffer.bo)
            .ok_or(KgdError::NoSuchBo(buffer.bo))?;

        let binding = self
            .add_bo_to_vm(vm, buffer.bo, va, buffer.size, flags.to_pte_flags())
            .map_err(|e| KgdError::MappingFailed(Box::new(e)))?;

        debug!("MemoryManager: imported {} at {va:#x}", buffer.bo);
        Ok(GpuMemoryObject::new(
            Backing::Imported(buffer),
            domain,
            buffer.size,
            flags,
            binding,
        ))
    }

    /// Unmaps, unbinds and releases `object`.
    ///
    /// Every step is attempted even if an earlier one failed; the first error
    /// is returned. A buffer whose binding could not be removed is leaked
    /// rather than destroyed under a live binding.
    pub fn free_memory(&self, object: GpuMemoryObject) -> KgdResult<()> {
        let bo = object.bo();
        let mut first_err = None;

        if let Err(e) = self.unmap_from_gpu(&object) {
            warn!("MemoryManager: unmap of {bo} during free failed: {e}");
            first_err = Some(e);
        }

        match self.remove_bo_from_vm(object.binding()) {
            Ok(()) => {
                if let Backing::Native(bo) = object.backing() {
                    self.store.destroy(*bo);
                }
            }
            Err(e) => {
                error!("MemoryManager: {bo} is still bound, leaking it: {e}");
                first_err.get_or_insert(e.during(Step::RemoveBinding));
            }
        }

        debug!("MemoryManager: freed {bo}");
        first_err.map_or(Ok(()), Err)
    }

    /// Makes `object` accessible to the GPU at its virtual address.
    ///
    /// Mapping an already mapped object does nothing. On failure every pin and
    /// reservation taken is released and the object stays unmapped.
    pub fn map_to_gpu(&self, object: &GpuMemoryObject) -> KgdResult<()> {
        let mut state = object.lock_state();
        if state.mapped_to_gpu {
            return Ok(());
        }

        let bo = object.bo();
        let address = self
            .pin_reserved(bo, object.domain())
            .map_err(|e| e.during(Step::PinBo))?;

        let target = PteTarget {
            address,
            domain: object.domain(),
        };
        if let Err(e) = self.map_pinned(object.binding(), target) {
            if let Err(ue) = self.unpin_reserved(bo) {
                warn!("MemoryManager: unwinding pin of {bo} failed: {ue}");
            }
            return Err(e);
        }

        state.mapped_to_gpu = true;
        state.gpu_address = Some(address);
        debug!("MemoryManager: mapped {bo} at {:#x} -> {address:#x}", object.va());
        Ok(())
    }

    fn pin_reserved(&self, bo: BoHandle, domain: MemoryDomain) -> KgdResult<u64> {
        let _reservation = Reservation::acquire(&*self.store, bo)?;
        self.store.pin(bo, domain)
    }

    fn unpin_reserved(&self, bo: BoHandle) -> KgdResult<()> {
        let _reservation = Reservation::acquire(&*self.store, bo)?;
        self.store.unpin(bo)
    }

    fn map_pinned(&self, binding: &VmBinding, target: PteTarget) -> KgdResult<()> {
        let vm = binding.vm();
        let id = binding.id();

        let reservations = self
            .reserve_vm(vm)
            .map_err(|e| e.during(Step::ReserveVm))?;
        trace!("MemoryManager: reserved {} VM buffers", reservations.len());

        let held = Some(&reservations);
        vm.pin_page_tables(id, held)
            .map_err(|e| e.during(Step::PinPageTables))?;

        if let Err(e) = vm.pin_page_directory(held) {
            Self::unwind_page_tables(vm, id, &reservations);
            return Err(e.during(Step::PinPageDirectory));
        }

        let result = Self::update_vm(vm, id, target).and_then(|touched| {
            touched.into_iter().try_for_each(|bo| match self.store.wait_idle(bo) {
                // Released by another thread since the update, nothing to wait for
                Err(KgdError::NoSuchBo(_)) => Ok(()),
                other => other.map_err(|e| e.during(Step::WaitIdle)),
            })
        });

        if let Err(e) = result {
            // PTEs may already point at the buffer
            if let Err(ce) = vm.lock().update_ptes(id, None) {
                warn!("MemoryManager: clearing PTEs of failed mapping failed: {ce}");
            }
            if let Err(ue) = vm.unpin_page_directory(held) {
                warn!("MemoryManager: unwinding page directory pin failed: {ue}");
            }
            Self::unwind_page_tables(vm, id, &reservations);
            return Err(e);
        }

        drop(reservations);
        Ok(())
    }

    /// Reserves everything `vm` references.
    ///
    /// A buffer released between the snapshot and its reservation is gone from
    /// the next snapshot, so the batch is retaken. A missing buffer the VM
    /// still references, such as an imported buffer its owner destroyed, fails
    /// with `NoSuchBo`.
    fn reserve_vm(&self, vm: &GpuVm) -> KgdResult<ReservationSet<'_>> {
        let mut bos = vm.referenced_bos();
        loop {
            match ReservationSet::acquire(&*self.store, bos) {
                Err(KgdError::NoSuchBo(bo)) => {
                    let next = vm.referenced_bos();
                    if next.contains(&bo) {
                        warn!("MemoryManager: VM still references released {bo}");
                        return Err(KgdError::NoSuchBo(bo));
                    }
                    trace!("MemoryManager: {bo} released while reserving, retrying");
                    bos = next;
                }
                other => return other,
            }
        }
    }

    fn update_vm(vm: &GpuVm, id: BindingId, target: PteTarget) -> KgdResult<Vec<BoHandle>> {
        let mut guard = vm.lock();
        guard
            .update_page_directory()
            .map_err(|e| e.during(Step::UpdatePageDirectory))?;
        guard
            .clear_freed()
            .map_err(|e| e.during(Step::ClearFreed))?;
        guard
            .update_ptes(id, Some(target))
            .map_err(|e| e.during(Step::UpdatePtes))?;
        guard
            .clear_invalids()
            .map_err(|e| e.during(Step::ClearInvalid))?;
        Ok(guard.finish())
    }

    fn unwind_page_tables(vm: &GpuVm, id: BindingId, held: &ReservationSet<'_>) {
        if let Err(e) = vm.unpin_page_tables(id, Some(held)) {
            warn!("MemoryManager: unwinding page table pins failed: {e}");
        }
    }

    /// Removes GPU access to `object` and drops its pins.
    ///
    /// Each unpin runs under its own reservation of the buffer concerned, so
    /// unmap waits for any thread holding one of them. Unmapping an unmapped
    /// object does nothing. All steps run even if one fails; the object ends
    /// up unmapped and the first error is returned.
    pub fn unmap_from_gpu(&self, object: &GpuMemoryObject) -> KgdResult<()> {
        let mut state = object.lock_state();
        if !state.mapped_to_gpu {
            return Ok(());
        }

        let bo = object.bo();
        let vm = object.vm();
        let id = object.binding().id();
        let mut first_err: Option<KgdError> = None;
        let mut record = |result: KgdResult<()>, step: Step| {
            if let Err(e) = result {
                warn!("MemoryManager: unmap of {bo}: {step} failed: {e}");
                first_err.get_or_insert(e.during(step));
            }
        };

        record(vm.unpin_page_directory(None), Step::UnpinPageDirectory);
        record(vm.unpin_page_tables(id, None), Step::UnpinPageTables);
        record(self.unpin_reserved(bo), Step::UnpinBo);

        {
            let mut guard = vm.lock();
            record(guard.clear_freed(), Step::ClearFreed);
            record(guard.update_ptes(id, None), Step::UpdatePtes);
            record(guard.clear_invalids(), Step::ClearInvalid);
        }

        state.mapped_to_gpu = false;
        state.gpu_address = None;
        debug!("MemoryManager: unmapped {bo}");
        first_err.map_or(Ok(()), Err)
    }

    /// Binds `bo` into `vm` at `[va, va + size)` and allocates the page-table
    /// blocks the range needs.
    ///
    /// The buffer is reserved for the duration of the call.
    pub fn add_bo_to_vm(
        &self,
        vm: &Arc<GpuVm>,
        bo: BoHandle,
        va: u64,
        size: u64,
        pte_flags: u64,
    ) -> KgdResult<VmBinding> {
        let _reservation =
            Reservation::acquire(&*self.store, bo).map_err(|e| e.during(Step::ReserveBo))?;

        let mut guard = vm.lock();
        let id = guard.create_binding(bo).map_err(|e| {
            warn!("MemoryManager: binding {bo} at {va:#x} failed: {e}");
            KgdError::InvalidVirtualAddress(va)
        })?;

        match guard.assign_address(id, va, size, pte_flags) {
            Ok(range) => Ok(VmBinding::new(id, vm.clone(), bo, range)),
            Err(e) => {
                guard.remove_binding(id);
                if let Err(ce) = guard.clear_freed() {
                    warn!("MemoryManager: releasing page tables after failed bind: {ce}");
                }
                Err(e)
            }
        }
    }

    /// Deletes `binding` and releases the page-table blocks nothing else
    /// spans. The buffer must be unmapped.
    pub fn remove_bo_from_vm(&self, binding: &VmBinding) -> KgdResult<()> {
        let _reservation = Reservation::acquire(&*self.store, binding.bo())
            .map_err(|e| e.during(Step::ReserveBo))?;

        let mut guard = binding.vm().lock();
        guard.remove_binding(binding.id());
        guard.clear_freed().map_err(|e| e.during(Step::ClearFreed))
    }
}
