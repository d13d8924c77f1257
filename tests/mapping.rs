use radeon_kgd::bo::host::{BoOp, HostBoStore};
use radeon_kgd::bo::{BoStore, MemoryDomain};
use radeon_kgd::memory::{AllocFlags, GpuMemoryObject, ImportedBuffer, MemoryManager};
use radeon_kgd::vm::host::{HostPageTables, PtOp};
use radeon_kgd::vm::{BLOCK_SPAN, GPU_PAGE_SHIFT, GPU_PAGE_SIZE, GpuVm, PTE_VALID, PteTarget};
use radeon_kgd::{KgdError, Step};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const VM_SIZE: u64 = 1 << 32;

struct Rig {
    store: Arc<HostBoStore>,
    tables: Arc<HostPageTables>,
    vm: Arc<GpuVm>,
    mm: MemoryManager,
}

fn rig() -> Rig {
    let store = Arc::new(HostBoStore::default());
    let tables = Arc::new(HostPageTables::default());
    let vm = Arc::new(GpuVm::new(store.clone(), tables.clone(), VM_SIZE).unwrap());
    let mm = MemoryManager::new(store.clone());
    Rig {
        store,
        tables,
        vm,
        mm,
    }
}

impl Rig {
    fn alloc(&self, va: u64, size: u64) -> GpuMemoryObject {
        self.mm
            .allocate_memory(&self.vm, va, size, AllocFlags::new().gtt())
            .unwrap()
    }

    fn assert_quiescent(&self) {
        assert_eq!(self.store.total_pins(), 0);
        assert_eq!(self.store.reserved_count(), 0);
        assert_eq!(self.tables.live_ptes(), 0);
        assert_eq!(self.vm.pending_invalid(), 0);
    }
}

#[test]
fn test_shared_blocks_pinned_once_until_last_user() {
    let rig = rig();
    let a = rig.alloc(0x1000, 0x1000);
    // Straddles the boundary between blocks 0 and 1
    let b = rig.alloc(0x1F_F000, 0x2000);
    let c = rig.alloc(0x30_0000, 0x1000);
    assert_eq!(rig.vm.page_table_count(), 2);

    for obj in [&a, &b, &c] {
        rig.mm.map_to_gpu(obj).unwrap();
    }

    let pt0 = rig.vm.block_bo(0).unwrap();
    let pt1 = rig.vm.block_bo(1).unwrap();
    assert_eq!(rig.store.pin_count(pt0), 1);
    assert_eq!(rig.store.pin_count(pt1), 1);
    assert_eq!(rig.vm.block_pin_users(0), 2);
    assert_eq!(rig.vm.block_pin_users(1), 2);
    assert_eq!(rig.store.pin_count(rig.vm.page_directory()), 1);
    assert_eq!(rig.vm.page_directory_pin_users(), 3);

    let addr_b = b.gpu_address().unwrap();
    assert_eq!(rig.tables.pte(pt0, 0x1FF) & !0xfff, addr_b);
    assert_eq!(rig.tables.pte(pt1, 0) & !0xfff, addr_b + GPU_PAGE_SIZE);
    assert_ne!(rig.tables.pte(pt1, 0) & PTE_VALID, 0);

    rig.mm.unmap_from_gpu(&a).unwrap();
    rig.mm.unmap_from_gpu(&c).unwrap();
    assert_eq!(rig.store.pin_count(pt0), 1);
    assert_eq!(rig.store.pin_count(pt1), 1);
    assert_eq!(rig.vm.block_pin_users(0), 1);
    assert_eq!(rig.vm.block_pin_users(1), 1);
    assert_eq!(rig.tables.pte(pt0, 1), 0);
    assert_eq!(rig.tables.pte(pt1, 0x100), 0);
    assert_eq!(rig.tables.pte(pt0, 0x1FF) & !0xfff, addr_b);

    rig.mm.unmap_from_gpu(&b).unwrap();
    rig.assert_quiescent();

    for obj in [a, b, c] {
        rig.mm.free_memory(obj).unwrap();
    }
    assert_eq!(rig.vm.page_table_count(), 0);
    assert_eq!(rig.vm.binding_count(), 0);
    assert_eq!(rig.tables.live_pdes(), 0);
}

#[test]
fn test_mapped_object_has_valid_ptes_over_its_range() {
    let rig = rig();
    let va = 3 * BLOCK_SPAN - 0x3000;
    let obj = rig.alloc(va, 0x6000);
    rig.mm.map_to_gpu(&obj).unwrap();
    let addr = obj.gpu_address().unwrap();

    for page in 0..6 {
        let pfn = (va >> GPU_PAGE_SHIFT) + page;
        let pt = rig.vm.block_bo(pfn >> 9).unwrap();
        let pte = rig.tables.pte(pt, pfn & 0x1FF);
        assert_ne!(pte & PTE_VALID, 0);
        assert_eq!(pte & !0xfff, addr + page * GPU_PAGE_SIZE);
    }
    assert_eq!(rig.tables.live_ptes(), 6);

    rig.mm.unmap_from_gpu(&obj).unwrap();
    rig.assert_quiescent();
    rig.mm.free_memory(obj).unwrap();
}

#[test]
fn test_allocate_and_free_leave_page_tables_unchanged() {
    let rig = rig();
    let keep = rig.alloc(0x1000, 0x1000);
    let tables = rig.vm.page_table_count();
    let objects = rig.store.live_objects();

    let obj = rig.alloc(5 * BLOCK_SPAN, 2 * BLOCK_SPAN);
    assert_eq!(rig.vm.page_table_count(), tables + 2);
    rig.mm.free_memory(obj).unwrap();

    assert_eq!(rig.vm.page_table_count(), tables);
    assert_eq!(rig.store.live_objects(), objects);
    rig.mm.free_memory(keep).unwrap();
}

enum Fault {
    Bo(BoOp, u32),
    Pt(PtOp),
}

#[test]
fn test_failure_at_each_step_restores_pins() {
    let cases = [
        (Fault::Bo(BoOp::Reserve, 1), Step::PinBo),
        (Fault::Bo(BoOp::Pin, 1), Step::PinBo),
        (Fault::Bo(BoOp::Reserve, 2), Step::ReserveVm),
        (Fault::Bo(BoOp::Pin, 2), Step::PinPageTables),
        (Fault::Bo(BoOp::Pin, 3), Step::PinPageDirectory),
        (Fault::Pt(PtOp::WritePde), Step::UpdatePageDirectory),
        (Fault::Pt(PtOp::WritePtes), Step::UpdatePtes),
        (Fault::Bo(BoOp::WaitIdle, 1), Step::WaitIdle),
    ];

    for (fault, step) in cases {
        let rig = rig();
        let obj = rig.alloc(BLOCK_SPAN + 0x1000, 0x1000);
        match fault {
            Fault::Bo(op, n) => rig.store.fail_nth(op, n),
            Fault::Pt(op) => rig.tables.fail_nth(op, 1),
        }

        let err = rig.mm.map_to_gpu(&obj).unwrap_err();
        assert_eq!(err.step(), Some(step), "wrong step for {err}");
        assert!(!obj.is_mapped());
        rig.assert_quiescent();
        assert_eq!(rig.vm.page_directory_pin_users(), 0);
        assert_eq!(rig.vm.block_pin_users(1), 0);

        // Nothing is left behind that would stop a retry
        rig.mm.map_to_gpu(&obj).unwrap();
        rig.mm.free_memory(obj).unwrap();
        rig.assert_quiescent();
        assert_eq!(rig.vm.page_table_count(), 0);
    }
}

#[test]
fn test_failure_while_clearing_freed_ranges_restores_pins() {
    let rig = rig();
    // A binding removed while its PTEs are live leaves its range queued
    let ghost = rig
        .store
        .create(0x1000, GPU_PAGE_SIZE, MemoryDomain::Gtt, 0)
        .unwrap();
    let id = rig.vm.create_binding(ghost).unwrap();
    rig.vm.assign_address(id, 4 * BLOCK_SPAN, 0x1000, 0).unwrap();
    {
        let mut guard = rig.vm.lock();
        let target = PteTarget {
            address: 1 << 40,
            domain: MemoryDomain::Gtt,
        };
        guard.update_ptes(id, Some(target)).unwrap();
        guard.remove_binding(id);
    }
    assert_eq!(rig.vm.pending_freed(), 1);

    let obj = rig.alloc(BLOCK_SPAN + 0x1000, 0x1000);
    rig.tables.fail_nth(PtOp::WritePtes, 1);
    let err = rig.mm.map_to_gpu(&obj).unwrap_err();
    assert_eq!(err.step(), Some(Step::ClearFreed), "wrong step for {err}");
    assert!(!obj.is_mapped());
    assert_eq!(rig.store.total_pins(), 0);
    assert_eq!(rig.store.reserved_count(), 0);
    assert_eq!(rig.vm.page_directory_pin_users(), 0);
    assert_eq!(rig.vm.block_pin_users(1), 0);
    assert_eq!(rig.vm.pending_freed(), 1);

    rig.mm.map_to_gpu(&obj).unwrap();
    assert_eq!(rig.vm.pending_freed(), 0);
    assert_eq!(rig.vm.block_bo(4), None);
    rig.mm.free_memory(obj).unwrap();
    rig.assert_quiescent();
    rig.store.destroy(ghost);
}

#[test]
fn test_failure_while_rewriting_invalidated_ptes_restores_pins() {
    let rig = rig();
    let a = rig.alloc(0x1000, 0x1000);
    let b = rig.alloc(BLOCK_SPAN + 0x1000, 0x1000);
    rig.mm.map_to_gpu(&a).unwrap();
    let pins = rig.store.total_pins();

    rig.vm.invalidate_bo(a.bo());
    // The write for `b` succeeds, the rewrite of `a` fails
    rig.tables.fail_nth(PtOp::WritePtes, 2);
    let err = rig.mm.map_to_gpu(&b).unwrap_err();
    assert_eq!(err.step(), Some(Step::ClearInvalid), "wrong step for {err}");
    assert!(!b.is_mapped());
    assert_eq!(rig.store.pin_count(b.bo()), 0);
    assert_eq!(rig.store.total_pins(), pins);
    assert_eq!(rig.store.reserved_count(), 0);
    assert_eq!(rig.vm.block_pin_users(1), 0);
    assert_eq!(rig.vm.page_directory_pin_users(), 1);

    rig.mm.map_to_gpu(&b).unwrap();
    assert_eq!(rig.vm.pending_invalid(), 0);
    for obj in [a, b] {
        rig.mm.free_memory(obj).unwrap();
    }
    rig.assert_quiescent();
}

#[test]
fn test_unmap_failure_still_unmaps() {
    let rig = rig();
    let obj = rig.alloc(0x10_0000, 0x1000);
    rig.mm.map_to_gpu(&obj).unwrap();
    rig.store.fail_nth(BoOp::Unpin, 1);

    let err = rig.mm.unmap_from_gpu(&obj).unwrap_err();
    assert!(matches!(err.root(), KgdError::Driver(_)));
    assert!(!obj.is_mapped());
    assert_eq!(rig.tables.live_ptes(), 0);
}

#[test]
fn test_unmap_waits_for_buffer_reservation() {
    let rig = rig();
    let obj = rig.alloc(0x10_0000, 0x1000);
    let bo = obj.bo();
    rig.mm.map_to_gpu(&obj).unwrap();
    rig.store.reserve(bo).unwrap();

    thread::scope(|s| {
        let unmap = s.spawn(|| rig.mm.unmap_from_gpu(&obj));
        thread::sleep(Duration::from_millis(50));
        assert!(!unmap.is_finished());
        assert_eq!(rig.store.pin_count(bo), 1);

        rig.store.unreserve(bo);
        unmap.join().unwrap().unwrap();
    });

    assert!(!obj.is_mapped());
    rig.assert_quiescent();
    rig.mm.free_memory(obj).unwrap();
}

#[test]
fn test_concurrent_map_and_free() {
    const THREADS: u64 = 8;
    const ROUNDS: u64 = 16;

    let rig = rig();
    let objects_before = rig.store.live_objects();

    thread::scope(|s| {
        for t in 0..THREADS {
            let rig = &rig;
            s.spawn(move || {
                // Neighbouring threads share page-table blocks
                let va = (t + 1) * (BLOCK_SPAN / 2);
                for _ in 0..ROUNDS {
                    let obj = rig.alloc(va, 0x4000);
                    rig.mm.map_to_gpu(&obj).unwrap();
                    assert!(obj.is_mapped());
                    rig.mm.unmap_from_gpu(&obj).unwrap();
                    rig.mm.free_memory(obj).unwrap();
                }
            });
        }
    });

    rig.assert_quiescent();
    assert_eq!(rig.vm.binding_count(), 0);
    assert_eq!(rig.vm.page_table_count(), 0);
    assert_eq!(rig.store.live_objects(), objects_before);
}

#[test]
fn test_imported_buffer_survives_free() {
    let rig = rig();
    let bo = rig
        .store
        .create(0x2000, GPU_PAGE_SIZE, MemoryDomain::Gtt, 0)
        .unwrap();
    let obj = rig
        .mm
        .import_memory(
            &rig.vm,
            0x80_0000,
            ImportedBuffer::new(bo, 0x2000),
            AllocFlags::new(),
        )
        .unwrap();
    rig.mm.map_to_gpu(&obj).unwrap();
    rig.mm.free_memory(obj).unwrap();

    assert!(rig.store.exists(bo));
    rig.assert_quiescent();
    rig.store.destroy(bo);
}

#[test]
fn test_map_fails_while_vm_references_a_released_buffer() {
    let rig = rig();
    let ext = rig
        .store
        .create(0x1000, GPU_PAGE_SIZE, MemoryDomain::Gtt, 0)
        .unwrap();
    let imported = rig
        .mm
        .import_memory(
            &rig.vm,
            0x40_0000,
            ImportedBuffer::new(ext, 0x1000),
            AllocFlags::new(),
        )
        .unwrap();
    // The owner releases the buffer while it is still bound
    rig.store.destroy(ext);

    let obj = rig.alloc(0x10_0000, 0x1000);
    let err = rig.mm.map_to_gpu(&obj).unwrap_err();
    assert_eq!(err.step(), Some(Step::ReserveVm));
    assert!(matches!(err.root(), KgdError::NoSuchBo(bo) if *bo == ext));
    assert!(!obj.is_mapped());
    rig.assert_quiescent();

    rig.mm.free_memory(obj).unwrap();
    // The stale binding cannot be reserved for removal
    assert!(rig.mm.free_memory(imported).is_err());
}
