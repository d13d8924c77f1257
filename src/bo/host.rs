use super::{BO_FLAG_NO_CPU_ACCESS, BoHandle, BoStore, MemoryDomain};
use crate::error::{KgdError, KgdResult};
use crate::utils::checked_align_up;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

const GTT_APERTURE_BASE: u64 = 1 << 40;
const DEFAULT_VRAM_SIZE: u64 = 1 << 30;
const DEFAULT_GTT_SIZE: u64 = 1 << 30;

/// Store operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoOp {
    Create,
    Reserve,
    Pin,
    Unpin,
    WaitIdle,
}

#[derive(Debug)]
struct HostBo {
    size: u64,
    domain: MemoryDomain,
    flags: u32,
    pin_count: u32,
    gpu_address: Option<u64>,
    waits: u32,
}

#[derive(Debug, Default)]
struct Faults {
    countdown: HashMap<BoOp, u32>,
    pin_of: HashSet<BoHandle>,
}

impl Faults {
    fn hit(&mut self, op: BoOp) -> bool {
        let Some(left) = self.countdown.get_mut(&op) else {
            return false;
        };
        *left -= 1;
        if *left == 0 {
            self.countdown.remove(&op);
            return true;
        }
        false
    }
}

#[derive(Debug)]
struct HostInner {
    next_handle: u64,
    objects: HashMap<BoHandle, HostBo>,
    reserved: HashSet<BoHandle>,
    vram_used: u64,
    gtt_used: u64,
    vram_size: u64,
    gtt_size: u64,
    next_vram_addr: u64,
    next_gtt_addr: u64,
    pin_ops: u64,
    unpin_ops: u64,
    faults: Faults,
}

/// A [`BoStore`] backed by host bookkeeping only.
///
/// Placement is a bump allocator per domain; a buffer gets a GPU address when
/// its pin count goes from zero to one and loses it when the count returns to
/// zero. Any operation can be armed to fail for fault-injection testing.
#[derive(Debug)]
pub struct HostBoStore {
    inner: Mutex<HostInner>,
    released: Condvar,
}

impl Default for HostBoStore {
    fn default() -> Self {
        Self::new(DEFAULT_VRAM_SIZE, DEFAULT_GTT_SIZE)
    }
}

impl HostBoStore {
    #[must_use]
    pub fn new(vram_size: u64, gtt_size: u64) -> Self {
        Self {
            inner: Mutex::new(HostInner {
                next_handle: 1,
                objects: HashMap::new(),
                reserved: HashSet::new(),
                vram_used: 0,
                gtt_used: 0,
                vram_size,
                gtt_size,
                next_vram_addr: 0,
                next_gtt_addr: GTT_APERTURE_BASE,
                pin_ops: 0,
                unpin_ops: 0,
                faults: Faults::default(),
            }),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the `n`th upcoming call of `op` fail (1 = the next one).
    pub fn fail_nth(&self, op: BoOp, n: u32) {
        assert!(n > 0, "fail_nth counts from 1");
        self.lock().faults.countdown.insert(op, n);
    }

    /// Makes the next pin of `bo` fail.
    pub fn fail_pin_of(&self, bo: BoHandle) {
        self.lock().faults.pin_of.insert(bo);
    }

    #[must_use]
    pub fn pin_count(&self, bo: BoHandle) -> u32 {
        self.lock().objects.get(&bo).map_or(0, |o| o.pin_count)
    }

    #[must_use]
    pub fn is_reserved(&self, bo: BoHandle) -> bool {
        self.lock().reserved.contains(&bo)
    }

    #[must_use]
    pub fn exists(&self, bo: BoHandle) -> bool {
        self.lock().objects.contains_key(&bo)
    }

    #[must_use]
    pub fn size_of(&self, bo: BoHandle) -> Option<u64> {
        self.lock().objects.get(&bo).map(|o| o.size)
    }

    #[must_use]
    pub fn flags_of(&self, bo: BoHandle) -> Option<u32> {
        self.lock().objects.get(&bo).map(|o| o.flags)
    }

    /// Number of `wait_idle` calls that completed for `bo`.
    #[must_use]
    pub fn wait_count(&self, bo: BoHandle) -> u32 {
        self.lock().objects.get(&bo).map_or(0, |o| o.waits)
    }

    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.lock().objects.len()
    }

    /// Sum of all outstanding pins.
    #[must_use]
    pub fn total_pins(&self) -> u64 {
        self.lock()
            .objects
            .values()
            .map(|o| u64::from(o.pin_count))
            .sum()
    }

    /// Number of successful `pin` / `unpin` calls so far.
    #[must_use]
    pub fn pin_ops(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.pin_ops, inner.unpin_ops)
    }

    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.lock().reserved.len()
    }
}

impl BoStore for HostBoStore {
    fn create(
        &self,
        size: u64,
        alignment: u64,
        domain: MemoryDomain,
        flags: u32,
    ) -> KgdResult<BoHandle> {
        if size == 0 {
            return Err(KgdError::InvalidArgument("zero-sized buffer object".into()));
        }

        let mut inner = self.lock();
        if inner.faults.hit(BoOp::Create) {
            return Err(KgdError::OutOfMemory);
        }

        let (used, limit) = match domain {
            MemoryDomain::Vram => (inner.vram_used, inner.vram_size),
            MemoryDomain::Gtt => (inner.gtt_used, inner.gtt_size),
        };
        let Some(size) = checked_align_up(size, alignment.max(4096)) else {
            warn!("HostBoStore: {domain:?} request of {size:#x} bytes is unrepresentable");
            return Err(KgdError::OutOfMemory);
        };
        if used.checked_add(size).is_none_or(|end| end > limit) {
            warn!("HostBoStore: {domain:?} exhausted ({used:#x} + {size:#x} > {limit:#x})");
            return Err(KgdError::OutOfMemory);
        }
        match domain {
            MemoryDomain::Vram => inner.vram_used += size,
            MemoryDomain::Gtt => inner.gtt_used += size,
        }

        let flags = if domain == MemoryDomain::Vram {
            flags | BO_FLAG_NO_CPU_ACCESS
        } else {
            flags
        };

        let handle = BoHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.objects.insert(
            handle,
            HostBo {
                size,
                domain,
                flags,
                pin_count: 0,
                gpu_address: None,
                waits: 0,
            },
        );
        Ok(handle)
    }

    fn destroy(&self, bo: BoHandle) {
        let mut inner = self.lock();
        let Some(obj) = inner.objects.remove(&bo) else {
            warn!("HostBoStore: destroy of unknown {bo}");
            return;
        };
        if obj.pin_count != 0 {
            warn!("HostBoStore: destroying {bo} with {} pins", obj.pin_count);
        }
        match obj.domain {
            MemoryDomain::Vram => inner.vram_used -= obj.size,
            MemoryDomain::Gtt => inner.gtt_used -= obj.size,
        }
        if inner.reserved.remove(&bo) {
            self.released.notify_all();
        }
    }

    fn reserve(&self, bo: BoHandle) -> KgdResult<()> {
        let mut inner = self.lock();
        if inner.faults.hit(BoOp::Reserve) {
            return Err(KgdError::Driver(format!("reserve of {bo} failed")));
        }
        loop {
            if !inner.objects.contains_key(&bo) {
                return Err(KgdError::NoSuchBo(bo));
            }
            if inner.reserved.insert(bo) {
                return Ok(());
            }
            inner = self
                .released
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn unreserve(&self, bo: BoHandle) {
        if self.lock().reserved.remove(&bo) {
            self.released.notify_all();
        }
    }

    fn pin(&self, bo: BoHandle, domain: MemoryDomain) -> KgdResult<u64> {
        let mut inner = self.lock();
        if inner.faults.hit(BoOp::Pin) || inner.faults.pin_of.remove(&bo) {
            return Err(KgdError::Driver(format!("pin of {bo} failed")));
        }

        let inner = &mut *inner;
        let obj = inner.objects.get_mut(&bo).ok_or(KgdError::NoSuchBo(bo))?;
        if obj.domain != domain {
            return Err(KgdError::InvalidArgument(format!(
                "{bo} lives in {:?}, cannot pin in {domain:?}",
                obj.domain
            )));
        }

        let addr = match obj.gpu_address {
            Some(addr) => addr,
            None => {
                let next = match domain {
                    MemoryDomain::Vram => &mut inner.next_vram_addr,
                    MemoryDomain::Gtt => &mut inner.next_gtt_addr,
                };
                let addr = *next;
                *next += obj.size;
                obj.gpu_address = Some(addr);
                addr
            }
        };
        obj.pin_count += 1;
        inner.pin_ops += 1;
        debug!("HostBoStore: pinned {bo} at {addr:#x} (count {})", obj.pin_count);
        Ok(addr)
    }

    fn unpin(&self, bo: BoHandle) -> KgdResult<()> {
        let mut inner = self.lock();
        if inner.faults.hit(BoOp::Unpin) {
            return Err(KgdError::Driver(format!("unpin of {bo} failed")));
        }

        let inner = &mut *inner;
        let obj = inner.objects.get_mut(&bo).ok_or(KgdError::NoSuchBo(bo))?;
        debug_assert!(obj.pin_count != 0, "unpin of unpinned {bo}");
        if obj.pin_count == 0 {
            warn!("HostBoStore: unpin of unpinned {bo}");
            return Err(KgdError::NotPinned(bo));
        }
        obj.pin_count -= 1;
        if obj.pin_count == 0 {
            obj.gpu_address = None;
        }
        inner.unpin_ops += 1;
        Ok(())
    }

    fn wait_idle(&self, bo: BoHandle) -> KgdResult<()> {
        let mut inner = self.lock();
        if inner.faults.hit(BoOp::WaitIdle) {
            return Err(KgdError::Timeout);
        }
        let obj = inner.objects.get_mut(&bo).ok_or(KgdError::NoSuchBo(bo))?;
        obj.waits += 1;
        Ok(())
    }

    fn gpu_address(&self, bo: BoHandle) -> Option<u64> {
        self.lock().objects.get(&bo).and_then(|o| o.gpu_address)
    }

    fn domain(&self, bo: BoHandle) -> Option<MemoryDomain> {
        self.lock().objects.get(&bo).map(|o| o.domain)
    }
}
