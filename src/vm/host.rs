use super::{PTES_PER_BLOCK, PageTableWriter};
use crate::bo::BoHandle;
use crate::error::{KgdError, KgdResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Page-table writes that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtOp {
    WritePde,
    WritePtes,
}

#[derive(Debug, Default)]
struct Tables {
    pdes: HashMap<(BoHandle, u64), u64>,
    ptes: HashMap<(BoHandle, u64), u64>,
    countdown: HashMap<PtOp, u32>,
    pde_writes: u64,
    pte_writes: u64,
}

impl Tables {
    fn hit(&mut self, op: PtOp) -> bool {
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

/// A [`PageTableWriter`] that keeps entries in host memory, keyed by table
/// buffer and index. Zero entries are not stored.
#[derive(Debug, Default)]
pub struct HostPageTables {
    inner: Mutex<Tables>,
}

impl HostPageTables {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the `n`th upcoming call of `op` fail (1 = the next one).
    pub fn fail_nth(&self, op: PtOp, n: u32) {
        assert!(n > 0, "fail_nth counts from 1");
        self.lock().countdown.insert(op, n);
    }

    #[must_use]
    pub fn pde(&self, pd: BoHandle, index: u64) -> u64 {
        self.lock().pdes.get(&(pd, index)).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn pte(&self, pt: BoHandle, index: u64) -> u64 {
        self.lock().ptes.get(&(pt, index)).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn live_ptes(&self) -> usize {
        self.lock().ptes.len()
    }

    #[must_use]
    pub fn live_pdes(&self) -> usize {
        self.lock().pdes.len()
    }

    /// Number of successful `write_pde` / `write_ptes` calls.
    #[must_use]
    pub fn write_counts(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.pde_writes, inner.pte_writes)
    }
}

impl PageTableWriter for HostPageTables {
    fn write_pde(&self, pd: BoHandle, index: u64, entry: u64) -> KgdResult<()> {
        let mut inner = self.lock();
        if inner.hit(PtOp::WritePde) {
            return Err(KgdError::Driver(format!("PDE {index} write to {pd} failed")));
        }
        if entry == 0 {
            inner.pdes.remove(&(pd, index));
        } else {
            inner.pdes.insert((pd, index), entry);
        }
        inner.pde_writes += 1;
        Ok(())
    }

    fn write_ptes(
        &self,
        pt: BoHandle,
        first: u64,
        count: u64,
        addr: u64,
        incr: u64,
        flags: u64,
    ) -> KgdResult<()> {
        if first + count > PTES_PER_BLOCK {
            return Err(KgdError::InvalidArgument(format!(
                "PTE write {first}+{count} overruns block {pt}"
            )));
        }

        let mut inner = self.lock();
        if inner.hit(PtOp::WritePtes) {
            return Err(KgdError::Driver(format!("PTE write to {pt} failed")));
        }
        for i in 0..count {
            let key = (pt, first + i);
            if flags == 0 {
                inner.ptes.remove(&key);
            } else {
                inner.ptes.insert(key, (addr + i * incr) | flags);
            }
        }
        inner.pte_writes += 1;
        Ok(())
    }
}
