//! Buffer object store interface.
//!
//! The store owns all backing memory. Everything above it refers to buffers by
//! [`BoHandle`], never by address, and goes through the store to reserve, pin
//! and release them.

pub mod host;

use crate::error::KgdResult;
use std::fmt;

/// Opaque handle to a buffer object owned by a [`BoStore`].
///
/// Handles are totally ordered; batch reservations acquire buffers in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoHandle(pub u64);

impl fmt::Display for BoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bo#{}", self.0)
    }
}

/// Placement domain of a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryDomain {
    /// System memory reached through the GART.
    Gtt,
    /// Device-local memory. Not CPU accessible.
    Vram,
}

// Access flags passed to `BoStore::create`.
pub const BO_FLAG_CPU_ACCESS: u32 = 1 << 0;
pub const BO_FLAG_NO_CPU_ACCESS: u32 = 1 << 1;
pub const BO_FLAG_GTT_USWC: u32 = 1 << 2;
pub const BO_FLAG_READ_ONLY: u32 = 1 << 3;

/// Backing-store allocator consumed by the VM and the memory manager.
///
/// Reservation is a sleeping, non-reentrant per-buffer lock. Pinning is counted:
/// a buffer keeps its GPU address until every `pin` has been matched by `unpin`.
pub trait BoStore: Send + Sync {
    /// Creates a buffer object. Fails with `OutOfMemory` when the domain is exhausted.
    fn create(
        &self,
        size: u64,
        alignment: u64,
        domain: MemoryDomain,
        flags: u32,
    ) -> KgdResult<BoHandle>;

    /// Releases the buffer object and its backing memory.
    fn destroy(&self, bo: BoHandle);

    /// Blocks until the calling thread holds the reservation on `bo`.
    fn reserve(&self, bo: BoHandle) -> KgdResult<()>;

    fn unreserve(&self, bo: BoHandle);

    /// Pins `bo` in `domain` and returns its GPU address.
    fn pin(&self, bo: BoHandle, domain: MemoryDomain) -> KgdResult<u64>;

    /// Drops one pin. Unpinning a buffer that is not pinned is a contract violation.
    fn unpin(&self, bo: BoHandle) -> KgdResult<()>;

    /// Blocks until the GPU has finished every access to `bo` queued so far.
    fn wait_idle(&self, bo: BoHandle) -> KgdResult<()>;

    /// GPU address of a pinned buffer, `None` while it is movable.
    fn gpu_address(&self, bo: BoHandle) -> Option<u64>;

    fn domain(&self, bo: BoHandle) -> Option<MemoryDomain>;
}

/// A held reservation on one buffer object, released on drop.
pub struct Reservation<'a> {
    store: &'a dyn BoStore,
    bo: BoHandle,
}

impl<'a> Reservation<'a> {
    pub fn acquire(store: &'a dyn BoStore, bo: BoHandle) -> KgdResult<Self> {
        store.reserve(bo)?;
        Ok(Self { store, bo })
    }

    #[must_use]
    pub const fn bo(&self) -> BoHandle {
        self.bo
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.store.unreserve(self.bo);
    }
}

/// Reservations on a list of buffer objects, taken in ascending handle order.
///
/// Every batch in the crate reserves in the same global order, so two batches
/// sharing buffers cannot deadlock against each other.
pub struct ReservationSet<'a> {
    store: &'a dyn BoStore,
    held: Vec<BoHandle>,
}

impl<'a> ReservationSet<'a> {
    /// Reserves every buffer in `bos`. Duplicates are reserved once.
    ///
    /// On failure, reservations taken so far are released in reverse order.
    pub fn acquire(store: &'a dyn BoStore, mut bos: Vec<BoHandle>) -> KgdResult<Self> {
        bos.sort_unstable();
        bos.dedup();

        let mut set = Self {
            store,
            held: Vec::with_capacity(bos.len()),
        };

        for bo in bos {
            // Dropping `set` on the error path unwinds the partial batch.
            store.reserve(bo)?;
            set.held.push(bo);
        }

        Ok(set)
    }

    #[must_use]
    pub fn contains(&self, bo: BoHandle) -> bool {
        self.held.binary_search(&bo).is_ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for ReservationSet<'_> {
    fn drop(&mut self) {
        for bo in self.held.iter().rev() {
            self.store.unreserve(*bo);
        }
    }
}
