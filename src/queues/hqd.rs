//! Hardware queue descriptor (HQD) slots of the compute pipes.
//!
//! A slot moves `Unloaded -> Loading -> Active -> Destroying -> Unloaded`.
//! Every register access for a slot happens with its SRBM bank selected, and
//! `destroy` keeps the bank selected for the whole drain poll, so no other
//! banked access can run until the queue is idle or the budget is spent.

use crate::error::{KgdError, KgdResult};
use crate::kfd::mqd::CikMqd;
use crate::kfd::regs::{
    COMPUTE_STATIC_THREAD_MGMT_SE0, COMPUTE_STATIC_THREAD_MGMT_SE1, COMPUTE_STATIC_THREAD_MGMT_SE2,
    COMPUTE_STATIC_THREAD_MGMT_SE3, CP_HQD_ACTIVE, CP_HQD_ACTIVE_ACTIVE, CP_HQD_ATOMIC0_PREOP_HI,
    CP_HQD_ATOMIC0_PREOP_LO, CP_HQD_ATOMIC1_PREOP_HI, CP_HQD_ATOMIC1_PREOP_LO,
    CP_HQD_DEQUEUE_REQUEST, CP_HQD_HQ_SCHEDULER0, CP_HQD_HQ_SCHEDULER1, CP_HQD_IB_BASE_ADDR,
    CP_HQD_IB_BASE_ADDR_HI, CP_HQD_IB_CONTROL, CP_HQD_IB_RPTR, CP_HQD_MSG_TYPE,
    CP_HQD_PERSISTENT_STATE, CP_HQD_PIPE_PRIORITY, CP_HQD_PQ_BASE, CP_HQD_PQ_BASE_HI,
    CP_HQD_PQ_CONTROL, CP_HQD_PQ_DOORBELL_CONTROL, CP_HQD_PQ_RPTR, CP_HQD_PQ_RPTR_REPORT_ADDR,
    CP_HQD_PQ_RPTR_REPORT_ADDR_HI, CP_HQD_PQ_WPTR, CP_HQD_PQ_WPTR_POLL_ADDR,
    CP_HQD_PQ_WPTR_POLL_ADDR_HI, CP_HQD_QUANTUM, CP_HQD_QUEUE_PRIORITY, CP_HQD_SEMA_CMD,
    CP_HQD_VMID, CP_MQD_BASE_ADDR, CP_MQD_BASE_ADDR_HI, CP_MQD_CONTROL, RegisterAccess, SrbmGuard,
    SrbmLock, vm_context_page_table_base,
};
use crate::utils::{lower_32_bits, upper_32_bits};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

pub const DEFAULT_POLL_QUANTUM: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HqdState {
    #[default]
    Unloaded,
    Loading,
    Active,
    Destroying,
}

/// What the CP does with in-flight work when a queue is dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResetType {
    Drain = 1,
    Reset = 2,
}

/// Host-side view of one (pipe, queue) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeQueueSlot {
    pub pipe: u32,
    pub queue: u32,
    pub state: HqdState,
    pub active: bool,
    pub ring_base: u64,
}

impl ComputeQueueSlot {
    const fn unloaded(pipe: u32, queue: u32) -> Self {
        Self {
            pipe,
            queue,
            state: HqdState::Unloaded,
            active: false,
            ring_base: 0,
        }
    }
}

/// A 32-bit word in user memory, such as a queue's write pointer shadow.
/// Reading it may fault.
pub trait UserWord: Send + Sync {
    fn read(&self) -> KgdResult<u32>;
}

impl UserWord for AtomicU32 {
    fn read(&self) -> KgdResult<u32> {
        Ok(self.load(Ordering::Acquire))
    }
}

pub struct HqdManager {
    regs: Arc<dyn RegisterAccess>,
    srbm: Arc<SrbmLock>,
    poll_quantum: Duration,
    slots: Mutex<HashMap<(u32, u32), ComputeQueueSlot>>,
}

impl fmt::Debug for HqdManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HqdManager")
            .field("poll_quantum", &self.poll_quantum)
            .finish_non_exhaustive()
    }
}

impl HqdManager {
    #[must_use]
    pub fn new(regs: Arc<dyn RegisterAccess>, srbm: Arc<SrbmLock>, poll_quantum: Duration) -> Self {
        Self {
            regs,
            srbm,
            poll_quantum,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<(u32, u32), ComputeQueueSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_slot(&self, pipe: u32, queue: u32, f: impl FnOnce(&mut ComputeQueueSlot)) {
        let mut slots = self.lock_slots();
        f(slots
            .entry((pipe, queue))
            .or_insert_with(|| ComputeQueueSlot::unloaded(pipe, queue)));
    }

    /// Tracked state of a slot. Slots never loaded report `Unloaded`.
    #[must_use]
    pub fn slot(&self, pipe: u32, queue: u32) -> ComputeQueueSlot {
        self.lock_slots()
            .get(&(pipe, queue))
            .copied()
            .unwrap_or_else(|| ComputeQueueSlot::unloaded(pipe, queue))
    }

    fn select(&self, pipe: u32, queue: u32) -> SrbmGuard<'_> {
        self.srbm.select_queue(&*self.regs, pipe, queue)
    }

    /// Programs `mqd` into the slot and activates it.
    ///
    /// The user write pointer is read before the register bank is taken since
    /// the read may fault; a failed read just leaves `CP_HQD_PQ_WPTR` alone.
    /// `page_table_base` is the byte address of the owning VM's page directory.
    /// ACTIVE is written last. Fails with `QueueBusy` if the slot's ACTIVE bit
    /// is still set.
    pub fn load(
        &self,
        mqd: &CikMqd,
        pipe: u32,
        queue: u32,
        wptr: Option<&dyn UserWord>,
        page_table_base: u64,
    ) -> KgdResult<()> {
        let wptr_shadow = wptr.and_then(|w| match w.read() {
            Ok(v) => Some(v),
            Err(e) => {
                debug!("HqdManager: write pointer unreadable, not restoring it: {e}");
                None
            }
        });

        let bank = self.select(pipe, queue);
        if bank.read32(CP_HQD_ACTIVE) & CP_HQD_ACTIVE_ACTIVE != 0 {
            warn!("HqdManager: pipe {pipe} queue {queue} is still active");
            return Err(KgdError::QueueBusy { pipe, queue });
        }
        self.update_slot(pipe, queue, |s| s.state = HqdState::Loading);

        let [se0, se1, se2, se3] = mqd.compute_static_thread_mgmt_se;
        bank.write32(COMPUTE_STATIC_THREAD_MGMT_SE0, se0);
        bank.write32(COMPUTE_STATIC_THREAD_MGMT_SE1, se1);
        bank.write32(COMPUTE_STATIC_THREAD_MGMT_SE2, se2);
        bank.write32(COMPUTE_STATIC_THREAD_MGMT_SE3, se3);

        let vmid = mqd.vmid();
        if vmid != 0 {
            bank.write32(
                vm_context_page_table_base(vmid),
                lower_32_bits(page_table_base >> 12),
            );
        }

        bank.write32(CP_MQD_BASE_ADDR, mqd.cp_mqd_base_addr_lo);
        bank.write32(CP_MQD_BASE_ADDR_HI, mqd.cp_mqd_base_addr_hi);
        bank.write32(CP_MQD_CONTROL, mqd.cp_mqd_control);

        bank.write32(CP_HQD_PQ_BASE, mqd.cp_hqd_pq_base_lo);
        bank.write32(CP_HQD_PQ_BASE_HI, mqd.cp_hqd_pq_base_hi);
        bank.write32(CP_HQD_PQ_CONTROL, mqd.cp_hqd_pq_control);

        bank.write32(CP_HQD_IB_CONTROL, mqd.cp_hqd_ib_control);
        bank.write32(CP_HQD_IB_BASE_ADDR, mqd.cp_hqd_ib_base_addr_lo);
        bank.write32(CP_HQD_IB_BASE_ADDR_HI, mqd.cp_hqd_ib_base_addr_hi);
        bank.write32(CP_HQD_IB_RPTR, mqd.cp_hqd_ib_rptr);

        bank.write32(CP_HQD_PERSISTENT_STATE, mqd.cp_hqd_persistent_state);
        bank.write32(CP_HQD_SEMA_CMD, mqd.cp_hqd_sema_cmd);
        bank.write32(CP_HQD_MSG_TYPE, mqd.cp_hqd_msg_type);

        bank.write32(CP_HQD_ATOMIC0_PREOP_LO, mqd.cp_hqd_atomic0_preop_lo);
        bank.write32(CP_HQD_ATOMIC0_PREOP_HI, mqd.cp_hqd_atomic0_preop_hi);
        bank.write32(CP_HQD_ATOMIC1_PREOP_LO, mqd.cp_hqd_atomic1_preop_lo);
        bank.write32(CP_HQD_ATOMIC1_PREOP_HI, mqd.cp_hqd_atomic1_preop_hi);

        bank.write32(CP_HQD_PQ_RPTR_REPORT_ADDR, mqd.cp_hqd_pq_rptr_report_addr_lo);
        bank.write32(CP_HQD_PQ_RPTR_REPORT_ADDR_HI, mqd.cp_hqd_pq_rptr_report_addr_hi);
        bank.write32(CP_HQD_PQ_RPTR, mqd.cp_hqd_pq_rptr);

        bank.write32(CP_HQD_PQ_WPTR_POLL_ADDR, mqd.cp_hqd_pq_wptr_poll_addr_lo);
        bank.write32(CP_HQD_PQ_WPTR_POLL_ADDR_HI, mqd.cp_hqd_pq_wptr_poll_addr_hi);

        bank.write32(CP_HQD_PQ_DOORBELL_CONTROL, mqd.cp_hqd_pq_doorbell_control);

        bank.write32(CP_HQD_VMID, mqd.cp_hqd_vmid);
        bank.write32(CP_HQD_QUANTUM, mqd.cp_hqd_quantum);
        bank.write32(CP_HQD_PIPE_PRIORITY, mqd.cp_hqd_pipe_priority);
        bank.write32(CP_HQD_QUEUE_PRIORITY, mqd.cp_hqd_queue_priority);

        bank.write32(CP_HQD_HQ_SCHEDULER0, mqd.cp_hqd_hq_scheduler0);
        bank.write32(CP_HQD_HQ_SCHEDULER1, mqd.cp_hqd_hq_scheduler1);

        if let Some(wptr) = wptr_shadow {
            bank.write32(CP_HQD_PQ_WPTR, wptr);
        }

        bank.write32(CP_HQD_ACTIVE, mqd.cp_hqd_active);

        let active = mqd.is_active();
        self.update_slot(pipe, queue, |s| {
            s.state = if active {
                HqdState::Active
            } else {
                HqdState::Unloaded
            };
            s.active = active;
            s.ring_base = mqd.ring_base();
        });
        drop(bank);

        debug!(
            "HqdManager: loaded pipe {pipe} queue {queue} (ring {:#x}, active {active})",
            mqd.ring_base()
        );
        Ok(())
    }

    /// Whether the slot is active and running the ring at `queue_address`.
    #[must_use]
    pub fn is_occupied(&self, queue_address: u64, pipe: u32, queue: u32) -> bool {
        let bank = self.select(pipe, queue);
        if bank.read32(CP_HQD_ACTIVE) & CP_HQD_ACTIVE_ACTIVE == 0 {
            return false;
        }
        let base = queue_address >> 8;
        bank.read32(CP_HQD_PQ_BASE) == lower_32_bits(base)
            && bank.read32(CP_HQD_PQ_BASE_HI) == upper_32_bits(base)
    }

    /// Dequeues the slot and waits for its ACTIVE bit to clear.
    ///
    /// The bank stays selected while polling. Each poll that finds the queue
    /// still active sleeps one quantum and charges it against `timeout`; once
    /// the budget is spent the call fails with `Timeout` and the slot is left
    /// in `Destroying`.
    pub fn destroy(
        &self,
        reset_type: ResetType,
        timeout: Duration,
        pipe: u32,
        queue: u32,
    ) -> KgdResult<()> {
        let bank = self.select(pipe, queue);
        self.update_slot(pipe, queue, |s| s.state = HqdState::Destroying);

        bank.write32(CP_HQD_PQ_DOORBELL_CONTROL, 0);
        bank.write32(CP_HQD_DEQUEUE_REQUEST, reset_type as u32);

        let mut budget = timeout;
        loop {
            if bank.read32(CP_HQD_ACTIVE) & CP_HQD_ACTIVE_ACTIVE == 0 {
                break;
            }
            if budget.is_zero() {
                warn!(
                    "HqdManager: CP queue preemption timed out after {timeout:?} (pipe {pipe} queue {queue})"
                );
                return Err(KgdError::Timeout);
            }
            trace!("HqdManager: pipe {pipe} queue {queue} still active, {budget:?} left");
            thread::sleep(self.poll_quantum);
            budget = budget.saturating_sub(self.poll_quantum);
        }

        self.update_slot(pipe, queue, |s| {
            s.state = HqdState::Unloaded;
            s.active = false;
        });
        drop(bank);

        debug!("HqdManager: destroyed pipe {pipe} queue {queue}");
        Ok(())
    }
}
