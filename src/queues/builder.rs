#![allow(clippy::cast_possible_truncation)]

use crate::error::{KgdError, KgdResult};
use crate::kfd::mqd::{
    COMPUTE_STATIC_THREAD_MGMT_ALL, CikMqd, DEFAULT_CP_HQD_PERSISTENT_STATE,
    DEFAULT_MIN_AVAIL_SIZE, DEFAULT_MIN_IB_AVAIL_SIZE, DEFAULT_RPTR_BLOCK_SIZE, DOORBELL_EN,
    IB_ATC_EN, MQD_CONTROL_PRIV_STATE_EN, MQD_HEADER, MQD_VMID_MASK, PQ_ATC_EN, PRELOAD_REQ,
    QUANTUM_EN, QUANTUM_SCALE_1MS, doorbell_offset, quantum_duration,
};
use crate::utils::{is_aligned, lower_32_bits, order_base_2, upper_32_bits};

pub const MAX_QUEUE_PERCENTAGE: u32 = 100;
pub const MAX_QUEUE_PRIORITY: u32 = 15;

const DEFAULT_QUANTUM_MS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePriority {
    Minimum = -3,
    Low = -2,
    BelowNormal = -1,
    Normal = 0,
    AboveNormal = 1,
    High = 2,
    Maximum = 3,
}

/// Builds the [`CikMqd`] for a user compute queue.
///
/// The ring must be a power of two of at least 256 bytes and 256-byte aligned.
/// The descriptor comes out active only if the ring is non-empty and the queue
/// percentage is non-zero.
#[derive(Debug, Clone)]
pub struct MqdBuilder {
    ring_base: u64,
    ring_size: u64,
    mqd_address: u64,
    vmid: u32,
    doorbell: Option<u32>,
    rptr_report_address: u64,
    wptr_poll_address: u64,
    percentage: u32,
    priority: QueuePriority,
}

impl MqdBuilder {
    #[must_use]
    pub const fn new(ring_base: u64, ring_size: u64) -> Self {
        Self {
            ring_base,
            ring_size,
            mqd_address: 0,
            vmid: 0,
            doorbell: None,
            rptr_report_address: 0,
            wptr_poll_address: 0,
            percentage: MAX_QUEUE_PERCENTAGE,
            priority: QueuePriority::Normal,
        }
    }

    /// GPU address of the descriptor itself.
    #[must_use]
    pub const fn with_mqd_address(mut self, address: u64) -> Self {
        self.mqd_address = address;
        self
    }

    #[must_use]
    pub const fn with_vmid(mut self, vmid: u32) -> Self {
        self.vmid = vmid;
        self
    }

    /// Doorbell index within the process doorbell page.
    #[must_use]
    pub const fn with_doorbell(mut self, offset: u32) -> Self {
        self.doorbell = Some(offset);
        self
    }

    #[must_use]
    pub const fn with_pointers(mut self, rptr_report: u64, wptr_poll: u64) -> Self {
        self.rptr_report_address = rptr_report;
        self.wptr_poll_address = wptr_poll;
        self
    }

    #[must_use]
    pub const fn with_percentage(mut self, percentage: u32) -> Self {
        self.percentage = percentage;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, p: QueuePriority) -> Self {
        self.priority = p;
        self
    }

    pub fn build(self) -> KgdResult<CikMqd> {
        if self.ring_size != 0 && (self.ring_size < 256 || !self.ring_size.is_power_of_two()) {
            return Err(KgdError::InvalidArgument(format!(
                "ring size {:#x} is not a power of two >= 256",
                self.ring_size
            )));
        }
        if !is_aligned(self.ring_base, 256) {
            return Err(KgdError::InvalidArgument(format!(
                "ring base {:#x} is not 256-byte aligned",
                self.ring_base
            )));
        }
        if self.vmid > MQD_VMID_MASK {
            return Err(KgdError::InvalidArgument(format!("VMID {} out of range", self.vmid)));
        }
        if self.percentage > MAX_QUEUE_PERCENTAGE {
            return Err(KgdError::InvalidArgument(format!(
                "queue percentage {} above {MAX_QUEUE_PERCENTAGE}",
                self.percentage
            )));
        }

        let mut mqd = CikMqd {
            header: MQD_HEADER,
            compute_pipelinestat_enable: 1,
            compute_static_thread_mgmt_se: [COMPUTE_STATIC_THREAD_MGMT_ALL; 4],
            cp_mqd_base_addr_lo: lower_32_bits(self.mqd_address),
            cp_mqd_base_addr_hi: upper_32_bits(self.mqd_address),
            cp_mqd_control: MQD_CONTROL_PRIV_STATE_EN,
            cp_hqd_persistent_state: DEFAULT_CP_HQD_PERSISTENT_STATE | PRELOAD_REQ,
            cp_hqd_ib_control: DEFAULT_MIN_IB_AVAIL_SIZE | IB_ATC_EN,
            cp_hqd_quantum: QUANTUM_EN | QUANTUM_SCALE_1MS | quantum_duration(DEFAULT_QUANTUM_MS),
            cp_hqd_pipe_priority: 1,
            cp_hqd_queue_priority: Self::map_priority(self.priority),
            cp_hqd_vmid: self.vmid,
            ..Default::default()
        };

        mqd.cp_hqd_pq_control = DEFAULT_RPTR_BLOCK_SIZE | DEFAULT_MIN_AVAIL_SIZE | PQ_ATC_EN;
        if self.ring_size != 0 {
            mqd.cp_hqd_pq_control |= order_base_2(self.ring_size / 4) - 1;
        }
        mqd.cp_hqd_pq_base_lo = lower_32_bits(self.ring_base >> 8);
        mqd.cp_hqd_pq_base_hi = upper_32_bits(self.ring_base >> 8);
        mqd.cp_hqd_pq_rptr_report_addr_lo = lower_32_bits(self.rptr_report_address);
        mqd.cp_hqd_pq_rptr_report_addr_hi = upper_32_bits(self.rptr_report_address);
        mqd.cp_hqd_pq_wptr_poll_addr_lo = lower_32_bits(self.wptr_poll_address);
        mqd.cp_hqd_pq_wptr_poll_addr_hi = upper_32_bits(self.wptr_poll_address);
        mqd.cp_hqd_pq_doorbell_control = self
            .doorbell
            .map_or(0, |offset| DOORBELL_EN | doorbell_offset(offset));

        let active = self.ring_size > 0 && self.ring_base != 0 && self.percentage > 0;
        mqd.cp_hqd_active = u32::from(active);

        Ok(mqd)
    }

    /// Calculates priority integer
    const fn map_priority(p: QueuePriority) -> u32 {
        match p {
            QueuePriority::Minimum => 0,
            QueuePriority::Low => 3,
            QueuePriority::BelowNormal => 5,
            QueuePriority::Normal => 7,
            QueuePriority::AboveNormal => 9,
            QueuePriority::High => 11,
            QueuePriority::Maximum => MAX_QUEUE_PRIORITY,
        }
    }
}
