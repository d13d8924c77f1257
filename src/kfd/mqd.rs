// ===============================================================================================
// Field values
// ===============================================================================================

pub const MQD_HEADER: u32 = 0xC031_0800;

pub const DEFAULT_CP_HQD_PERSISTENT_STATE: u32 = 0x33 << 8;
pub const PRELOAD_REQ: u32 = 1 << 0;

pub const MQD_VMID_MASK: u32 = 0xF;
pub const MQD_CONTROL_PRIV_STATE_EN: u32 = 1 << 8;

pub const QUANTUM_EN: u32 = 1 << 0;
pub const QUANTUM_SCALE_1MS: u32 = 1 << 4;
pub const fn quantum_duration(x: u32) -> u32 {
    (x & 0x3F) << 8
}

pub const DEFAULT_RPTR_BLOCK_SIZE: u32 = 5 << 8;
pub const DEFAULT_MIN_AVAIL_SIZE: u32 = 1 << 20;
pub const PQ_ATC_EN: u32 = 1 << 23;
pub const NO_UPDATE_RPTR: u32 = 1 << 27;
pub const UNORD_DISPATCH: u32 = 1 << 28;
pub const PRIV_STATE: u32 = 1 << 30;
pub const KMD_QUEUE: u32 = 1 << 31;

pub const DOORBELL_EN: u32 = 1 << 30;
pub const fn doorbell_offset(x: u32) -> u32 {
    (x & 0x1F_FFFF) << 2
}

pub const IB_ATC_EN: u32 = 1 << 23;
pub const DEFAULT_MIN_IB_AVAIL_SIZE: u32 = 3 << 20;

pub const COMPUTE_STATIC_THREAD_MGMT_ALL: u32 = 0xFFFF_FFFF;

/// Memory queue descriptor for a CIK compute queue.
///
/// The `cp_*` fields are the values `HqdManager::load` programs into the
/// matching `CP_HQD_*` / `CP_MQD_*` registers of the selected queue slot.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CikMqd {
    pub header: u32,
    pub compute_pipelinestat_enable: u32,
    pub compute_static_thread_mgmt_se: [u32; 4],

    pub cp_mqd_base_addr_lo: u32,
    pub cp_mqd_base_addr_hi: u32,
    pub cp_hqd_active: u32,
    pub cp_hqd_vmid: u32,
    pub cp_hqd_persistent_state: u32,
    pub cp_hqd_pipe_priority: u32,
    pub cp_hqd_queue_priority: u32,
    pub cp_hqd_quantum: u32,
    pub cp_hqd_pq_base_lo: u32,
    pub cp_hqd_pq_base_hi: u32,
    pub cp_hqd_pq_rptr: u32,
    pub cp_hqd_pq_rptr_report_addr_lo: u32,
    pub cp_hqd_pq_rptr_report_addr_hi: u32,
    pub cp_hqd_pq_wptr_poll_addr_lo: u32,
    pub cp_hqd_pq_wptr_poll_addr_hi: u32,
    pub cp_hqd_pq_doorbell_control: u32,
    pub cp_hqd_pq_wptr: u32,
    pub cp_hqd_pq_control: u32,
    pub cp_hqd_ib_base_addr_lo: u32,
    pub cp_hqd_ib_base_addr_hi: u32,
    pub cp_hqd_ib_rptr: u32,
    pub cp_hqd_ib_control: u32,
    pub cp_hqd_iq_timer: u32,
    pub cp_hqd_iq_rptr: u32,
    pub cp_hqd_dequeue_request: u32,
    pub cp_hqd_dma_offload: u32,
    pub cp_hqd_sema_cmd: u32,
    pub cp_hqd_msg_type: u32,
    pub cp_hqd_atomic0_preop_lo: u32,
    pub cp_hqd_atomic0_preop_hi: u32,
    pub cp_hqd_atomic1_preop_lo: u32,
    pub cp_hqd_atomic1_preop_hi: u32,
    pub cp_hqd_hq_scheduler0: u32,
    pub cp_hqd_hq_scheduler1: u32,
    pub cp_mqd_control: u32,
}

impl CikMqd {
    /// Ring base address in bytes, as programmed into `CP_HQD_PQ_BASE{,_HI}`.
    #[must_use]
    pub const fn ring_base(&self) -> u64 {
        (((self.cp_hqd_pq_base_hi as u64) << 32) | self.cp_hqd_pq_base_lo as u64) << 8
    }

    #[must_use]
    pub const fn vmid(&self) -> u32 {
        self.cp_hqd_vmid & MQD_VMID_MASK
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.cp_hqd_active & 1 != 0
    }
}
