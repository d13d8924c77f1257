//! Simulated register file for unit tests.

use crate::kfd::regs::{
    ATC_VMID_PASID_MAPPING_UPDATE_STATUS, ATC_VMID0_PASID_MAPPING, CP_HQD_ACTIVE,
    CP_HQD_ACTIVE_ACTIVE, CP_HQD_DEQUEUE_REQUEST, RLC_CAPTURE_GPU_CLOCK_COUNT,
    RLC_GPU_CLOCK_COUNT_LSB, RLC_GPU_CLOCK_COUNT_MSB, RegisterAccess, SH_MEM_BASES,
    SH_MEM_CONFIG, SRBM_GFX_CNTL, compute_pipe, srbm_meid, srbm_pipeid, srbm_queueid,
    srbm_vmid,
};
use crate::utils::{lower_32_bits, upper_32_bits};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// How the ACTIVE bit reacts to a dequeue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// ACTIVE clears after this many further reads of it.
    After(u32),
    /// ACTIVE never clears.
    Never,
}

#[derive(Debug)]
struct SimState {
    srbm: u32,
    values: HashMap<(u32, u32), u32>,
    writes: Vec<(u32, u32, u32)>,
    drain: Drain,
    draining: HashMap<u32, u32>,
    atc_stuck: bool,
    clock: u64,
}

pub struct SimRegs {
    state: Mutex<SimState>,
}

const fn is_banked(offset: u32) -> bool {
    (offset >= 0xC900 && offset < 0xCA00) || (offset >= SH_MEM_BASES && offset <= SH_MEM_CONFIG)
}

/// SRBM selection value of compute queue `queue` on `pipe_id`.
pub const fn queue_bank(pipe_id: u32, queue: u32) -> u32 {
    let (mec, pipe) = compute_pipe(pipe_id);
    srbm_pipeid(pipe) | srbm_meid(mec) | srbm_queueid(queue)
}

pub const fn vmid_bank(vmid: u32) -> u32 {
    srbm_vmid(vmid)
}

impl SimRegs {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                srbm: 0,
                values: HashMap::new(),
                writes: Vec::new(),
                drain: Drain::After(0),
                draining: HashMap::new(),
                atc_stuck: false,
                clock: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(bank: u32, offset: u32) -> (u32, u32) {
        if is_banked(offset) { (bank, offset) } else { (0, offset) }
    }

    pub fn set_drain(&self, drain: Drain) {
        self.lock().drain = drain;
    }

    /// Stops the ATC from acknowledging PASID mapping updates.
    pub fn set_atc_stuck(&self, stuck: bool) {
        self.lock().atc_stuck = stuck;
    }

    pub fn set_clock(&self, clock: u64) {
        self.lock().clock = clock;
    }

    pub fn srbm(&self) -> u32 {
        self.lock().srbm
    }

    pub fn peek(&self, bank: u32, offset: u32) -> u32 {
        let state = self.lock();
        state.values.get(&Self::key(bank, offset)).copied().unwrap_or(0)
    }

    /// Every write so far as `(srbm selection, offset, value)`.
    pub fn writes(&self) -> Vec<(u32, u32, u32)> {
        self.lock().writes.clone()
    }
}

impl Default for SimRegs {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAccess for SimRegs {
    fn read32(&self, offset: u32) -> u32 {
        let mut state = self.lock();
        let bank = state.srbm;

        if offset == CP_HQD_ACTIVE
            && let Some(left) = state.draining.get_mut(&bank)
        {
            if *left == 0 {
                state.draining.remove(&bank);
                if let Some(v) = state.values.get_mut(&(bank, CP_HQD_ACTIVE)) {
                    *v &= !CP_HQD_ACTIVE_ACTIVE;
                }
            } else {
                *left -= 1;
            }
        }

        state
            .values
            .get(&Self::key(bank, offset))
            .copied()
            .unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.lock();
        let bank = state.srbm;
        state.writes.push((bank, offset, value));

        match offset {
            SRBM_GFX_CNTL => state.srbm = value,
            CP_HQD_DEQUEUE_REQUEST if value != 0 => {
                if let Drain::After(n) = state.drain {
                    state.draining.insert(bank, n);
                }
                state.values.insert((bank, offset), value);
            }
            o if (ATC_VMID0_PASID_MAPPING..ATC_VMID0_PASID_MAPPING + 16 * 4).contains(&o) => {
                state.values.insert((0, o), value);
                if !state.atc_stuck {
                    let vmid = (o - ATC_VMID0_PASID_MAPPING) / 4;
                    *state
                        .values
                        .entry((0, ATC_VMID_PASID_MAPPING_UPDATE_STATUS))
                        .or_insert(0) |= 1 << vmid;
                }
            }
            ATC_VMID_PASID_MAPPING_UPDATE_STATUS => {
                if let Some(v) = state.values.get_mut(&(0, offset)) {
                    *v &= !value;
                }
            }
            RLC_CAPTURE_GPU_CLOCK_COUNT if value & 1 != 0 => {
                let clock = state.clock;
                state
                    .values
                    .insert((0, RLC_GPU_CLOCK_COUNT_LSB), lower_32_bits(clock));
                state
                    .values
                    .insert((0, RLC_GPU_CLOCK_COUNT_MSB), upper_32_bits(clock));
            }
            _ => {
                state.values.insert(Self::key(bank, offset), value);
            }
        }
    }
}
