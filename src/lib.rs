//! Kernel graphics driver side of the radeon compute interface.
//!
//! [`RadeonKgd`](kfd::device::RadeonKgd) is the device object handed to the
//! compute driver. Behind it, [`memory::MemoryManager`] maps buffer objects
//! into per-process [`vm::GpuVm`] address spaces and [`queues::HqdManager`]
//! loads and drains the compute pipes' hardware queue slots.

pub mod bo;
pub mod config;
pub mod error;
pub mod kfd;
pub mod memory;
pub mod queues;
pub mod utils;
pub mod vm;

#[cfg(test)]
mod testing;

pub use config::KgdConfig;
pub use error::{KgdError, KgdResult, Step};
pub use kfd::device::RadeonKgd;
pub use kfd::interface::{Kfd2Kgd, Kgd2Kfd};
