pub mod builder;
pub mod hqd;

pub use builder::{MqdBuilder, QueuePriority};
pub use hqd::{HqdManager, HqdState, ResetType};
