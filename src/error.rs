use crate::bo::BoHandle;
use crate::kfd::interface::InterfaceVersion;
use std::fmt;
use thiserror::Error;

/// Protocol step a nested error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    PinBo,
    ReserveVm,
    PinPageTables,
    PinPageDirectory,
    UpdatePageDirectory,
    ClearFreed,
    UpdatePtes,
    ClearInvalid,
    WaitIdle,
    UnpinPageDirectory,
    UnpinPageTables,
    UnpinBo,
    ReserveBo,
    RemoveBinding,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PinBo => "pin buffer object",
            Self::ReserveVm => "reserve VM buffer list",
            Self::PinPageTables => "pin page tables",
            Self::PinPageDirectory => "pin page directory",
            Self::UpdatePageDirectory => "update page directory",
            Self::ClearFreed => "clear freed mappings",
            Self::UpdatePtes => "update page table entries",
            Self::ClearInvalid => "clear invalidated mappings",
            Self::WaitIdle => "wait for page table idle",
            Self::UnpinPageDirectory => "unpin page directory",
            Self::UnpinPageTables => "unpin page tables",
            Self::UnpinBo => "unpin buffer object",
            Self::ReserveBo => "reserve buffer object",
            Self::RemoveBinding => "remove VM binding",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum KgdError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of GPU Memory")]
    OutOfMemory,

    #[error("Mapping failed: {0}")]
    MappingFailed(#[source] Box<KgdError>),

    #[error("Invalid virtual address: 0x{0:x}")]
    InvalidVirtualAddress(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("{step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: Box<KgdError>,
    },

    #[error("Queue slot busy: pipe {pipe}, queue {queue}")]
    QueueBusy { pipe: u32, queue: u32 },

    #[error("Buffer object {0} is not pinned")]
    NotPinned(BoHandle),

    #[error("No such buffer object: {0}")]
    NoSuchBo(BoHandle),

    #[error("Buffer object {0} is already bound to this VM")]
    BindingExists(BoHandle),

    #[error("Incompatible KFD interface: expected {expected}, found {found}")]
    IncompatibleInterface {
        expected: InterfaceVersion,
        found: InterfaceVersion,
    },

    #[error("Device Error: {0}")]
    Driver(String),
}

impl KgdError {
    /// Wraps `self` with the protocol step it came from.
    #[must_use]
    pub fn during(self, step: Step) -> Self {
        Self::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, with step context stripped.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// The step this error was raised from, if it carries one.
    #[must_use]
    pub const fn step(&self) -> Option<Step> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

// A convenient alias
pub type KgdResult<T> = Result<T, KgdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_strips_step_context() {
        let err = KgdError::OutOfMemory
            .during(Step::PinPageTables)
            .during(Step::ReserveVm);
        assert_eq!(err.step(), Some(Step::ReserveVm));
        assert!(matches!(err.root(), KgdError::OutOfMemory));
    }

    #[test]
    fn test_step_message_names_the_step() {
        let err = KgdError::Timeout.during(Step::WaitIdle);
        assert_eq!(
            err.to_string(),
            "wait for page table idle failed: Operation timed out"
        );
    }
}
