use std::{io, path::PathBuf};

use crate::{GroupId, Pin, PinMode};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to open {}: {}", .path.display(), .source)]
    Open { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Uapi(#[from] lib_uapi::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("No GPIO chip is open")]
    ChipNotOpen,
    #[error("This manager already holds chip {0}")]
    ChipAlreadyOpen(String),
    #[error("{pin} is out of range, chip {chip} has {lines} lines")]
    PinOutOfRange { pin: Pin, chip: String, lines: u32 },
    #[error("{pin} is already requested by {consumer:?}")]
    LineBusy { pin: Pin, consumer: String },
    #[error("Pin state is inconsistent: {0}")]
    Inconsistent(&'static str),
    #[error("Pull configuration is not supported on this SoC")]
    PullUnsupported,
    #[error("{0} has no pull register field")]
    PullPinOutOfRange(Pin),
    #[error("{pin} belongs to group {group}")]
    PinInGroup { pin: Pin, group: GroupId },
    #[error("{0} is listed more than once")]
    DuplicatePin(Pin),
    #[error("A group needs at least one pin")]
    EmptyGroup,
    #[error("A group holds at most {max} pins, got {count}")]
    TooManyPins { count: usize, max: usize },
    #[error("Group {0} is not registered")]
    GroupNotFound(GroupId),
    #[error("Expected {expected} values, got {actual}")]
    ValueCount { expected: usize, actual: usize },
    #[error("{pin} cannot be used in {mode:?} mode here")]
    InvalidMode { pin: Pin, mode: PinMode },
    #[error("Edge detection needs a registered edge callback")]
    NoEdgeCallback,
    #[error("Channel {0} does not exist on this device")]
    InvalidChannel(usize),
}

/// Log and build an [`Error::Inconsistent`].
///
/// Reaching one of these means the pin bookkeeping contradicts itself, which
/// is a bug in this crate rather than a hardware problem.
pub(crate) fn inconsistent(what: &'static str) -> Error {
    tracing::error!("{what}");
    Error::Inconsistent(what)
}

pub type Result<T> = std::result::Result<T, Error>;
