#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Ioctl to {:?} failed: {}", .kind, .source)]
    Ioctl { kind: IoctlKind, source: nix::Error },
    #[error("Requested {count} lines, the kernel accepts 1 to {max}")]
    InvalidLineCount { count: usize, max: usize },
    #[error("Expected {expected} bytes from the event descriptor, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlKind {
    GetChipInfo,
    GetLineInfo,
    GetLine,
    GetValues,
    SetValues,
    GetLineEvent,
    ReadEvent,
}

pub(crate) fn ioctl_error(kind: IoctlKind, source: nix::Error) -> Error {
    Error::Ioctl { kind, source }
}

pub type Result<T> = std::result::Result<T, Error>;
