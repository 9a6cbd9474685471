use snafu::Snafu;

use crate::buffer;
use crate::LockLevel;

#[derive(Debug, Snafu)]
pub enum Error<External = Box<dyn std::error::Error>> {
    UnexpectedEof,

    #[snafu(display("file name must be valid utf8"))]
    InvalidName,

    #[snafu(display("file {name} not found"))]
    NotFound {
        name: String,
    },

    #[snafu(display("path too long"))]
    PathTooLong,

    #[snafu(display("invalid open flags {flags:#x}"))]
    InvalidOpenFlags {
        flags: i32,
    },

    #[snafu(display("invalid lock level {level}"))]
    InvalidLockLevel {
        level: i32,
    },

    #[snafu(display("unsupported lock transition {from:?} -> {to:?}"))]
    InvalidLockTransition {
        from: LockLevel,
        to: LockLevel,
    },

    #[snafu(display("no file registered under handle {id}"))]
    UnknownHandle {
        id: u32,
    },

    #[snafu(display("handle {id} is already in use"))]
    HandleInUse {
        id: u32,
    },

    #[snafu(display("permission denied"))]
    PermissionDenied,

    #[snafu(display("expected {name} arg"))]
    ExpectedArg {
        name: &'static str,
    },

    #[snafu(display("buffer fault: {fault}"))]
    Buffer {
        fault: buffer::Fault,
    },

    External {
        cause: External,
    },
}

impl<T> From<T> for Error<T> {
    fn from(value: T) -> Self {
        Self::External { cause: value }
    }
}
