use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("could not open {}: {source}", path.display()))]
    OpenBackingFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("page i/o at offset {offset}: {source}"))]
    PageIo {
        offset: u64,
        source: std::io::Error,
    },

    #[snafu(display("backing file metadata: {source}"))]
    FileMeta {
        source: std::io::Error,
    },

    #[snafu(display("flush backing file: {source}"))]
    Flush {
        source: std::io::Error,
    },

    #[snafu(display("could not remove {}: {source}", path.display()))]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("auxiliary index {}: {source}", path.display()))]
    IndexIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("auxiliary index record: {source}"))]
    IndexCodec {
        source: bincode::Error,
    },

    #[snafu(display("file aborted after a failed commit; reopen to recover"))]
    Aborted,

    #[snafu(display("database is read-only"))]
    ReadOnly,

    #[snafu(display("{source}"))]
    LockProtocol {
        source: sql_vfs::locks::InvalidTransition,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
