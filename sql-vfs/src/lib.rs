#![allow(async_fn_in_trait)]
//! Create a custom virtual file system for an embedded SQL engine by
//! implementing the [Vfs] and [FileHandle] traits and driving them through a
//! [dispatch::Dispatcher].

pub mod buffer;
pub mod codes;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod state;

use std::borrow::Cow;
use std::time::Duration;

pub use dispatch::Dispatcher;

/// A file opened by a [Vfs].
pub trait FileHandle {
    type Error: std::error::Error;

    /// Return the current size in bytes of the file.
    async fn size(&mut self) -> Result<u64, error::Error<Self::Error>>;

    /// Read up to `buf.len()` bytes starting at `offset`, returning how many
    /// bytes were produced. The dispatch facade zero-fills the tail and
    /// reports a short read to the engine when fewer bytes were available.
    async fn read_at(
        &mut self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, error::Error<Self::Error>>;

    /// Write the entire `buf` starting at `offset`.
    async fn write_at(&mut self, buf: &[u8], offset: u64)
        -> Result<(), error::Error<Self::Error>>;

    /// Set the file to the specified `size`.
    async fn truncate(&mut self, size: u64) -> Result<(), error::Error<Self::Error>>;

    /// Make sure all writes reached durable storage. If `data_only` is set,
    /// only the data and not the metadata has to be synced.
    async fn sync(&mut self, data_only: bool) -> Result<(), error::Error<Self::Error>>;

    /// Move the handle to `level`. Returns whether the requested level could
    /// be reached. Escalation sequence:
    /// - The level is never moved from [LockLevel::None] to anything higher
    ///   than [LockLevel::Shared].
    /// - A [LockLevel::Pending] is never requested explicitly.
    /// - A [LockLevel::Shared] is always held when [LockLevel::Reserved] is
    ///   requested.
    async fn lock(&mut self, level: LockLevel) -> Result<bool, error::Error<Self::Error>>;

    /// Move the handle down to `level`.
    async fn unlock(&mut self, level: LockLevel) -> Result<bool, error::Error<Self::Error>> {
        self.lock(level).await
    }

    /// Check whether any handle on this file holds a [LockLevel::Reserved] or
    /// higher lock.
    async fn reserved(&mut self) -> Result<bool, error::Error<Self::Error>>;

    /// The level this handle currently holds.
    fn current_lock(&self) -> LockLevel;

    /// Extensible side channel for engine hints; see [ControlOp]. The default
    /// handles nothing, which the facade reports as NOTFOUND so the engine
    /// falls back to its own processing.
    async fn file_control(
        &mut self,
        _op: ControlOp<'_>,
    ) -> Result<ControlReply, error::Error<Self::Error>> {
        Ok(ControlReply::NotHandled)
    }

    fn sector_size(&self) -> u32 {
        512
    }

    fn device_characteristics(&self) -> u32 {
        0
    }

    /// Check if the underlying data of the handle got moved or deleted.
    async fn moved(&self) -> Result<bool, error::Error<Self::Error>> {
        Ok(false)
    }
}

/// A virtual file system for an embedded SQL engine.
pub trait Vfs {
    /// The file returned by [Vfs::open].
    type Handle: FileHandle<Error = Self::Error>;

    type Error: std::error::Error;

    /// Open the file `db` (of type `opts.kind`).
    async fn open(
        &self,
        db: &str,
        opts: OpenOptions,
    ) -> Result<Self::Handle, error::Error<Self::Error>>;

    /// Delete the file `db`.
    async fn delete(&self, db: &str) -> Result<(), error::Error<Self::Error>>;

    /// Check if a file `db` already exists.
    async fn exists(&self, db: &str) -> Result<bool, error::Error<Self::Error>>;

    /// Check access to `db`. The default implementation always grants it.
    async fn access(&self, _db: &str, _write: bool) -> Result<bool, error::Error<Self::Error>> {
        Ok(true)
    }

    /// Retrieve the full pathname of `db`.
    async fn full_pathname<'a>(
        &self,
        db: &'a str,
    ) -> Result<Cow<'a, str>, error::Error<Self::Error>> {
        Ok(db.into())
    }

    /// Generate a name for a transient file.
    async fn temporary_name(&self) -> String;

    /// Populate `buffer` with random data.
    fn random(&self, buffer: &mut [u8]);

    /// Sleep for `duration`. Returns the duration actually slept.
    async fn sleep(&self, duration: Duration) -> Duration;

    /// Which operations of this backend may suspend. Queried once at
    /// registration; the dispatch facade routes every listed method through
    /// its suspending trampoline and everything else through the synchronous
    /// one.
    fn async_methods(&self) -> MethodMask {
        MethodMask::ALL
    }
}

/// One dispatchable operation, used to classify backends via [MethodMask].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Method {
    Open,
    Close,
    Read,
    Write,
    Truncate,
    Sync,
    FileSize,
    Lock,
    Unlock,
    CheckReserved,
    FileControl,
    Access,
    Delete,
    FullPathname,
}

/// Bitmask over [Method], answering `has_async_method` per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodMask(u32);

impl MethodMask {
    pub const NONE: MethodMask = MethodMask(0);
    pub const ALL: MethodMask = MethodMask(u32::MAX);

    pub const fn with(self, method: Method) -> Self {
        MethodMask(self.0 | (1 << method as u32))
    }

    pub const fn contains(self, method: Method) -> bool {
        self.0 & (1 << method as u32) != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOptions {
    /// The object type that is being opened.
    pub kind: OpenKind,

    /// The access an object is opened with.
    pub access: OpenAccess,

    /// The file should be deleted when it is closed.
    pub delete_on_close: bool,
}

/// The object type that is being opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenKind {
    MainDb,
    MainJournal,
    TempDb,
    TempJournal,
    TransientDb,
    SubJournal,
    SuperJournal,
    Wal,
}

/// The access an object is opened with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenAccess {
    Read,

    /// Write access (includes read access).
    Write,

    /// Create the file if it does not exist (includes write and read access).
    Create,

    /// Create the file, but fail if it already exists (includes write and
    /// read access).
    CreateNew,
}

/// The engine's five-state lock level for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockLevel {
    /// No locks are held; the file may be neither read nor written and any
    /// cached data is suspect. This is the default state.
    #[default]
    None,

    /// The file may be read but not written. Any number of handles can hold
    /// shared locks at the same time.
    Shared,

    /// The holder plans to write at some point but is currently just reading.
    /// Only one reserved lock may be active at a time; shared locks can
    /// coexist with it.
    Reserved,

    /// The holder wants to write as soon as possible and is waiting for
    /// current shared locks to clear. No new shared locks are admitted.
    Pending,

    /// Needed in order to write. No other lock of any kind may coexist with
    /// an exclusive lock.
    Exclusive,
}

/// Typed view of the engine's file-control side channel (recognized opcodes
/// only; everything else stays in the facade and reports NOTFOUND).
#[derive(Debug, PartialEq)]
pub enum ControlOp<'a> {
    /// Pragma relay: `(name, value)`, e.g. `("page_size", Some("4096"))`.
    Pragma {
        name: &'a str,
        value: Option<&'a str>,
    },
    /// Sent immediately before the sync of a committing transaction.
    Sync,
    /// Sent after a commit completed but before the file is unlocked.
    CommitPhaseTwo,
    /// The entire file is about to be overwritten by the current transaction
    /// (VACUUM).
    Overwrite,
    BeginAtomicWrite,
    CommitAtomicWrite,
    RollbackAtomicWrite,
    /// Private hint that the upcoming transaction will write.
    WriteHint,
    /// Blocking lock acquisitions may wait up to this many milliseconds; a
    /// negative value queries the current setting.
    LockTimeout {
        millis: i32,
    },
    /// How large the file will grow to be during the current transaction.
    SizeHint {
        size: u64,
    },
}

/// Outcome of a [ControlOp], translated back to a result code by the facade.
#[derive(Debug, PartialEq)]
pub enum ControlReply {
    Handled,
    /// The backend does not interpret this op; the engine applies its default.
    NotHandled,
    /// Reply text for a pragma (`None` means handled silently).
    Pragma(Option<String>),
    /// Previous value for a lock-timeout update.
    LockTimeout {
        previous: i32,
    },
}

impl OpenOptions {
    pub fn from_flags(flags: i32) -> Option<Self> {
        Some(OpenOptions {
            kind: OpenKind::from_flags(flags)?,
            access: OpenAccess::from_flags(flags)?,
            delete_on_close: flags & codes::OPEN_DELETEONCLOSE > 0,
        })
    }

    pub fn to_flags(&self) -> i32 {
        self.kind.to_flags()
            | self.access.to_flags()
            | if self.delete_on_close {
                codes::OPEN_DELETEONCLOSE
            } else {
                0
            }
    }
}

impl OpenKind {
    fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            flags if flags & codes::OPEN_MAIN_DB > 0 => Some(Self::MainDb),
            flags if flags & codes::OPEN_MAIN_JOURNAL > 0 => Some(Self::MainJournal),
            flags if flags & codes::OPEN_TEMP_DB > 0 => Some(Self::TempDb),
            flags if flags & codes::OPEN_TEMP_JOURNAL > 0 => Some(Self::TempJournal),
            flags if flags & codes::OPEN_TRANSIENT_DB > 0 => Some(Self::TransientDb),
            flags if flags & codes::OPEN_SUBJOURNAL > 0 => Some(Self::SubJournal),
            flags if flags & codes::OPEN_SUPER_JOURNAL > 0 => Some(Self::SuperJournal),
            flags if flags & codes::OPEN_WAL > 0 => Some(Self::Wal),
            _ => None,
        }
    }

    fn to_flags(self) -> i32 {
        match self {
            OpenKind::MainDb => codes::OPEN_MAIN_DB,
            OpenKind::MainJournal => codes::OPEN_MAIN_JOURNAL,
            OpenKind::TempDb => codes::OPEN_TEMP_DB,
            OpenKind::TempJournal => codes::OPEN_TEMP_JOURNAL,
            OpenKind::TransientDb => codes::OPEN_TRANSIENT_DB,
            OpenKind::SubJournal => codes::OPEN_SUBJOURNAL,
            OpenKind::SuperJournal => codes::OPEN_SUPER_JOURNAL,
            OpenKind::Wal => codes::OPEN_WAL,
        }
    }

    pub fn is_main_db(self) -> bool {
        matches!(self, OpenKind::MainDb)
    }

    /// Journals and temp objects may skip durability work.
    pub fn is_relaxed(self) -> bool {
        !matches!(self, OpenKind::MainDb | OpenKind::Wal)
    }
}

impl OpenAccess {
    fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            flags
                if (flags & codes::OPEN_CREATE > 0) && (flags & codes::OPEN_EXCLUSIVE > 0) =>
            {
                Some(Self::CreateNew)
            }
            flags if flags & codes::OPEN_CREATE > 0 => Some(Self::Create),
            flags if flags & codes::OPEN_READWRITE > 0 => Some(Self::Write),
            flags if flags & codes::OPEN_READONLY > 0 => Some(Self::Read),
            _ => None,
        }
    }

    fn to_flags(self) -> i32 {
        match self {
            OpenAccess::Read => codes::OPEN_READONLY,
            OpenAccess::Write => codes::OPEN_READWRITE,
            OpenAccess::Create => codes::OPEN_READWRITE | codes::OPEN_CREATE,
            OpenAccess::CreateNew => {
                codes::OPEN_READWRITE | codes::OPEN_CREATE | codes::OPEN_EXCLUSIVE
            }
        }
    }
}

impl LockLevel {
    pub fn from_i32(level: i32) -> Option<Self> {
        Some(match level {
            codes::LOCK_NONE => Self::None,
            codes::LOCK_SHARED => Self::Shared,
            codes::LOCK_RESERVED => Self::Reserved,
            codes::LOCK_PENDING => Self::Pending,
            codes::LOCK_EXCLUSIVE => Self::Exclusive,
            _ => return None,
        })
    }

    pub fn to_i32(self) -> i32 {
        match self {
            Self::None => codes::LOCK_NONE,
            Self::Shared => codes::LOCK_SHARED,
            Self::Reserved => codes::LOCK_RESERVED,
            Self::Pending => codes::LOCK_PENDING,
            Self::Exclusive => codes::LOCK_EXCLUSIVE,
        }
    }
}

impl PartialOrd for LockLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.to_i32().partial_cmp(&other.to_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_order() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Reserved < LockLevel::Pending);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }

    #[test]
    fn test_open_options_round_trip() {
        let opts = OpenOptions::from_flags(
            codes::OPEN_MAIN_DB | codes::OPEN_READWRITE | codes::OPEN_CREATE,
        )
        .unwrap();
        assert_eq!(opts.kind, OpenKind::MainDb);
        assert_eq!(opts.access, OpenAccess::Create);
        assert!(!opts.delete_on_close);
        assert_eq!(
            opts.to_flags(),
            codes::OPEN_MAIN_DB | codes::OPEN_READWRITE | codes::OPEN_CREATE
        );

        assert!(OpenOptions::from_flags(0).is_none());
    }

    #[test]
    fn test_method_mask() {
        let mask = MethodMask::NONE.with(Method::Lock).with(Method::Sync);
        assert!(mask.contains(Method::Lock));
        assert!(mask.contains(Method::Sync));
        assert!(!mask.contains(Method::Read));
        assert!(MethodMask::ALL.contains(Method::FileControl));
    }
}
