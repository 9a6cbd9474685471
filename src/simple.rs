//! Baseline backend: one local file per handle, operations mapped straight
//! onto positional I/O, exclusive-policy locking. Also carries the journals
//! and temp files opened next to a versioned main database, and the
//! `immutable`/`nolock` read-only downgrades.

use std::fs::{self, File, OpenOptions as FsOpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use snafu::ResultExt;
use sql_vfs::codes;
use sql_vfs::error::Error as VfsError;
use sql_vfs::locks::{FileLocks, LockPolicy};
use sql_vfs::{ControlOp, ControlReply, FileHandle, LockLevel, MethodMask, OpenAccess,
              OpenOptions, Vfs};

use crate::error::{self, Error, Result};
use crate::locks::{LockOwner, LockRegistry};
use crate::store::read_at_most;

pub struct SimpleFile {
    file: File,
    locks: Option<FileLocks<LockRegistry>>,
    /// Releases any still-held advisory lock when the handle closes.
    _owner: Option<LockOwner>,
    readonly: bool,
    /// Journals and temp files may skip durability work.
    relaxed: bool,
    immutable: bool,
}

impl SimpleFile {
    pub(crate) fn open(
        path: &str,
        opts: &OpenOptions,
        immutable: bool,
        nolock: bool,
        registry: &Arc<LockRegistry>,
    ) -> Result<Self> {
        let readonly = immutable || opts.access == OpenAccess::Read;
        let mut fs_opts = FsOpenOptions::new();
        fs_opts.read(true);
        if !readonly {
            fs_opts.write(true);
        }
        match opts.access {
            OpenAccess::Create => {
                fs_opts.create(true);
            }
            OpenAccess::CreateNew => {
                fs_opts.create_new(true);
            }
            OpenAccess::Read | OpenAccess::Write => {}
        }
        let file = fs_opts
            .open(path)
            .context(error::OpenBackingFileSnafu { path })?;

        let (locks, owner) = if nolock || immutable {
            (None, None)
        } else {
            let owner = registry.owner();
            let locks = FileLocks::new(registry.clone(), owner.id(), path, LockPolicy::Exclusive);
            (Some(locks), Some(owner))
        };

        Ok(SimpleFile {
            file,
            locks,
            _owner: owner,
            readonly,
            relaxed: opts.kind.is_relaxed(),
            immutable,
        })
    }
}

impl FileHandle for SimpleFile {
    type Error = Error;

    async fn size(&mut self) -> Result<u64, VfsError<Error>> {
        let meta = self.file.metadata().context(error::FileMetaSnafu)?;
        Ok(meta.len())
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, VfsError<Error>> {
        Ok(read_at_most(&self.file, buf, offset)?)
    }

    async fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), VfsError<Error>> {
        if self.readonly {
            return Err(Error::ReadOnly.into());
        }
        self.file
            .write_all_at(buf, offset)
            .context(error::PageIoSnafu { offset })?;
        Ok(())
    }

    async fn truncate(&mut self, size: u64) -> Result<(), VfsError<Error>> {
        if self.readonly {
            return Err(Error::ReadOnly.into());
        }
        self.file.set_len(size).context(error::FlushSnafu)?;
        Ok(())
    }

    async fn sync(&mut self, data_only: bool) -> Result<(), VfsError<Error>> {
        if self.relaxed || self.readonly {
            return Ok(());
        }
        let result = if data_only {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        };
        result.context(error::FlushSnafu)?;
        Ok(())
    }

    async fn lock(&mut self, level: LockLevel) -> Result<bool, VfsError<Error>> {
        match self.locks.as_mut() {
            Some(locks) => Ok(locks
                .transition(level)
                .await
                .context(error::LockProtocolSnafu)?),
            None => Ok(true),
        }
    }

    async fn reserved(&mut self) -> Result<bool, VfsError<Error>> {
        match self.locks.as_mut() {
            Some(locks) => Ok(locks.check_reserved().await),
            None => Ok(false),
        }
    }

    fn current_lock(&self) -> LockLevel {
        self.locks
            .as_ref()
            .map(|locks| locks.level())
            .unwrap_or_default()
    }

    async fn file_control(
        &mut self,
        op: ControlOp<'_>,
    ) -> Result<ControlReply, VfsError<Error>> {
        match op {
            ControlOp::SizeHint { size } => {
                if !self.readonly {
                    let current = self.file.metadata().context(error::FileMetaSnafu)?.len();
                    if current < size {
                        self.file.set_len(size).context(error::FlushSnafu)?;
                    }
                }
                Ok(ControlReply::Handled)
            }
            ControlOp::LockTimeout { millis } => match self.locks.as_mut() {
                Some(locks) => {
                    let previous = locks
                        .timeout()
                        .map(|timeout| timeout.as_millis() as i32)
                        .unwrap_or(-1);
                    if millis >= 0 {
                        locks.set_timeout(Some(Duration::from_millis(millis as u64)));
                    }
                    Ok(ControlReply::LockTimeout { previous })
                }
                None => Ok(ControlReply::NotHandled),
            },
            _ => Ok(ControlReply::NotHandled),
        }
    }

    fn device_characteristics(&self) -> u32 {
        if self.immutable {
            codes::IOCAP_IMMUTABLE
        } else {
            0
        }
    }
}

/// Generate a path for a transient file under the system temp directory.
pub(crate) fn transient_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    std::env::temp_dir()
        .join(format!("vfs-transient-{suffix}"))
        .to_string_lossy()
        .into_owned()
}

/// The baseline VFS: every operation maps directly onto the single file
/// handle, coordination is the exclusive lock policy.
#[derive(Clone)]
pub struct SimpleVfs {
    registry: Arc<LockRegistry>,
}

impl SimpleVfs {
    pub fn new() -> Self {
        SimpleVfs {
            registry: LockRegistry::new(),
        }
    }

    pub fn with_registry(registry: Arc<LockRegistry>) -> Self {
        SimpleVfs { registry }
    }
}

impl Default for SimpleVfs {
    fn default() -> Self {
        Self::new()
    }
}

/// Surface open failures in the terms the dispatch facade understands.
pub(crate) fn map_open_error(err: Error, name: &str) -> VfsError<Error> {
    match &err {
        Error::OpenBackingFile { source, .. }
            if source.kind() == std::io::ErrorKind::PermissionDenied =>
        {
            VfsError::PermissionDenied
        }
        Error::OpenBackingFile { source, .. }
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            VfsError::NotFound {
                name: name.to_string(),
            }
        }
        _ => err.into(),
    }
}

impl Vfs for SimpleVfs {
    type Handle = SimpleFile;
    type Error = Error;

    async fn open(&self, db: &str, opts: OpenOptions) -> Result<SimpleFile, VfsError<Error>> {
        SimpleFile::open(db, &opts, false, false, &self.registry)
            .map_err(|err| map_open_error(err, db))
    }

    async fn delete(&self, db: &str) -> Result<(), VfsError<Error>> {
        match fs::remove_file(db) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(VfsError::NotFound {
                    name: db.to_string(),
                })
            }
            Err(err) => Err(Error::Remove {
                path: db.into(),
                source: err,
            }
            .into()),
        }
    }

    async fn exists(&self, db: &str) -> Result<bool, VfsError<Error>> {
        Ok(Path::new(db).exists())
    }

    async fn temporary_name(&self) -> String {
        transient_name()
    }

    fn random(&self, buffer: &mut [u8]) {
        rand::thread_rng().fill(buffer);
    }

    async fn sleep(&self, duration: Duration) -> Duration {
        tokio::time::sleep(duration).await;
        duration
    }

    fn async_methods(&self) -> MethodMask {
        MethodMask::ALL
    }
}

#[cfg(test)]
mod tests {
    use sql_vfs::OpenKind;

    use super::*;

    fn create_opts() -> OpenOptions {
        OpenOptions {
            kind: OpenKind::MainDb,
            access: OpenAccess::Create,
            delete_on_close: false,
        }
    }

    #[tokio::test]
    async fn round_trip_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.db");
        let registry = LockRegistry::new();
        let mut file = SimpleFile::open(
            path.to_str().unwrap(),
            &create_opts(),
            false,
            false,
            &registry,
        )
        .unwrap();

        file.write_at(b"hello world", 0).await.unwrap();
        assert_eq!(file.size().await.unwrap(), 11);

        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(&mut buf, 6).await.unwrap(), 5);
        assert_eq!(&buf, b"world");

        file.truncate(5).await.unwrap();
        assert_eq!(file.size().await.unwrap(), 5);
        assert_eq!(file.read_at(&mut buf, 5).await.unwrap(), 0, "reads at EOF are empty");
    }

    #[tokio::test]
    async fn exclusive_policy_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.db");
        let registry = LockRegistry::new();
        let open = |registry: &Arc<LockRegistry>| {
            SimpleFile::open(path.to_str().unwrap(), &create_opts(), false, false, registry)
                .unwrap()
        };

        let mut first = open(&registry);
        let mut second = open(&registry);

        assert!(first.lock(LockLevel::Shared).await.unwrap());
        assert!(!second.lock(LockLevel::Shared).await.unwrap());

        assert!(first.unlock(LockLevel::None).await.unwrap());
        assert!(second.lock(LockLevel::Shared).await.unwrap());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.db");
        fs::write(&path, b"data").unwrap();

        let registry = LockRegistry::new();
        let opts = OpenOptions {
            kind: OpenKind::MainDb,
            access: OpenAccess::Read,
            delete_on_close: false,
        };
        let mut file =
            SimpleFile::open(path.to_str().unwrap(), &opts, true, true, &registry).unwrap();
        assert!(file.write_at(b"x", 0).await.is_err());
        assert_eq!(
            file.device_characteristics() & codes::IOCAP_IMMUTABLE,
            codes::IOCAP_IMMUTABLE
        );
    }
}
