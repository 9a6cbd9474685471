//! The open-file handle of the versioned VFS.
//!
//! Main databases route into the versioned store; journals, temp files and
//! the `immutable`/`nolock` downgrades go straight to the baseline file
//! backend. The engine's side-channel opcodes land here: `sync` publishes
//! the active transaction, `overwrite` starts a VACUUM rewrite, the atomic
//! -write trio maps onto the store's transaction buffering.

use sql_vfs::codes;
use sql_vfs::error::Error as VfsError;
use sql_vfs::{ControlOp, ControlReply, FileHandle, LockLevel};

use crate::error::Error;
use crate::simple::SimpleFile;
use crate::store::{Durability, VersionedStore};

pub enum DbHandle {
    Versioned(Box<VersionedStore>),
    Plain(SimpleFile),
}

fn pragma_reply(text: impl Into<String>) -> Result<ControlReply, VfsError<Error>> {
    Ok(ControlReply::Pragma(Some(text.into())))
}

fn handle_pragma(
    store: &mut VersionedStore,
    name: &str,
    value: Option<&str>,
) -> Result<ControlReply, VfsError<Error>> {
    match name.to_ascii_lowercase().as_str() {
        "page_size" => {
            // The permuted layout cannot re-slot existing pages; only a
            // matching (or first) size may pass through to the engine.
            if let Some(requested) = value.and_then(|value| value.parse::<u32>().ok()) {
                if store.page_size() != 0 && requested != store.page_size() {
                    return Err(Error::Whatever {
                        message: format!(
                            "page_size is fixed at {} for this database",
                            store.page_size()
                        ),
                        source: None,
                    }
                    .into());
                }
            }
            Ok(ControlReply::NotHandled)
        }
        "synchronous" => {
            if let Some(value) = value {
                let full = matches!(
                    value.to_ascii_lowercase().as_str(),
                    "2" | "3" | "full" | "extra"
                );
                store.set_durability(if full {
                    Durability::Full
                } else {
                    Durability::Normal
                });
            }
            // The engine still applies its own synchronous setting.
            Ok(ControlReply::NotHandled)
        }
        "flush_interval" => match value.map(|value| value.parse::<u64>()) {
            Some(Ok(interval)) => {
                store.set_flush_interval(interval);
                pragma_reply(store.flush_interval().to_string())
            }
            Some(Err(_)) => Err(Error::Whatever {
                message: format!("not a flush interval: {}", value.unwrap_or_default()),
                source: None,
            }
            .into()),
            None => pragma_reply(store.flush_interval().to_string()),
        },
        _ => Ok(ControlReply::NotHandled),
    }
}

impl FileHandle for DbHandle {
    type Error = Error;

    async fn size(&mut self) -> Result<u64, VfsError<Error>> {
        match self {
            DbHandle::Versioned(store) => Ok(store.virtual_size()),
            DbHandle::Plain(file) => file.size().await,
        }
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, VfsError<Error>> {
        match self {
            DbHandle::Versioned(store) => Ok(store.read(buf, offset)?),
            DbHandle::Plain(file) => file.read_at(buf, offset).await,
        }
    }

    async fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), VfsError<Error>> {
        match self {
            DbHandle::Versioned(store) => Ok(store.write(buf, offset)?),
            DbHandle::Plain(file) => file.write_at(buf, offset).await,
        }
    }

    async fn truncate(&mut self, size: u64) -> Result<(), VfsError<Error>> {
        match self {
            DbHandle::Versioned(store) => Ok(store.truncate(size)?),
            DbHandle::Plain(file) => file.truncate(size).await,
        }
    }

    async fn sync(&mut self, data_only: bool) -> Result<(), VfsError<Error>> {
        match self {
            // Page durability is driven by the auxiliary-index commit, which
            // the sync side-channel opcode already performed.
            DbHandle::Versioned(store) => Ok(store.flush(data_only)?),
            DbHandle::Plain(file) => file.sync(data_only).await,
        }
    }

    async fn lock(&mut self, level: LockLevel) -> Result<bool, VfsError<Error>> {
        match self {
            DbHandle::Versioned(store) => Ok(store.lock(level).await?),
            DbHandle::Plain(file) => file.lock(level).await,
        }
    }

    async fn unlock(&mut self, level: LockLevel) -> Result<bool, VfsError<Error>> {
        match self {
            DbHandle::Versioned(store) => Ok(store.unlock(level).await?),
            DbHandle::Plain(file) => file.unlock(level).await,
        }
    }

    async fn reserved(&mut self) -> Result<bool, VfsError<Error>> {
        match self {
            DbHandle::Versioned(store) => Ok(store.check_reserved().await),
            DbHandle::Plain(file) => file.reserved().await,
        }
    }

    fn current_lock(&self) -> LockLevel {
        match self {
            DbHandle::Versioned(store) => store.current_lock(),
            DbHandle::Plain(file) => file.current_lock(),
        }
    }

    async fn file_control(
        &mut self,
        op: ControlOp<'_>,
    ) -> Result<ControlReply, VfsError<Error>> {
        let store = match self {
            DbHandle::Versioned(store) => store,
            DbHandle::Plain(file) => return file.file_control(op).await,
        };
        match op {
            ControlOp::Pragma { name, value } => handle_pragma(store, name, value),
            ControlOp::Sync => {
                store.commit().await?;
                Ok(ControlReply::Handled)
            }
            ControlOp::CommitPhaseTwo => Ok(ControlReply::Handled),
            ControlOp::Overwrite => {
                store.begin_overwrite().await?;
                Ok(ControlReply::Handled)
            }
            // Writes already buffer in the active transaction; begin/commit
            // only acknowledge, rollback discards it.
            ControlOp::BeginAtomicWrite | ControlOp::CommitAtomicWrite => {
                Ok(ControlReply::Handled)
            }
            ControlOp::RollbackAtomicWrite => {
                store.rollback();
                Ok(ControlReply::Handled)
            }
            ControlOp::WriteHint => {
                store.set_write_hint(true);
                Ok(ControlReply::Handled)
            }
            ControlOp::LockTimeout { millis } => Ok(ControlReply::LockTimeout {
                previous: store.set_lock_timeout(millis),
            }),
            ControlOp::SizeHint { .. } => Ok(ControlReply::Handled),
        }
    }

    fn sector_size(&self) -> u32 {
        match self {
            DbHandle::Versioned(_) => 4096,
            DbHandle::Plain(file) => file.sector_size(),
        }
    }

    fn device_characteristics(&self) -> u32 {
        match self {
            // Transactions publish whole page sets atomically, and the
            // backing file cannot disappear under an open handle.
            DbHandle::Versioned(_) => {
                codes::IOCAP_BATCH_ATOMIC | codes::IOCAP_UNDELETABLE_WHEN_OPEN
            }
            DbHandle::Plain(file) => file.device_characteristics(),
        }
    }
}
