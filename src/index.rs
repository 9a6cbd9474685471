//! The durable auxiliary index: a small key-value store beside the backing
//! file with two object classes per database, `pages` (page index → physical
//! offset, the committed page map) and `pending` (tx id → transaction
//! record, the not-yet-finalized log).
//!
//! Mutations batch into an [IndexTxn] and publish atomically by writing a
//! temporary snapshot and renaming it over the index file; a reader therefore
//! always observes the last committed state, never a torn one. Durable
//! commits additionally fsync before the rename, relaxed ones skip it.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::trace;

use crate::error::{self, Result};
use crate::tx::Tx;

pub const INDEX_SUFFIX: &str = "-index";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IndexState {
    /// The `pages` class.
    pub pages: BTreeMap<u32, u64>,
    /// The `pending` class, keyed (and therefore ordered) by tx id.
    pub pending: BTreeMap<u64, Tx>,
}

#[derive(Debug, Clone)]
pub struct AuxIndex {
    path: PathBuf,
}

impl AuxIndex {
    pub fn for_db(db_path: &str) -> Self {
        AuxIndex {
            path: PathBuf::from(format!("{db_path}{INDEX_SUFFIX}")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last committed state; a missing index file is an empty one.
    pub fn load(&self) -> Result<IndexState> {
        match fs::read(&self.path) {
            Ok(bytes) => bincode::deserialize(&bytes).context(error::IndexCodecSnafu),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(IndexState::default()),
            Err(err) => Err(err).context(error::IndexIoSnafu {
                path: self.path.clone(),
            }),
        }
    }

    pub fn begin(&self) -> Result<IndexTxn> {
        Ok(IndexTxn {
            index: self.clone(),
            state: self.load()?,
        })
    }

    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(error::IndexIoSnafu {
                path: self.path.clone(),
            }),
        }
    }
}

/// A batch of index mutations, applied to a private copy of the state and
/// published all-or-nothing by [IndexTxn::commit].
pub struct IndexTxn {
    index: AuxIndex,
    state: IndexState,
}

impl IndexTxn {
    pub fn state(&self) -> &IndexState {
        &self.state
    }

    pub fn put_page(&mut self, page: u32, offset: u64) {
        self.state.pages.insert(page, offset);
    }

    pub fn clear_pages(&mut self) {
        self.state.pages.clear();
    }

    pub fn insert_pending(&mut self, tx: Tx) {
        self.state.pending.insert(tx.tx_id, tx);
    }

    pub fn remove_pending(&mut self, tx_id: u64) {
        self.state.pending.remove(&tx_id);
    }

    pub fn clear_pending(&mut self) {
        self.state.pending.clear();
    }

    pub fn commit(self, durable: bool) -> Result<()> {
        let bytes = bincode::serialize(&self.state).context(error::IndexCodecSnafu)?;
        let mut tmp = self.index.path.clone().into_os_string();
        tmp.push(".new");
        let tmp = std::path::PathBuf::from(tmp);
        let io = error::IndexIoSnafu {
            path: self.index.path.clone(),
        };

        let mut file = fs::File::create(&tmp).context(io.clone())?;
        file.write_all(&bytes).context(io.clone())?;
        if durable {
            file.sync_all().context(io.clone())?;
        }
        drop(file);
        fs::rename(&tmp, &self.index.path).context(io.clone())?;
        if durable {
            // Push the rename itself out; failures here do not un-commit.
            if let Some(dir) = self.index.path.parent() {
                if let Ok(dir) = fs::File::open(dir) {
                    let _ = dir.sync_all();
                }
            }
        }
        trace!(path = %self.index.path.display(), durable, "aux index committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::tx::PageLocation;

    use super::*;

    fn index_in(dir: &tempfile::TempDir) -> AuxIndex {
        AuxIndex::for_db(dir.path().join("db").to_str().unwrap())
    }

    #[test]
    fn missing_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = index_in(&dir).load().unwrap();
        assert!(state.pages.is_empty());
        assert!(state.pending.is_empty());
    }

    #[test]
    fn committed_state_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir);

        let mut txn = index.begin().unwrap();
        txn.put_page(1, 0);
        txn.put_page(2, 4096);
        let mut tx = Tx::new(1, 8192);
        tx.pages.insert(
            2,
            PageLocation {
                offset: 4096,
                checksum: [5, 6],
            },
        );
        txn.insert_pending(tx);
        txn.commit(true).unwrap();

        // A second handle on the same path observes the committed state.
        let other = index_in(&dir);
        let state = other.load().unwrap();
        assert_eq!(state.pages.get(&2), Some(&4096));
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.pending[&1].pages[&2].checksum, [5, 6]);
    }

    #[test]
    fn later_transactions_replace_earlier_rows() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir);

        let mut txn = index.begin().unwrap();
        txn.insert_pending(Tx::new(1, 0));
        txn.insert_pending(Tx::new(2, 0));
        txn.commit(false).unwrap();

        let mut txn = index.begin().unwrap();
        txn.remove_pending(1);
        txn.put_page(7, 12288);
        txn.commit(false).unwrap();

        let state = index.load().unwrap();
        assert_eq!(
            state.pending.keys().copied().collect::<Vec<_>>(),
            vec![2]
        );
        assert_eq!(state.pages.get(&7), Some(&12288));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir);
        index.begin().unwrap().commit(false).unwrap();
        index.delete().unwrap();
        index.delete().unwrap();
        assert!(index.load().unwrap().pending.is_empty());
    }
}
