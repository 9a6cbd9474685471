//! The log-structured versioned core of the database backend.
//!
//! Pages live at permuted offsets inside one backing file. The committed
//! page → offset map and the not-yet-finalized transaction log are durable in
//! the auxiliary index; committed transactions are pushed to peers over the
//! broadcast channel and pinned against reclamation by per-peer `view@` locks.
//! A reader holding `view@k` keeps every offset of transactions ≤ k alive, so
//! snapshot reads cost nothing while writers continue.
//!
//! All mutation happens on the single task bound to the file; suspension
//! points are advisory lock acquisition, the auxiliary-index commit and the
//! peer waits of a VACUUM.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use sql_vfs::locks::{
    lock_name, view_lock_name, FileLocks, LockMode, LockPolicy, LockService, ROLE_READ,
    ROLE_WRITE,
};
use sql_vfs::LockLevel;
use tracing::{debug, trace};

use crate::error::{self, Result};
use crate::index::AuxIndex;
use crate::locks::{LockOwner, LockRegistry};
use crate::peers::{ChannelRegistry, PeerChannel, PeerMessage};
use crate::tx::{page_checksum, verify_checksum, PageLocation, Tx};

/// Commit durability, driven by the `synchronous` pragma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Finalize on the flush-interval cadence; the auxiliary index commits
    /// relaxed.
    Normal,
    /// Every commit finalizes and the auxiliary index commits durably.
    Full,
}

pub const DEFAULT_FLUSH_INTERVAL: u64 = 64;

/// An in-flight write transaction.
struct ActiveTx {
    tx: Tx,
    /// Physical size of the backing file when the transaction began; appends
    /// are handed out from here.
    phys_size: u64,
    /// VACUUM rewrite: every page goes to its identity offset.
    overwrite: bool,
}

pub struct VersionedStore {
    path: String,
    file: File,
    index: AuxIndex,
    registry: Arc<LockRegistry>,
    owner_id: u64,
    /// Keeps the advisory-lock identity alive; dropping it releases every
    /// lock this file still holds, including the view pin.
    _owner: LockOwner,
    locks: FileLocks<LockRegistry>,
    channel: PeerChannel,

    page_size: u32,
    /// Virtual size exposed to the engine.
    file_size: u64,
    phys_size: u64,
    page_map: BTreeMap<u32, u64>,
    free: BTreeSet<u64>,
    pending: VecDeque<Tx>,
    view_tx: u64,
    view_name: Option<String>,
    active: Option<ActiveTx>,

    /// Peer transactions waiting for application, keyed by tx id; a gap
    /// blocks everything behind it.
    inbox: BTreeMap<u64, Tx>,
    access_requested: bool,
    /// Writer gate held exclusively for the EXCLUSIVE level. Readers keep
    /// their shared access locks meanwhile; versioned placement, not the
    /// lock, isolates them from the writer.
    gate_held: bool,
    durability: Durability,
    flush_interval: u64,
    overwrite_armed: bool,
    /// The shared presence hold on `read` was surrendered to an overwriting
    /// peer and must be retaken on the next SHARED transition.
    read_released: bool,
    /// We hold `read` exclusively for a VACUUM of our own.
    read_upgraded: bool,
    aborted: bool,
}

pub(crate) fn read_at_most(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context(error::PageIoSnafu { offset }),
        }
    }
    Ok(filled)
}

fn decode_page_size(raw: u16) -> u32 {
    match raw {
        0 => 0,
        1 => 65536,
        n => n as u32,
    }
}

impl VersionedStore {
    /// Open (or create) the versioned database at `path` and recover its
    /// state from the auxiliary index and pending log.
    pub async fn open(
        path: &str,
        registry: Arc<LockRegistry>,
        channels: &ChannelRegistry,
        create: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .context(error::OpenBackingFileSnafu { path })?;

        let owner = registry.owner();
        let owner_id = owner.id();
        let locks = FileLocks::new(registry.clone(), owner_id, path, LockPolicy::SharedHint);
        let index = AuxIndex::for_db(path);
        let channel = channels.subscribe(path);

        let mut store = VersionedStore {
            path: path.to_string(),
            file,
            index,
            registry,
            owner_id,
            _owner: owner,
            locks,
            channel,
            page_size: 0,
            file_size: 0,
            phys_size: 0,
            page_map: BTreeMap::new(),
            free: BTreeSet::new(),
            pending: VecDeque::new(),
            view_tx: 0,
            view_name: None,
            active: None,
            inbox: BTreeMap::new(),
            access_requested: false,
            gate_held: false,
            durability: Durability::Normal,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            overwrite_armed: false,
            read_released: false,
            read_upgraded: false,
            aborted: false,
        };
        store.recover().await?;
        Ok(store)
    }

    async fn recover(&mut self) -> Result<()> {
        // The writer gate keeps two peers from initializing concurrently.
        let gate = lock_name(&self.path, ROLE_WRITE);
        self.registry
            .acquire(self.owner_id, &gate, LockMode::Exclusive, None)
            .await;

        let result = self.recover_locked().await;

        // Pin the recovered view and announce presence before readmitting
        // writers, so a racing VACUUM cannot truncate under us. Replaying the
        // pending log already pinned the final view; only a fresh or fully
        // finalized file still needs one.
        if result.is_ok() {
            if self.view_name.is_none() {
                let view = view_lock_name(&self.path, self.view_tx);
                self.registry
                    .try_acquire(self.owner_id, &view, LockMode::Shared);
                self.view_name = Some(view);
            }
            self.registry
                .acquire(
                    self.owner_id,
                    &lock_name(&self.path, ROLE_READ),
                    LockMode::Shared,
                    None,
                )
                .await;
        }
        self.registry.release(self.owner_id, &gate);
        result
    }

    async fn recover_locked(&mut self) -> Result<()> {
        let state = self.index.load()?;
        self.phys_size = self.file.metadata().context(error::FileMetaSnafu)?.len();

        // The page-size field sits at byte 16 of page 1, and offset 0 always
        // holds (a version of) page 1 unless the file is fresh.
        if self.phys_size >= 18 {
            let mut field = [0u8; 2];
            self.file
                .read_exact_at(&mut field, 16)
                .context(error::PageIoSnafu { offset: 16u64 })?;
            self.page_size = decode_page_size(u16::from_be_bytes(field));
        }

        self.page_map = state.pages.clone();
        self.file_size = self.page_map.len() as u64 * self.page_size as u64;

        // Every aligned slot not referenced by the committed map is free.
        if self.page_size > 0 {
            let ps = self.page_size as u64;
            let used: HashSet<u64> = self.page_map.values().copied().collect();
            let mut offset = 0;
            while offset + ps <= self.phys_size {
                if !used.contains(&offset) {
                    self.free.insert(offset);
                }
                offset += ps;
            }
        }

        // Replay the pending log in tx order, verifying every page. The
        // first mismatch truncates the log there: that transaction and all
        // its successors are dropped, which keeps the committed prefix dense
        // and checksum-valid.
        let mut broken_at: Option<u64> = None;
        let mut page_buf = vec![0u8; self.page_size as usize];
        for (tx_id, tx) in &state.pending {
            let mut valid = self.page_size > 0 || tx.pages.is_empty();
            if valid {
                for loc in tx.pages.values() {
                    let n = read_at_most(&self.file, &mut page_buf, loc.offset)?;
                    if n < page_buf.len() || !verify_checksum(&page_buf, loc.checksum) {
                        valid = false;
                        break;
                    }
                }
            }
            if !valid {
                debug!(tx_id, path = %self.path, "pending log truncated at checksum mismatch");
                broken_at = Some(*tx_id);
                break;
            }
            self.install_committed(tx.clone())?;
        }

        if let Some(first_bad) = broken_at {
            let mut txn = self.index.begin()?;
            for tx_id in state.pending.range(first_bad..).map(|(tx_id, _)| *tx_id) {
                txn.remove_pending(tx_id);
            }
            txn.commit(false)?;
        }

        trace!(
            path = %self.path,
            view = self.view_tx,
            pages = self.page_map.len(),
            free = self.free.len(),
            "versioned store recovered"
        );
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn view_tx(&self) -> u64 {
        self.view_tx
    }

    pub fn virtual_size(&self) -> u64 {
        self.active
            .as_ref()
            .map(|active| active.tx.file_size)
            .unwrap_or(self.file_size)
    }

    pub fn page_map(&self) -> &BTreeMap<u32, u64> {
        &self.page_map
    }

    pub fn free_offsets(&self) -> &BTreeSet<u64> {
        &self.free
    }

    pub fn pending_ids(&self) -> Vec<u64> {
        self.pending.iter().map(|tx| tx.tx_id).collect()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    pub fn set_durability(&mut self, durability: Durability) {
        self.durability = durability;
    }

    pub fn flush_interval(&self) -> u64 {
        self.flush_interval
    }

    pub fn set_flush_interval(&mut self, interval: u64) {
        self.flush_interval = interval.max(1);
    }

    pub fn current_lock(&self) -> LockLevel {
        if self.gate_held {
            LockLevel::Exclusive
        } else {
            self.locks.level()
        }
    }

    pub fn set_write_hint(&mut self, hint: bool) {
        self.locks.set_write_hint(hint);
    }

    /// Update the blocking-lock budget, returning the previous one in
    /// milliseconds. Negative input only queries.
    pub fn set_lock_timeout(&mut self, millis: i32) -> i32 {
        let previous = self
            .locks
            .timeout()
            .map(|timeout| timeout.as_millis() as i32)
            .unwrap_or(-1);
        if millis >= 0 {
            self.locks
                .set_timeout(Some(Duration::from_millis(millis as u64)));
        }
        previous
    }

    fn ensure_live(&self) -> Result<()> {
        if self.aborted {
            error::AbortedSnafu.fail()
        } else {
            Ok(())
        }
    }

    /// Read into `buf` from virtual `offset`, returning the bytes produced;
    /// the caller zero-fills the rest.
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.ensure_live()?;
        let ps = self.page_size as u64;
        let (page_index, in_page) = if ps > 0 {
            ((offset / ps + 1) as u32, offset % ps)
        } else {
            (1, offset)
        };

        // An active write transaction overlays the committed map.
        let located = self
            .active
            .as_ref()
            .and_then(|active| active.tx.pages.get(&page_index))
            .map(|loc| loc.offset)
            .or_else(|| self.page_map.get(&page_index).copied());
        let Some(base) = located else {
            return Ok(0);
        };

        let n = read_at_most(&self.file, buf, base + in_page)?;

        // Learn the page size the first time the header field passes by;
        // the raw value 1 encodes 65536.
        if self.page_size == 0 && offset <= 16 && offset + n as u64 >= 18 {
            let at = (16 - offset) as usize;
            self.page_size = decode_page_size(u16::from_be_bytes([buf[at], buf[at + 1]]));
        }

        Ok(n)
    }

    fn begin_tx(&mut self) {
        if self.active.is_none() {
            self.active = Some(ActiveTx {
                tx: Tx::new(self.view_tx + 1, self.file_size),
                phys_size: self.phys_size,
                overwrite: self.overwrite_armed,
            });
        }
    }

    /// Write one page. The first write of a fresh file fixes the page size.
    pub fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.ensure_live()?;
        if self.page_size == 0 {
            self.page_size = buf.len() as u32;
        }
        let ps = self.page_size as u64;
        debug_assert!(offset % ps == 0 && buf.len() as u64 == ps, "page-aligned writes only");
        let page_index = (offset / ps + 1) as u32;

        self.begin_tx();
        let active = self.active.as_mut().expect("transaction begun");

        let dest = if active.overwrite {
            (page_index as u64 - 1) * ps
        } else if let Some(loc) = active.tx.pages.get(&page_index) {
            // Rewrite within the same transaction lands in place.
            loc.offset
        } else if page_index == 1 && self.free.remove(&0) {
            0
        } else if let Some(off) = self.free.range(1..active.phys_size).next().copied() {
            self.free.remove(&off);
            off
        } else {
            let off = active.phys_size;
            active.phys_size += ps;
            off
        };

        self.file
            .write_all_at(buf, dest)
            .context(error::PageIoSnafu { offset: dest })?;
        active.tx.pages.insert(
            page_index,
            PageLocation {
                offset: dest,
                checksum: page_checksum(buf),
            },
        );
        active.tx.file_size = active.tx.file_size.max(page_index as u64 * ps);
        Ok(())
    }

    /// Shrink (or extend) the virtual file inside the current transaction.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_live()?;
        self.begin_tx();
        let ps = self.page_size as u64;
        let active = self.active.as_mut().expect("transaction begun");
        active.tx.file_size = size;
        if ps > 0 {
            let dropped: Vec<u32> = active
                .tx
                .pages
                .keys()
                .copied()
                .filter(|page| *page as u64 * ps > size)
                .collect();
            for page in dropped {
                if let Some(loc) = active.tx.pages.remove(&page) {
                    if !active.overwrite {
                        self.free.insert(loc.offset);
                    }
                }
            }
        }
        Ok(())
    }

    /// Page durability is governed by the auxiliary-index commit; a flush of
    /// the backing file is only forced under full durability.
    pub fn flush(&mut self, _data_only: bool) -> Result<()> {
        self.ensure_live()?;
        if self.durability == Durability::Full {
            self.file.sync_data().context(error::FlushSnafu)?;
        }
        Ok(())
    }

    fn sample_oldest_view(&self) -> u64 {
        self.registry
            .lowest_view(&self.path)
            .unwrap_or(self.view_tx)
    }

    /// Publish the active transaction: auxiliary index first, then the peer
    /// broadcast, then the local install. Triggered by the engine's `sync`
    /// side-channel opcode.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_live()?;
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let ActiveTx { mut tx, overwrite, .. } = active;
        if tx.pages.is_empty() && tx.file_size == self.file_size && !overwrite {
            return Ok(());
        }

        let finalize = self.durability == Durability::Full
            || overwrite
            || tx.tx_id % self.flush_interval == 0;
        if finalize {
            // Sampled before installation; holding view@(tx_id−1) until the
            // new view lock is taken keeps any peer from advancing past us
            // in between.
            tx.oldest_tx_in_use = Some(self.sample_oldest_view());
        }

        if let Err(err) = self.publish_index(&tx, overwrite, finalize) {
            // The index and the in-memory state may now disagree; only a
            // fresh open recovers.
            self.aborted = true;
            return Err(err);
        }

        self.channel.broadcast(PeerMessage::Commit(tx.clone()));

        debug!(
            path = %self.path,
            tx_id = tx.tx_id,
            pages = tx.pages.len(),
            finalize,
            overwrite,
            "transaction committed"
        );
        self.install_committed(tx)?;

        if overwrite {
            self.overwrite_armed = false;
            self.finish_overwrite().await?;
        }
        Ok(())
    }

    fn publish_index(&mut self, tx: &Tx, overwrite: bool, finalize: bool) -> Result<()> {
        let mut txn = self.index.begin()?;
        if finalize {
            self.file.sync_data().context(error::FlushSnafu)?;
            if overwrite {
                // The rewrite covered every page; repopulate the index
                // identity-style and truncate the backing file. Dropping all
                // pending rows is safe because the committer waits for every
                // peer to reach this transaction before readers resume.
                self.file
                    .set_len(tx.file_size)
                    .context(error::FlushSnafu)?;
                txn.clear_pages();
                txn.clear_pending();
                for (page, loc) in &tx.pages {
                    txn.put_page(*page, loc.offset);
                }
            } else {
                let oldest = tx.oldest_tx_in_use.unwrap_or(0);
                for done in self.pending.iter().filter(|done| done.tx_id <= oldest) {
                    for (page, loc) in &done.pages {
                        txn.put_page(*page, loc.offset);
                    }
                    txn.remove_pending(done.tx_id);
                }
            }
        }
        txn.insert_pending(tx.clone());
        txn.commit(self.durability == Durability::Full)
    }

    /// Install a committed transaction into the page map, collect displaced
    /// offsets for later reclamation, hop the view lock and prune the
    /// finalized prefix. Used identically for own commits, peer broadcasts
    /// and the pending log replayed at open.
    fn install_committed(&mut self, mut tx: Tx) -> Result<()> {
        for (page, loc) in &tx.pages {
            self.free.remove(&loc.offset);
            if let Some(old) = self.page_map.insert(*page, loc.offset) {
                if old != loc.offset {
                    tx.reclaimable.push(old);
                }
            }
        }
        self.file_size = tx.file_size;
        self.phys_size = self.file.metadata().context(error::FileMetaSnafu)?.len();
        if self.page_size > 0 {
            let ps = self.page_size as u64;
            let phys = self.phys_size;
            self.free.retain(|off| off + ps <= phys);
        }

        let tx_id = tx.tx_id;
        let oldest = tx.oldest_tx_in_use;
        self.pending.push_back(tx);

        // Take the new view pin before dropping the old one, so the lower
        // bound over all held view locks never has a hole.
        let view = view_lock_name(&self.path, tx_id);
        self.registry
            .try_acquire(self.owner_id, &view, LockMode::Shared);
        if let Some(old) = self.view_name.take() {
            self.registry.release(self.owner_id, &old);
        }
        self.view_name = Some(view);
        self.view_tx = tx_id;

        // Transactions at or below the committed oldest-in-use are finalized:
        // their displaced offsets become reusable.
        if let Some(oldest) = oldest {
            let ps = self.page_size as u64;
            let used: HashSet<u64> = self.page_map.values().copied().collect();
            while self
                .pending
                .front()
                .map_or(false, |front| front.tx_id <= oldest)
            {
                let done = self.pending.pop_front().expect("checked front");
                for off in done.reclaimable {
                    if !used.contains(&off) && (ps == 0 || off + ps <= self.phys_size) {
                        self.free.insert(off);
                    }
                }
            }
        }
        Ok(())
    }

    /// Abandon the active transaction, returning its freshly chosen offsets
    /// to the free set.
    pub fn rollback(&mut self) {
        if let Some(active) = self.active.take() {
            if let Ok(meta) = self.file.metadata() {
                // Appended pages grew the file; their slots are reusable.
                self.phys_size = meta.len();
            }
            if !active.overwrite {
                let ps = self.page_size as u64;
                for loc in active.tx.pages.values() {
                    if loc.offset + ps <= self.phys_size {
                        self.free.insert(loc.offset);
                    }
                }
            }
        }
        self.overwrite_armed = false;
        if self.read_upgraded {
            self.downgrade_read();
        }
    }

    /// VACUUM entry: take the read lock exclusively (asking peers to let go),
    /// evacuate all live pages above the post-VACUUM size, publish that as an
    /// intermediate transaction, and arm identity mapping for the rewrite
    /// that follows.
    pub async fn begin_overwrite(&mut self) -> Result<()> {
        self.ensure_live()?;
        let read = lock_name(&self.path, ROLE_READ);
        if !self
            .registry
            .try_acquire(self.owner_id, &read, LockMode::Exclusive)
        {
            self.channel
                .broadcast(PeerMessage::AccessRequest { exclusive: true });
            self.registry
                .acquire(self.owner_id, &read, LockMode::Exclusive, None)
                .await;
        }
        self.read_upgraded = true;

        self.evacuate()?;
        if self.active.is_some() {
            self.commit().await?;
        }
        self.overwrite_armed = true;
        Ok(())
    }

    fn evacuate(&mut self) -> Result<()> {
        let ps = self.page_size as u64;
        if ps == 0 {
            return Ok(());
        }
        debug_assert!(self.active.is_none(), "overwrite announced mid-transaction");

        let moves: Vec<(u32, u64)> = self
            .page_map
            .iter()
            .filter(|(_, off)| **off < self.file_size)
            .map(|(page, off)| (*page, *off))
            .collect();
        if moves.is_empty() {
            return Ok(());
        }

        let mut evac = Tx::new(self.view_tx + 1, self.file_size);
        let mut phys = self.phys_size.max(self.file_size);
        let mut page_buf = vec![0u8; ps as usize];
        for (page, src) in moves {
            let n = read_at_most(&self.file, &mut page_buf, src)?;
            page_buf[n..].fill(0);
            // Anything at or above the virtual size survives the truncation
            // that ends the VACUUM.
            let dest = match self.free.range(self.file_size..).next().copied() {
                Some(off) => {
                    self.free.remove(&off);
                    off
                }
                None => {
                    let off = phys;
                    phys += ps;
                    off
                }
            };
            self.file
                .write_all_at(&page_buf, dest)
                .context(error::PageIoSnafu { offset: dest })?;
            evac.pages.insert(
                page,
                PageLocation {
                    offset: dest,
                    checksum: page_checksum(&page_buf),
                },
            );
        }
        self.file.sync_data().context(error::FlushSnafu)?;
        self.active = Some(ActiveTx {
            tx: evac,
            phys_size: phys,
            overwrite: false,
        });
        Ok(())
    }

    async fn finish_overwrite(&mut self) -> Result<()> {
        // Readers must not resume until every peer observed the rewrite;
        // their view locks are the progress signal.
        loop {
            match self.registry.lowest_view(&self.path) {
                Some(floor) if floor < self.view_tx => {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                _ => break,
            }
        }
        self.downgrade_read();
        Ok(())
    }

    fn downgrade_read(&mut self) {
        if !self.read_upgraded {
            return;
        }
        let read = lock_name(&self.path, ROLE_READ);
        self.registry.release(self.owner_id, &read);
        // Restore the presence share, plus the protocol share if the lock
        // state machine believes it holds one.
        if self
            .registry
            .try_acquire(self.owner_id, &read, LockMode::Shared)
        {
            if self.locks.holds(ROLE_READ) {
                self.registry
                    .try_acquire(self.owner_id, &read, LockMode::Shared);
            }
        } else {
            // Another overwriter slipped in; behave as if it had asked.
            self.read_released = true;
        }
        self.read_upgraded = false;
    }

    /// Escalate the file lock, with the versioned specializations on top of
    /// the shared-policy state machine.
    pub async fn lock(&mut self, to: LockLevel) -> Result<bool> {
        self.ensure_live()?;
        self.drain_channel();
        let from = self.current_lock();
        if to == from {
            return Ok(true);
        }

        // EXCLUSIVE only excludes other writers here: the gate is taken, the
        // access lock is left alone. Peers keep reading their pinned views
        // while this transaction writes to fresh offsets.
        if to == LockLevel::Exclusive
            && matches!(from, LockLevel::Shared | LockLevel::Reserved)
        {
            let gate = lock_name(&self.path, ROLE_WRITE);
            if !self
                .registry
                .acquire(self.owner_id, &gate, LockMode::Exclusive, self.locks.timeout())
                .await
            {
                return Ok(false);
            }
            self.gate_held = true;
            return Ok(true);
        }

        if from == LockLevel::None && to == LockLevel::Shared {
            // Catch up on broadcasts before pinning a view.
            self.apply_inbox()?;
            if self.read_released {
                let read = lock_name(&self.path, ROLE_READ);
                if !self
                    .registry
                    .acquire(self.owner_id, &read, LockMode::Shared, self.locks.timeout())
                    .await
                {
                    return Ok(false);
                }
                self.read_released = false;
            }
            // A peer's VACUUM may have truncated the backing file since the
            // free set was built.
            self.phys_size = self.file.metadata().context(error::FileMetaSnafu)?.len();
            if self.page_size > 0 {
                let ps = self.page_size as u64;
                let phys = self.phys_size;
                self.free.retain(|off| off + ps <= phys);
            }
        }

        let ok = self
            .locks
            .transition(to)
            .await
            .context(error::LockProtocolSnafu)?;
        if !ok {
            return Ok(false);
        }

        if to == LockLevel::Reserved {
            // The durable pending log is authoritative: writing on a stale
            // view would fork the transaction history.
            let state = self.index.load()?;
            let stale: Vec<Tx> = state
                .pending
                .range(self.view_tx + 1..)
                .map(|(_, tx)| tx.clone())
                .collect();
            if !stale.is_empty() {
                trace!(
                    path = %self.path,
                    view = self.view_tx,
                    newest = stale.last().map(|tx| tx.tx_id),
                    "stale view at reserved; queueing missed transactions"
                );
                for tx in stale {
                    self.inbox.insert(tx.tx_id, tx);
                }
                let _ = self
                    .locks
                    .transition(LockLevel::Shared)
                    .await
                    .context(error::LockProtocolSnafu)?;
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// De-escalate. Unlocking to NONE applies whatever peer traffic buffered
    /// up meanwhile. Works on aborted files so the engine can unwind.
    pub async fn unlock(&mut self, to: LockLevel) -> Result<bool> {
        if self.gate_held && to < LockLevel::Exclusive {
            self.registry
                .release(self.owner_id, &lock_name(&self.path, ROLE_WRITE));
            self.gate_held = false;
        }
        let ok = self
            .locks
            .transition(to)
            .await
            .context(error::LockProtocolSnafu)?;
        if ok && to == LockLevel::None && !self.aborted {
            self.drain_channel();
            self.apply_inbox()?;
        }
        Ok(ok)
    }

    pub async fn check_reserved(&mut self) -> bool {
        self.locks.check_reserved().await
    }

    fn drain_channel(&mut self) {
        while let Some(message) = self.channel.try_recv() {
            match message {
                PeerMessage::Commit(tx) if tx.tx_id > self.view_tx => {
                    self.inbox.insert(tx.tx_id, tx);
                }
                PeerMessage::Commit(_) => {}
                PeerMessage::AccessRequest { exclusive: true } => {
                    self.access_requested = true;
                }
                PeerMessage::AccessRequest { .. } => {}
            }
        }
    }

    /// Apply buffered peer transactions in tx order while the file holds no
    /// lock; a missing predecessor pauses everything behind it until the gap
    /// fills (from a later broadcast or the durable log).
    fn apply_inbox(&mut self) -> Result<()> {
        if self.locks.level() != LockLevel::None {
            return Ok(());
        }
        if self.access_requested {
            self.access_requested = false;
            if !self.read_released && !self.read_upgraded {
                self.registry
                    .release(self.owner_id, &lock_name(&self.path, ROLE_READ));
                self.read_released = true;
            }
        }

        let view_tx = self.view_tx;
        self.inbox.retain(|tx_id, _| *tx_id > view_tx);
        loop {
            let next = self.view_tx + 1;
            let Some(tx) = self.inbox.remove(&next) else {
                break;
            };
            self.install_committed(tx)?;
        }
        if let Some((first, _)) = self.inbox.iter().next() {
            trace!(
                path = %self.path,
                first,
                view = self.view_tx,
                "peer transactions buffered behind a gap"
            );
        }
        Ok(())
    }
}
