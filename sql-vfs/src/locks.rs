//! The engine's five-state locking protocol mapped onto a small set of named
//! advisory locks.
//!
//! The advisory service itself stays behind the [LockService] seam; this
//! module only encodes the transition rules. Two policies exist: an
//! exclusive-only one (a single lock held for the whole NONE→…→NONE epoch)
//! and a shared-readers one, where writers funnel through a gate lock that
//! readers take shared and release immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;

use crate::LockLevel;

/// Reader access lock: held shared by readers, exclusively by a writer.
pub const ROLE_READ: &str = "read";
/// Writer gate: taken exclusively by writers, shared-and-released by readers.
pub const ROLE_WRITE: &str = "write";
pub const ROLE_RESERVED: &str = "reserved";
pub const ROLE_HINT: &str = "hint";
/// Prefix of the per-peer view locks, completed by a decimal transaction id.
pub const VIEW_PREFIX: &str = "view@";

/// Lock names are `<path>` + NUL + role, so distinct paths can never collide.
const NAME_SEP: char = '\u{0}';

pub fn lock_name(path: &str, role: &str) -> String {
    format!("{path}{NAME_SEP}{role}")
}

pub fn view_lock_name(path: &str, tx_id: u64) -> String {
    lock_name(path, &format!("{VIEW_PREFIX}{tx_id}"))
}

pub fn view_lock_prefix(path: &str) -> String {
    lock_name(path, VIEW_PREFIX)
}

/// The transaction id encoded in a view-lock name, if it is one.
pub fn parse_view_lock(name: &str) -> Option<u64> {
    let (_, role) = name.rsplit_once(NAME_SEP)?;
    role.strip_prefix(VIEW_PREFIX)?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// The advisory cooperative lock service of the execution environment.
///
/// Locks are named resources held in shared or exclusive mode by numeric
/// owners. Implementations must release everything an owner holds when the
/// owner's context is destroyed.
pub trait LockService: Send + Sync {
    /// Polling acquisition: take the lock if it is free right now.
    fn try_acquire(&self, owner: u64, name: &str, mode: LockMode) -> bool;

    /// Blocking acquisition. `timeout` of `None` waits forever; expiry
    /// returns `false`.
    async fn acquire(
        &self,
        owner: u64,
        name: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> bool;

    fn release(&self, owner: u64, name: &str);

    /// Names of all currently held locks starting with `prefix`, regardless
    /// of owner.
    fn held(&self, prefix: &str) -> Vec<String>;
}

#[derive(Debug, Snafu)]
#[snafu(display("unsupported lock transition {from:?} -> {to:?}"))]
pub struct InvalidTransition {
    pub from: LockLevel,
    pub to: LockLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// One lock, taken exclusively for the whole epoch.
    Exclusive,
    /// Shared readers with a writer gate.
    Shared,
    /// [LockPolicy::Shared] plus the `hint` lock when the engine announced a
    /// writing transaction.
    SharedHint,
}

/// Per-file lock state machine over a [LockService].
pub struct FileLocks<S> {
    service: Arc<S>,
    owner: u64,
    path: String,
    policy: LockPolicy,
    level: LockLevel,
    held: HashMap<&'static str, LockMode>,
    write_hint: bool,
    timeout: Option<Duration>,
}

impl<S: LockService> FileLocks<S> {
    pub fn new(service: Arc<S>, owner: u64, path: impl Into<String>, policy: LockPolicy) -> Self {
        FileLocks {
            service,
            owner,
            path: path.into(),
            policy,
            level: LockLevel::None,
            held: HashMap::new(),
            write_hint: false,
            // A zero budget makes blocking acquisitions degenerate to a
            // single probe, so contention surfaces as BUSY for the engine's
            // busy handler instead of stalling the call.
            timeout: Some(Duration::ZERO),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn holds(&self, role: &str) -> bool {
        self.held.contains_key(role)
    }

    pub fn set_write_hint(&mut self, hint: bool) {
        self.write_hint = hint;
    }

    /// Update the blocking-acquisition budget, returning the previous one.
    /// Polling acquisitions are unaffected.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Option<Duration> {
        std::mem::replace(&mut self.timeout, timeout)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn acquire_role(&mut self, role: &'static str, mode: LockMode) -> bool {
        if self.held.get(role) == Some(&mode) {
            return true;
        }
        let name = lock_name(&self.path, role);
        if self
            .service
            .acquire(self.owner, &name, mode, self.timeout)
            .await
        {
            self.held.insert(role, mode);
            true
        } else {
            false
        }
    }

    fn poll_role(&mut self, role: &'static str, mode: LockMode) -> bool {
        if self.held.get(role) == Some(&mode) {
            return true;
        }
        let name = lock_name(&self.path, role);
        if self.service.try_acquire(self.owner, &name, mode) {
            self.held.insert(role, mode);
            true
        } else {
            false
        }
    }

    fn release_role(&mut self, role: &str) {
        if self.held.remove(role).is_some() {
            self.service.release(self.owner, &lock_name(&self.path, role));
        }
    }

    fn release_everything(&mut self) {
        for role in [ROLE_READ, ROLE_WRITE, ROLE_RESERVED, ROLE_HINT] {
            self.release_role(role);
        }
    }

    /// Move to `level`, returning whether the transition succeeded. A denied
    /// advisory lock yields `Ok(false)` (BUSY); an edge outside the protocol
    /// is an error.
    pub async fn transition(&mut self, to: LockLevel) -> Result<bool, InvalidTransition> {
        use LockLevel::*;

        let from = self.level;
        if to == from {
            return Ok(true);
        }

        if self.policy == LockPolicy::Exclusive {
            return self.transition_exclusive(to).await;
        }

        let ok = match (from, to) {
            (None, Shared) => {
                if self.policy == LockPolicy::SharedHint && self.write_hint {
                    // A writing transaction was announced; serialize against
                    // other hinted writers up front.
                    if !self.acquire_role(ROLE_HINT, LockMode::Exclusive).await {
                        return Ok(false);
                    }
                }
                if !self.acquire_role(ROLE_WRITE, LockMode::Shared).await {
                    return Ok(false);
                }
                let ok = self.acquire_role(ROLE_READ, LockMode::Shared).await;
                self.release_role(ROLE_WRITE);
                ok
            }
            (Shared, Reserved) => {
                // Polling here prevents a deadlock against other holders of
                // the shared access lock.
                if self.policy == LockPolicy::SharedHint
                    && !self.poll_role(ROLE_HINT, LockMode::Exclusive)
                {
                    return Ok(false);
                }
                if !self.poll_role(ROLE_RESERVED, LockMode::Exclusive) {
                    return Ok(false);
                }
                self.release_role(ROLE_READ);
                true
            }
            (Shared, Exclusive) => {
                // Only taken after a hot-journal recovery.
                if !self.acquire_role(ROLE_WRITE, LockMode::Exclusive).await {
                    return Ok(false);
                }
                self.release_role(ROLE_READ);
                if self.acquire_role(ROLE_READ, LockMode::Exclusive).await {
                    true
                } else {
                    let restored = self.acquire_role(ROLE_READ, LockMode::Shared).await;
                    self.release_role(ROLE_WRITE);
                    if !restored {
                        self.level = None;
                    }
                    return Ok(false);
                }
            }
            (Reserved, Exclusive) => {
                if !self.acquire_role(ROLE_WRITE, LockMode::Exclusive).await {
                    return Ok(false);
                }
                if self.acquire_role(ROLE_READ, LockMode::Exclusive).await {
                    true
                } else {
                    self.release_role(ROLE_WRITE);
                    return Ok(false);
                }
            }
            (Exclusive, Shared) => {
                self.release_role(ROLE_READ);
                let ok = self.acquire_role(ROLE_READ, LockMode::Shared).await;
                self.release_role(ROLE_WRITE);
                self.release_role(ROLE_RESERVED);
                self.release_role(ROLE_HINT);
                ok
            }
            (Reserved, Shared) => {
                // Rare: a journal write failed with an I/O error.
                let ok = self.acquire_role(ROLE_READ, LockMode::Shared).await;
                self.release_role(ROLE_RESERVED);
                self.release_role(ROLE_HINT);
                ok
            }
            (Shared | Reserved | Exclusive, None) => {
                self.release_everything();
                self.write_hint = false;
                true
            }
            (from, to) => return Err(InvalidTransition { from, to }),
        };

        if ok {
            self.level = to;
        }
        Ok(ok)
    }

    async fn transition_exclusive(&mut self, to: LockLevel) -> Result<bool, InvalidTransition> {
        use LockLevel::*;

        match (self.level, to) {
            (None, Shared) => {
                if self.acquire_role(ROLE_READ, LockMode::Exclusive).await {
                    self.level = Shared;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            // Everything between SHARED and EXCLUSIVE is covered by the one
            // lock already held.
            (Shared | Reserved | Exclusive, Shared | Reserved | Exclusive) => {
                self.level = to;
                Ok(true)
            }
            (Shared | Reserved | Exclusive, None) => {
                self.release_everything();
                self.write_hint = false;
                self.level = None;
                Ok(true)
            }
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }

    /// Whether some handle holds the file reserved (or higher). Probes by
    /// poll-acquiring `reserved` shared: success means nobody holds it
    /// exclusively.
    pub async fn check_reserved(&mut self) -> bool {
        if self.policy == LockPolicy::Exclusive {
            return false;
        }
        if self.holds(ROLE_RESERVED) {
            return true;
        }
        let name = lock_name(&self.path, ROLE_RESERVED);
        if self.service.try_acquire(self.owner, &name, LockMode::Shared) {
            self.service.release(self.owner, &name);
            false
        } else {
            true
        }
    }

    /// Release whatever is still held, e.g. on close.
    pub fn reset(&mut self) {
        self.release_everything();
        self.write_hint = false;
        self.level = LockLevel::None;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    /// Test-only service: blocking acquisitions degrade to a single poll, so
    /// a denied lock reports BUSY instead of hanging the test.
    #[derive(Default)]
    struct TestService {
        locks: Mutex<HashMap<String, (Option<u64>, HashSet<u64>)>>,
    }

    impl LockService for TestService {
        fn try_acquire(&self, owner: u64, name: &str, mode: LockMode) -> bool {
            let mut locks = self.locks.lock().unwrap();
            let (exclusive, shared) = locks.entry(name.to_string()).or_default();
            match mode {
                LockMode::Shared => {
                    if exclusive.map_or(false, |holder| holder != owner) {
                        return false;
                    }
                    shared.insert(owner);
                    true
                }
                LockMode::Exclusive => {
                    if *exclusive == Some(owner) {
                        return true;
                    }
                    let others = shared.iter().any(|holder| *holder != owner);
                    if exclusive.is_some() || others {
                        return false;
                    }
                    shared.remove(&owner);
                    *exclusive = Some(owner);
                    true
                }
            }
        }

        async fn acquire(
            &self,
            owner: u64,
            name: &str,
            mode: LockMode,
            _timeout: Option<Duration>,
        ) -> bool {
            self.try_acquire(owner, name, mode)
        }

        fn release(&self, owner: u64, name: &str) {
            let mut locks = self.locks.lock().unwrap();
            if let Some((exclusive, shared)) = locks.get_mut(name) {
                if *exclusive == Some(owner) {
                    *exclusive = None;
                }
                shared.remove(&owner);
            }
        }

        fn held(&self, prefix: &str) -> Vec<String> {
            let locks = self.locks.lock().unwrap();
            locks
                .iter()
                .filter(|(name, (exclusive, shared))| {
                    name.starts_with(prefix) && (exclusive.is_some() || !shared.is_empty())
                })
                .map(|(name, _)| name.clone())
                .collect()
        }
    }

    fn shared_locks(service: &Arc<TestService>, owner: u64) -> FileLocks<TestService> {
        FileLocks::new(service.clone(), owner, "/db", LockPolicy::Shared)
    }

    #[tokio::test]
    async fn shared_ladder_up_and_down() {
        let service = Arc::new(TestService::default());
        let mut locks = shared_locks(&service, 1);

        assert!(locks.transition(LockLevel::Shared).await.unwrap());
        assert!(locks.holds(ROLE_READ));
        assert!(!locks.holds(ROLE_WRITE), "gate must be released again");

        assert!(locks.transition(LockLevel::Reserved).await.unwrap());
        assert!(locks.holds(ROLE_RESERVED));
        assert!(!locks.holds(ROLE_READ));

        assert!(locks.transition(LockLevel::Exclusive).await.unwrap());
        assert!(locks.holds(ROLE_WRITE));
        assert!(locks.holds(ROLE_READ));

        assert!(locks.transition(LockLevel::Shared).await.unwrap());
        assert!(locks.holds(ROLE_READ));
        assert!(!locks.holds(ROLE_WRITE));
        assert!(!locks.holds(ROLE_RESERVED));

        assert!(locks.transition(LockLevel::None).await.unwrap());
        assert!(service.held(&lock_name("/db", "")).is_empty());
    }

    #[tokio::test]
    async fn two_readers_one_reserved() {
        let service = Arc::new(TestService::default());
        let mut first = shared_locks(&service, 1);
        let mut second = shared_locks(&service, 2);

        assert!(first.transition(LockLevel::Shared).await.unwrap());
        assert!(second.transition(LockLevel::Shared).await.unwrap());

        assert!(first.transition(LockLevel::Reserved).await.unwrap());
        // Only one reserved holder at a time.
        assert!(!second.transition(LockLevel::Reserved).await.unwrap());
        assert!(second.check_reserved().await);

        // But the reserved writer cannot go exclusive while a reader holds
        // the access lock.
        assert!(!first.transition(LockLevel::Exclusive).await.unwrap());
        assert!(second.transition(LockLevel::None).await.unwrap());
        assert!(first.transition(LockLevel::Exclusive).await.unwrap());
    }

    #[tokio::test]
    async fn gate_blocks_new_readers() {
        let service = Arc::new(TestService::default());
        let mut writer = shared_locks(&service, 1);
        let mut reader = shared_locks(&service, 2);

        assert!(writer.transition(LockLevel::Shared).await.unwrap());
        assert!(writer.transition(LockLevel::Reserved).await.unwrap());
        assert!(writer.transition(LockLevel::Exclusive).await.unwrap());

        assert!(!reader.transition(LockLevel::Shared).await.unwrap());

        assert!(writer.transition(LockLevel::None).await.unwrap());
        assert!(reader.transition(LockLevel::Shared).await.unwrap());
    }

    #[tokio::test]
    async fn hint_serializes_announced_writers() {
        let service = Arc::new(TestService::default());
        let mut first = FileLocks::new(service.clone(), 1, "/db", LockPolicy::SharedHint);
        let mut second = FileLocks::new(service.clone(), 2, "/db", LockPolicy::SharedHint);

        first.set_write_hint(true);
        second.set_write_hint(true);

        assert!(first.transition(LockLevel::Shared).await.unwrap());
        assert!(first.holds(ROLE_HINT));
        assert!(!second.transition(LockLevel::Shared).await.unwrap());

        assert!(first.transition(LockLevel::None).await.unwrap());
        assert!(second.transition(LockLevel::Shared).await.unwrap());
    }

    #[tokio::test]
    async fn exclusive_policy_is_one_lock() {
        let service = Arc::new(TestService::default());
        let mut first = FileLocks::new(service.clone(), 1, "/db", LockPolicy::Exclusive);
        let mut second = FileLocks::new(service.clone(), 2, "/db", LockPolicy::Exclusive);

        assert!(first.transition(LockLevel::Shared).await.unwrap());
        assert!(!second.transition(LockLevel::Shared).await.unwrap());

        // Intermediate transitions are no-ops on the same single lock.
        assert!(first.transition(LockLevel::Reserved).await.unwrap());
        assert!(first.transition(LockLevel::Exclusive).await.unwrap());
        assert!(!first.check_reserved().await);

        assert!(first.transition(LockLevel::None).await.unwrap());
        assert!(second.transition(LockLevel::Shared).await.unwrap());
    }

    #[tokio::test]
    async fn unsupported_edges_error() {
        let service = Arc::new(TestService::default());
        let mut locks = shared_locks(&service, 1);

        assert!(locks.transition(LockLevel::Exclusive).await.is_err());
        assert!(locks.transition(LockLevel::Pending).await.is_err());

        assert!(locks.transition(LockLevel::Shared).await.unwrap());
        assert!(locks.transition(LockLevel::Pending).await.is_err());
    }

    #[test]
    fn view_lock_names() {
        let name = view_lock_name("/a/db", 17);
        assert_eq!(parse_view_lock(&name), Some(17));
        assert!(name.starts_with(&view_lock_prefix("/a/db")));
        assert_eq!(parse_view_lock(&lock_name("/a/db", ROLE_READ)), None);
    }
}
