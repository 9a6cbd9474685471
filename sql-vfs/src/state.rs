use std::fmt::Display;
use std::sync::{Arc, Mutex};

use crate::{Vfs, LockLevel};

/// Registry-wide bookkeeping for one registered VFS.
pub struct State<V: Vfs> {
    pub name: String,
    pub vfs: Arc<V>,
    /// The last error; shared between the registry and its files.
    pub last_error: Arc<Mutex<Option<(i32, String)>>>,
    pub next_id: u64,
}

/// Per-open-file bookkeeping held in the dispatcher's arena.
pub struct FileState<V: Vfs> {
    pub handle: V::Handle,
    pub db_name: String,
    pub delete_on_close: bool,
    pub last_error: Arc<Mutex<Option<(i32, String)>>>,
    /// The last error number of this file (not shared with the registry).
    pub last_errno: i32,
    pub id: u64,
    pub chunk_size: Option<usize>,
    pub powersafe_overwrite: bool,
    pub last_lock: LockLevel,
}

impl<V: Vfs> State<V> {
    pub(crate) fn set_last_error(&self, no: i32, err: impl Display) -> i32 {
        *(self.last_error.lock().unwrap()) = Some((no, err.to_string()));
        no
    }
}

impl<V: Vfs> FileState<V> {
    pub(crate) fn set_last_error(&mut self, no: i32, err: impl Display) -> i32 {
        *(self.last_error.lock().unwrap()) = Some((no, err.to_string()));
        self.last_errno = no;
        no
    }
}
