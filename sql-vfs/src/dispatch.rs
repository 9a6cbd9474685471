//! The dispatch facade between the engine's raw call sites and a [Vfs]
//! backend.
//!
//! The engine addresses files through `u32` handles out of an arena, passes
//! 64-bit offsets as two 32-bit halves, and reads/writes through buffer views
//! over relocatable host memory. Each entry point here decodes those raw
//! shapes, invokes the backend, and folds every fault into a result code from
//! [crate::codes], caching the message for [Dispatcher::last_error].
//!
//! Whether a backend method may suspend is decided once, at construction,
//! from [Vfs::async_methods]: suspending methods run to completion on the
//! dispatcher's own single-threaded runtime, synchronous ones go through a
//! no-suspension trampoline.

use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::buffer::{ByteView, ScalarView};
use crate::codes;
use crate::error::Error;
use crate::state::{FileState, State};
use crate::{ControlOp, ControlReply, FileHandle, LockLevel, Method, MethodMask, OpenAccess,
            OpenKind, OpenOptions, Vfs};

const MAX_PATH_LENGTH: usize = 512;

/// Argument slot of a raw `file_control` call.
pub enum FcntlArg<'a> {
    None,
    /// An in/out 32-bit integer in engine memory.
    Int(&'a ScalarView),
    /// An in/out 64-bit integer in engine memory.
    Int64(&'a ScalarView),
    Pragma(&'a mut PragmaArgs),
    OutString(&'a mut Option<String>),
}

/// Decoded pragma triple; `reply` is written back for the engine to report.
#[derive(Debug, Default)]
pub struct PragmaArgs {
    pub name: String,
    pub value: Option<String>,
    pub reply: Option<String>,
}

pub struct Dispatcher<V: Vfs> {
    state: State<V>,
    files: HashMap<u32, FileState<V>>,
    async_methods: MethodMask,
    runtime: tokio::runtime::Runtime,
}

/// Rebuild an unsigned 64-bit value from the two little-endian halves the
/// engine delivers.
pub fn join_u64(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Reassemble a raw uri-open name: `path\0key=value\0…\0\0` becomes
/// `path?key=value&…`.
pub fn decode_uri(raw: &[u8]) -> Option<String> {
    let mut segments = raw.split(|b| *b == 0);
    let path = std::str::from_utf8(segments.next()?).ok()?;
    let mut out = String::from(path);
    let mut first = true;
    for segment in segments {
        if segment.is_empty() {
            break;
        }
        let pair = std::str::from_utf8(segment).ok()?;
        out.push(if first { '?' } else { '&' });
        out.push_str(pair);
        first = false;
    }
    Some(out)
}

/// Drive `fut` to completion according to the backend's declaration. A
/// method declared synchronous must not suspend; if it does anyway, that is a
/// backend bug which is logged and recovered by blocking.
fn run<T>(
    runtime: &tokio::runtime::Runtime,
    async_methods: MethodMask,
    method: Method,
    fut: impl Future<Output = T>,
) -> T {
    let mut fut = pin!(fut);
    if !async_methods.contains(method) {
        let mut cx = Context::from_waker(Waker::noop());
        if let Poll::Ready(value) = fut.as_mut().poll(&mut cx) {
            return value;
        }
        log::error!("{method:?} declared synchronous but suspended; blocking");
    }
    runtime.block_on(fut)
}

fn forward_control<V: Vfs>(
    runtime: &tokio::runtime::Runtime,
    async_methods: MethodMask,
    fs: &mut FileState<V>,
    control: ControlOp<'_>,
) -> Result<ControlReply, Error<V::Error>> {
    run(
        runtime,
        async_methods,
        Method::FileControl,
        fs.handle.file_control(control),
    )
}

impl<V: Vfs> Dispatcher<V> {
    pub fn new(name: impl Into<String>, vfs: V) -> std::io::Result<Self> {
        let async_methods = vfs.async_methods();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Dispatcher {
            state: State {
                name: name.into(),
                vfs: Arc::new(vfs),
                last_error: Arc::new(Mutex::new(None)),
                next_id: 0,
            },
            files: HashMap::new(),
            async_methods,
            runtime,
        })
    }

    pub fn vfs_name(&self) -> &str {
        &self.state.name
    }

    pub fn last_error(&self) -> Option<(i32, String)> {
        self.state.last_error.lock().unwrap().clone()
    }

    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    /// Open a file and register its handle under `file_id`.
    pub fn open(
        &mut self,
        raw_name: Option<&[u8]>,
        file_id: u32,
        flags: i32,
        mut out_flags: Option<&mut i32>,
    ) -> i32 {
        if self.files.contains_key(&file_id) {
            return self
                .state
                .set_last_error(codes::MISUSE, Error::<V::Error>::HandleInUse { id: file_id });
        }

        let name = match raw_name {
            None => None,
            Some(raw) => {
                let decoded = if flags & codes::OPEN_URI > 0 {
                    decode_uri(raw)
                } else {
                    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                    std::str::from_utf8(&raw[..end]).ok().map(String::from)
                };
                match decoded {
                    Some(name) => Some(name),
                    None => {
                        return self
                            .state
                            .set_last_error(codes::CANTOPEN, Error::<V::Error>::InvalidName)
                    }
                }
            }
        };
        log::trace!("open name={name:?} flags={flags}");

        let mut opts = match OpenOptions::from_flags(flags) {
            Some(opts) => opts,
            None => {
                return self
                    .state
                    .set_last_error(codes::CANTOPEN, Error::<V::Error>::InvalidOpenFlags { flags })
            }
        };
        if name.is_none() && !opts.delete_on_close {
            return self.state.set_last_error(
                codes::CANTOPEN,
                Error::<V::Error>::ExpectedArg { name: "delete_on_close" },
            );
        }

        let runtime = &self.runtime;
        let state = &mut self.state;
        let vfs = state.vfs.clone();
        let name = match name {
            Some(name) => name,
            None => run(runtime, self.async_methods, Method::Open, vfs.temporary_name()),
        };

        let result = run(runtime, self.async_methods, Method::Open, vfs.open(&name, opts.clone()));
        let result = match result {
            Ok(handle) => Ok(handle),

            // Journals in a read-only directory cannot be created at all.
            Err(Error::PermissionDenied)
                if matches!(
                    opts.kind,
                    OpenKind::SuperJournal | OpenKind::MainJournal | OpenKind::Wal
                ) && matches!(opts.access, OpenAccess::Create | OpenAccess::CreateNew)
                    && !run(runtime, self.async_methods, Method::Access, vfs.exists(&name))
                        .unwrap_or(false) =>
            {
                return state.set_last_error(
                    codes::READONLY_DIRECTORY,
                    Error::<V::Error>::PermissionDenied,
                );
            }

            // Try again as readonly.
            Err(Error::PermissionDenied) if opts.access != OpenAccess::Read => {
                opts.access = OpenAccess::Read;
                run(runtime, self.async_methods, Method::Open, vfs.open(&name, opts.clone()))
            }

            Err(err) => Err(err),
        };
        let handle = match result {
            Ok(handle) => handle,
            Err(err) => return state.set_last_error(codes::CANTOPEN, err),
        };

        if let Some(out) = out_flags.as_deref_mut() {
            *out = opts.to_flags();
        }

        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        self.files.insert(
            file_id,
            FileState {
                handle,
                db_name: name,
                delete_on_close: opts.delete_on_close,
                last_error: Arc::clone(&state.last_error),
                last_errno: 0,
                id,
                chunk_size: None,
                powersafe_overwrite: true,
                last_lock: LockLevel::None,
            },
        );

        codes::OK
    }

    /// Release the handle. The backing handle is dropped even when the
    /// delete-on-close cleanup fails.
    pub fn close(&mut self, file_id: u32) -> i32 {
        let Some(fs) = self.files.remove(&file_id) else {
            return codes::OK;
        };
        log::trace!("[{}] close ({})", fs.id, fs.db_name);

        if fs.delete_on_close {
            let vfs = self.state.vfs.clone();
            if let Err(err) = run(
                &self.runtime,
                self.async_methods,
                Method::Close,
                vfs.delete(&fs.db_name),
            ) {
                return self.state.set_last_error(codes::IOERR_DELETE, err);
            }
        }

        codes::OK
    }

    /// Fill `buf` from `offset`. Short reads zero-fill the tail.
    pub fn read(&mut self, file_id: u32, buf: &ByteView, offset_lo: u32, offset_hi: u32) -> i32 {
        let offset = join_u64(offset_lo, offset_hi);
        let runtime = &self.runtime;
        let async_methods = self.async_methods;
        let Some(fs) = self.files.get_mut(&file_id) else {
            return codes::IOERR_READ;
        };

        let mut scratch = vec![0u8; buf.len()];
        let n = match run(
            runtime,
            async_methods,
            Method::Read,
            fs.handle.read_at(&mut scratch, offset),
        ) {
            Ok(n) => n.min(scratch.len()),
            Err(Error::UnexpectedEof) => 0,
            Err(err) => return fs.set_last_error(codes::IOERR_READ, err),
        };

        scratch[n..].fill(0);
        if let Err(fault) = buf.copy_from(&scratch) {
            return fs.set_last_error(codes::IOERR_READ, fault);
        }
        if n < buf.len() {
            return codes::IOERR_SHORT_READ;
        }

        codes::OK
    }

    /// Write `buf` at `offset`.
    pub fn write(&mut self, file_id: u32, buf: &ByteView, offset_lo: u32, offset_hi: u32) -> i32 {
        let offset = join_u64(offset_lo, offset_hi);
        let runtime = &self.runtime;
        let async_methods = self.async_methods;
        let Some(fs) = self.files.get_mut(&file_id) else {
            return codes::IOERR_WRITE;
        };
        log::trace!(
            "[{}] write offset={} len={} ({})",
            fs.id,
            offset,
            buf.len(),
            fs.db_name
        );

        let data = match buf.to_vec() {
            Ok(data) => data,
            Err(fault) => return fs.set_last_error(codes::IOERR_WRITE, fault),
        };
        match run(
            runtime,
            async_methods,
            Method::Write,
            fs.handle.write_at(&data, offset),
        ) {
            Ok(()) => codes::OK,
            Err(err) => fs.set_last_error(codes::IOERR_WRITE, err),
        }
    }

    pub fn truncate(&mut self, file_id: u32, size_lo: u32, size_hi: u32) -> i32 {
        let runtime = &self.runtime;
        let async_methods = self.async_methods;
        let Some(fs) = self.files.get_mut(&file_id) else {
            return codes::IOERR_TRUNCATE;
        };

        let mut size = join_u64(size_lo, size_hi);
        if let Some(chunk_size) = fs.chunk_size {
            size = size.div_ceil(chunk_size as u64) * chunk_size as u64;
        }
        log::trace!("[{}] truncate size={} ({})", fs.id, size, fs.db_name);

        match run(
            runtime,
            async_methods,
            Method::Truncate,
            fs.handle.truncate(size),
        ) {
            Ok(()) => codes::OK,
            Err(err) => fs.set_last_error(codes::IOERR_TRUNCATE, err),
        }
    }

    pub fn sync(&mut self, file_id: u32, flags: i32) -> i32 {
        let runtime = &self.runtime;
        let async_methods = self.async_methods;
        let Some(fs) = self.files.get_mut(&file_id) else {
            return codes::IOERR_FSYNC;
        };
        log::trace!("[{}] sync ({})", fs.id, fs.db_name);

        match run(
            runtime,
            async_methods,
            Method::Sync,
            fs.handle.sync(flags & codes::SYNC_DATAONLY > 0),
        ) {
            Ok(()) => codes::OK,
            Err(err) => fs.set_last_error(codes::IOERR_FSYNC, err),
        }
    }

    pub fn file_size(&mut self, file_id: u32, out: &ScalarView) -> i32 {
        let runtime = &self.runtime;
        let async_methods = self.async_methods;
        let Some(fs) = self.files.get_mut(&file_id) else {
            return codes::IOERR_FSTAT;
        };
        log::trace!("[{}] file_size ({})", fs.id, fs.db_name);

        match run(runtime, async_methods, Method::FileSize, fs.handle.size()) {
            Ok(n) => match out.set(n as i64) {
                Ok(()) => codes::OK,
                Err(fault) => fs.set_last_error(codes::IOERR_FSTAT, fault),
            },
            Err(err) => fs.set_last_error(codes::IOERR_FSTAT, err),
        }
    }

    pub fn lock(&mut self, file_id: u32, level: i32) -> i32 {
        let runtime = &self.runtime;
        let async_methods = self.async_methods;
        let Some(fs) = self.files.get_mut(&file_id) else {
            return codes::IOERR_LOCK;
        };
        let Some(level) = LockLevel::from_i32(level) else {
            return codes::IOERR_LOCK;
        };

        match run(runtime, async_methods, Method::Lock, fs.handle.lock(level)) {
            Ok(true) => {
                fs.last_lock = level;
                log::trace!("[{}] lock={:?} ({})", fs.id, level, fs.db_name);
                codes::OK
            }
            Ok(false) => {
                log::trace!("[{}] busy (denied {:?}) ({})", fs.id, level, fs.db_name);
                codes::BUSY
            }
            Err(err) => fs.set_last_error(codes::IOERR_LOCK, err),
        }
    }

    pub fn unlock(&mut self, file_id: u32, level: i32) -> i32 {
        let runtime = &self.runtime;
        let async_methods = self.async_methods;
        let Some(fs) = self.files.get_mut(&file_id) else {
            return codes::IOERR_UNLOCK;
        };
        let Some(level) = LockLevel::from_i32(level) else {
            return codes::IOERR_UNLOCK;
        };

        match run(
            runtime,
            async_methods,
            Method::Unlock,
            fs.handle.unlock(level),
        ) {
            Ok(true) => {
                fs.last_lock = level;
                log::trace!("[{}] unlock={:?} ({})", fs.id, level, fs.db_name);
                codes::OK
            }
            Ok(false) => codes::BUSY,
            Err(err) => fs.set_last_error(codes::IOERR_UNLOCK, err),
        }
    }

    pub fn check_reserved_lock(&mut self, file_id: u32, out: &ScalarView) -> i32 {
        let runtime = &self.runtime;
        let async_methods = self.async_methods;
        let Some(fs) = self.files.get_mut(&file_id) else {
            return codes::IOERR_CHECKRESERVEDLOCK;
        };
        log::trace!("[{}] check_reserved_lock ({})", fs.id, fs.db_name);

        match run(
            runtime,
            async_methods,
            Method::CheckReserved,
            fs.handle.reserved(),
        ) {
            Ok(reserved) => match out.set(reserved as i64) {
                Ok(()) => codes::OK,
                Err(fault) => fs.set_last_error(codes::IOERR_CHECKRESERVEDLOCK, fault),
            },
            Err(err) => fs.set_last_error(codes::IOERR_CHECKRESERVEDLOCK, err),
        }
    }

    /// Raw file-control entry point: decode `(op, arg)` into a typed
    /// [ControlOp] where one is specified, handle facade-level ops locally,
    /// and report NOTFOUND for everything else so the engine falls back to
    /// its default processing.
    pub fn file_control(&mut self, file_id: u32, op: i32, arg: FcntlArg<'_>) -> i32 {
        let runtime = &self.runtime;
        let async_methods = self.async_methods;
        let vfs = self.state.vfs.clone();
        let vfs_name = self.state.name.clone();
        let Some(fs) = self.files.get_mut(&file_id) else {
            return codes::NOTFOUND;
        };
        log::trace!("[{}] file_control op={} ({})", fs.id, op, fs.db_name);

        match op {
            // Engine-side state mirrored by the facade.
            codes::FCNTL_LOCKSTATE => match arg {
                FcntlArg::Int(out) => match out.set(fs.handle.current_lock().to_i32() as i64) {
                    Ok(()) => codes::OK,
                    Err(fault) => fs.set_last_error(codes::ERROR, fault),
                },
                _ => codes::MISUSE,
            },
            codes::FCNTL_LAST_ERRNO => match arg {
                FcntlArg::Int(out) => match out.set(fs.last_errno as i64) {
                    Ok(()) => codes::OK,
                    Err(fault) => fs.set_last_error(codes::ERROR, fault),
                },
                _ => codes::MISUSE,
            },
            codes::FCNTL_CHUNK_SIZE => match arg {
                FcntlArg::Int(input) => match input.get() {
                    Ok(n) if n > 0 => {
                        fs.chunk_size = Some(n as usize);
                        codes::OK
                    }
                    Ok(_) => codes::OK,
                    Err(fault) => fs.set_last_error(codes::NOTFOUND, fault),
                },
                _ => codes::MISUSE,
            },
            codes::FCNTL_POWERSAFE_OVERWRITE => match arg {
                FcntlArg::Int(slot) => {
                    match slot.get() {
                        Ok(v) if v < 0 => {
                            // Query of the current setting.
                            if let Err(fault) = slot.set(fs.powersafe_overwrite as i64) {
                                return fs.set_last_error(codes::ERROR, fault);
                            }
                        }
                        Ok(v) => fs.powersafe_overwrite = v == 1,
                        Err(fault) => return fs.set_last_error(codes::ERROR, fault),
                    }
                    codes::OK
                }
                _ => codes::MISUSE,
            },
            codes::FCNTL_VFSNAME => match arg {
                FcntlArg::OutString(out) => {
                    *out = Some(vfs_name);
                    codes::OK
                }
                _ => codes::MISUSE,
            },
            codes::FCNTL_TEMPFILENAME => match arg {
                FcntlArg::OutString(out) => {
                    *out = Some(run(
                        runtime,
                        async_methods,
                        Method::FileControl,
                        vfs.temporary_name(),
                    ));
                    codes::OK
                }
                _ => codes::MISUSE,
            },
            codes::FCNTL_HAS_MOVED => match arg {
                FcntlArg::Int(out) => {
                    let moved = match run(
                        runtime,
                        async_methods,
                        Method::FileControl,
                        fs.handle.moved(),
                    ) {
                        Ok(moved) => moved,
                        Err(err) => return fs.set_last_error(codes::ERROR, err),
                    };
                    match out.set(moved as i64) {
                        Ok(()) => codes::OK,
                        Err(fault) => fs.set_last_error(codes::ERROR, fault),
                    }
                }
                _ => codes::MISUSE,
            },

            // Typed ops forwarded to the backend.
            codes::FCNTL_PRAGMA => match arg {
                FcntlArg::Pragma(args) => {
                    let reply = forward_control(
                        runtime,
                        async_methods,
                        fs,
                        ControlOp::Pragma {
                            name: &args.name,
                            value: args.value.as_deref(),
                        },
                    );
                    match reply {
                        Ok(ControlReply::Pragma(text)) => {
                            args.reply = text;
                            codes::OK
                        }
                        Ok(_) => codes::NOTFOUND,
                        Err(err) => {
                            args.reply = Some(err.to_string());
                            fs.set_last_error(codes::ERROR, err)
                        }
                    }
                }
                _ => codes::MISUSE,
            },
            codes::FCNTL_LOCK_TIMEOUT => match arg {
                FcntlArg::Int(slot) => {
                    let millis = match slot.get() {
                        Ok(millis) => millis as i32,
                        Err(fault) => return fs.set_last_error(codes::ERROR, fault),
                    };
                    match forward_control(runtime, async_methods, fs, ControlOp::LockTimeout { millis }) {
                        Ok(ControlReply::LockTimeout { previous }) => {
                            match slot.set(previous as i64) {
                                Ok(()) => codes::OK,
                                Err(fault) => fs.set_last_error(codes::ERROR, fault),
                            }
                        }
                        Ok(_) => codes::NOTFOUND,
                        Err(err) => fs.set_last_error(codes::ERROR, err),
                    }
                }
                _ => codes::MISUSE,
            },
            codes::FCNTL_SIZE_HINT => match arg {
                FcntlArg::Int64(input) => {
                    let size = match input.get() {
                        Ok(size) if size >= 0 => size as u64,
                        Ok(_) => return codes::OK,
                        Err(fault) => return fs.set_last_error(codes::NOTFOUND, fault),
                    };
                    match forward_control(runtime, async_methods, fs, ControlOp::SizeHint { size }) {
                        Ok(_) => codes::OK,
                        Err(err) => fs.set_last_error(codes::IOERR_TRUNCATE, err),
                    }
                }
                _ => codes::MISUSE,
            },
            codes::FCNTL_SYNC
            | codes::FCNTL_COMMIT_PHASETWO
            | codes::FCNTL_OVERWRITE
            | codes::FCNTL_BEGIN_ATOMIC_WRITE
            | codes::FCNTL_COMMIT_ATOMIC_WRITE
            | codes::FCNTL_ROLLBACK_ATOMIC_WRITE
            | codes::FCNTL_WRITE_HINT => {
                let control = match op {
                    codes::FCNTL_SYNC => ControlOp::Sync,
                    codes::FCNTL_COMMIT_PHASETWO => ControlOp::CommitPhaseTwo,
                    codes::FCNTL_OVERWRITE => ControlOp::Overwrite,
                    codes::FCNTL_BEGIN_ATOMIC_WRITE => ControlOp::BeginAtomicWrite,
                    codes::FCNTL_COMMIT_ATOMIC_WRITE => ControlOp::CommitAtomicWrite,
                    codes::FCNTL_ROLLBACK_ATOMIC_WRITE => ControlOp::RollbackAtomicWrite,
                    _ => ControlOp::WriteHint,
                };
                match forward_control(runtime, async_methods, fs, control) {
                    Ok(ControlReply::NotHandled) => codes::NOTFOUND,
                    Ok(_) => codes::OK,
                    Err(err) => fs.set_last_error(codes::IOERR, err),
                }
            }

            // No longer used, or handled by the engine before reaching a VFS.
            codes::FCNTL_SYNC_OMITTED | codes::FCNTL_PERSIST_WAL | codes::FCNTL_BUSYHANDLER => {
                codes::NOTFOUND
            }

            _ => codes::NOTFOUND,
        }
    }

    pub fn sector_size(&self, file_id: u32) -> i32 {
        self.files
            .get(&file_id)
            .map(|fs| fs.handle.sector_size() as i32)
            .unwrap_or(512)
    }

    pub fn device_characteristics(&self, file_id: u32) -> i32 {
        let Some(fs) = self.files.get(&file_id) else {
            return 0;
        };
        let mut caps = fs.handle.device_characteristics();
        if fs.powersafe_overwrite {
            caps |= codes::IOCAP_POWERSAFE_OVERWRITE;
        }
        caps as i32
    }

    /// Test for access permissions to `name`.
    pub fn access(&mut self, name: &str, flags: i32, out: &ScalarView) -> i32 {
        log::trace!("access name={name} flags={flags}");
        let vfs = self.state.vfs.clone();
        let result = match flags {
            codes::ACCESS_EXISTS => run(
                &self.runtime,
                self.async_methods,
                Method::Access,
                vfs.exists(name),
            ),
            codes::ACCESS_READ => run(
                &self.runtime,
                self.async_methods,
                Method::Access,
                vfs.access(name, false),
            ),
            codes::ACCESS_READWRITE => run(
                &self.runtime,
                self.async_methods,
                Method::Access,
                vfs.access(name, true),
            ),
            _ => return codes::IOERR_ACCESS,
        };

        match result {
            Ok(ok) => match out.set(ok as i64) {
                Ok(()) => codes::OK,
                Err(fault) => self.state.set_last_error(codes::IOERR_ACCESS, fault),
            },
            Err(err) => self.state.set_last_error(codes::IOERR_ACCESS, err),
        }
    }

    /// Delete the file `name`. `sync_dir` requests that the directory change
    /// reaches durable storage before returning.
    pub fn delete(&mut self, name: &str, _sync_dir: bool) -> i32 {
        log::trace!("delete name={name}");
        let vfs = self.state.vfs.clone();
        match run(
            &self.runtime,
            self.async_methods,
            Method::Delete,
            vfs.delete(name),
        ) {
            Ok(()) => codes::OK,
            Err(Error::NotFound { .. }) => codes::IOERR_DELETE_NOENT,
            Err(err) => self.state.set_last_error(codes::IOERR_DELETE, err),
        }
    }

    /// Write the full canonical pathname of `name`, nul-terminated, into
    /// `out`.
    pub fn full_pathname(&mut self, name: &str, out: &ByteView) -> i32 {
        log::trace!("full_pathname name={name}");
        let vfs = self.state.vfs.clone();
        let full = match run(
            &self.runtime,
            self.async_methods,
            Method::FullPathname,
            vfs.full_pathname(name),
        ) {
            Ok(full) => full,
            Err(err) => return self.state.set_last_error(codes::ERROR, err),
        };

        let bytes = full.as_bytes();
        if bytes.len() + 1 > out.len() || bytes.len() + 1 > MAX_PATH_LENGTH {
            return self
                .state
                .set_last_error(codes::CANTOPEN, Error::<V::Error>::PathTooLong);
        }
        let mut nul_terminated = Vec::with_capacity(out.len());
        nul_terminated.extend_from_slice(bytes);
        nul_terminated.resize(out.len(), 0);
        match out.copy_from(&nul_terminated) {
            Ok(()) => codes::OK,
            Err(fault) => self.state.set_last_error(codes::CANTOPEN, fault),
        }
    }

    pub fn random(&self, buf: &mut [u8]) -> i32 {
        self.state.vfs.random(buf);
        buf.len() as i32
    }

    pub fn sleep(&self, micros: i32) -> i32 {
        let slept = self
            .runtime
            .block_on(self.state.vfs.sleep(Duration::from_micros(micros.max(0) as u64)));
        slept.as_micros() as i32
    }

    /// Milliseconds since the julian epoch, as the engine counts time.
    pub fn current_time_i64(&self) -> i64 {
        const UNIX_EPOCH: i64 = 24405875 * 8640000;
        time::OffsetDateTime::now_utc().unix_timestamp() * 1000 + UNIX_EPOCH
    }

    pub fn current_time(&self) -> f64 {
        self.current_time_i64() as f64 / 86400000.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::buffer::GrowableRegion;

    #[test]
    fn test_join_u64() {
        assert_eq!(join_u64(0, 0), 0);
        assert_eq!(join_u64(0xffff_ffff, 0), 0xffff_ffff);
        assert_eq!(join_u64(0x9abc_def0, 0x1234_5678), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn test_decode_uri() {
        assert_eq!(decode_uri(b"/a/db\0\0").unwrap(), "/a/db");
        assert_eq!(
            decode_uri(b"/a/db\0immutable=1\0\0").unwrap(),
            "/a/db?immutable=1"
        );
        assert_eq!(
            decode_uri(b"/a/db\0immutable=1\0nolock=1\0\0").unwrap(),
            "/a/db?immutable=1&nolock=1"
        );
        assert!(decode_uri(&[0xff, 0xfe, 0]).is_none());
    }

    // A minimal, fully synchronous in-memory backend to exercise the facade.
    #[derive(Clone, Default)]
    struct MemVfs {
        files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    struct MemHandle {
        vfs: MemVfs,
        name: String,
    }

    impl crate::FileHandle for MemHandle {
        type Error = Infallible;

        async fn size(&mut self) -> Result<u64, Error<Infallible>> {
            Ok(self.vfs.files.lock().unwrap()[&self.name].len() as u64)
        }

        async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, Error<Infallible>> {
            let files = self.vfs.files.lock().unwrap();
            let data = &files[&self.name];
            let start = (offset as usize).min(data.len());
            let n = (data.len() - start).min(buf.len());
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(n)
        }

        async fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error<Infallible>> {
            let mut files = self.vfs.files.lock().unwrap();
            let data = files.get_mut(&self.name).unwrap();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(())
        }

        async fn truncate(&mut self, size: u64) -> Result<(), Error<Infallible>> {
            let mut files = self.vfs.files.lock().unwrap();
            files.get_mut(&self.name).unwrap().resize(size as usize, 0);
            Ok(())
        }

        async fn sync(&mut self, _data_only: bool) -> Result<(), Error<Infallible>> {
            Ok(())
        }

        async fn lock(&mut self, _level: LockLevel) -> Result<bool, Error<Infallible>> {
            Ok(true)
        }

        async fn reserved(&mut self) -> Result<bool, Error<Infallible>> {
            Ok(false)
        }

        fn current_lock(&self) -> LockLevel {
            LockLevel::None
        }
    }

    impl Vfs for MemVfs {
        type Handle = MemHandle;
        type Error = Infallible;

        async fn open(
            &self,
            db: &str,
            _opts: OpenOptions,
        ) -> Result<MemHandle, Error<Infallible>> {
            self.files
                .lock()
                .unwrap()
                .entry(db.to_string())
                .or_default();
            Ok(MemHandle {
                vfs: self.clone(),
                name: db.to_string(),
            })
        }

        async fn delete(&self, db: &str) -> Result<(), Error<Infallible>> {
            self.files.lock().unwrap().remove(db);
            Ok(())
        }

        async fn exists(&self, db: &str) -> Result<bool, Error<Infallible>> {
            Ok(self.files.lock().unwrap().contains_key(db))
        }

        async fn temporary_name(&self) -> String {
            "temp".to_string()
        }

        fn random(&self, buffer: &mut [u8]) {
            buffer.fill(4);
        }

        async fn sleep(&self, duration: Duration) -> Duration {
            duration
        }

        fn async_methods(&self) -> MethodMask {
            MethodMask::NONE
        }
    }

    #[test]
    fn facade_round_trip_and_short_read() {
        let mut dispatcher = Dispatcher::new("mem", MemVfs::default()).unwrap();
        let mut out_flags = 0;
        let rc = dispatcher.open(
            Some(b"test.db\0"),
            7,
            codes::OPEN_MAIN_DB | codes::OPEN_READWRITE | codes::OPEN_CREATE,
            Some(&mut out_flags),
        );
        assert_eq!(rc, codes::OK);
        assert_eq!(out_flags & codes::OPEN_MAIN_DB, codes::OPEN_MAIN_DB);

        let region = GrowableRegion::from_vec(vec![0xAA; 8]);
        let buf = ByteView::new(region.clone(), 0, 8);
        assert_eq!(dispatcher.write(7, &buf, 0, 0), codes::OK);

        // A 16-byte read only finds 8 bytes: short read, zero-filled tail.
        let read_region = GrowableRegion::from_vec(vec![0xFF; 16]);
        let read_buf = ByteView::new(read_region.clone(), 0, 16);
        assert_eq!(dispatcher.read(7, &read_buf, 0, 0), codes::IOERR_SHORT_READ);
        let got = read_buf.to_vec().unwrap();
        assert_eq!(&got[..8], &[0xAA; 8]);
        assert_eq!(&got[8..], &[0u8; 8]);

        let size_out = ScalarView::i64(read_region, 0);
        assert_eq!(dispatcher.file_size(7, &size_out), codes::OK);
        assert_eq!(size_out.get().unwrap(), 8);

        assert_eq!(dispatcher.close(7), codes::OK);
        assert_eq!(dispatcher.open_file_count(), 0);
    }

    #[test]
    fn duplicate_handle_is_misuse() {
        let mut dispatcher = Dispatcher::new("mem", MemVfs::default()).unwrap();
        let flags = codes::OPEN_MAIN_DB | codes::OPEN_READWRITE | codes::OPEN_CREATE;
        assert_eq!(dispatcher.open(Some(b"a.db\0"), 1, flags, None), codes::OK);
        assert_eq!(dispatcher.open(Some(b"b.db\0"), 1, flags, None), codes::MISUSE);
        let (no, msg) = dispatcher.last_error().unwrap();
        assert_eq!(no, codes::MISUSE);
        assert!(msg.contains("already in use"));
    }

    #[test]
    fn missing_without_create_cant_open() {
        let mut dispatcher = Dispatcher::new("mem", MemVfs::default()).unwrap();
        // MemVfs creates on demand, so drive the flag-validation path instead.
        assert_eq!(dispatcher.open(Some(b"x.db\0"), 1, 0, None), codes::CANTOPEN);
    }
}
