//! Engine constants: result codes, open/sync/access flags, lock levels, device
//! characteristics and file-control opcodes. The numeric values are the
//! engine's canonical ones and must stay bit-exact.

pub const OK: i32 = 0;
pub const ERROR: i32 = 1;
pub const BUSY: i32 = 5;
pub const NOMEM: i32 = 7;
pub const READONLY: i32 = 8;
pub const IOERR: i32 = 10;
pub const NOTFOUND: i32 = 12;
pub const FULL: i32 = 13;
pub const CANTOPEN: i32 = 14;
pub const MISUSE: i32 = 21;
pub const NOTADB: i32 = 26;

// Extended I/O codes: IOERR | (n << 8).
pub const IOERR_READ: i32 = IOERR | (1 << 8);
pub const IOERR_SHORT_READ: i32 = IOERR | (2 << 8);
pub const IOERR_WRITE: i32 = IOERR | (3 << 8);
pub const IOERR_FSYNC: i32 = IOERR | (4 << 8);
pub const IOERR_TRUNCATE: i32 = IOERR | (6 << 8);
pub const IOERR_FSTAT: i32 = IOERR | (7 << 8);
pub const IOERR_UNLOCK: i32 = IOERR | (8 << 8);
pub const IOERR_DELETE: i32 = IOERR | (10 << 8);
pub const IOERR_ACCESS: i32 = IOERR | (13 << 8);
pub const IOERR_CHECKRESERVEDLOCK: i32 = IOERR | (14 << 8);
pub const IOERR_LOCK: i32 = IOERR | (15 << 8);
pub const IOERR_DELETE_NOENT: i32 = IOERR | (23 << 8);
pub const READONLY_DIRECTORY: i32 = READONLY | (6 << 8);

// Open flags.
pub const OPEN_READONLY: i32 = 0x0000_0001;
pub const OPEN_READWRITE: i32 = 0x0000_0002;
pub const OPEN_CREATE: i32 = 0x0000_0004;
pub const OPEN_DELETEONCLOSE: i32 = 0x0000_0008;
pub const OPEN_EXCLUSIVE: i32 = 0x0000_0010;
pub const OPEN_URI: i32 = 0x0000_0040;
pub const OPEN_MEMORY: i32 = 0x0000_0080;
pub const OPEN_MAIN_DB: i32 = 0x0000_0100;
pub const OPEN_TEMP_DB: i32 = 0x0000_0200;
pub const OPEN_TRANSIENT_DB: i32 = 0x0000_0400;
pub const OPEN_MAIN_JOURNAL: i32 = 0x0000_0800;
pub const OPEN_TEMP_JOURNAL: i32 = 0x0000_1000;
pub const OPEN_SUBJOURNAL: i32 = 0x0000_2000;
pub const OPEN_SUPER_JOURNAL: i32 = 0x0000_4000;
pub const OPEN_WAL: i32 = 0x0008_0000;

// Lock levels.
pub const LOCK_NONE: i32 = 0;
pub const LOCK_SHARED: i32 = 1;
pub const LOCK_RESERVED: i32 = 2;
pub const LOCK_PENDING: i32 = 3;
pub const LOCK_EXCLUSIVE: i32 = 4;

// Access queries.
pub const ACCESS_EXISTS: i32 = 0;
pub const ACCESS_READWRITE: i32 = 1;
pub const ACCESS_READ: i32 = 2;

// Sync flags.
pub const SYNC_NORMAL: i32 = 0x0000_0002;
pub const SYNC_FULL: i32 = 0x0000_0003;
pub const SYNC_DATAONLY: i32 = 0x0000_0010;

// Device characteristics.
pub const IOCAP_ATOMIC: u32 = 0x0000_0001;
pub const IOCAP_SAFE_APPEND: u32 = 0x0000_0200;
pub const IOCAP_SEQUENTIAL: u32 = 0x0000_0400;
pub const IOCAP_UNDELETABLE_WHEN_OPEN: u32 = 0x0000_0800;
pub const IOCAP_POWERSAFE_OVERWRITE: u32 = 0x0000_1000;
pub const IOCAP_IMMUTABLE: u32 = 0x0000_2000;
pub const IOCAP_BATCH_ATOMIC: u32 = 0x0000_4000;

// File-control opcodes.
pub const FCNTL_LOCKSTATE: i32 = 1;
pub const FCNTL_LAST_ERRNO: i32 = 4;
pub const FCNTL_SIZE_HINT: i32 = 5;
pub const FCNTL_CHUNK_SIZE: i32 = 6;
pub const FCNTL_SYNC_OMITTED: i32 = 8;
pub const FCNTL_PERSIST_WAL: i32 = 10;
pub const FCNTL_OVERWRITE: i32 = 11;
pub const FCNTL_VFSNAME: i32 = 12;
pub const FCNTL_POWERSAFE_OVERWRITE: i32 = 13;
pub const FCNTL_PRAGMA: i32 = 14;
pub const FCNTL_BUSYHANDLER: i32 = 15;
pub const FCNTL_TEMPFILENAME: i32 = 16;
pub const FCNTL_HAS_MOVED: i32 = 20;
pub const FCNTL_SYNC: i32 = 21;
pub const FCNTL_COMMIT_PHASETWO: i32 = 22;
pub const FCNTL_BEGIN_ATOMIC_WRITE: i32 = 31;
pub const FCNTL_COMMIT_ATOMIC_WRITE: i32 = 32;
pub const FCNTL_ROLLBACK_ATOMIC_WRITE: i32 = 33;
pub const FCNTL_LOCK_TIMEOUT: i32 = 34;

/// Private opcode: the engine wrapper hints that the next transaction will
/// write, arming the `hint` lock of the shared policy.
pub const FCNTL_WRITE_HINT: i32 = 9001;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_codes_carry_primary() {
        assert_eq!(IOERR_SHORT_READ, 522);
        assert_eq!(IOERR_WRITE, 778);
        assert_eq!(IOERR_SHORT_READ & 0xff, IOERR);
        assert_eq!(READONLY_DIRECTORY & 0xff, READONLY);
    }
}
