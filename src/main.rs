//! Round-trip demo: drive the versioned backend through the dispatch facade
//! the way the engine would — open, write a page, publish with the sync
//! opcode, read it back.

use sql_vfs::buffer::{ByteView, GrowableRegion, ScalarView};
use sql_vfs::dispatch::FcntlArg;
use sql_vfs::{codes, Dispatcher};

use permudb::VersionedVfs;

const PAGE_SIZE: usize = 4096;
const DB_ID: u32 = 1;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt().init();

    let dir = std::env::temp_dir().join(format!("permudb-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let db_path = dir.join("demo.db");
    let db_name = format!("{}\0", db_path.display());

    let mut dispatcher = Dispatcher::new("versioned", VersionedVfs::new())?;

    let mut out_flags = 0;
    let rc = dispatcher.open(
        Some(db_name.as_bytes()),
        DB_ID,
        codes::OPEN_MAIN_DB | codes::OPEN_READWRITE | codes::OPEN_CREATE,
        Some(&mut out_flags),
    );
    assert_eq!(rc, codes::OK, "open failed: {:?}", dispatcher.last_error());

    // Page 1, with the page-size field at byte 16 the engine would write.
    let mut page = vec![0xAA_u8; PAGE_SIZE];
    page[16..18].copy_from_slice(&(PAGE_SIZE as u16).to_be_bytes());

    let region = GrowableRegion::from_vec(page.clone());
    let buf = ByteView::new(region, 0, PAGE_SIZE);

    assert_eq!(dispatcher.lock(DB_ID, codes::LOCK_SHARED), codes::OK);
    assert_eq!(dispatcher.lock(DB_ID, codes::LOCK_RESERVED), codes::OK);
    assert_eq!(dispatcher.lock(DB_ID, codes::LOCK_EXCLUSIVE), codes::OK);
    assert_eq!(dispatcher.write(DB_ID, &buf, 0, 0), codes::OK);
    assert_eq!(
        dispatcher.file_control(DB_ID, codes::FCNTL_SYNC, FcntlArg::None),
        codes::OK
    );
    assert_eq!(dispatcher.unlock(DB_ID, codes::LOCK_NONE), codes::OK);

    let read_region = GrowableRegion::with_len(PAGE_SIZE);
    let read_buf = ByteView::new(read_region.clone(), 0, PAGE_SIZE);
    assert_eq!(dispatcher.lock(DB_ID, codes::LOCK_SHARED), codes::OK);
    assert_eq!(dispatcher.read(DB_ID, &read_buf, 0, 0), codes::OK);
    assert_eq!(dispatcher.unlock(DB_ID, codes::LOCK_NONE), codes::OK);
    assert_eq!(read_buf.to_vec().unwrap(), page);

    let size_out = ScalarView::i64(read_region, 0);
    assert_eq!(dispatcher.file_size(DB_ID, &size_out), codes::OK);
    println!(
        "wrote and read back one {PAGE_SIZE}-byte page; database size {}",
        size_out.get().unwrap()
    );

    assert_eq!(dispatcher.close(DB_ID), codes::OK);
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
