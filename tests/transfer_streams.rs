// tests/transfer_streams.rs
//
// Run only this file:
//   cargo test --test transfer_streams -- --nocapture
//
// Whole-image streaming helpers: Read → image and image → Write.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;

use pbs_session::transfer::{download_image, upload_image, DEFAULT_BLOCK_SIZE};
use pbs_session::{BackupParams, BackupSession, EngineCall, MemoryEngine, RestoreParams, RestoreSession};

const T0: u64 = 1_700_000_000;

fn source(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn upload_then_download() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = Arc::new(MemoryEngine::new());
    let data = source(100_000);
    {
        let session = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", T0, "pw"))?;
        let w = session.register_image("disk0", data.len() as u64)?;
        assert_eq!(upload_image(&w, Cursor::new(&data), 4096)?, data.len() as u64);
        w.close()?;
        session.finish()?;
    }
    // 100_000 / 4096 → 25 blocks
    assert_eq!(engine.count_calls(|c| matches!(c, EngineCall::WriteData { .. })), 25);

    let session = RestoreSession::open(engine.clone(), &RestoreParams::new("store1", "vm", "100", T0, "pw"))?;
    let r = session.open_image("disk0")?;
    let mut out = Vec::new();
    assert_eq!(download_image(&r, &mut out, DEFAULT_BLOCK_SIZE)?, data.len() as u64);
    assert_eq!(out, data);
    Ok(())
}

#[test]
fn upload_longer_than_image_is_range_error() -> Result<()> {
    let engine = Arc::new(MemoryEngine::new());
    let session = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", T0, "pw"))?;
    let w = session.register_image("disk0", 1000)?;
    let err = upload_image(&w, Cursor::new(source(1500)), 512).unwrap_err();
    assert!(err.is_range(), "{:?}", err);
    // the first block fits, the second one is cut off locally
    assert_eq!(engine.count_calls(|c| matches!(c, EngineCall::WriteData { .. })), 1);
    Ok(())
}

#[test]
fn zero_block_size_is_invalid() -> Result<()> {
    let engine = Arc::new(MemoryEngine::new());
    let session = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", T0, "pw"))?;
    let w = session.register_image("disk0", 10)?;
    assert!(upload_image(&w, Cursor::new(source(10)), 0).unwrap_err().is_invalid_argument());
    Ok(())
}

#[test]
fn upload_survives_partial_engine_writes() -> Result<()> {
    let engine = Arc::new(MemoryEngine::new());
    engine.set_max_write(Some(1000));
    let data = source(10_000);
    {
        let session = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", T0, "pw"))?;
        let w = session.register_image("disk0", data.len() as u64)?;
        upload_image(&w, Cursor::new(&data), 4096)?;
        w.close()?;
        session.finish()?;
    }
    assert_eq!(
        engine.image_bytes("vm/100/2023-11-14T22:13:20Z", "disk0").unwrap(),
        data
    );
    Ok(())
}
