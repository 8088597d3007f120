// tests/restore_lifecycle.rs
//
// Run only this file:
//   cargo test --test restore_lifecycle -- --nocapture
//
// Covers:
// 1) Open order: canonical snapshot name → allocate → connect; every failing step releases.
// 2) Image lookup (NotFound), length, short reads at the end, reads past the end.
// 3) Backup → restore round trip through the same engine.

use std::sync::Arc;

use anyhow::Result;

use pbs_session::{
    BackupParams, BackupSession, EngineCall, EngineOp, MemoryEngine, RestoreParams,
    RestoreSession, RestoreState, SessionError,
};

const T0: u64 = 1_700_000_000;
const SNAP: &str = "vm/100/2023-11-14T22:13:20Z";
const DISK_SIZE: u64 = 1_048_576;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn seeded() -> Arc<MemoryEngine> {
    let engine = Arc::new(MemoryEngine::new());
    let head: Vec<u8> = (0u8..=255).collect();
    engine.insert_image(SNAP, "disk0", DISK_SIZE, &head);
    engine
}

fn params() -> RestoreParams {
    RestoreParams::new("store1", "vm", "100", T0, "secret")
}

#[test]
fn open_resolves_name_then_allocates_then_connects() -> Result<()> {
    init_log();
    let engine = seeded();
    let session = RestoreSession::open(engine.clone(), &params())?;
    assert_eq!(session.snapshot(), SNAP);
    assert_eq!(session.state(), RestoreState::Connected);

    let calls = engine.calls();
    assert_eq!(
        calls[0],
        EngineCall::SnapshotName {
            snapshot_type: "vm".into(),
            backup_id: "100".into(),
            backup_time: T0 as i64
        }
    );
    assert!(matches!(&calls[1], EngineCall::NewRestore { snapshot, .. } if snapshot == SNAP));
    assert!(matches!(calls[2], EngineCall::ConnectRestore { .. }));

    session.disconnect();
    assert_eq!(engine.live_handles(), 0);
    Ok(())
}

#[test]
fn reads_are_clamped_at_the_end_of_the_image() -> Result<()> {
    let engine = seeded();
    let session = RestoreSession::open(engine.clone(), &params())?;
    let r = session.open_image("disk0")?;
    assert_eq!(r.length()?, DISK_SIZE);

    let mut buf = vec![0xFFu8; 4096];
    assert_eq!(r.read_at(&mut buf, DISK_SIZE - 100)?, 100);
    assert!(buf[..100].iter().all(|&b| b == 0));
    assert_eq!(r.read_at(&mut buf, DISK_SIZE)?, 0);
    assert_eq!(r.read_at(&mut buf, DISK_SIZE + 1)?, 0);

    let mut head = [0u8; 8];
    assert_eq!(r.read_at(&mut head, 250)?, 8);
    assert_eq!(head, [250, 251, 252, 253, 254, 255, 0, 0]);

    // length is fetched once
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::ImageLength { .. })),
        1
    );
    // reads at/after the end never reach the engine
    assert_eq!(engine.count_calls(|c| matches!(c, EngineCall::ReadAt { .. })), 2);
    Ok(())
}

#[test]
fn read_exact_at_reports_eof() -> Result<()> {
    let engine = seeded();
    let session = RestoreSession::open(engine, &params())?;
    let r = session.open_image("disk0")?;

    let mut buf = [0u8; 16];
    r.read_exact_at(&mut buf, 0)?;
    assert_eq!(buf[15], 15);

    let err = r.read_exact_at(&mut buf, DISK_SIZE - 8).unwrap_err();
    match err {
        SessionError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("expected Io, got {:?}", other),
    }
    Ok(())
}

#[test]
fn missing_image_is_not_found() -> Result<()> {
    let engine = seeded();
    let session = RestoreSession::open(engine, &params())?;
    let err = session.open_image("disk9").err().unwrap();
    match &err {
        SessionError::NotFound { name, .. } => assert_eq!(name, "disk9"),
        other => panic!("expected NotFound, got {:?}", other),
    }
    // the session stays usable
    let r = session.open_image("disk0")?;
    assert_eq!(r.length()?, DISK_SIZE);
    Ok(())
}

#[test]
fn missing_snapshot_fails_connect_and_releases() -> Result<()> {
    let engine = seeded();
    let p = RestoreParams::new("store1", "vm", "101", T0, "secret");
    let err = RestoreSession::open(engine.clone(), &p).err().unwrap();
    assert!(err.is_connection(), "{:?}", err);
    assert_eq!(engine.live_handles(), 0);
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::DisconnectRestore { .. })),
        1
    );
    Ok(())
}

#[test]
fn snapshot_name_failure_stops_before_allocation() -> Result<()> {
    let engine = seeded();
    engine.fail_on(EngineOp::SnapshotName, "unsupported backup type");
    let err = RestoreSession::open(engine.clone(), &params()).err().unwrap();
    assert!(err.is_invalid_argument());
    assert!(err.to_string().contains("unsupported backup type"));
    assert_eq!(engine.count_calls(|c| matches!(c, EngineCall::NewRestore { .. })), 0);

    engine.clear_faults();
    let bad_type = RestoreParams::new("store1", "lxc", "100", T0, "secret");
    assert!(RestoreSession::open(engine.clone(), &bad_type).err().unwrap().is_invalid_argument());
    assert_eq!(engine.live_handles(), 0);
    Ok(())
}

#[test]
fn allocation_failure_skips_connect() -> Result<()> {
    let engine = seeded();
    engine.fail_on(EngineOp::NewRestore, "too many sessions");
    let err = RestoreSession::open(engine.clone(), &params()).err().unwrap();
    match err {
        SessionError::Connection { op, message } => {
            assert_eq!(op, "new_restore_session");
            assert_eq!(message, "too many sessions");
        }
        other => panic!("expected Connection, got {:?}", other),
    }
    assert_eq!(engine.count_calls(|c| matches!(c, EngineCall::ConnectRestore { .. })), 0);
    assert_eq!(engine.live_handles(), 0);
    Ok(())
}

#[test]
fn engine_read_failure_is_protocol_error() -> Result<()> {
    let engine = seeded();
    let session = RestoreSession::open(engine.clone(), &params())?;
    let r = session.open_image("disk0")?;
    r.length()?;
    engine.fail_on(EngineOp::ReadAt, "chunk missing");
    let mut buf = [0u8; 4];
    let err = r.read_at(&mut buf, 0).unwrap_err();
    assert!(err.is_protocol());
    assert!(err.to_string().contains("chunk missing"));
    Ok(())
}

#[test]
fn readers_can_share_a_session_across_threads() -> Result<()> {
    let engine = seeded();
    let session = RestoreSession::open(engine, &params())?;
    let r = session.open_image("disk0")?;

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let r = &r;
            s.spawn(move || {
                let mut buf = [0u8; 4];
                let n = r.read_at(&mut buf, t * 4).unwrap();
                assert_eq!(n, 4);
                assert_eq!(buf[0] as u64, t * 4);
            });
        }
    });
    Ok(())
}

#[test]
fn backup_then_restore_roundtrip() -> Result<()> {
    init_log();
    let engine = Arc::new(MemoryEngine::new());
    {
        let b = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", T0, "pw"))?;
        let w = b.register_image("disk0", 200_000)?;
        w.write_all_at(&[0x11; 1000], 0)?;
        w.write_all_at(&[0x22; 1000], 150_000)?;
        w.close()?;
        b.finish()?;
    }

    let session = RestoreSession::open(engine.clone(), &params())?;
    let r = session.open_image("disk0")?;
    let mut buf = vec![0u8; 3000];
    r.read_exact_at(&mut buf, 149_000)?;
    assert!(buf[..1000].iter().all(|&b| b == 0));
    assert!(buf[1000..2000].iter().all(|&b| b == 0x22));
    assert!(buf[2000..].iter().all(|&b| b == 0));
    Ok(())
}
