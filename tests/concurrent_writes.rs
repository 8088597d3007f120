// tests/concurrent_writes.rs
//
// Run only this file:
//   cargo test --test concurrent_writes -- --nocapture
//
// Two images of one backup session written from several threads at disjoint offsets;
// the committed snapshot must hold exactly what each thread wrote.

use std::sync::Arc;

use anyhow::Result;

use pbs_session::{BackupParams, BackupSession, EngineCall, MemoryEngine};

const T0: u64 = 1_700_000_000;
const SNAP: &str = "vm/100/2023-11-14T22:13:20Z";
const IMAGE: u64 = 4 * 1024 * 1024;
const BLOCK: usize = 256 * 1024;

fn block_byte(image: u8, block: usize) -> u8 {
    image.wrapping_mul(31).wrapping_add(block as u8).wrapping_add(1)
}

#[test]
fn parallel_writes_on_two_images() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = Arc::new(MemoryEngine::new());
    let session = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", T0, "pw"))?;
    let a = session.register_image("disk0", IMAGE)?;
    let b = session.register_image("disk1", IMAGE)?;
    let blocks = IMAGE as usize / BLOCK;

    std::thread::scope(|s| {
        for (img_no, w) in [(0u8, &a), (1u8, &b)] {
            for worker in 0..4usize {
                s.spawn(move || {
                    for blk in (worker..blocks).step_by(4) {
                        let data = vec![block_byte(img_no, blk); BLOCK];
                        w.write_all_at(&data, (blk * BLOCK) as u64).unwrap();
                    }
                });
            }
        }
    });

    a.close()?;
    b.close()?;
    session.finish()?;

    for (img_no, name) in [(0u8, "disk0"), (1u8, "disk1")] {
        let bytes = engine.image_bytes(SNAP, name).unwrap();
        assert_eq!(bytes.len() as u64, IMAGE);
        for blk in 0..blocks {
            let chunk = &bytes[blk * BLOCK..(blk + 1) * BLOCK];
            assert!(
                chunk.iter().all(|&x| x == block_byte(img_no, blk)),
                "image {} block {} mismatch",
                name,
                blk
            );
        }
    }
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::WriteData { .. })),
        2 * blocks
    );
    Ok(())
}

#[test]
fn finish_waits_for_concurrent_writers_to_close() -> Result<()> {
    let engine = Arc::new(MemoryEngine::new());
    let session = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", T0, "pw"))?;
    let writers: Vec<_> = (0..4)
        .map(|i| session.register_image(&format!("disk{}", i), 64 * 1024))
        .collect::<pbs_session::Result<_>>()?;

    std::thread::scope(|s| {
        for w in &writers {
            s.spawn(move || {
                w.write_all_at(&[0x5A; 64 * 1024], 0).unwrap();
                w.close().unwrap();
            });
        }
    });

    assert_eq!(session.open_writers(), 0);
    session.finish()?;
    assert_eq!(engine.snapshot_names(), vec![SNAP.to_string()]);
    Ok(())
}

#[test]
fn close_during_writes_yields_already_closed() -> Result<()> {
    let engine = Arc::new(MemoryEngine::new());
    let session = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", T0, "pw"))?;
    let w = session.register_image("disk0", 64 * 1024)?;
    let started = std::sync::Barrier::new(2);

    let err = std::thread::scope(|s| {
        let writer = s.spawn(|| {
            started.wait();
            let mut off = 0u64;
            loop {
                if let Err(e) = w.write_at(&[0x11; 512], off) {
                    return e;
                }
                off = (off + 512) % (64 * 1024);
            }
        });
        started.wait();
        w.close().unwrap();
        writer.join().unwrap()
    });

    assert!(err.is_already_closed(), "unexpected error: {}", err);
    // после CloseImage движок не видит ни одной записи
    let calls = engine.calls();
    let closed_at = calls
        .iter()
        .position(|c| matches!(c, EngineCall::CloseImage { .. }))
        .unwrap();
    assert!(calls[closed_at..]
        .iter()
        .all(|c| !matches!(c, EngineCall::WriteData { .. })));
    session.finish()?;
    Ok(())
}
