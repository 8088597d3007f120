// tests/metrics_counters.rs
//
// Run only this file:
//   cargo test --test metrics_counters -- --nocapture
//
// Counters are process-wide, so this binary holds a single test.

use std::sync::Arc;

use anyhow::Result;

use pbs_session::metrics;
use pbs_session::{BackupParams, BackupSession, MemoryEngine, RestoreParams, RestoreSession};

#[test]
fn session_activity_is_counted() -> Result<()> {
    metrics::reset();
    let engine = Arc::new(MemoryEngine::new());

    {
        let s = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", 1_700_000_000, "pw"))?;
        s.attach_config("vm.conf", b"x")?;
        let w = s.register_image("disk0", 100)?;
        w.write_all_at(&[1u8; 100], 0)?;
        assert!(w.write_at(&[1u8; 10], 95).is_err());
        w.close()?;
        s.finish()?;
    }
    {
        let s = BackupSession::open(engine.clone(), &BackupParams::new("store1", "100", 1_700_000_001, "pw"))?;
        s.abort("test")?;
    }
    {
        let s = RestoreSession::open(engine.clone(), &RestoreParams::new("store1", "vm", "100", 1_700_000_000, "pw"))?;
        let r = s.open_image("disk0")?;
        let mut buf = [0u8; 64];
        r.read_exact_at(&mut buf, 0)?;
    }

    let m = metrics::snapshot();
    assert_eq!(m.backup_sessions_opened, 2);
    assert_eq!(m.backup_sessions_finished, 1);
    assert_eq!(m.backup_sessions_aborted, 1);
    assert_eq!(m.images_registered, 1);
    assert_eq!(m.configs_attached, 1);
    assert_eq!(m.bytes_written, 100);
    assert_eq!(m.restore_sessions_opened, 1);
    assert_eq!(m.images_opened, 1);
    assert_eq!(m.bytes_read, 64);
    assert_eq!(m.local_rejections, 1);
    assert!((m.abort_ratio() - 0.5).abs() < 1e-9);

    metrics::reset();
    assert_eq!(metrics::snapshot().bytes_written, 0);
    Ok(())
}
