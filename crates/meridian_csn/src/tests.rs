#[cfg(test)]
mod csn_context_tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use meridian_common::config::CsnConfig;
    use meridian_common::error::CsnError;
    use meridian_common::types::{Csn, Xid, XidCsn};

    use crate::{CsnContext, CsnLog, ManualClock, MemCsnLog, MemCsnWal};

    const START: u64 = 1_000 * Csn::NSECS_PER_SEC;

    fn config(defer_secs: u64) -> CsnConfig {
        CsnConfig {
            enable_csn_snapshot: true,
            csn_snapshot_defer_time: defer_secs,
            ..CsnConfig::default()
        }
    }

    /// CSN log whose writes can be made to fail: all of them, or only the
    /// final committed CSNs.
    #[derive(Default)]
    struct FlakyLog {
        inner: MemCsnLog,
        fail_all: AtomicBool,
        fail_commits: AtomicBool,
    }

    impl CsnLog for FlakyLog {
        fn set_csn(&self, xid: Xid, subxids: &[Xid], csn: XidCsn) -> Result<(), CsnError> {
            let fail = self.fail_all.load(Ordering::SeqCst)
                || (self.fail_commits.load(Ordering::SeqCst) && csn.csn().is_some());
            if fail {
                return Err(CsnError::LogWrite {
                    xid,
                    reason: "disk full".into(),
                });
            }
            self.inner.set_csn(xid, subxids, csn)
        }

        fn get_csn(&self, xid: Xid) -> Result<XidCsn, CsnError> {
            self.inner.get_csn(xid)
        }
    }

    fn setup_flaky() -> (Arc<FlakyLog>, CsnContext) {
        let log = Arc::new(FlakyLog::default());
        let ctx = CsnContext::new(
            config(0),
            Arc::new(ManualClock::new(START)),
            log.clone(),
            Arc::new(MemCsnWal::new()),
        )
        .unwrap();
        ctx.startup();
        (log, ctx)
    }

    fn setup(defer_secs: u64) -> (Arc<ManualClock>, Arc<MemCsnLog>, CsnContext) {
        let clock = Arc::new(ManualClock::new(START));
        let log = Arc::new(MemCsnLog::new());
        let ctx = CsnContext::new(
            config(defer_secs),
            clock.clone(),
            log.clone(),
            Arc::new(MemCsnWal::new()),
        )
        .unwrap();
        ctx.startup();
        (clock, log, ctx)
    }

    // ── Local commit ──

    #[test]
    fn test_commit_publishes_csn_for_all_subxacts() {
        let (_clock, log, ctx) = setup(0);
        let be = ctx.register_backend();
        let mut xact = ctx.begin_transaction(&be).unwrap();
        let sub = ctx.begin_subtransaction(&be, &mut xact).unwrap();
        let xid = xact.xid;

        let csn = ctx.commit_transaction(&be, xact).unwrap().unwrap();
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::Committed(csn));
        assert_eq!(log.get_csn(sub).unwrap(), XidCsn::Committed(csn));
        assert!(!ctx.locks().is_held(xid));
        assert!(!ctx.locks().is_held(sub));
        assert!(ctx.proc_array().running_xids().is_empty());
    }

    #[test]
    fn test_abort_marks_aborted_and_invisible() {
        let (_clock, log, ctx) = setup(0);
        let be = ctx.register_backend();
        let reader = ctx.register_backend();
        let xact = ctx.begin_transaction(&be).unwrap();
        let xid = xact.xid;
        let snap = ctx.take_snapshot(&reader).unwrap();
        ctx.abort_transaction(&be, xact).unwrap();
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::Aborted);
        assert!(ctx.oracle().unwrap().is_invisible(xid, &snap).unwrap());
    }

    #[test]
    fn test_concurrent_commits_get_distinct_csns() {
        let ctx = Arc::new(CsnContext::in_memory(config(0)).unwrap());
        ctx.startup();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let be = ctx.register_backend();
                    let mut csns = Vec::new();
                    for _ in 0..200 {
                        let xact = ctx.begin_transaction(&be).unwrap();
                        csns.push(ctx.commit_transaction(&be, xact).unwrap().unwrap());
                    }
                    csns
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            let csns = h.join().unwrap();
            assert!(csns.windows(2).all(|w| w[0] < w[1]));
            for csn in csns {
                assert!(seen.insert(csn));
            }
        }
        assert_eq!(seen.len(), 800);
    }

    // ── Visibility ──

    #[test]
    fn test_csn_and_local_snapshot_agree() {
        let (_clock, _log, ctx) = setup(0);
        let writer = ctx.register_backend();
        let early = ctx.register_backend();
        let late = ctx.register_backend();

        let done = ctx.begin_transaction(&writer).unwrap();
        let done_xid = done.xid;
        ctx.commit_transaction(&writer, done).unwrap();

        let running = ctx.begin_transaction(&writer).unwrap();
        let running_xid = running.xid;
        let early_snap = ctx.take_snapshot(&early).unwrap();
        ctx.commit_transaction(&writer, running).unwrap();
        let late_snap = ctx.take_snapshot(&late).unwrap();

        let oracle = ctx.oracle().unwrap();
        // is_invisible cross-checks against the xid-based answer in debug
        // builds; check both explicitly as well.
        for (xid, snap, expected) in [
            (done_xid, &early_snap, false),
            (running_xid, &early_snap, true),
            (done_xid, &late_snap, false),
            (running_xid, &late_snap, false),
        ] {
            assert_eq!(oracle.is_invisible(xid, snap).unwrap(), expected);
            assert_eq!(snap.xid_in_local_snapshot(xid), expected);
        }
    }

    #[test]
    fn test_disabled_context_skips_csn_log() {
        let log = Arc::new(MemCsnLog::new());
        let ctx = CsnContext::new(
            CsnConfig::default(),
            Arc::new(ManualClock::new(START)),
            log.clone(),
            Arc::new(MemCsnWal::new()),
        )
        .unwrap();
        ctx.startup();
        let be = ctx.register_backend();
        let xact = ctx.begin_transaction(&be).unwrap();
        assert_eq!(ctx.commit_transaction(&be, xact).unwrap(), None);
        assert!(log.is_empty());
        assert!(matches!(ctx.oracle(), Err(CsnError::Disabled)));
        assert!(ctx.xmin_map().is_none());
    }

    #[test]
    fn test_horizon_marks_older_xids_frozen() {
        let (_clock, _log, ctx) = setup(0);
        let be = ctx.register_backend();
        let first = ctx.begin_transaction(&be).unwrap();
        let first_xid = first.xid;
        ctx.abort_transaction(&be, first).unwrap();

        ctx.mark_csn_horizon();
        let oracle = ctx.oracle().unwrap();
        assert_eq!(oracle.xid_csn(first_xid, Xid::FIRST_NORMAL).unwrap(), XidCsn::Frozen);
        assert_eq!(oracle.xid_csn(Xid::BOOTSTRAP, Xid::FIRST_NORMAL).unwrap(), XidCsn::Frozen);
        assert_eq!(
            oracle.xid_csn(first_xid.next(), Xid::FIRST_NORMAL).unwrap(),
            XidCsn::InProgress
        );
    }

    #[test]
    fn test_reader_waits_for_in_doubt_commit() {
        let (_clock, log, ctx) = setup(0);
        let ctx = Arc::new(ctx);
        let be = ctx.register_backend();
        let xact = ctx.begin_transaction(&be).unwrap();
        let xid = xact.xid;

        // Steps one and two of commit; the CSN is fixed but not published.
        ctx.commit_protocol().precommit(&be.slot, xid, &[]).unwrap();
        let csn = ctx
            .proc_array()
            .end_transaction(be.id, true, true)
            .unwrap()
            .unwrap();
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::InDoubt);

        let reader = {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.oracle().unwrap().xid_csn(xid, Xid(3)).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());

        ctx.commit_protocol().commit(&be.slot, xid, &[]).unwrap();
        drop(xact);
        assert_eq!(reader.join().unwrap(), XidCsn::Committed(csn));
    }

    // ── Xmin deferral and snapshot import ──

    #[test]
    fn test_import_lowers_xmin_to_recorded_value() {
        let (clock, _log, ctx) = setup(10);
        let writer = ctx.register_backend();
        let reader = ctx.register_backend();

        let old = ctx.begin_transaction(&writer).unwrap();
        let old_xid = old.xid;
        let past = ctx.take_snapshot(&reader).unwrap();
        ctx.commit_transaction(&writer, old).unwrap();
        ctx.end_read_only(&reader).unwrap();

        clock.advance(Duration::from_secs(5));
        let other = ctx.register_backend();
        let now = ctx.take_snapshot(&other).unwrap();
        assert!(now.xmin > old_xid);

        let importer = ctx.register_backend();
        let imported = ctx.import_snapshot(&importer, past.snapshot_csn).unwrap();
        assert!(imported.imported);
        assert_eq!(imported.snapshot_csn, past.snapshot_csn);
        assert_eq!(imported.xmin, old_xid);
        assert_eq!(ctx.proc_array().backend_xmin(importer.id), Some(old_xid));
        assert!(ctx.vacuum_horizon() <= old_xid);

        // The past snapshot did not see the commit that followed it.
        let oracle = ctx.oracle().unwrap();
        assert!(oracle.is_invisible(old_xid, &imported).unwrap());
    }

    #[test]
    fn test_import_beyond_window_is_too_old() {
        let (clock, _log, ctx) = setup(10);
        let be = ctx.register_backend();
        let past = ctx.take_snapshot(&be).unwrap();
        ctx.end_read_only(&be).unwrap();

        clock.advance(Duration::from_secs(100));
        ctx.take_snapshot(&be).unwrap();
        let err = ctx.import_snapshot(&be, past.snapshot_csn).unwrap_err();
        assert!(matches!(err, CsnError::SnapshotTooOld { window_secs: 10, .. }));
    }

    #[test]
    fn test_import_from_future_advances_local_clock() {
        let (_clock, _log, ctx) = setup(10);
        let be = ctx.register_backend();
        let future = Csn(START).plus_secs(60);
        let snap = ctx.import_snapshot(&be, future).unwrap();
        assert_eq!(snap.snapshot_csn, future);
        assert!(ctx.generate_csn().unwrap() > future);
    }

    #[test]
    fn test_import_rejects_out_of_range_csn() {
        let (_clock, _log, ctx) = setup(10);
        let be = ctx.register_backend();
        let before = ctx.generator().last_max_csn();
        for bad in [Csn(0), Csn(XidCsn::FIRST_NORMAL_RAW - 1), Csn(u64::MAX)] {
            let err = ctx.import_snapshot(&be, bad).unwrap_err();
            assert!(matches!(err, CsnError::InvalidCsn(c) if c == bad));
        }
        assert_eq!(ctx.generator().last_max_csn(), before);
        assert!(ctx.generate_csn().unwrap() > before);
    }

    #[test]
    fn test_import_requires_deferral_map() {
        let (_clock, _log, ctx) = setup(0);
        let be = ctx.register_backend();
        let err = ctx.import_snapshot(&be, Csn(START)).unwrap_err();
        assert!(matches!(err, CsnError::XminMapUnavailable));
    }

    #[test]
    fn test_export_then_import_on_other_node_sees_same_commits() {
        let (clock1, _l1, node1) = setup(30);
        let (clock2, _l2, node2) = setup(30);

        let w2 = node2.register_backend();
        let r1 = node1.register_backend();
        let r2 = node2.register_backend();

        let a = node2.begin_transaction(&w2).unwrap();
        let a_xid = a.xid;
        node2.commit_transaction(&w2, a).unwrap();

        clock1.advance(Duration::from_secs(1));
        let snap1 = node1.take_snapshot(&r1).unwrap();
        let csn = node1.export_snapshot(&snap1).unwrap();

        clock2.advance(Duration::from_secs(2));
        let b = node2.begin_transaction(&w2).unwrap();
        let b_xid = b.xid;
        node2.commit_transaction(&w2, b).unwrap();

        let snap2 = node2.import_snapshot(&r2, csn).unwrap();
        let oracle = node2.oracle().unwrap();
        assert!(!oracle.is_invisible(a_xid, &snap2).unwrap());
        assert!(oracle.is_invisible(b_xid, &snap2).unwrap());
    }

    // ── Prepared transactions and global CSN ──

    #[test]
    fn test_global_commit_agrees_on_max_csn() {
        let (clock1, log1, node1) = setup(0);
        let (clock2, log2, node2) = setup(0);
        clock2.set(START + 3 * Csn::NSECS_PER_SEC);

        let be1 = node1.register_backend();
        let be2 = node2.register_backend();
        let x1 = node1.begin_transaction(&be1).unwrap();
        let x2 = node2.begin_transaction(&be2).unwrap();
        let (xid1, xid2) = (x1.xid, x2.xid);
        node1.prepare_transaction(&be1, x1, "fx_1").unwrap();
        node2.prepare_transaction(&be2, x2, "fx_1").unwrap();

        let p1 = node1.csn_snapshot_prepare("fx_1").unwrap();
        let p2 = node2.csn_snapshot_prepare("fx_1").unwrap();
        assert_eq!(log1.get_csn(xid1).unwrap(), XidCsn::InDoubt);
        let agreed = p1.max(p2);
        assert_eq!(agreed, p2);

        node1.csn_snapshot_assign("fx_1", agreed).unwrap();
        node2.csn_snapshot_assign("fx_1", agreed).unwrap();
        assert_eq!(node1.commit_prepared("fx_1").unwrap(), Some(agreed));
        assert_eq!(node2.commit_prepared("fx_1").unwrap(), Some(agreed));

        assert_eq!(log1.get_csn(xid1).unwrap(), XidCsn::Committed(agreed));
        assert_eq!(log2.get_csn(xid2).unwrap(), XidCsn::Committed(agreed));
        // Node one's clock lags, but its next CSN is still above the agreed one.
        clock1.set(START);
        assert!(node1.generate_csn().unwrap() > agreed);
        assert!(node1.prepared().is_empty());
    }

    #[test]
    fn test_local_commit_publishes_assigned_global_csn() {
        let (clock, log, ctx) = setup(0);
        let be = ctx.register_backend();
        let xact = ctx.begin_transaction(&be).unwrap();
        let xid = xact.xid;

        let proposed = ctx.csn_prepare_current(&be, &xact).unwrap();
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::InDoubt);
        let agreed = proposed.plus_secs(2);
        ctx.csn_assign_current(&be, &xact, agreed).unwrap();

        assert_eq!(ctx.commit_transaction(&be, xact).unwrap(), Some(agreed));
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::Committed(agreed));
        clock.set(START);
        assert!(ctx.generate_csn().unwrap() > agreed);
    }

    #[test]
    fn test_prepared_xact_stays_running_until_resolved() {
        let (_clock, log, ctx) = setup(0);
        let be = ctx.register_backend();
        let xact = ctx.begin_transaction(&be).unwrap();
        let xid = xact.xid;
        ctx.prepare_transaction(&be, xact, "fx_keep").unwrap();

        assert_eq!(ctx.proc_array().running_xids(), vec![xid]);
        assert!(ctx.locks().is_held(xid));
        assert_eq!(ctx.prepared().gids(), vec!["fx_keep".to_string()]);

        // The backend moves on to a new transaction.
        let next = ctx.begin_transaction(&be).unwrap();
        assert!(next.xid > xid);
        ctx.abort_transaction(&be, next).unwrap();

        ctx.rollback_prepared("fx_keep").unwrap();
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::Aborted);
        assert!(!ctx.locks().is_held(xid));
        assert!(ctx.proc_array().running_xids().is_empty());
    }

    #[test]
    fn test_commit_prepared_without_global_csn_generates_one() {
        let (_clock, log, ctx) = setup(0);
        let be = ctx.register_backend();
        let xact = ctx.begin_transaction(&be).unwrap();
        let xid = xact.xid;
        ctx.prepare_transaction(&be, xact, "fx_local").unwrap();
        let csn = ctx.commit_prepared("fx_local").unwrap().unwrap();
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::Committed(csn));
    }

    #[test]
    fn test_unknown_and_duplicate_gids() {
        let (_clock, _log, ctx) = setup(0);
        assert!(matches!(
            ctx.csn_snapshot_prepare("nope"),
            Err(CsnError::UnknownPreparedXact(_))
        ));
        assert!(matches!(
            ctx.csn_snapshot_assign("nope", Csn(START)),
            Err(CsnError::UnknownPreparedXact(_))
        ));
        assert!(matches!(
            ctx.commit_prepared("nope"),
            Err(CsnError::UnknownPreparedXact(_))
        ));

        let be = ctx.register_backend();
        let x = ctx.begin_transaction(&be).unwrap();
        ctx.prepare_transaction(&be, x, "dup").unwrap();
        let y = ctx.begin_transaction(&be).unwrap();
        assert!(matches!(
            ctx.prepare_transaction(&be, y, "dup"),
            Err(CsnError::DuplicatePreparedXact(_))
        ));
    }

    #[test]
    fn test_failed_commit_prepared_keeps_gid_for_rollback() {
        let (log, ctx) = setup_flaky();
        let be = ctx.register_backend();
        let xact = ctx.begin_transaction(&be).unwrap();
        let xid = xact.xid;
        ctx.prepare_transaction(&be, xact, "fx_disk").unwrap();

        log.fail_all.store(true, Ordering::SeqCst);
        assert!(matches!(
            ctx.commit_prepared("fx_disk"),
            Err(CsnError::LogWrite { .. })
        ));
        assert!(ctx.prepared().contains("fx_disk"));
        assert_eq!(ctx.proc_array().running_xids(), vec![xid]);
        assert!(ctx.locks().is_held(xid));

        log.fail_all.store(false, Ordering::SeqCst);
        ctx.rollback_prepared("fx_disk").unwrap();
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::Aborted);
        assert!(!ctx.prepared().contains("fx_disk"));
        assert!(ctx.proc_array().running_xids().is_empty());
        assert!(!ctx.locks().is_held(xid));
    }

    #[test]
    fn test_commit_prepared_retries_after_failed_publish() {
        let (log, ctx) = setup_flaky();
        let be = ctx.register_backend();
        let xact = ctx.begin_transaction(&be).unwrap();
        let xid = xact.xid;
        ctx.prepare_transaction(&be, xact, "fx_retry").unwrap();

        // Left the running set, but the CSN never reached the log.
        log.fail_commits.store(true, Ordering::SeqCst);
        assert!(ctx.commit_prepared("fx_retry").is_err());
        assert!(ctx.prepared().contains("fx_retry"));
        assert!(ctx.proc_array().running_xids().is_empty());
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::InDoubt);
        assert!(ctx.locks().is_held(xid));

        log.fail_commits.store(false, Ordering::SeqCst);
        let csn = ctx.commit_prepared("fx_retry").unwrap().unwrap();
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::Committed(csn));
        assert!(!ctx.prepared().contains("fx_retry"));
        assert!(!ctx.locks().is_held(xid));
    }

    #[test]
    fn test_out_of_range_global_csn_leaves_prepared_xact_intact() {
        let (_clock, log, ctx) = setup(0);
        let be = ctx.register_backend();
        let xact = ctx.begin_transaction(&be).unwrap();
        let xid = xact.xid;
        ctx.prepare_transaction(&be, xact, "fx_bad").unwrap();
        let proposed = ctx.csn_snapshot_prepare("fx_bad").unwrap();

        assert!(matches!(
            ctx.csn_snapshot_assign("fx_bad", Csn(2)),
            Err(CsnError::InvalidCsn(Csn(2)))
        ));
        assert!(matches!(
            ctx.csn_snapshot_assign("fx_bad", Csn(u64::MAX)),
            Err(CsnError::InvalidCsn(_))
        ));
        assert!(ctx.prepared().contains("fx_bad"));

        // Without an agreed CSN the commit takes a fresh local one.
        let csn = ctx.commit_prepared("fx_bad").unwrap().unwrap();
        assert!(csn > proposed);
        assert_eq!(log.get_csn(xid).unwrap(), XidCsn::Committed(csn));

        let reader = ctx.register_backend();
        let snap = ctx.take_snapshot(&reader).unwrap();
        assert!(!ctx.oracle().unwrap().is_invisible(xid, &snap).unwrap());
    }

    // ── Recovery ──

    #[test]
    fn test_restore_after_recovery_resumes_above_logged_csn() {
        let wal = Arc::new(MemCsnWal::new());
        let clock = Arc::new(ManualClock::new(START));
        let ctx = CsnContext::new(
            config(0),
            clock.clone(),
            Arc::new(MemCsnLog::new()),
            wal.clone(),
        )
        .unwrap();
        let issued = ctx.generate_csn().unwrap();
        let logged = wal.last_logged().unwrap();

        let restarted = CsnContext::new(
            config(0),
            clock.clone(),
            Arc::new(MemCsnLog::new()),
            wal,
        )
        .unwrap();
        clock.set(START - Csn::NSECS_PER_SEC);
        restarted.restore_after_recovery(logged, Xid(500));
        assert!(restarted.generate_csn().unwrap() > issued);
        assert_eq!(restarted.proc_array().next_xid(), Xid(500));
    }
}
