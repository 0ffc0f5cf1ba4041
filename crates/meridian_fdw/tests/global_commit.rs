//! End-to-end global commits across loopback nodes.
//!
//! Every node runs its own CSN context and clock. The coordinator node
//! writes locally and on remote nodes, and the tests check that all nodes
//! publish one agreed commit CSN and that a snapshot exported by the
//! coordinator sees the same data everywhere.

mod common;

use meridian_common::types::{Csn, IsolationLevel, XidCsn};
use meridian_fdw::{FdwXactStatus, LocalXactState};

use common::*;

fn write_remote(
    cache: &mut meridian_fdw::ConnectionCache,
    remote: usize,
    xact: &LocalXactState,
    key: &str,
) {
    let mapping = mapping_of(remote);
    let mut conn = cache.acquire(mapping, xact, false).unwrap();
    conn.execute(&format!("INSERT {key}")).unwrap();
    cache.mark_modified(mapping);
}

#[test]
fn test_all_nodes_commit_with_one_csn() {
    let a = Node::new("node_a", START);
    // Clock ahead of the coordinator's: the agreed CSN is its proposal.
    let b = Node::new("node_b", START + 3 * Csn::NSECS_PER_SEC);
    let c = Node::new("node_c", START + Csn::NSECS_PER_SEC);
    let cluster = Cluster::new(a.clone(), vec![b.clone(), c.clone()]);
    let coord = cluster.coordinator();
    let mut cache = cluster.session_cache();

    let backend = a.ctx.register_backend();
    let snapshot = a.ctx.take_snapshot(&backend).unwrap();
    let local = a.ctx.begin_transaction(&backend).unwrap();
    let local_xid = local.xid;
    let xact = LocalXactState::new(IsolationLevel::RepeatableRead)
        .with_xid(local_xid)
        .with_global_snapshot(a.ctx.export_snapshot(&snapshot).unwrap());

    write_remote(&mut cache, 0, &xact, "k1");
    write_remote(&mut cache, 1, &xact, "k2");

    let outcome = coord.commit(&mut cache, &backend, Some(local)).unwrap();
    assert!(outcome.two_phase);
    assert!(outcome.handed_to_resolver.is_empty());
    let csn = outcome.csn.unwrap();
    assert!(csn >= Csn(START + 3 * Csn::NSECS_PER_SEC));

    assert_eq!(a.csn_of(local_xid), XidCsn::Committed(csn));
    assert_eq!(b.csn_of(b.writer_of("k1").unwrap()), XidCsn::Committed(csn));
    assert_eq!(c.csn_of(c.writer_of("k2").unwrap()), XidCsn::Committed(csn));
    assert!(b.ctx.prepared().is_empty());
    assert!(c.ctx.prepared().is_empty());

    // Every node's clock has moved past the agreed CSN.
    for node in [&a, &b, &c] {
        assert!(node.ctx.generate_csn().unwrap() > csn);
    }
}

#[test]
fn test_exported_snapshot_sees_same_data_everywhere() {
    let a = Node::new("node_a", START);
    let b = Node::new("node_b", START + 2 * Csn::NSECS_PER_SEC);
    let cluster = Cluster::new(a.clone(), vec![b.clone()]);
    let coord = cluster.coordinator();

    // A snapshot exported before the write commits.
    let early_reader = a.ctx.register_backend();
    let before = a.ctx.take_snapshot(&early_reader).unwrap();

    let writer = a.ctx.register_backend();
    let local = a.ctx.begin_transaction(&writer).unwrap();
    let local_xid = local.xid;
    let mut cache = cluster.session_cache();
    let xact = LocalXactState::new(IsolationLevel::RepeatableRead).with_xid(local_xid);
    write_remote(&mut cache, 0, &xact, "k1");
    coord.commit(&mut cache, &writer, Some(local)).unwrap();
    let remote_xid = b.writer_of("k1").unwrap();

    let late_reader = a.ctx.register_backend();
    let after = a.ctx.take_snapshot(&late_reader).unwrap();

    for (snapshot, visible) in [(&before, false), (&after, true)] {
        let mut reader_cache = cluster.session_cache();
        let exported = a.ctx.export_snapshot(snapshot).unwrap();
        let xact = LocalXactState::new(IsolationLevel::RepeatableRead).with_global_snapshot(exported);
        reader_cache.acquire(mapping_of(0), &xact, false).unwrap();

        let imported = b.last_imported().unwrap();
        assert_eq!(imported.snapshot_csn, exported);
        assert_eq!(a.is_visible(local_xid, snapshot), visible);
        assert_eq!(b.is_visible(remote_xid, &imported), visible);
    }
}

#[test]
fn test_lost_commit_prepared_resolved_with_agreed_csn() {
    let a = Node::new("node_a", START);
    let b = Node::new("node_b", START);
    let cluster = Cluster::new(a.clone(), vec![b.clone()]);
    let coord = cluster.coordinator();
    let mut cache = cluster.session_cache();

    let backend = a.ctx.register_backend();
    let local = a.ctx.begin_transaction(&backend).unwrap();
    let local_xid = local.xid;
    let xact = LocalXactState::new(IsolationLevel::RepeatableRead).with_xid(local_xid);
    write_remote(&mut cache, 0, &xact, "k1");
    b.drop_link_on("COMMIT PREPARED");

    let outcome = coord.commit(&mut cache, &backend, Some(local)).unwrap();
    let csn = outcome.csn.unwrap();
    assert_eq!(outcome.handed_to_resolver.len(), 1);
    let gid = &outcome.handed_to_resolver[0];
    assert_eq!(
        coord.resolver().get(gid).unwrap().status,
        FdwXactStatus::Committing
    );

    // Still prepared on the remote, already in-doubt with the agreed CSN fixed.
    assert!(b.ctx.prepared().contains(gid));
    let remote_xid = b.writer_of("k1").unwrap();
    assert_eq!(a.csn_of(local_xid), XidCsn::Committed(csn));

    assert_eq!(coord.resolver().sweep(), 1);
    assert!(!b.ctx.prepared().contains(gid));
    assert_eq!(b.csn_of(remote_xid), XidCsn::Committed(csn));
}

#[test]
fn test_remote_prepare_failure_aborts_on_every_node() {
    let a = Node::new("node_a", START);
    let b = Node::new("node_b", START);
    let c = Node::new("node_c", START);
    let cluster = Cluster::new(a.clone(), vec![b.clone(), c.clone()]);
    let coord = cluster.coordinator();
    let mut cache = cluster.session_cache();

    let backend = a.ctx.register_backend();
    let local = a.ctx.begin_transaction(&backend).unwrap();
    let local_xid = local.xid;
    let xact = LocalXactState::new(IsolationLevel::RepeatableRead).with_xid(local_xid);
    write_remote(&mut cache, 0, &xact, "k1");
    write_remote(&mut cache, 1, &xact, "k2");
    c.drop_link_on("PREPARE TRANSACTION");

    assert!(coord.commit(&mut cache, &backend, Some(local)).is_err());
    assert_eq!(a.csn_of(local_xid), XidCsn::Aborted);
    assert_eq!(b.csn_of(b.writer_of("k1").unwrap()), XidCsn::Aborted);
    assert!(b.ctx.prepared().is_empty());

    // The lost prepare never happened on node_c; the resolver's rollback
    // finds nothing and counts it resolved.
    assert_eq!(coord.resolver().in_doubt_count(), 1);
    assert_eq!(coord.resolver().sweep(), 1);
    assert!(c.ctx.prepared().is_empty());
    // node_c's session went away with its link and aborted the write.
    assert_eq!(c.csn_of(c.writer_of("k2").unwrap()), XidCsn::Aborted);
}
