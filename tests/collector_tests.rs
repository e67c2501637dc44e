//! End-to-end tests from agents through the collector to placement.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tensorshm::collector::{ChannelSink, JsonFileSink, decode_report, encode_report};
use tensorshm::prelude::*;

fn open_store() -> (TempDir, StoreHandle) {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreHandle::open(StoreConfig::under(dir.path())).unwrap();
    (dir, store)
}

fn descriptor(model: &str, name: &str, len: u64) -> TensorDescriptor {
    TensorDescriptor::builder(model, name)
        .shape([len])
        .dtype(DType::U8)
        .source(SourceRef::Offset(0))
        .build()
        .unwrap()
}

// ============================================================================
// Inventory
// ============================================================================

/// A segment still being populated is absent from the inventory.
#[test]
fn test_scan_skips_segment_under_construction() {
    let (_dir, store) = open_store();
    let agent = Agent::new(store.clone(), AgentConfig::new("m"));

    let a = descriptor("m", "a", 100);
    let b = descriptor("m", "b", 200);
    let c = descriptor("m", "c", 300);
    let _ha = agent.resolve_bytes(&a, &[1; 100]).unwrap();
    let _hb = agent.resolve_bytes(&b, &[2; 200]).unwrap();

    // Park a creator inside populate so `c` stays in the Creating state.
    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let creator = {
        let (store, c) = (store.clone(), c.clone());
        thread::spawn(move || {
            let agent = Agent::new(store, AgentConfig::new("m"));
            let handle = agent
                .resolve_with(&c, move |buf| {
                    entered_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                    buf.fill(3);
                    Ok(())
                })
                .unwrap();
            agent.release(handle).unwrap();
        })
    };
    entered_rx.recv().unwrap();
    assert!(store.segment_path(c.fingerprint()).exists());

    let collector = Collector::new(store.clone(), CollectorConfig::new("node-1"));
    let report = collector.scan().unwrap();
    assert_eq!(report.records.len(), 2);
    assert!(report.contains(a.fingerprint()));
    assert!(report.contains(b.fingerprint()));
    assert!(!report.contains(c.fingerprint()));
    assert_eq!(report.total_bytes(), 300);
    assert!(report.records.iter().all(|r| r.node_id == "node-1"));

    resume_tx.send(()).unwrap();
    creator.join().unwrap();
}

/// Released segments disappear from the next inventory.
#[test]
fn test_inventory_follows_release() {
    let (_dir, store) = open_store();
    let agent = Agent::new(store.clone(), AgentConfig::new("m"));
    let collector = Collector::new(
        store.clone(),
        CollectorConfig::new("node-1").with_reconcile(false),
    );

    let desc = descriptor("m", "w", 64);
    let handle = agent.resolve_bytes(&desc, &[9; 64]).unwrap();
    assert!(collector.scan().unwrap().contains(desc.fingerprint()));

    agent.release(handle).unwrap();
    assert!(collector.scan().unwrap().records.is_empty());
}

/// Keep-warm segments stay in the inventory after their last release.
#[test]
fn test_keep_warm_segment_stays_resident() {
    let (_dir, store) = open_store();
    let config = AgentConfig::new("m").with_reclaim(ReclaimPolicy::KeepWarm(Duration::from_secs(3600)));
    let agent = Agent::new(store.clone(), config);

    let desc = descriptor("m", "w", 64);
    let handle = agent.resolve_bytes(&desc, &[4; 64]).unwrap();
    agent.release(handle).unwrap();

    let status = store.status(desc.fingerprint()).unwrap().unwrap();
    assert_eq!(status.ref_count, 0);
    assert!(status.idle_since_ms > 0);

    let collector = Collector::new(
        store.clone(),
        CollectorConfig::new("node-1")
            .with_reclaim(ReclaimPolicy::KeepWarm(Duration::from_secs(3600))),
    );
    let mut sink = JsonFileSink::new(store.config().shm_dir.with_extension("json"));
    let report = collector.tick(&mut sink).unwrap();
    assert!(report.contains(desc.fingerprint()));

    // A later resolve attaches to the warm copy.
    let again = agent.resolve_with(&desc, |_| panic!("segment is warm")).unwrap();
    assert_eq!(again.outcome(), ResolveOutcome::Attached);
}

/// A default collector honors the grace period a keep-warm agent released with.
#[test]
fn test_default_collector_keeps_agent_warm_segment() {
    let (_dir, store) = open_store();
    let config = AgentConfig::new("m").with_reclaim(ReclaimPolicy::KeepWarm(Duration::from_secs(3600)));
    let agent = Agent::new(store.clone(), config);

    let desc = descriptor("m", "w", 64);
    agent.release(agent.resolve_bytes(&desc, &[6; 64]).unwrap()).unwrap();
    assert!(store.status(desc.fingerprint()).unwrap().unwrap().keep_warm_until_ms > 0);

    let collector = Collector::new(store.clone(), CollectorConfig::new("node-1"));
    assert_eq!(collector.config().reclaim, ReclaimPolicy::Eager);
    let (mut sink, _rx) = ChannelSink::new();
    for _ in 0..2 {
        let report = collector.tick(&mut sink).unwrap();
        assert!(report.contains(desc.fingerprint()));
    }

    let again = agent.resolve_with(&desc, |_| panic!("segment is warm")).unwrap();
    assert_eq!(again.outcome(), ResolveOutcome::Attached);
}

/// A running default collector follows agents holding and releasing handles.
#[test]
fn test_running_collector_tracks_handles() {
    let (_dir, store) = open_store();
    let eager = Agent::new(store.clone(), AgentConfig::new("m"));
    let warm = Agent::new(
        store.clone(),
        AgentConfig::new("m").with_reclaim(ReclaimPolicy::KeepWarm(Duration::from_secs(3600))),
    );
    let a = descriptor("m", "a", 32);
    let b = descriptor("m", "b", 48);
    let ha = eager.resolve_bytes(&a, &[1; 32]).unwrap();
    let hb = warm.resolve_bytes(&b, &[2; 48]).unwrap();

    let (sink, rx) = ChannelSink::new();
    let collector = Collector::new(
        store.clone(),
        CollectorConfig::new("node-1").with_interval(Duration::from_millis(10)),
    )
    .spawn(sink)
    .unwrap();
    let timeout = Duration::from_secs(5);

    // Held segments survive the sweep on every tick.
    for _ in 0..3 {
        let report = rx.recv_timeout(timeout).unwrap();
        assert!(report.contains(a.fingerprint()));
        assert!(report.contains(b.fingerprint()));
    }

    eager.release(ha).unwrap();
    warm.release(hb).unwrap();
    assert!(store.status(a.fingerprint()).unwrap().is_none());

    // Reports queued before the release may still list `a`.
    let mut report = rx.recv_timeout(timeout).unwrap();
    while report.contains(a.fingerprint()) {
        report = rx.recv_timeout(timeout).unwrap();
    }
    for _ in 0..3 {
        assert!(!report.contains(a.fingerprint()));
        assert!(report.contains(b.fingerprint()));
        report = rx.recv_timeout(timeout).unwrap();
    }
    collector.join();

    let status = store.status(b.fingerprint()).unwrap().unwrap();
    assert!(status.is_ready());
    assert_eq!(status.ref_count, 0);
}

// ============================================================================
// Placement
// ============================================================================

/// Reports from two nodes steer a model toward the node holding its weights.
#[test]
fn test_reports_rank_warm_node_first() {
    let (_dir_a, store_a) = open_store();
    let (_dir_b, store_b) = open_store();

    let embed = descriptor("bert", "embed", 4096);
    let head = descriptor("bert", "head", 512);

    let agent_a = Agent::new(store_a.clone(), AgentConfig::new("bert"));
    let _ea = agent_a.resolve_bytes(&embed, &[1; 4096]).unwrap();
    let _ha = agent_a.resolve_bytes(&head, &[2; 512]).unwrap();
    let manifest = agent_a.manifest();
    assert_eq!(manifest.required_bytes(), 4096 + 512);

    let agent_b = Agent::new(store_b.clone(), AgentConfig::new("bert"));
    let _hb = agent_b.resolve_bytes(&head, &[2; 512]).unwrap();

    let (sink, rx) = ChannelSink::new();
    let collector_a = Collector::new(store_a, CollectorConfig::new("node-a"))
        .spawn(sink.clone())
        .unwrap();
    let collector_b = Collector::new(store_b, CollectorConfig::new("node-b"))
        .spawn(sink)
        .unwrap();

    let mut index = PlacementIndex::new();
    let mut seen = std::collections::HashSet::new();
    while seen.len() < 2 {
        let report = rx.recv().unwrap();
        // Reports cross the wire in framed form.
        let report = decode_report(&encode_report(&report).unwrap()).unwrap();
        index.ingest(&report);
        seen.insert(report.node_id);
    }
    collector_a.join();
    collector_b.join();

    let ranked = index.rank(&manifest, ["node-c", "node-b", "node-a"]);
    let order: Vec<_> = ranked.iter().map(|(node, _)| node.as_str()).collect();
    assert_eq!(order, ["node-a", "node-b", "node-c"]);

    let (_, best) = &ranked[0];
    assert_eq!(best.matched, 2);
    assert_eq!(best.fraction(), 1.0);
    let (_, partial) = &ranked[1];
    assert_eq!(partial.matched_bytes, 512);
    assert!(!ranked[2].1.is_warm());
}
