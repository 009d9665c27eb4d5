/// End-to-end collector scenarios driven datagram by datagram, without a
/// socket: session table, finalize pool, router and verifier together.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use sensorlink_transfer::hasher::hash_bytes;
use sensorlink_transfer::{
    CollisionPolicy, Collector, Manifest, ManifestEntry, MemoryLogger, ReceiverConfig,
    ReceiverProgress, SessionPolicy, Site, SiteRouter, TransferEvent,
};

const FM1: &str = "1.1.1.1:40000";

fn collector(root: &Path) -> (Collector, Arc<MemoryLogger>) {
    collector_with(root, SessionPolicy::default())
}

fn collector_with(root: &Path, policy: SessionPolicy) -> (Collector, Arc<MemoryLogger>) {
    let logger = Arc::new(MemoryLogger::new());
    let mut config = ReceiverConfig::new("127.0.0.1:0".parse().unwrap(), root);
    config.policy = policy;
    config.router = Arc::new(SiteRouter::from_sites([Site {
        address: "1.1.1.1".parse().unwrap(),
        label: "Site FM1".into(),
        folder: Some("FM1".into()),
    }]));
    config.logger = Some(logger.clone());
    let collector = Collector::new(&config, Arc::new(ReceiverProgress::new())).unwrap();
    (collector, logger)
}

fn feed(collector: &mut Collector, peer: &str, datagrams: &[&[u8]]) {
    let peer: SocketAddr = peer.parse().unwrap();
    for datagram in datagrams {
        collector.handle_datagram(peer, datagram, Instant::now());
    }
}

fn manifest_json(entries: &[(&str, &[u8])]) -> String {
    Manifest {
        entries: entries
            .iter()
            .map(|(name, content)| ManifestEntry { filename: name.to_string(), hash: hash_bytes(content) })
            .collect(),
    }
    .to_json()
    .unwrap()
}

#[test]
fn clean_batch_is_stored_routed_and_verified() {
    let dir = tempfile::tempdir().unwrap();
    let (mut collector, logger) = collector(dir.path());
    let manifest = manifest_json(&[("a.json", b"A"), ("b.json", b"B")]);

    feed(&mut collector, FM1, &[
        b"FILENAME:a.json", b"A", b"EOF",
        b"FILENAME:b.json", b"B", b"EOF",
        b"ALL_FILES_SENT",
        b"HASH_LOG_START", manifest.as_bytes(), b"EOF",
    ]);
    collector.shutdown().unwrap();

    for (name, content) in [("a.json", b"A"), ("b.json", b"B")] {
        assert_eq!(std::fs::read(dir.path().join("received").join(name)).unwrap(), content);
        assert_eq!(std::fs::read(dir.path().join("FM1").join(name)).unwrap(), content);
    }
    let hashlogs: Vec<_> = std::fs::read_dir(dir.path().join("hashlog")).unwrap().collect();
    assert_eq!(hashlogs.len(), 1);
    let name = hashlogs[0].as_ref().unwrap().file_name().to_string_lossy().into_owned();
    assert!(name.starts_with("FM1_received_hash_log_") && name.ends_with(".json"), "{}", name);

    assert_eq!(logger.count(TransferEvent::is_fault), 0, "{:?}", logger.events());
    assert!(logger.events().contains(&TransferEvent::VerificationComplete {
        passed: 2,
        missing: 0,
        corrupted: 0,
    }));
    assert_eq!(std::fs::read_dir(dir.path().join("corrupted")).unwrap().count(), 0);
}

#[test]
fn lost_chunk_is_detected_and_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let (mut collector, logger) = collector(dir.path());
    let b: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let manifest = manifest_json(&[("a.json", b"A"), ("b.json", &b[..])]);

    // Second chunk of b.json never arrives.
    feed(&mut collector, FM1, &[
        b"FILENAME:a.json", b"A", b"EOF",
        b"FILENAME:b.json", &b[..1024], b"EOF",
        b"ALL_FILES_SENT",
        b"HASH_LOG_START", manifest.as_bytes(), b"EOF",
    ]);
    collector.shutdown().unwrap();

    assert!(dir.path().join("received/a.json").is_file());
    assert!(!dir.path().join("received/b.json").exists());
    assert_eq!(std::fs::read(dir.path().join("corrupted/b.json")).unwrap(), &b[..1024]);
    assert_eq!(
        logger.count(|e| matches!(e, TransferEvent::IntegrityFault { name, .. } if name == "b.json")),
        1
    );
    assert!(logger.events().contains(&TransferEvent::VerificationComplete {
        passed: 1,
        missing: 0,
        corrupted: 1,
    }));
}

#[test]
fn resent_file_replaces_previous_copy() {
    let dir = tempfile::tempdir().unwrap();
    let (mut collector, _logger) = collector(dir.path());

    feed(&mut collector, FM1, &[b"FILENAME:a.json", b"old", b"EOF"]);
    feed(&mut collector, FM1, &[b"FILENAME:a.json", b"new", b"EOF"]);
    collector.shutdown().unwrap();

    assert_eq!(std::fs::read(dir.path().join("received/a.json")).unwrap(), b"new");
    assert_eq!(std::fs::read(dir.path().join("FM1/a.json")).unwrap(), b"new");
}

#[test]
fn orphan_eof_is_one_fault_and_no_write() {
    let dir = tempfile::tempdir().unwrap();
    let (mut collector, logger) = collector(dir.path());

    feed(&mut collector, FM1, &[b"EOF"]);
    collector.shutdown().unwrap();

    assert_eq!(logger.events(), vec![TransferEvent::OrphanEof]);
    assert_eq!(std::fs::read_dir(dir.path().join("received")).unwrap().count(), 0);
}

#[test]
fn interleaved_senders_do_not_mix() {
    let dir = tempfile::tempdir().unwrap();
    let (mut collector, logger) = collector(dir.path());
    let fm2 = "2.2.2.2:40000";

    feed(&mut collector, FM1, &[b"FILENAME:x.json"]);
    feed(&mut collector, fm2, &[b"FILENAME:y.json"]);
    feed(&mut collector, FM1, &[b"x1"]);
    feed(&mut collector, fm2, &[b"y1"]);
    feed(&mut collector, FM1, &[b"x2", b"EOF"]);
    feed(&mut collector, fm2, &[b"EOF"]);
    collector.shutdown().unwrap();

    assert_eq!(std::fs::read(dir.path().join("received/x.json")).unwrap(), b"x1x2");
    assert_eq!(std::fs::read(dir.path().join("received/y.json")).unwrap(), b"y1");
    // 2.2.2.2 is not in the site map: no site copy.
    assert!(!dir.path().join("FM1/y.json").exists());
    assert_eq!(logger.count(TransferEvent::is_fault), 0);
}

#[test]
fn manifest_before_file_flush_reports_missing() {
    let dir = tempfile::tempdir().unwrap();
    let (mut collector, logger) = collector(dir.path());
    let manifest = manifest_json(&[("late.pcap", b"P")]);

    feed(&mut collector, FM1, &[b"HASH_LOG_START", manifest.as_bytes(), b"EOF"]);
    collector.shutdown().unwrap();

    assert_eq!(
        logger.count(|e| matches!(e, TransferEvent::MissingFile { name } if name == "late.pcap")),
        1
    );
}

#[test]
fn traversal_name_never_leaves_storage() {
    let dir = tempfile::tempdir().unwrap();
    let (mut collector, logger) = collector(dir.path());

    feed(&mut collector, FM1, &[b"FILENAME:../escape.json", b"x", b"EOF"]);
    collector.shutdown().unwrap();

    assert!(!dir.path().join("escape.json").exists());
    assert_eq!(logger.count(|e| matches!(e, TransferEvent::InvalidName { .. })), 1);
    // Payload and EOF after a refused open have no session.
    assert_eq!(logger.count(|e| matches!(e, TransferEvent::OrphanPayload { .. })), 1);
    assert_eq!(logger.count(|e| matches!(e, TransferEvent::OrphanEof)), 1);
}

#[test]
fn manifest_on_new_port_sees_files_from_same_host() {
    let dir = tempfile::tempdir().unwrap();
    let (mut collector, logger) = collector(dir.path());
    let big: Vec<u8> = (0..512 * 1024u32).map(|i| (i % 253) as u8).collect();
    let manifest = manifest_json(&[("big.pcap", &big[..]), ("small.json", b"S")]);

    // Each transfer arrives from its own ephemeral port on the same host.
    let mut datagrams: Vec<&[u8]> = Vec::new();
    datagrams.push(b"FILENAME:big.pcap");
    datagrams.extend(big.chunks(1024));
    datagrams.push(b"EOF");
    feed(&mut collector, "1.1.1.1:40001", &datagrams);
    feed(&mut collector, "1.1.1.1:40002", &[b"FILENAME:small.json", b"S", b"EOF"]);
    feed(&mut collector, "1.1.1.1:40003", &[b"HASH_LOG_START", manifest.as_bytes(), b"EOF"]);
    collector.shutdown().unwrap();

    assert!(logger.events().contains(&TransferEvent::VerificationComplete {
        passed: 2,
        missing: 0,
        corrupted: 0,
    }));
    assert_eq!(logger.count(TransferEvent::is_fault), 0, "{:?}", logger.events());
}

#[test]
fn rejected_open_does_not_splice_into_kept_file() {
    let dir = tempfile::tempdir().unwrap();
    let policy = SessionPolicy {
        on_collision: CollisionPolicy::Reject,
        ..SessionPolicy::default()
    };
    let (mut collector, logger) = collector_with(dir.path(), policy);

    feed(&mut collector, FM1, &[
        b"FILENAME:a.json", b"AAA",
        b"FILENAME:b.json", b"BBB", b"EOF",
    ]);
    collector.shutdown().unwrap();

    assert!(!dir.path().join("received/a.json").exists());
    assert!(!dir.path().join("received/b.json").exists());
    assert_eq!(logger.count(|e| matches!(e, TransferEvent::SessionRejected { .. })), 1);
    assert_eq!(logger.count(|e| matches!(e, TransferEvent::OrphanPayload { bytes: 3 })), 1);
    assert_eq!(logger.count(|e| matches!(e, TransferEvent::OrphanEof)), 1);
    assert_eq!(logger.count(|e| matches!(e, TransferEvent::FileReceived { .. })), 0);
}

#[test]
fn truncated_manifest_is_stored_but_not_verified() {
    let dir = tempfile::tempdir().unwrap();
    let (mut collector, logger) = collector(dir.path());

    feed(&mut collector, FM1, &[b"HASH_LOG_START", br#"[{"filename":"#, b"EOF"]);
    collector.shutdown().unwrap();

    assert_eq!(logger.count(|e| matches!(e, TransferEvent::ManifestDecodeFault { .. })), 1);
    assert_eq!(logger.count(|e| matches!(e, TransferEvent::VerificationComplete { .. })), 0);
    let stored: Vec<_> = std::fs::read_dir(dir.path().join("hashlog")).unwrap().collect();
    assert_eq!(stored.len(), 1);
    let path = stored[0].as_ref().unwrap().path();
    assert_eq!(std::fs::read_to_string(path).unwrap(), r#"[{"filename":"#);
}
