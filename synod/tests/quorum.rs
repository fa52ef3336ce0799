mod common;

use std::time::Duration;

use common::{cluster, revive, TIMEOUT};

#[test]
fn three_node_cluster_commits_with_one_member_down() {
    let mut nodes = cluster(3);
    let down = nodes.pop().unwrap();
    let _cold = down.kill();

    let writer = nodes[0].log.writer_with_default_retries();
    let reader = nodes[0].log.reader();

    let position = writer
        .append(b"quorum".to_vec(), TIMEOUT)
        .expect("append succeeds against two of three")
        .expect("learned within timeout");

    let records = reader.read(position, position, TIMEOUT).expect("read");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, b"quorum");
}

#[test]
fn replica_down_during_writes_catches_up_after_rejoining() {
    let mut nodes = cluster(3);
    let lagging = nodes.pop().unwrap();
    let cold = lagging.kill();

    let writer = nodes[0].log.writer_with_default_retries();
    let a = writer.append(b"a".to_vec(), TIMEOUT).unwrap().unwrap();
    let b = writer.append(b"b".to_vec(), TIMEOUT).unwrap().unwrap();

    let rejoined = revive(cold);
    // Give the catch-up thread a few fallback ticks to pull the batch
    // it missed while it was down.
    std::thread::sleep(Duration::from_secs(1));

    let reader = rejoined.log.reader();
    assert!(
        reader.ending().value >= b.value,
        "catch-up task should have backfilled the rejoined replica's own log"
    );
    let records = reader
        .read(a, b, TIMEOUT)
        .expect("rejoined replica backfills the range it missed");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].payload, b"a");
    assert_eq!(records[1].payload, b"b");
}
