mod common;

use std::time::Duration;

use common::{cluster, TIMEOUT};
use synod::Error;

#[test]
fn new_coordinator_preserves_a_value_the_old_one_already_got_learned() {
    let mut nodes = cluster(3);

    let first_writer = nodes[0].log.writer_with_default_retries();
    let first = first_writer
        .append(b"first".to_vec(), TIMEOUT)
        .unwrap()
        .unwrap();

    // Node 0 (the only coordinator so far) is gone now; node 1 takes
    // over. Its election's prepare phase must see "first" already
    // accepted by the surviving quorum and carry it forward rather than
    // silently losing it.
    let old_coordinator = nodes.remove(0);
    let _cold = old_coordinator.kill();

    let second_writer = nodes[0].log.writer_with_default_retries();
    let second = second_writer
        .append(b"second".to_vec(), TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(first.value + 1, second.value);

    let reader = nodes[0].log.reader();
    let records = reader.read(first, second, TIMEOUT).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].payload, b"first");
    assert_eq!(records[1].payload, b"second");
}

#[test]
fn minority_partition_cannot_make_progress() {
    let mut nodes = cluster(3);
    let _isolated_two = nodes.split_off(1); // keep only node 0; strand the majority
    let _cold_two: Vec<_> = _isolated_two.into_iter().map(|node| node.kill()).collect();

    let writer = nodes[0].log.writer(1);
    let result = writer.append(b"should not commit".to_vec(), Duration::from_millis(300));
    match result {
        Err(Error::CoordinatorLost { .. }) => {}
        Ok(None) => {}
        other => panic!("a minority partition must never report a commit, got {other:?}"),
    }
}
